//! Fuzz harness for `AuthorizationReceipt::from_json`.
//!
//! Arbitrary bytes must parse to `Ok` or `Err`, never panic. Anything that
//! parses must also survive MAC verification and recanonicalization without
//! panicking, and must never come back enforceable in dry-run mode.

#![no_main]
use libfuzzer_sys::fuzz_target;
use proofgate_core::crypto::ReceiptMac;
use proofgate_core::receipt::{AuthorizationReceipt, RunMode};
use secrecy::SecretString;

fuzz_target!(|data: &[u8]| {
    let Ok(receipt) = AuthorizationReceipt::from_json(data) else {
        return;
    };
    assert!(!(receipt.mode == RunMode::DryRun && receipt.enforceable));

    let _ = receipt.canonical_bytes();
    let _ = receipt.compute_receipt_digest();
    if let Ok(mac) = ReceiptMac::new(
        receipt.signature.key_id.clone(),
        SecretString::from("fuzz-secret-0123456789abcdef0123"),
    ) {
        let _ = receipt.verify_signature(&mac);
    }
});
