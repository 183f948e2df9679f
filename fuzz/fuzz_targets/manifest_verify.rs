//! Fuzz harness for `verify_manifest_bytes`.
//!
//! The verifier is handed arbitrary manifest bytes and must reject them
//! without panicking. A fixed key is used so that signature checks run on
//! every input that parses.

#![no_main]
use libfuzzer_sys::fuzz_target;
use proofgate_core::crypto::ManifestSigner;
use proofgate_core::pack::verify_manifest_bytes;

fuzz_target!(|data: &[u8]| {
    let verifier = ManifestSigner::from_seed(&[0x42; 32]).verifier();
    let _ = verify_manifest_bytes(data, &verifier);
});
