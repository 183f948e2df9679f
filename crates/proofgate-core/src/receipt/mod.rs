//! Authorization receipts and the binding/replay validator.
//!
//! An [`AuthorizationReceipt`] is minted by the single issuing authority and
//! protected by an HMAC over its canonical bytes. The
//! [`ReceiptValidator`] decides whether a receipt may authorize one
//! specific operation right now.
//!
//! # Validation order
//!
//! Checks run in a fixed order and stop at the first failure:
//!
//! 1. request mode is exactly `prod`
//! 2. a receipt is present
//! 3. the MAC verifies against the validator's shared secret
//! 4. the receipt is enforceable
//! 5. `runId` matches the request (cross-run replay)
//! 6. `operationKind` matches the request (cross-operation replay)
//! 7. the receipt has not been consumed
//! 8. `now < expiresAt`
//! 9. `issuedAt` lies inside the staleness window
//!
//! [`ReceiptValidator::validate`] stops there. On success
//! [`ReceiptValidator::validate_and_consume`] consumes the receipt through
//! the [`ConsumeIndex`], whose insert is the atomic compare-and-swap: when
//! callers race, exactly one wins and every other caller observes
//! [`ReceiptDenial::AlreadyConsumed`].
//!
//! # Invariants
//!
//! - A dry-run receipt is never enforceable. The builder refuses to mint
//!   one and [`AuthorizationReceipt::from_json`] refuses to parse one.
//! - The MAC covers every field except its own value.
//! - Consumption happens once and never reverses.

mod consume;
mod types;
mod validator;


use thiserror::Error;

pub use consume::{ConsumeError, ConsumeIndex, FileBackedConsumeIndex, InMemoryConsumeIndex};
pub use types::{
    AdvisoryOutcome, AuthorizationReceipt, DEFAULT_RECEIPT_TTL_SECS, Issuer, MAX_RECEIPT_BYTES,
    OperationKind, PolicySet, RECEIPT_SCHEMA_VERSION, RECEIPT_TYPE, ReceiptBuilder,
    ReceiptDigests, ReceiptSignature, RunMode, Subject, SubjectDigests,
};
pub use validator::{
    ConsumedAuthorization, DEFAULT_STALENESS_WINDOW_SECS, ReceiptDenial, ReceiptValidator,
    RequestContext,
};

use crate::canonical::CanonicalError;
use crate::crypto::CryptoError;

/// Errors from minting, parsing, or verifying receipts.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ReceiptError {
    /// Canonical encoding failed.
    #[error(transparent)]
    Canonical(#[from] CanonicalError),

    /// Key or MAC failure.
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// A required field was not supplied.
    #[error("missing required field: {field}")]
    MissingField {
        /// Wire name of the field.
        field: &'static str,
    },

    /// A dry-run receipt claimed to be enforceable.
    #[error("dry-run receipts can never be enforceable")]
    DryRunEnforceable,

    /// `expiresAt` is not after `issuedAt`.
    #[error("receipt expiry must be after its issue time")]
    InvalidValidityWindow,

    /// A mode string did not match exactly.
    #[error("unknown run mode '{value}'")]
    UnknownMode {
        /// The rejected value.
        value: String,
    },

    /// An operation string did not match exactly.
    #[error("unknown operation kind '{value}'")]
    UnknownOperation {
        /// The rejected value.
        value: String,
    },

    /// Input exceeds [`MAX_RECEIPT_BYTES`].
    #[error("receipt too large: {size} > {max}")]
    TooLarge {
        /// Input size.
        size: usize,
        /// Limit.
        max: usize,
    },

    /// JSON decoding failed.
    #[error("receipt parse error: {message}")]
    Parse {
        /// Decoder message.
        message: String,
    },

    /// Wrong schema identifier or receipt type.
    #[error("schema mismatch: expected {expected}, found {actual}")]
    SchemaMismatch {
        /// Expected identifier.
        expected: String,
        /// Identifier found.
        actual: String,
    },

    /// Signature block names another algorithm.
    #[error("signature algorithm mismatch: expected {expected}, found {actual}")]
    AlgorithmMismatch {
        /// Expected algorithm.
        expected: String,
        /// Algorithm found.
        actual: String,
    },

    /// Signature block names another key.
    #[error("signature key mismatch: expected {expected}, found {actual}")]
    KeyMismatch {
        /// Expected key id.
        expected: String,
        /// Key id found.
        actual: String,
    },

    /// The stored self-digest does not match the recomputed one.
    #[error("receipt digest mismatch: recorded {expected}, recomputed {actual}")]
    DigestMismatch {
        /// Recorded digest.
        expected: String,
        /// Recomputed digest.
        actual: String,
    },

    /// The MAC does not verify.
    #[error("receipt signature invalid")]
    SignatureInvalid,
}
