//! Signing primitives.
//!
//! Two independent schemes, both operating only on canonical bytes and never
//! interpreting what those bytes mean:
//!
//! - **HMAC-SHA-256** ([`ReceiptMac`]): the issuing authority and the
//!   validator share one secret. Used for authorization receipts.
//! - **Ed25519** ([`ManifestSigner`] / [`ManifestVerifier`]): used to seal
//!   run manifests so anyone holding the public key can verify a proof pack
//!   offline.
//!
//! A canonicalization mismatch between signer and verifier shows up here as
//! a verification failure that is indistinguishable from tampering. Callers
//! treat it as such.

mod keys;
mod mac;
mod sign;

use std::path::PathBuf;

use thiserror::Error;

pub use keys::{read_public_key_file, read_signing_key_file, write_key_pair};
pub use mac::{RECEIPT_MAC_ALGORITHM, ReceiptMac};
pub use sign::{
    MANIFEST_SIGNATURE_ALGORITHM, ManifestSigner, ManifestVerifier, PUBLIC_KEY_HEX_LEN, key_id_for,
};

/// Errors from key handling and signature verification.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CryptoError {
    /// Key material is malformed or too weak.
    #[error("invalid key: {reason}")]
    InvalidKey {
        /// Why the key was rejected.
        reason: String,
    },

    /// Signature bytes could not be decoded.
    #[error("malformed signature: {reason}")]
    MalformedSignature {
        /// Why decoding failed.
        reason: String,
    },

    /// The signature does not verify over the payload.
    #[error("signature verification failed")]
    VerificationFailed,

    /// Reading or writing a key file failed.
    #[error("key file {path}: {source}")]
    Io {
        /// The file involved.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}
