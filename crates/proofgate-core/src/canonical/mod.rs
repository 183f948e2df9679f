//! Deterministic canonical serialization and content hashing.
//!
//! Everything that is signed or hashed in proofgate goes through
//! [`canonicalize`] first. The signer and the verifier run in different
//! processes and must reproduce identical bytes independently, so the
//! encoding is fixed down to the byte:
//!
//! - **Schema field order**: struct fields are emitted in declaration order.
//!   Record types are the schema; reordering a field is a breaking change.
//!   Open-ended maps are not used in signed records; ordered key/value
//!   sequences take their place.
//! - **One encoder**: compact `serde_json` output, no whitespace, its fixed
//!   string escaping.
//! - **Explicit-offset timestamps**: see [`timestamp`].
//! - **Excluded fields**: optional fields marked
//!   `skip_serializing_if = "Option::is_none"` vanish from the bytes when
//!   absent. Signature slots rely on this, or on an explicit placeholder.
//!
//! # Profile constraints
//!
//! Before any bytes are produced the value is checked against the same
//! strict profile the ledger's CAC-JSON canonicalizer enforces:
//!
//! - floats are rejected (integers only, within `i64`)
//! - strings and object keys must be Unicode NFC
//! - nesting deeper than [`MAX_DEPTH`] is rejected
//!
//! # Example
//!
//! ```
//! use proofgate_core::canonical::canonicalize;
//!
//! #[derive(serde::Serialize)]
//! struct Record {
//!     zeta: u32,
//!     alpha: &'static str,
//! }
//!
//! let bytes = canonicalize(&Record { zeta: 1, alpha: "a" }).unwrap();
//! assert_eq!(bytes.as_bytes(), br#"{"zeta":1,"alpha":"a"}"#);
//! ```

mod digest;
pub mod timestamp;

use serde::Serialize;
use serde_json::{Number, Value};
use thiserror::Error;
use unicode_normalization::is_nfc;

pub use digest::{ContentDigest, DigestAlgorithm, DigestParseError, hash_bytes};

/// Canonicalizer identifier recorded alongside signed artifacts.
pub const CANONICALIZER_ID: &str = "proofgate-json-v1";

/// Maximum nesting depth accepted by the canonicalizer.
pub const MAX_DEPTH: usize = 128;

/// Errors produced while canonicalizing a value.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CanonicalError {
    /// A floating-point number was encountered.
    #[error("float not allowed at '{path}': canonical form requires integer-only numbers")]
    FloatNotAllowed {
        /// JSON path of the offending number.
        path: String,
    },

    /// An integer does not fit in a signed 64-bit range.
    #[error("number out of range at '{path}': {value}")]
    NumberOutOfRange {
        /// JSON path of the offending number.
        path: String,
        /// String form of the number.
        value: String,
    },

    /// A string or key is not in Unicode NFC.
    #[error("non-NFC string at '{path}'")]
    NonNfcString {
        /// JSON path of the offending string.
        path: String,
    },

    /// Nesting exceeded [`MAX_DEPTH`].
    #[error("max depth exceeded: value nested deeper than {max_depth} levels")]
    MaxDepthExceeded {
        /// The configured maximum.
        max_depth: usize,
    },

    /// The value could not be serialized at all.
    #[error("serialization failed: {message}")]
    Serialize {
        /// Encoder error text.
        message: String,
    },
}

/// Canonical bytes of a structured value.
///
/// Only [`canonicalize`] constructs this type, so holding a
/// `CanonicalBytes` means the profile checks have passed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CanonicalBytes(Vec<u8>);

impl CanonicalBytes {
    /// Returns the raw bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Consumes self and returns the byte vector.
    #[must_use]
    pub fn into_vec(self) -> Vec<u8> {
        self.0
    }

    /// Number of bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the encoding is empty (never true for a real value).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// SHA-256 digest of these bytes.
    #[must_use]
    pub fn digest(&self) -> ContentDigest {
        hash_bytes(&self.0)
    }
}

impl AsRef<[u8]> for CanonicalBytes {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Produces the canonical bytes of `value`.
///
/// # Errors
///
/// Returns [`CanonicalError`] if the value violates the profile (floats,
/// out-of-range integers, non-NFC strings, excessive depth) or cannot be
/// serialized.
pub fn canonicalize<T>(value: &T) -> Result<CanonicalBytes, CanonicalError>
where
    T: Serialize + ?Sized,
{
    // The tree is only used for validation; its map ordering is irrelevant.
    let tree = serde_json::to_value(value).map_err(|e| CanonicalError::Serialize {
        message: e.to_string(),
    })?;
    validate_value(&tree, "$", 0)?;

    let bytes = serde_json::to_vec(value).map_err(|e| CanonicalError::Serialize {
        message: e.to_string(),
    })?;
    Ok(CanonicalBytes(bytes))
}

/// Canonicalizes `value` and returns the digest of the resulting bytes.
///
/// # Errors
///
/// Same as [`canonicalize`].
pub fn digest_of<T>(value: &T) -> Result<ContentDigest, CanonicalError>
where
    T: Serialize + ?Sized,
{
    Ok(canonicalize(value)?.digest())
}

fn validate_value(value: &Value, path: &str, depth: usize) -> Result<(), CanonicalError> {
    if depth > MAX_DEPTH {
        return Err(CanonicalError::MaxDepthExceeded {
            max_depth: MAX_DEPTH,
        });
    }

    match value {
        Value::Null | Value::Bool(_) => Ok(()),
        Value::Number(n) => validate_number(n, path),
        Value::String(s) => validate_string(s, path),
        Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                validate_value(item, &format!("{path}[{i}]"), depth + 1)?;
            }
            Ok(())
        },
        Value::Object(obj) => {
            for (key, item) in obj {
                let item_path = format!("{path}.{key}");
                validate_string(key, &item_path)?;
                validate_value(item, &item_path, depth + 1)?;
            }
            Ok(())
        },
    }
}

fn validate_number(n: &Number, path: &str) -> Result<(), CanonicalError> {
    if n.is_i64() {
        return Ok(());
    }
    if let Some(u) = n.as_u64() {
        if i64::try_from(u).is_err() {
            return Err(CanonicalError::NumberOutOfRange {
                path: path.to_string(),
                value: u.to_string(),
            });
        }
        return Ok(());
    }
    Err(CanonicalError::FloatNotAllowed {
        path: path.to_string(),
    })
}

fn validate_string(s: &str, path: &str) -> Result<(), CanonicalError> {
    if is_nfc(s) {
        Ok(())
    } else {
        Err(CanonicalError::NonNfcString {
            path: path.to_string(),
        })
    }
}
