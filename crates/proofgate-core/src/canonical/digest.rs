//! SHA-256 content digests tagged with their algorithm.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;

/// Length of a SHA-256 digest in hex characters.
const SHA256_HEX_LEN: usize = 64;

/// Hash algorithm tag carried by every digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DigestAlgorithm {
    /// SHA-256.
    Sha256,
}

impl DigestAlgorithm {
    /// Wire label of the algorithm.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
        }
    }
}

/// Errors from parsing a digest string.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DigestParseError {
    /// Unknown or missing algorithm prefix.
    #[error("unsupported digest algorithm in '{value}'")]
    UnsupportedAlgorithm {
        /// The rejected input.
        value: String,
    },

    /// The hex body is not 64 lower-case hex characters.
    #[error("malformed sha256 digest: {reason}")]
    Malformed {
        /// Why the body was rejected.
        reason: String,
    },
}

/// A lower-case hex SHA-256 digest.
///
/// Serialized as `sha256:<hex>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentDigest {
    algorithm: DigestAlgorithm,
    hex: String,
}

impl ContentDigest {
    /// Builds a digest from raw hash output.
    #[must_use]
    pub fn from_sha256(raw: [u8; 32]) -> Self {
        Self {
            algorithm: DigestAlgorithm::Sha256,
            hex: hex::encode(raw),
        }
    }

    /// Algorithm tag.
    #[must_use]
    pub const fn algorithm(&self) -> DigestAlgorithm {
        self.algorithm
    }

    /// The lower-case hex body without the algorithm prefix.
    #[must_use]
    pub fn hex(&self) -> &str {
        &self.hex
    }

    /// Returns true if `bytes` hash to this digest. Comparison is
    /// constant-time.
    #[must_use]
    pub fn matches(&self, bytes: &[u8]) -> bool {
        let computed = hash_bytes(bytes);
        computed.hex.as_bytes().ct_eq(self.hex.as_bytes()).into()
    }

    /// Parses `sha256:<hex>` or a bare 64-character hex string.
    ///
    /// # Errors
    ///
    /// Returns [`DigestParseError`] for any other algorithm prefix or a
    /// malformed body. Upper-case hex is rejected so that one digest has one
    /// spelling.
    pub fn parse(value: &str) -> Result<Self, DigestParseError> {
        let body = match value.split_once(':') {
            Some(("sha256", body)) => body,
            Some(_) => {
                return Err(DigestParseError::UnsupportedAlgorithm {
                    value: value.to_string(),
                });
            },
            None => value,
        };

        if body.len() != SHA256_HEX_LEN {
            return Err(DigestParseError::Malformed {
                reason: format!("expected {SHA256_HEX_LEN} hex chars, got {}", body.len()),
            });
        }
        if !body
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        {
            return Err(DigestParseError::Malformed {
                reason: "digest must be lower-case hex".to_string(),
            });
        }

        Ok(Self {
            algorithm: DigestAlgorithm::Sha256,
            hex: body.to_string(),
        })
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm.as_str(), self.hex)
    }
}

impl FromStr for ContentDigest {
    type Err = DigestParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for ContentDigest {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ContentDigest {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// SHA-256 of `bytes`.
#[must_use]
pub fn hash_bytes(bytes: &[u8]) -> ContentDigest {
    ContentDigest::from_sha256(Sha256::digest(bytes).into())
}
