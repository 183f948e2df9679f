//! HMAC-SHA-256 receipt authentication.

use std::fmt;

use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use super::CryptoError;

type HmacSha256 = Hmac<Sha256>;

/// Algorithm label written into receipt signature blocks.
pub const RECEIPT_MAC_ALGORITHM: &str = "hmac-sha256";

/// Minimum shared-secret length in bytes.
const MIN_SECRET_LEN: usize = 32;

/// Shared-secret MAC used by the issuing authority and the validator.
pub struct ReceiptMac {
    key_id: String,
    secret: SecretString,
}

impl fmt::Debug for ReceiptMac {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReceiptMac")
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

impl ReceiptMac {
    /// Creates a MAC keyed by `secret`.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKey`] if the key id is empty or the
    /// secret is shorter than 32 bytes.
    pub fn new(key_id: impl Into<String>, secret: SecretString) -> Result<Self, CryptoError> {
        let key_id = key_id.into();
        if key_id.trim().is_empty() {
            return Err(CryptoError::InvalidKey {
                reason: "receipt key id must not be empty".to_string(),
            });
        }
        let len = secret.expose_secret().len();
        if len < MIN_SECRET_LEN {
            return Err(CryptoError::InvalidKey {
                reason: format!("shared secret is {len} bytes, need at least {MIN_SECRET_LEN}"),
            });
        }
        Ok(Self { key_id, secret })
    }

    /// Identifier of the shared secret.
    #[must_use]
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// Computes the hex-encoded MAC of `payload`.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKey`] if the MAC cannot be keyed.
    pub fn sign(&self, payload: &[u8]) -> Result<String, CryptoError> {
        Ok(hex::encode(self.compute(payload)?))
    }

    /// Verifies a hex-encoded MAC in constant time.
    ///
    /// Only the lower-case encoding [`sign`](Self::sign) produces is
    /// accepted, so one MAC has one spelling. Anything else simply fails.
    #[must_use]
    pub fn verify(&self, payload: &[u8], mac_hex: &str) -> bool {
        let Ok(expected) = self.compute(payload) else {
            return false;
        };
        let expected = hex::encode(expected);
        expected.as_bytes().ct_eq(mac_hex.as_bytes()).into()
    }

    fn compute(&self, payload: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut mac = HmacSha256::new_from_slice(self.secret.expose_secret().as_bytes())
            .map_err(|e| CryptoError::InvalidKey {
                reason: e.to_string(),
            })?;
        mac.update(payload);
        Ok(mac.finalize().into_bytes().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mac() -> ReceiptMac {
        ReceiptMac::new(
            "authority-1",
            SecretString::from("0123456789abcdef0123456789abcdef"),
        )
        .unwrap()
    }

    #[test]
    fn sign_then_verify() {
        let mac = mac();
        let sig = mac.sign(b"canonical payload").unwrap();
        assert_eq!(sig.len(), 64);
        assert!(mac.verify(b"canonical payload", &sig));
    }

    #[test]
    fn any_flipped_payload_byte_fails() {
        let mac = mac();
        let payload = b"canonical payload".to_vec();
        let sig = mac.sign(&payload).unwrap();
        for i in 0..payload.len() {
            let mut tampered = payload.clone();
            tampered[i] ^= 0x01;
            assert!(!mac.verify(&tampered, &sig), "flip at byte {i} verified");
        }
    }

    #[test]
    fn different_secret_fails() {
        let other = ReceiptMac::new(
            "authority-1",
            SecretString::from("fedcba9876543210fedcba9876543210"),
        )
        .unwrap();
        let sig = mac().sign(b"x").unwrap();
        assert!(!other.verify(b"x", &sig));
    }

    #[test]
    fn malformed_mac_fails_closed() {
        let mac = mac();
        assert!(!mac.verify(b"x", "not hex"));
        assert!(!mac.verify(b"x", "abcd"));
        assert!(!mac.verify(b"x", ""));

        let upper = mac.sign(b"x").unwrap().to_ascii_uppercase();
        assert!(!mac.verify(b"x", &upper));
    }

    #[test]
    fn short_secret_rejected() {
        let err = ReceiptMac::new("k", SecretString::from("short")).unwrap_err();
        assert!(matches!(err, CryptoError::InvalidKey { .. }));
    }

    #[test]
    fn debug_does_not_leak_secret() {
        let rendered = format!("{:?}", mac());
        assert!(!rendered.contains("0123456789abcdef"));
    }
}
