//! Ed25519 signing and verification for run manifests.

use std::fmt;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier as _, VerifyingKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};

use super::CryptoError;

/// Algorithm label written into manifest signature blocks.
pub const MANIFEST_SIGNATURE_ALGORITHM: &str = "ed25519";

/// Length of a hex-encoded Ed25519 public key.
pub const PUBLIC_KEY_HEX_LEN: usize = 64;

/// Number of hex characters of the key fingerprint kept in a key id.
const KEY_ID_FINGERPRINT_LEN: usize = 16;

/// Derives the key id for a public key: `ed25519:` followed by the first 16
/// hex characters of SHA-256 over the raw key bytes.
#[must_use]
pub fn key_id_for(key: &VerifyingKey) -> String {
    let fingerprint = hex::encode(Sha256::digest(key.as_bytes()));
    format!(
        "{MANIFEST_SIGNATURE_ALGORITHM}:{}",
        &fingerprint[..KEY_ID_FINGERPRINT_LEN]
    )
}

/// Holds the Ed25519 signing key for manifest sealing.
pub struct ManifestSigner {
    signing_key: SigningKey,
    key_id: String,
}

impl fmt::Debug for ManifestSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManifestSigner")
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

impl ManifestSigner {
    /// Generates a fresh key pair from the OS RNG.
    #[must_use]
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey::generate(&mut OsRng))
    }

    /// Builds a signer from a 32-byte seed.
    #[must_use]
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self::from_signing_key(SigningKey::from_bytes(seed))
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let key_id = key_id_for(&signing_key.verifying_key());
        Self {
            signing_key,
            key_id,
        }
    }

    /// Key id of the public half.
    #[must_use]
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// Verifier for the public half.
    #[must_use]
    pub fn verifier(&self) -> ManifestVerifier {
        ManifestVerifier::new(self.signing_key.verifying_key())
    }

    /// Signs `payload`, returning the base64 signature.
    #[must_use]
    pub fn sign(&self, payload: &[u8]) -> String {
        BASE64.encode(self.signing_key.sign(payload).to_bytes())
    }

    /// Hex seed of the signing key. Only the key writer should need this.
    pub(crate) fn seed_hex(&self) -> String {
        hex::encode(self.signing_key.to_bytes())
    }
}

/// Public-key verifier for manifest signatures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestVerifier {
    key: VerifyingKey,
    key_id: String,
}

impl ManifestVerifier {
    /// Wraps a verifying key.
    #[must_use]
    pub fn new(key: VerifyingKey) -> Self {
        let key_id = key_id_for(&key);
        Self { key, key_id }
    }

    /// Parses a hex-encoded 32-byte public key.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKey`] for bad hex, bad length, or a
    /// point that is not a valid Ed25519 key.
    pub fn from_hex(public_key_hex: &str) -> Result<Self, CryptoError> {
        let trimmed = public_key_hex.trim();
        let bytes = hex::decode(trimmed).map_err(|e| CryptoError::InvalidKey {
            reason: format!("public key is not hex: {e}"),
        })?;
        let bytes: [u8; 32] = bytes.try_into().map_err(|v: Vec<u8>| CryptoError::InvalidKey {
            reason: format!("public key must be 32 bytes, got {}", v.len()),
        })?;
        let key = VerifyingKey::from_bytes(&bytes).map_err(|e| CryptoError::InvalidKey {
            reason: e.to_string(),
        })?;
        Ok(Self::new(key))
    }

    /// Key id derived from the public key.
    #[must_use]
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// Hex encoding of the public key.
    #[must_use]
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.key.as_bytes())
    }

    /// Verifies a base64 signature over `payload`.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::MalformedSignature`] if the signature cannot be
    /// decoded, or [`CryptoError::VerificationFailed`] if it does not verify.
    pub fn verify(&self, payload: &[u8], signature_b64: &str) -> Result<(), CryptoError> {
        let raw = BASE64
            .decode(signature_b64)
            .map_err(|e| CryptoError::MalformedSignature {
                reason: e.to_string(),
            })?;
        let signature =
            Signature::from_slice(&raw).map_err(|e| CryptoError::MalformedSignature {
                reason: e.to_string(),
            })?;
        self.key
            .verify(payload, &signature)
            .map_err(|_| CryptoError::VerificationFailed)
    }
}
