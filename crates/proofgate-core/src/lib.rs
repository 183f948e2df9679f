#![allow(clippy::doc_markdown)]
#![allow(clippy::too_long_first_doc_paragraph)]

//! proofgate-core - fail-closed authorization gating and sealed proof packs.
//!
//! This crate gates consequential operations (publish, tag, open-request)
//! behind verifiable authorization and seals the evidence of every decision
//! into an offline-verifiable bundle.
//!
//! Data flows one way through the modules:
//!
//! ```text
//! canonical -> crypto -> receipt -> gate -> boundary -> pack
//! ```
//!
//! # Modules
//!
//! - [`canonical`]: Deterministic JSON bytes and SHA-256 content digests
//! - [`crypto`]: HMAC-SHA-256 receipt MACs and Ed25519 manifest signatures
//! - [`receipt`]: Authorization receipts, the binding/replay validator, and
//!   the consume index that enforces single use
//! - [`gate`]: The staged gate evaluator and its collaborator ports
//! - [`boundary`]: The only path through which side effects may run
//! - [`pack`]: Proof pack sealing and offline verification
//! - [`config`]: TOML configuration

pub mod boundary;
pub mod canonical;
pub mod config;
pub mod crypto;
pub mod gate;
pub mod pack;
pub mod receipt;

pub use canonical::{CanonicalBytes, CanonicalError, ContentDigest, canonicalize, hash_bytes};
pub use config::{ConfigError, ProofgateConfig};
