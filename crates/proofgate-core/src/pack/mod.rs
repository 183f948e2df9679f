//! Proof packs: sealed, signed, content-addressed bundles of finished runs.
//!
//! A pack is a directory:
//!
//! ```text
//! <pack>/
//!   pack_index.json
//!   keys/manifest_signing.pub
//!   runs/<runId>/plan.json
//!   runs/<runId>/ledger.json
//!   runs/<runId>/receipt.json      (when the run had a receipt)
//!   runs/<runId>/summary.json
//!   runs/<runId>/manifest.json
//! ```
//!
//! Every JSON file is the canonical encoding of its record. Each manifest
//! lists its run's artifacts with the digest and size of the bytes read back
//! from disk, and carries an Ed25519 signature over itself with the
//! signature block absent. The index lists every manifest digest and a pack
//! digest computed by [`compute_pack_digest`].
//!
//! [`PackSealer`] writes packs. [`verify_pack`] re-reads one and reports
//! signature, artifact, and pack-digest status per run.

mod sealer;
mod types;
mod verify;

#[cfg(test)]
mod tests;

use std::path::PathBuf;

use sha2::{Digest, Sha256};
use thiserror::Error;

pub use sealer::PackSealer;
pub use types::{
    ArtifactEntry, CompletedRun, MANIFEST_SCHEMA_VERSION, ManifestInvariants, ManifestSignature,
    ManifestSource, PACK_INDEX_SCHEMA_VERSION, PackIndex, PackRunEntry, PlannedOperation, Rollup,
    RunManifest, RunPlan, RunScope, RunSummary,
};
pub use verify::{
    ArtifactReport, PackReport, RunReport, verify_manifest_bytes, verify_manifest_signature,
    verify_pack,
};

use crate::canonical::{CanonicalError, ContentDigest};
use crate::crypto::CryptoError;

/// File name of the pack index.
pub const PACK_INDEX_FILE: &str = "pack_index.json";

/// Pack-relative path of the shipped public key.
pub const PUBLIC_KEY_PATH: &str = "keys/manifest_signing.pub";

/// Upper bound on any single file read back from a pack.
pub const MAX_PACK_FILE_BYTES: u64 = 64 * 1024 * 1024;

/// Errors raised while sealing. Every variant is a caller defect or an I/O
/// failure; nothing here is a soft outcome.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SealError {
    /// No runs were supplied.
    #[error("cannot seal an empty pack")]
    EmptyPack,

    /// Runs belong to more than one tenant.
    #[error("runs span more than one tenant: {tenants:?}")]
    CrossTenantPack {
        /// Distinct tenant ids seen, sorted.
        tenants: Vec<String>,
    },

    /// Two runs share an id.
    #[error("duplicate run id: {run_id}")]
    DuplicateRun {
        /// Repeated id.
        run_id: String,
    },

    /// A run id cannot be used as a directory name.
    #[error("run id is not a safe path segment: {run_id:?}")]
    InvalidRunId {
        /// Offending id.
        run_id: String,
    },

    /// The target directory already holds a sealed pack.
    #[error("pack already sealed at {}", path.display())]
    PackExists {
        /// Existing index.
        path: PathBuf,
    },

    /// The receipt is bound to another run.
    #[error("receipt for run {receipt_run_id} attached to run {run_id}")]
    ReceiptRunMismatch {
        /// Run being sealed.
        run_id: String,
        /// Run the receipt names.
        receipt_run_id: String,
    },

    /// A written artifact does not match the digest the receipt was bound to.
    #[error("run {run_id}: {artifact} digest drifted (receipt {expected}, disk {actual})")]
    BindingDrift {
        /// Run being sealed.
        run_id: String,
        /// Artifact name.
        artifact: &'static str,
        /// Digest in the receipt.
        expected: ContentDigest,
        /// Digest of the bytes on disk.
        actual: ContentDigest,
    },

    /// A record violates the canonical profile.
    #[error(transparent)]
    Canonical(#[from] CanonicalError),

    /// Filesystem failure.
    #[error("I/O error at {}: {source}", path.display())]
    Io {
        /// Path involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

/// Errors that stop verification before a report can be produced.
///
/// Per-run and per-artifact failures are not errors; they are recorded in
/// the [`PackReport`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PackVerifyError {
    /// A required file could not be read.
    #[error("I/O error at {}: {source}", path.display())]
    Io {
        /// Path involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// A file exceeds [`MAX_PACK_FILE_BYTES`].
    #[error("{} is {size} bytes, over the {max} byte limit", path.display())]
    TooLarge {
        /// Offending file.
        path: PathBuf,
        /// Its size.
        size: u64,
        /// Limit.
        max: u64,
    },

    /// A record did not parse.
    #[error("cannot parse {what}: {message}")]
    Parse {
        /// What was being parsed.
        what: String,
        /// Parser detail.
        message: String,
    },

    /// The manifest carries no signature block.
    #[error("manifest is not signed")]
    MissingSignature,

    /// The signature block names another algorithm.
    #[error("unsupported signature algorithm: {alg}")]
    AlgorithmMismatch {
        /// Algorithm in the manifest.
        alg: String,
    },

    /// The manifest was signed by another key.
    #[error("manifest signed by {actual}, expected {expected}")]
    KeyMismatch {
        /// Key id of the verifier.
        expected: String,
        /// Key id in the manifest.
        actual: String,
    },

    /// Key or signature check failed.
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// The manifest could not be recanonicalized.
    #[error(transparent)]
    Canonical(#[from] CanonicalError),
}

/// Pack digest over `(run_id, manifest_digest)` pairs.
///
/// Sorts by run id, concatenates the lowercase hex of each manifest digest
/// with no separators, and hashes the result once. Input order does not
/// matter.
#[must_use]
pub fn compute_pack_digest<'a, I>(manifests: I) -> ContentDigest
where
    I: IntoIterator<Item = (&'a str, &'a ContentDigest)>,
{
    let mut sorted: Vec<_> = manifests.into_iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(b.0));
    let mut hasher = Sha256::new();
    for (_, digest) in sorted {
        hasher.update(digest.hex().as_bytes());
    }
    ContentDigest::from_sha256(hasher.finalize().into())
}
