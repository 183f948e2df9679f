//! Offline verification of manifests and packs.

use std::fs;
use std::path::{Component, Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{info, warn};

use super::types::{ArtifactEntry, PackIndex, PackRunEntry, RunManifest};
use super::{
    MAX_PACK_FILE_BYTES, PACK_INDEX_FILE, PUBLIC_KEY_PATH, PackVerifyError, compute_pack_digest,
};
use crate::canonical::{ContentDigest, canonicalize, hash_bytes};
use crate::crypto::{MANIFEST_SIGNATURE_ALGORITHM, ManifestVerifier, read_public_key_file};

// =============================================================================
// Manifest Signatures
// =============================================================================

/// Verifies the manifest's signature block against `verifier`.
///
/// The signed payload is the canonical encoding of the manifest with the
/// signature block removed.
///
/// # Errors
///
/// - [`PackVerifyError::MissingSignature`] if the manifest is unsigned
/// - [`PackVerifyError::AlgorithmMismatch`] for any algorithm but Ed25519
/// - [`PackVerifyError::KeyMismatch`] if the block names another key
/// - [`PackVerifyError::Crypto`] if the signature is malformed or wrong
pub fn verify_manifest_signature(
    manifest: &RunManifest,
    verifier: &ManifestVerifier,
) -> Result<(), PackVerifyError> {
    let block = manifest
        .manifest_signature
        .as_ref()
        .ok_or(PackVerifyError::MissingSignature)?;
    if block.alg != MANIFEST_SIGNATURE_ALGORITHM {
        return Err(PackVerifyError::AlgorithmMismatch {
            alg: block.alg.clone(),
        });
    }
    if block.key_id != verifier.key_id() {
        return Err(PackVerifyError::KeyMismatch {
            expected: verifier.key_id().to_string(),
            actual: block.key_id.clone(),
        });
    }
    let payload = canonicalize(&manifest.unsigned())?;
    verifier.verify(payload.as_bytes(), &block.signature)?;
    Ok(())
}

/// Parses manifest JSON and verifies its signature.
///
/// # Errors
///
/// Returns [`PackVerifyError::Parse`] for bytes that are not a manifest,
/// otherwise as [`verify_manifest_signature`].
pub fn verify_manifest_bytes(
    bytes: &[u8],
    verifier: &ManifestVerifier,
) -> Result<RunManifest, PackVerifyError> {
    let manifest: RunManifest = parse("manifest", bytes)?;
    verify_manifest_signature(&manifest, verifier)?;
    Ok(manifest)
}

// =============================================================================
// Reports
// =============================================================================

/// Status of one artifact listed in a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactReport {
    /// Logical name.
    pub name: String,
    /// Pack-relative path.
    pub path: String,
    /// The file exists inside the pack and is readable.
    pub present: bool,
    /// Bytes hash to the recorded digest.
    pub digest_ok: bool,
    /// Byte count equals the recorded size.
    pub size_ok: bool,
}

impl ArtifactReport {
    /// Whether every check passed.
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.present && self.digest_ok && self.size_ok
    }
}

/// Status of one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    /// Run id from the index.
    pub run_id: String,
    /// Manifest bytes hash to the digest in the index.
    pub manifest_digest_ok: bool,
    /// Manifest names the same run, tenant, and mode as the index.
    pub bound_to_index: bool,
    /// Manifest signature verifies.
    pub signature_ok: bool,
    /// Why the run could not be checked, or why the signature failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Per-artifact status.
    pub artifacts: Vec<ArtifactReport>,
}

impl RunReport {
    fn new(run_id: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            manifest_digest_ok: false,
            bound_to_index: false,
            signature_ok: false,
            error: None,
            artifacts: Vec::new(),
        }
    }

    /// Whether every check passed.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.manifest_digest_ok
            && self.bound_to_index
            && self.signature_ok
            && !self.artifacts.is_empty()
            && self.artifacts.iter().all(ArtifactReport::is_valid)
    }
}

/// Result of [`verify_pack`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PackReport {
    /// Pack id from the index.
    pub pack_id: String,
    /// Tenant id from the index.
    pub tenant_id: String,
    /// Key id of the shipped public key.
    pub key_id: String,
    /// The shipped key has the key id the caller pinned.
    pub key_trusted: bool,
    /// Per-run status, in index order.
    pub runs: Vec<RunReport>,
    /// Pack digest recorded in the index.
    pub recorded_pack_digest: ContentDigest,
    /// Pack digest recomputed from the manifests on disk. Absent when a
    /// manifest could not be read.
    pub recomputed_pack_digest: Option<ContentDigest>,
}

impl PackReport {
    /// Recomputed pack digest equals the recorded one.
    #[must_use]
    pub fn pack_digest_ok(&self) -> bool {
        self.recomputed_pack_digest.as_ref() == Some(&self.recorded_pack_digest)
    }

    /// Whether every check in the pack passed.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.key_trusted
            && self.pack_digest_ok()
            && !self.runs.is_empty()
            && self.runs.iter().all(RunReport::is_valid)
    }
}

// =============================================================================
// Pack Verification
// =============================================================================

/// Re-reads a sealed pack and checks everything it claims.
///
/// Signatures are checked with the public key shipped at
/// `keys/manifest_signing.pub`. That key is only trusted when its key id is
/// `expected_key_id`: anyone able to rewrite the pack can also re-sign it
/// with a key of their own.
///
/// # Errors
///
/// Returns [`PackVerifyError`] only when no report can be produced: the
/// index or the public key is missing, oversized, or malformed. Every other
/// failure is recorded in the returned [`PackReport`].
pub fn verify_pack(
    dir: &Path,
    expected_key_id: &str,
) -> Result<PackReport, PackVerifyError> {
    let index: PackIndex = parse("pack index", &read_bounded(&dir.join(PACK_INDEX_FILE))?)?;
    let verifier = read_public_key_file(&dir.join(PUBLIC_KEY_PATH))?;
    let key_trusted = expected_key_id == verifier.key_id();

    let mut runs = Vec::with_capacity(index.runs.len());
    let mut on_disk = Vec::with_capacity(index.runs.len());
    for entry in &index.runs {
        let (report, digest) = verify_run(dir, &index.tenant_id, entry, &verifier);
        runs.push(report);
        on_disk.push(digest.map(|d| (entry.run_id.as_str(), d)));
    }
    let recomputed_pack_digest = on_disk
        .into_iter()
        .collect::<Option<Vec<_>>>()
        .map(|digests| compute_pack_digest(digests.iter().map(|(id, d)| (*id, d))));

    let report = PackReport {
        pack_id: index.pack_id,
        tenant_id: index.tenant_id,
        key_id: verifier.key_id().to_string(),
        key_trusted,
        runs,
        recorded_pack_digest: index.pack_digest,
        recomputed_pack_digest,
    };
    if report.is_valid() {
        info!(pack_id = %report.pack_id, runs = report.runs.len(), "proof pack verified");
    } else {
        warn!(
            pack_id = %report.pack_id,
            key_trusted = report.key_trusted,
            pack_digest_ok = report.pack_digest_ok(),
            "proof pack failed verification"
        );
    }
    Ok(report)
}

fn verify_run(
    dir: &Path,
    tenant_id: &str,
    entry: &PackRunEntry,
    verifier: &ManifestVerifier,
) -> (RunReport, Option<ContentDigest>) {
    let mut report = RunReport::new(&entry.run_id);
    let Some(path) = resolve(dir, &entry.path) else {
        report.error = Some(format!("manifest path escapes the pack: {}", entry.path));
        return (report, None);
    };
    let bytes = match read_bounded(&path) {
        Ok(bytes) => bytes,
        Err(e) => {
            report.error = Some(e.to_string());
            return (report, None);
        },
    };
    let digest = hash_bytes(&bytes);
    report.manifest_digest_ok = entry.digest.matches(&bytes);

    let manifest: RunManifest = match parse("manifest", &bytes) {
        Ok(manifest) => manifest,
        Err(e) => {
            report.error = Some(e.to_string());
            return (report, Some(digest));
        },
    };
    report.bound_to_index = manifest.run_id == entry.run_id
        && manifest.tenant_id == tenant_id
        && manifest.mode == entry.mode;
    match verify_manifest_signature(&manifest, verifier) {
        Ok(()) => report.signature_ok = true,
        Err(e) => report.error = Some(e.to_string()),
    }
    report.artifacts = manifest
        .artifacts
        .iter()
        .map(|artifact| check_artifact(dir, artifact))
        .collect();
    (report, Some(digest))
}

fn check_artifact(dir: &Path, entry: &ArtifactEntry) -> ArtifactReport {
    let mut report = ArtifactReport {
        name: entry.name.clone(),
        path: entry.path.clone(),
        present: false,
        digest_ok: false,
        size_ok: false,
    };
    if let Some(bytes) = resolve(dir, &entry.path).and_then(|p| read_bounded(&p).ok()) {
        report.present = true;
        report.digest_ok = entry.digest.matches(&bytes);
        report.size_ok = bytes.len() as u64 == entry.byte_size;
    }
    report
}

/// Joins a pack-relative path, refusing anything that could leave `dir`.
fn resolve(dir: &Path, relative: &str) -> Option<PathBuf> {
    let rel = Path::new(relative);
    let plain = !relative.is_empty()
        && !relative.contains('\\')
        && rel.components().all(|c| matches!(c, Component::Normal(_)));
    plain.then(|| dir.join(rel))
}

fn read_bounded(path: &Path) -> Result<Vec<u8>, PackVerifyError> {
    let io_err = |source| PackVerifyError::Io {
        path: path.to_path_buf(),
        source,
    };
    let size = fs::metadata(path).map_err(io_err)?.len();
    if size > MAX_PACK_FILE_BYTES {
        return Err(PackVerifyError::TooLarge {
            path: path.to_path_buf(),
            size,
            max: MAX_PACK_FILE_BYTES,
        });
    }
    fs::read(path).map_err(io_err)
}

fn parse<T: DeserializeOwned>(what: &str, bytes: &[u8]) -> Result<T, PackVerifyError> {
    serde_json::from_slice(bytes).map_err(|e| PackVerifyError::Parse {
        what: what.to_string(),
        message: e.to_string(),
    })
}
