//! Sealing finished runs into a pack directory.

use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::io::Write;
use std::path::Path;

use tracing::{debug, info};
use uuid::Uuid;

use super::types::{
    ArtifactEntry, CompletedRun, MANIFEST_SCHEMA_VERSION, ManifestInvariants, ManifestSignature,
    ManifestSource, PACK_INDEX_SCHEMA_VERSION, PackIndex, PackRunEntry, Rollup, RunManifest,
};
use super::{PACK_INDEX_FILE, PUBLIC_KEY_PATH, SealError, compute_pack_digest};
use crate::canonical::{ContentDigest, canonicalize, hash_bytes, timestamp};
use crate::crypto::{MANIFEST_SIGNATURE_ALGORITHM, ManifestSigner};
use crate::receipt::{AuthorizationReceipt, RunMode};

const JSON: &str = "application/json";

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> SealError + '_ {
    move |source| SealError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Writes sealed packs.
///
/// ```no_run
/// use std::path::Path;
///
/// use proofgate_core::config::SourceConfig;
/// use proofgate_core::crypto::ManifestSigner;
/// use proofgate_core::pack::{CompletedRun, PackSealer};
///
/// # fn runs() -> Vec<CompletedRun> { Vec::new() }
/// let signer = ManifestSigner::generate();
/// let sealer = PackSealer::new(&signer, (&SourceConfig::default()).into());
/// let index = sealer.seal(&runs(), Path::new("out/pack")).unwrap();
/// println!("{}", index.pack_digest);
/// ```
#[derive(Debug)]
pub struct PackSealer<'a> {
    signer: &'a ManifestSigner,
    source: ManifestSource,
}

impl<'a> PackSealer<'a> {
    /// Sealer signing with `signer` and stamping `source` into manifests.
    #[must_use]
    pub const fn new(signer: &'a ManifestSigner, source: ManifestSource) -> Self {
        Self { signer, source }
    }

    /// Seals `runs` into `out_dir` and returns the written index.
    ///
    /// Runs are written in run id order. The index is written last, so a
    /// directory without `pack_index.json` is not a pack.
    ///
    /// # Errors
    ///
    /// - [`SealError::EmptyPack`], [`SealError::CrossTenantPack`],
    ///   [`SealError::DuplicateRun`], [`SealError::InvalidRunId`] for bad
    ///   input
    /// - [`SealError::PackExists`] if `out_dir` already holds an index
    /// - [`SealError::ReceiptRunMismatch`] and [`SealError::BindingDrift`]
    ///   if a receipt does not bind the bytes actually written
    /// - [`SealError::Io`] and [`SealError::Canonical`] otherwise
    pub fn seal(&self, runs: &[CompletedRun], out_dir: &Path) -> Result<PackIndex, SealError> {
        let tenant_id = check_runs(runs)?;
        let index_path = out_dir.join(PACK_INDEX_FILE);
        if index_path.exists() {
            return Err(SealError::PackExists { path: index_path });
        }

        let mut ordered: Vec<&CompletedRun> = runs.iter().collect();
        ordered.sort_by(|a, b| a.run_id.cmp(&b.run_id));

        let verifier = self.signer.verifier();
        write_atomic(
            &out_dir.join(PUBLIC_KEY_PATH),
            format!("{}\n", verifier.public_key_hex()).as_bytes(),
        )?;

        let entries = ordered
            .into_iter()
            .map(|run| self.seal_run(run, out_dir))
            .collect::<Result<Vec<_>, _>>()?;

        let pack_digest =
            compute_pack_digest(entries.iter().map(|e| (e.run_id.as_str(), &e.digest)));
        let index = PackIndex {
            schema_version: PACK_INDEX_SCHEMA_VERSION.to_string(),
            created_at: timestamp::now_millis(),
            pack_id: format!("pack-{}", Uuid::new_v4()),
            tenant_id,
            runs: entries,
            pack_digest,
        };
        write_atomic(&index_path, canonicalize(&index)?.as_bytes())?;

        info!(
            pack_id = %index.pack_id,
            tenant_id = %index.tenant_id,
            runs = index.runs.len(),
            pack_digest = %index.pack_digest,
            key_id = %self.signer.key_id(),
            "proof pack sealed"
        );
        Ok(index)
    }

    fn seal_run(&self, run: &CompletedRun, out_dir: &Path) -> Result<PackRunEntry, SealError> {
        let run_dir = format!("runs/{}", run.run_id);

        let plan = persist(out_dir, &run_dir, "plan", canonicalize(&run.plan)?.as_bytes())?;
        let ledger = persist(out_dir, &run_dir, "ledger", canonicalize(&run.ledger)?.as_bytes())?;
        let mut artifacts = Vec::with_capacity(4);
        if let Some(receipt) = &run.receipt {
            check_binding(run, receipt, &plan.digest, &ledger.digest)?;
            let receipt_entry =
                persist(out_dir, &run_dir, "receipt", canonicalize(receipt)?.as_bytes())?;
            artifacts.extend([plan, ledger, receipt_entry]);
        } else {
            artifacts.extend([plan, ledger]);
        }
        artifacts.push(persist(
            out_dir,
            &run_dir,
            "summary",
            canonicalize(&run.summary)?.as_bytes(),
        )?);

        let unsigned = RunManifest {
            schema_version: MANIFEST_SCHEMA_VERSION.to_string(),
            run_id: run.run_id.clone(),
            tenant_id: run.tenant_id.clone(),
            issued_at: timestamp::now_millis(),
            mode: run.mode,
            scenario: run.scenario.clone(),
            source: self.source.clone(),
            scope: run.scope.clone(),
            invariants: observe_invariants(run),
            artifacts,
            rollup: Rollup::derive(&run.ledger, &run.summary),
            manifest_signature: None,
        };
        let signature = self.signer.sign(canonicalize(&unsigned)?.as_bytes());
        let signed = unsigned.with_signature(ManifestSignature {
            alg: MANIFEST_SIGNATURE_ALGORITHM.to_string(),
            key_id: self.signer.key_id().to_string(),
            public_key_path: PUBLIC_KEY_PATH.to_string(),
            signature,
            signed_at: timestamp::now_millis(),
        });

        let manifest_path = format!("{run_dir}/manifest.json");
        let absolute = out_dir.join(&manifest_path);
        write_atomic(&absolute, canonicalize(&signed)?.as_bytes())?;
        let (digest, _) = read_back(&absolute)?;

        debug!(run_id = %run.run_id, manifest_digest = %digest, "run sealed");
        Ok(PackRunEntry {
            run_id: run.run_id.clone(),
            scenario: run.scenario.clone(),
            mode: run.mode,
            path: manifest_path,
            digest,
        })
    }
}

/// Validates the run set and returns its single tenant.
fn check_runs(runs: &[CompletedRun]) -> Result<String, SealError> {
    let mut tenants: BTreeSet<&str> = runs
        .iter()
        .flat_map(|r| {
            [
                r.tenant_id.as_str(),
                r.scope.tenant_id.as_str(),
                r.plan.tenant_id.as_str(),
            ]
        })
        .collect();
    let tenant = tenants.pop_first().ok_or(SealError::EmptyPack)?;
    if !tenants.is_empty() {
        tenants.insert(tenant);
        return Err(SealError::CrossTenantPack {
            tenants: tenants.into_iter().map(str::to_string).collect(),
        });
    }

    let mut seen = HashSet::with_capacity(runs.len());
    for run in runs {
        if !is_safe_segment(&run.run_id) {
            return Err(SealError::InvalidRunId {
                run_id: run.run_id.clone(),
            });
        }
        if !seen.insert(run.run_id.as_str()) {
            return Err(SealError::DuplicateRun {
                run_id: run.run_id.clone(),
            });
        }
    }
    Ok(tenant.to_string())
}

fn is_safe_segment(id: &str) -> bool {
    !id.is_empty()
        && id != "."
        && id != ".."
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

fn check_binding(
    run: &CompletedRun,
    receipt: &AuthorizationReceipt,
    plan: &ContentDigest,
    ledger: &ContentDigest,
) -> Result<(), SealError> {
    if receipt.run_id != run.run_id {
        return Err(SealError::ReceiptRunMismatch {
            run_id: run.run_id.clone(),
            receipt_run_id: receipt.run_id.clone(),
        });
    }
    let bound = &receipt.subject.subject_digests;
    let drift = |artifact, expected: &ContentDigest, actual: &ContentDigest| {
        SealError::BindingDrift {
            run_id: run.run_id.clone(),
            artifact,
            expected: expected.clone(),
            actual: actual.clone(),
        }
    };
    if bound.plan_digest != *plan {
        return Err(drift("plan", &bound.plan_digest, plan));
    }
    if let Some(expected) = &bound.ledger_digest {
        if expected != ledger {
            return Err(drift("ledger", expected, ledger));
        }
    }
    Ok(())
}

/// Reads invariants off the run's records. These are shape checks; nothing
/// here verifies a MAC or a signature.
fn observe_invariants(run: &CompletedRun) -> ManifestInvariants {
    ManifestInvariants {
        dry_run_blocks_all_side_effects: run
            .ledger
            .iter()
            .filter(|i| run.mode == RunMode::DryRun || i.mode == RunMode::DryRun)
            .all(|i| i.blocked_by_mode),
        authority_is_only_mint: run
            .receipt
            .as_ref()
            .is_none_or(|r| !r.signature.sig.is_empty() && r.run_id == run.run_id),
        ports_are_gateways: run
            .ledger
            .iter()
            .all(|i| i.required_authorization.enforceable),
    }
}

/// Writes one artifact and describes the bytes that landed on disk.
fn persist(
    out_dir: &Path,
    run_dir: &str,
    name: &str,
    bytes: &[u8],
) -> Result<ArtifactEntry, SealError> {
    let path = format!("{run_dir}/{name}.json");
    let absolute = out_dir.join(&path);
    write_atomic(&absolute, bytes)?;
    let (digest, byte_size) = read_back(&absolute)?;
    Ok(ArtifactEntry {
        name: name.to_string(),
        path,
        content_type: JSON.to_string(),
        digest,
        byte_size,
    })
}

fn read_back(path: &Path) -> Result<(ContentDigest, u64), SealError> {
    let bytes = fs::read(path).map_err(io_err(path))?;
    Ok((hash_bytes(&bytes), bytes.len() as u64))
}

/// Temp file in the destination directory, fsync, then rename over
/// `path`.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), SealError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).map_err(io_err(dir))?;

    let mut temp = tempfile::NamedTempFile::new_in(dir).map_err(io_err(dir))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        temp.as_file()
            .set_permissions(fs::Permissions::from_mode(0o644))
            .map_err(io_err(path))?;
    }
    temp.as_file_mut().write_all(bytes).map_err(io_err(path))?;
    temp.as_file().sync_all().map_err(io_err(path))?;
    temp.persist(path).map_err(|e| SealError::Io {
        path: path.to_path_buf(),
        source: e.error,
    })?;
    Ok(())
}
