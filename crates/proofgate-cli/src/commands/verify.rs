//! `proofgate verify-manifest` and `proofgate verify-pack`.

use std::fs;
use std::path::Path;

use anyhow::{Context, anyhow};
use proofgate_core::crypto::{CryptoError, ManifestVerifier, read_public_key_file};
use proofgate_core::pack::{
    MAX_PACK_FILE_BYTES, PackReport, PackVerifyError, RunManifest, verify_manifest_bytes,
};
use tracing::debug;

use super::{Failure, exit_codes};

/// Verifies one manifest against a public key file.
pub fn verify_manifest(public_key: &Path, manifest: &Path) -> u8 {
    match check_manifest(public_key, manifest) {
        Ok(manifest) => {
            let key_id = manifest
                .manifest_signature
                .as_ref()
                .map_or("", |s| s.key_id.as_str());
            println!(
                "manifest valid: run {} ({}) signed by {key_id}",
                manifest.run_id, manifest.tenant_id
            );
            exit_codes::SUCCESS
        },
        Err(failure) => failure.report(),
    }
}

fn check_manifest(public_key: &Path, manifest: &Path) -> Result<RunManifest, Failure> {
    let verifier = load_key(public_key)?;
    let bytes = read_input(manifest)?;
    debug!(key_id = %verifier.key_id(), bytes = bytes.len(), "verifying manifest");
    verify_manifest_bytes(&bytes, &verifier)
        .with_context(|| format!("manifest {}", manifest.display()))
        .map_err(Failure::Invalid)
}

fn load_key(path: &Path) -> Result<ManifestVerifier, Failure> {
    read_public_key_file(path).map_err(|e| match e {
        CryptoError::Io { .. } => Failure::Usage(anyhow!(e)),
        other => Failure::Invalid(anyhow!(other)),
    })
}

fn read_input(path: &Path) -> Result<Vec<u8>, Failure> {
    let meta = fs::metadata(path)
        .with_context(|| format!("cannot read {}", path.display()))
        .map_err(Failure::Usage)?;
    if meta.len() > MAX_PACK_FILE_BYTES {
        return Err(Failure::Invalid(anyhow!(
            "{} is {} bytes, over the {MAX_PACK_FILE_BYTES} byte limit",
            path.display(),
            meta.len()
        )));
    }
    fs::read(path)
        .with_context(|| format!("cannot read {}", path.display()))
        .map_err(Failure::Usage)
}

/// Verifies a whole pack directory.
pub fn verify_pack(dir: &Path, expected_key_id: &str, json: bool) -> u8 {
    if !dir.is_dir() {
        return Failure::Usage(anyhow!("{} is not a directory", dir.display())).report();
    }
    let report = match proofgate_core::pack::verify_pack(dir, expected_key_id) {
        Ok(report) => report,
        Err(e @ (PackVerifyError::Io { .. } | PackVerifyError::Crypto(CryptoError::Io { .. }))) => {
            return Failure::Usage(anyhow!(e)).report();
        },
        Err(e) => return Failure::Invalid(anyhow!(e)).report(),
    };

    if json {
        match serde_json::to_string_pretty(&report) {
            Ok(text) => println!("{text}"),
            Err(e) => return Failure::Invalid(anyhow!(e)).report(),
        }
    } else {
        print_report(&report);
    }

    if report.is_valid() {
        exit_codes::SUCCESS
    } else {
        exit_codes::INVALID
    }
}

fn print_report(report: &PackReport) {
    let mark = |ok: bool| if ok { "ok" } else { "FAIL" };
    println!("pack {} (tenant {})", report.pack_id, report.tenant_id);
    println!("  key {}: {}", report.key_id, mark(report.key_trusted));
    for run in &report.runs {
        println!(
            "  run {}: manifest {}, signature {}, bound {}",
            run.run_id,
            mark(run.manifest_digest_ok),
            mark(run.signature_ok),
            mark(run.bound_to_index)
        );
        if let Some(error) = &run.error {
            println!("    error: {error}");
        }
        for artifact in &run.artifacts {
            if !artifact.is_valid() {
                println!(
                    "    {} ({}): present {}, digest {}, size {}",
                    artifact.name,
                    artifact.path,
                    mark(artifact.present),
                    mark(artifact.digest_ok),
                    mark(artifact.size_ok)
                );
            }
        }
    }
    println!("  pack digest: {}", mark(report.pack_digest_ok()));
    println!("{}", if report.is_valid() { "VALID" } else { "INVALID" });
}
