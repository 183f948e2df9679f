//! Sealing and verification of proof packs.

use std::fs;

use proptest::prelude::*;
use secrecy::SecretString;
use tempfile::TempDir;

use super::*;
use crate::boundary::{EffectParameters, SideEffectIntent};
use crate::canonical::{digest_of, hash_bytes};
use crate::config::SourceConfig;
use crate::crypto::{CryptoError, ManifestSigner, ReceiptMac};
use crate::receipt::{OperationKind, ReceiptBuilder, RunMode};

const TENANT: &str = "tenant-acme";

fn signer() -> ManifestSigner {
    ManifestSigner::from_seed(&[7u8; 32])
}

fn mac() -> ReceiptMac {
    ReceiptMac::new(
        "authority-key-1",
        SecretString::from("pack-test-secret-0123456789abcdef"),
    )
    .unwrap()
}

fn ledger(mode: RunMode) -> Vec<SideEffectIntent> {
    [OperationKind::Tag, OperationKind::Publish]
        .into_iter()
        .map(|op| {
            let mut intent = SideEffectIntent::new(
                mode,
                op,
                "registry.example/acme/widget",
                EffectParameters::from_pairs([("version", "1.4.0")]).unwrap(),
            );
            intent.blocked_by_mode = mode == RunMode::DryRun;
            intent
        })
        .collect()
}

fn run(run_id: &str, tenant: &str, mode: RunMode) -> CompletedRun {
    let plan = RunPlan {
        run_id: run_id.to_string(),
        tenant_id: tenant.to_string(),
        mode,
        operations: vec![
            PlannedOperation {
                operation_kind: OperationKind::Tag,
                target: "acme/widget".to_string(),
            },
            PlannedOperation {
                operation_kind: OperationKind::Publish,
                target: "registry.example/acme/widget".to_string(),
            },
        ],
    };
    let ledger = ledger(mode);
    let receipt = ReceiptBuilder::new(run_id, OperationKind::Publish, mode)
        .issuer("authority", "https://authority.internal/v1")
        .plan_digest(digest_of(&plan).unwrap())
        .ledger_digest(digest_of(&ledger).unwrap())
        .policy_set("default", "3", hash_bytes(b"policy"))
        .sign(&mac())
        .unwrap();
    CompletedRun {
        run_id: run_id.to_string(),
        tenant_id: tenant.to_string(),
        mode,
        scenario: format!("{}-release", mode.as_str()),
        scope: RunScope {
            tenant_id: tenant.to_string(),
            repos: vec!["acme/widget".to_string()],
            repos_total: 1,
            issues_total: 12,
        },
        plan,
        ledger,
        receipt: Some(receipt),
        summary: RunSummary {
            run_id: run_id.to_string(),
            policy_verdict: "pass".to_string(),
            recommendation_outcome: "approve".to_string(),
            notes: Vec::new(),
        },
    }
}

fn seal(runs: &[CompletedRun]) -> (TempDir, PackIndex) {
    let dir = TempDir::new().unwrap();
    let signer = signer();
    let index = PackSealer::new(&signer, (&SourceConfig::default()).into())
        .seal(runs, dir.path())
        .unwrap();
    (dir, index)
}

fn read_manifest(dir: &TempDir, run_id: &str) -> RunManifest {
    let bytes = fs::read(dir.path().join(format!("runs/{run_id}/manifest.json"))).unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[test]
fn sealed_pack_verifies() {
    let (dir, index) = seal(&[
        run("run-b", TENANT, RunMode::Prod),
        run("run-a", TENANT, RunMode::DryRun),
    ]);

    let ids: Vec<_> = index.runs.iter().map(|r| r.run_id.as_str()).collect();
    assert_eq!(ids, ["run-a", "run-b"]);
    assert_eq!(index.tenant_id, TENANT);
    assert!(dir.path().join(PACK_INDEX_FILE).is_file());
    assert!(dir.path().join(PUBLIC_KEY_PATH).is_file());

    let report = verify_pack(dir.path(), signer().key_id()).unwrap();
    assert!(report.is_valid(), "{report:#?}");
    assert!(report.pack_digest_ok());
    assert_eq!(report.runs.len(), 2);
    for run in &report.runs {
        let names: Vec<_> = run.artifacts.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, ["plan", "ledger", "receipt", "summary"]);
    }
}

#[test]
fn manifest_records_bytes_on_disk_and_rollup() {
    let (dir, _) = seal(&[run("run-a", TENANT, RunMode::DryRun)]);
    let manifest = read_manifest(&dir, "run-a");

    assert_eq!(manifest.schema_version, MANIFEST_SCHEMA_VERSION);
    for artifact in &manifest.artifacts {
        let bytes = fs::read(dir.path().join(&artifact.path)).unwrap();
        assert!(artifact.digest.matches(&bytes));
        assert_eq!(artifact.byte_size, bytes.len() as u64);
        assert_eq!(artifact.content_type, "application/json");
    }

    assert_eq!(manifest.rollup.intents_total, 2);
    assert_eq!(manifest.rollup.blocked_by_mode, 2);
    assert_eq!(manifest.rollup.blocked_by_policy, 0);
    assert_eq!(manifest.rollup.policy_verdict, "pass");
    assert!(manifest.invariants.dry_run_blocks_all_side_effects);
    assert!(manifest.invariants.authority_is_only_mint);
    assert!(manifest.invariants.ports_are_gateways);
}

#[test]
fn mint_invariant_is_structural() {
    let mut forged = run("run-a", TENANT, RunMode::Prod);
    if let Some(receipt) = forged.receipt.as_mut() {
        receipt.signature.sig = "00".repeat(32);
    }
    let mut unsigned = run("run-b", TENANT, RunMode::Prod);
    if let Some(receipt) = unsigned.receipt.as_mut() {
        receipt.signature.sig.clear();
    }
    let (dir, _) = seal(&[forged, unsigned]);

    // The sealer has no MAC secret: a present but wrong MAC still passes.
    assert!(read_manifest(&dir, "run-a").invariants.authority_is_only_mint);
    assert!(!read_manifest(&dir, "run-b").invariants.authority_is_only_mint);
}

#[test]
fn run_without_receipt_has_no_receipt_artifact() {
    let mut completed = run("run-a", TENANT, RunMode::DryRun);
    completed.receipt = None;
    let (dir, _) = seal(&[completed]);

    let manifest = read_manifest(&dir, "run-a");
    let names: Vec<_> = manifest.artifacts.iter().map(|a| a.name.as_str()).collect();
    assert_eq!(names, ["plan", "ledger", "summary"]);
    assert!(!dir.path().join("runs/run-a/receipt.json").exists());
    assert!(verify_pack(dir.path(), signer().key_id()).unwrap().is_valid());
}

#[test]
fn tampered_artifact_fails_while_signature_holds() {
    let (dir, _) = seal(&[run("run-a", TENANT, RunMode::Prod)]);
    let ledger_path = dir.path().join("runs/run-a/ledger.json");
    let mut bytes = fs::read(&ledger_path).unwrap();
    bytes[10] ^= 0x01;
    fs::write(&ledger_path, &bytes).unwrap();

    let report = verify_pack(dir.path(), signer().key_id()).unwrap();
    assert!(!report.is_valid());
    assert!(report.pack_digest_ok());

    let run = &report.runs[0];
    assert!(run.signature_ok);
    assert!(run.manifest_digest_ok);
    for artifact in &run.artifacts {
        if artifact.name == "ledger" {
            assert!(artifact.present && !artifact.digest_ok && artifact.size_ok);
        } else {
            assert!(artifact.is_valid(), "{artifact:?}");
        }
    }
}

#[test]
fn tampered_manifest_breaks_signature_and_pack_digest() {
    let (dir, _) = seal(&[run("run-a", TENANT, RunMode::Prod)]);
    let path = dir.path().join("runs/run-a/manifest.json");
    let text = fs::read_to_string(&path).unwrap();
    fs::write(&path, text.replace("\"issuesTotal\":12", "\"issuesTotal\":13")).unwrap();

    let report = verify_pack(dir.path(), signer().key_id()).unwrap();
    let run = &report.runs[0];
    assert!(!run.manifest_digest_ok);
    assert!(!run.signature_ok);
    assert!(!report.pack_digest_ok());
    assert!(!report.is_valid());
}

#[test]
fn deleted_artifact_is_reported_missing() {
    let (dir, _) = seal(&[run("run-a", TENANT, RunMode::Prod)]);
    fs::remove_file(dir.path().join("runs/run-a/summary.json")).unwrap();

    let report = verify_pack(dir.path(), signer().key_id()).unwrap();
    let summary = report.runs[0]
        .artifacts
        .iter()
        .find(|a| a.name == "summary")
        .unwrap();
    assert!(!summary.present);
    assert!(!report.is_valid());
}

#[test]
fn unexpected_key_id_is_untrusted() {
    let (dir, _) = seal(&[run("run-a", TENANT, RunMode::Prod)]);
    let report = verify_pack(dir.path(), "ed25519:0000000000000000").unwrap();
    assert!(!report.key_trusted);
    assert!(!report.is_valid());
}

#[test]
fn pack_resealed_with_another_key_is_untrusted() {
    let forged_signer = ManifestSigner::from_seed(&[9u8; 32]);
    let dir = TempDir::new().unwrap();
    PackSealer::new(&forged_signer, (&SourceConfig::default()).into())
        .seal(&[run("run-a", TENANT, RunMode::Prod)], dir.path())
        .unwrap();

    let report = verify_pack(dir.path(), signer().key_id()).unwrap();
    assert!(report.runs.iter().all(|r| r.signature_ok));
    assert!(report.pack_digest_ok());
    assert!(!report.key_trusted);
    assert!(!report.is_valid());
}

#[test]
fn missing_index_is_an_error() {
    let dir = TempDir::new().unwrap();
    assert!(matches!(
        verify_pack(dir.path(), signer().key_id()),
        Err(PackVerifyError::Io { .. })
    ));
}

#[test]
fn manifest_signature_checks() {
    let (dir, _) = seal(&[run("run-a", TENANT, RunMode::Prod)]);
    let manifest = read_manifest(&dir, "run-a");
    let verifier = signer().verifier();

    verify_manifest_signature(&manifest, &verifier).unwrap();

    let other = ManifestSigner::from_seed(&[9u8; 32]).verifier();
    assert!(matches!(
        verify_manifest_signature(&manifest, &other),
        Err(PackVerifyError::KeyMismatch { .. })
    ));

    assert!(matches!(
        verify_manifest_signature(&manifest.unsigned(), &verifier),
        Err(PackVerifyError::MissingSignature)
    ));

    let mut altered = manifest.clone();
    altered.scenario = "prod-hotfix".to_string();
    assert!(matches!(
        verify_manifest_signature(&altered, &verifier),
        Err(PackVerifyError::Crypto(CryptoError::VerificationFailed))
    ));

    let mut wrong_alg = manifest;
    if let Some(block) = wrong_alg.manifest_signature.as_mut() {
        block.alg = "rsa".to_string();
    }
    assert!(matches!(
        verify_manifest_signature(&wrong_alg, &verifier),
        Err(PackVerifyError::AlgorithmMismatch { .. })
    ));
}

#[test]
fn manifest_bytes_round_trip_through_verifier() {
    let (dir, _) = seal(&[run("run-a", TENANT, RunMode::Prod)]);
    let bytes = fs::read(dir.path().join("runs/run-a/manifest.json")).unwrap();
    let manifest = verify_manifest_bytes(&bytes, &signer().verifier()).unwrap();
    assert_eq!(manifest.run_id, "run-a");

    assert!(matches!(
        verify_manifest_bytes(b"{\"runId\":1}", &signer().verifier()),
        Err(PackVerifyError::Parse { .. })
    ));
}

#[test]
fn seal_rejects_bad_run_sets() {
    let dir = TempDir::new().unwrap();
    let signer = signer();
    let sealer = PackSealer::new(&signer, (&SourceConfig::default()).into());

    assert!(matches!(
        sealer.seal(&[], dir.path()),
        Err(SealError::EmptyPack)
    ));

    match sealer.seal(
        &[
            run("run-a", TENANT, RunMode::Prod),
            run("run-b", "tenant-globex", RunMode::Prod),
        ],
        dir.path(),
    ) {
        Err(SealError::CrossTenantPack { tenants }) => {
            assert_eq!(tenants, ["tenant-acme", "tenant-globex"]);
        },
        other => panic!("expected CrossTenantPack, got {other:?}"),
    }

    let mut scope_drift = run("run-a", TENANT, RunMode::Prod);
    scope_drift.scope.tenant_id = "tenant-globex".to_string();
    assert!(matches!(
        sealer.seal(&[scope_drift], dir.path()),
        Err(SealError::CrossTenantPack { .. })
    ));

    assert!(matches!(
        sealer.seal(
            &[
                run("run-a", TENANT, RunMode::Prod),
                run("run-a", TENANT, RunMode::DryRun),
            ],
            dir.path()
        ),
        Err(SealError::DuplicateRun { .. })
    ));

    assert!(matches!(
        sealer.seal(&[run("../escape", TENANT, RunMode::Prod)], dir.path()),
        Err(SealError::InvalidRunId { .. })
    ));

    // Nothing was written for rejected inputs.
    assert!(!dir.path().join(PACK_INDEX_FILE).exists());
}

#[test]
fn seal_refuses_to_overwrite_a_pack() {
    let (dir, _) = seal(&[run("run-a", TENANT, RunMode::Prod)]);
    let signer = signer();
    let err = PackSealer::new(&signer, (&SourceConfig::default()).into())
        .seal(&[run("run-b", TENANT, RunMode::Prod)], dir.path())
        .unwrap_err();
    assert!(matches!(err, SealError::PackExists { .. }));
}

#[test]
fn receipt_bound_to_other_plan_is_binding_drift() {
    let mut drifted = run("run-a", TENANT, RunMode::Prod);
    drifted.plan.operations.pop();

    let dir = TempDir::new().unwrap();
    let signer = signer();
    let err = PackSealer::new(&signer, (&SourceConfig::default()).into())
        .seal(&[drifted], dir.path())
        .unwrap_err();
    assert!(matches!(
        err,
        SealError::BindingDrift {
            artifact: "plan",
            ..
        }
    ));
}

#[test]
fn receipt_bound_to_other_ledger_is_binding_drift() {
    let mut drifted = run("run-a", TENANT, RunMode::Prod);
    drifted.ledger.truncate(1);

    let dir = TempDir::new().unwrap();
    let signer = signer();
    let err = PackSealer::new(&signer, (&SourceConfig::default()).into())
        .seal(&[drifted], dir.path())
        .unwrap_err();
    assert!(matches!(
        err,
        SealError::BindingDrift {
            artifact: "ledger",
            ..
        }
    ));
}

#[test]
fn receipt_for_another_run_is_rejected() {
    let mut swapped = run("run-a", TENANT, RunMode::Prod);
    swapped.receipt = run("run-z", TENANT, RunMode::Prod).receipt;

    let dir = TempDir::new().unwrap();
    let signer = signer();
    let err = PackSealer::new(&signer, (&SourceConfig::default()).into())
        .seal(&[swapped], dir.path())
        .unwrap_err();
    assert!(matches!(err, SealError::ReceiptRunMismatch { .. }));
}

#[test]
fn pack_digest_is_reproducible_from_manifests() {
    let (dir, index) = seal(&[
        run("run-a", TENANT, RunMode::Prod),
        run("run-b", TENANT, RunMode::DryRun),
    ]);
    let from_disk: Vec<_> = index
        .runs
        .iter()
        .map(|entry| {
            let bytes = fs::read(dir.path().join(&entry.path)).unwrap();
            (entry.run_id.as_str(), hash_bytes(&bytes))
        })
        .collect();
    let recomputed = compute_pack_digest(from_disk.iter().map(|(id, d)| (*id, d)));
    assert_eq!(recomputed, index.pack_digest);
}

#[test]
fn pack_digest_concatenates_hex_without_separators() {
    let a = hash_bytes(b"a");
    let b = hash_bytes(b"b");
    let expected = hash_bytes(format!("{}{}", a.hex(), b.hex()).as_bytes());
    assert_eq!(compute_pack_digest([("run-1", &a), ("run-2", &b)]), expected);
}

proptest! {
    #[test]
    fn pack_digest_ignores_input_order(
        seeds in prop::collection::btree_set("[a-z0-9]{1,8}", 1..8),
        rotation in 0usize..8,
    ) {
        let entries: Vec<(String, ContentDigest)> = seeds
            .into_iter()
            .map(|id| {
                let digest = hash_bytes(id.as_bytes());
                (id, digest)
            })
            .collect();
        let mut shuffled = entries.clone();
        shuffled.rotate_left(rotation % entries.len());
        shuffled.reverse();

        let ordered = compute_pack_digest(entries.iter().map(|(id, d)| (id.as_str(), d)));
        let reordered = compute_pack_digest(shuffled.iter().map(|(id, d)| (id.as_str(), d)));
        prop_assert_eq!(ordered, reordered);
    }
}
