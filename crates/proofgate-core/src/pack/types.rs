//! Proof pack records.
//!
//! Field order in every struct is the canonical order of its JSON form.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::boundary::SideEffectIntent;
use crate::canonical::{ContentDigest, timestamp};
use crate::config::SourceConfig;
use crate::receipt::{AuthorizationReceipt, OperationKind, RunMode};

/// Schema identifier of [`RunManifest`].
pub const MANIFEST_SCHEMA_VERSION: &str = "proofgate.run_manifest.v1";

/// Schema identifier of [`PackIndex`].
pub const PACK_INDEX_SCHEMA_VERSION: &str = "proofgate.pack_index.v1";

// =============================================================================
// Inputs
// =============================================================================

/// One planned operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PlannedOperation {
    /// Operation kind.
    pub operation_kind: OperationKind,
    /// Where it lands.
    pub target: String,
}

/// What a run set out to do. Its canonical bytes are the plan digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RunPlan {
    /// Run id.
    pub run_id: String,
    /// Tenant id.
    pub tenant_id: String,
    /// Run mode.
    pub mode: RunMode,
    /// Planned operations, in order.
    pub operations: Vec<PlannedOperation>,
}

/// How the run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RunSummary {
    /// Run id.
    pub run_id: String,
    /// Verdict of policy evaluation.
    pub policy_verdict: String,
    /// Recommendation the run produced.
    pub recommendation_outcome: String,
    /// Free-form notes.
    #[serde(default)]
    pub notes: Vec<String>,
}

/// What the run covered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RunScope {
    /// Tenant id.
    pub tenant_id: String,
    /// Repositories in scope.
    pub repos: Vec<String>,
    /// Number of repositories considered.
    pub repos_total: u64,
    /// Number of issues considered.
    pub issues_total: u64,
}

/// A finished run handed to the sealer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedRun {
    /// Run id.
    pub run_id: String,
    /// Tenant id.
    pub tenant_id: String,
    /// Run mode.
    pub mode: RunMode,
    /// Scenario label.
    pub scenario: String,
    /// Scope.
    pub scope: RunScope,
    /// Plan.
    pub plan: RunPlan,
    /// Every intent the boundary recorded.
    pub ledger: Vec<SideEffectIntent>,
    /// Authorization receipt, if one was issued.
    pub receipt: Option<AuthorizationReceipt>,
    /// Summary.
    pub summary: RunSummary,
}

// =============================================================================
// Manifest
// =============================================================================

/// Where a manifest was produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ManifestSource {
    /// Host.
    pub host: String,
    /// Service name.
    pub service: String,
    /// Service version.
    pub service_version: String,
}

impl From<&SourceConfig> for ManifestSource {
    fn from(source: &SourceConfig) -> Self {
        Self {
            host: source.host.clone(),
            service: source.service.clone(),
            service_version: source.service_version.clone(),
        }
    }
}

/// Safety properties observed in the run's own records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ManifestInvariants {
    /// Every dry-run intent in the ledger was blocked by mode.
    pub dry_run_blocks_all_side_effects: bool,
    /// The receipt, if any, carries a non-empty authority MAC and is bound
    /// to this run.
    ///
    /// Structural only: the sealer holds no MAC secret, so the MAC itself
    /// is not verified here. Authority is verified once, by the
    /// [`ReceiptValidator`](crate::receipt::ReceiptValidator), before the
    /// effect runs.
    pub authority_is_only_mint: bool,
    /// Every intent declared that it required enforceable authorization.
    pub ports_are_gateways: bool,
}

/// One persisted artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ArtifactEntry {
    /// Logical name (`plan`, `ledger`, `receipt`, `summary`).
    pub name: String,
    /// Pack-relative path.
    pub path: String,
    /// MIME type.
    pub content_type: String,
    /// Digest of the bytes on disk.
    pub digest: ContentDigest,
    /// Size of the bytes on disk.
    pub byte_size: u64,
}

/// Counts derived from the ledger plus the summary's verdicts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Rollup {
    /// Intents recorded.
    pub intents_total: u64,
    /// Intents blocked because the run was not prod.
    pub blocked_by_mode: u64,
    /// Intents blocked by an authorization check.
    pub blocked_by_policy: u64,
    /// Policy verdict from the summary.
    pub policy_verdict: String,
    /// Recommendation from the summary.
    pub recommendation_outcome: String,
}

impl Rollup {
    /// Derives the rollup for a run.
    #[must_use]
    pub fn derive(ledger: &[SideEffectIntent], summary: &RunSummary) -> Self {
        let count = |pred: fn(&SideEffectIntent) -> bool| {
            ledger.iter().filter(|i| pred(i)).count() as u64
        };
        Self {
            intents_total: ledger.len() as u64,
            blocked_by_mode: count(|i| i.blocked_by_mode),
            blocked_by_policy: count(|i| i.blocked_by_policy),
            policy_verdict: summary.policy_verdict.clone(),
            recommendation_outcome: summary.recommendation_outcome.clone(),
        }
    }
}

/// Detached signature block over the manifest without this block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ManifestSignature {
    /// Always `ed25519`.
    pub alg: String,
    /// Signing key id.
    pub key_id: String,
    /// Pack-relative path of the public key.
    pub public_key_path: String,
    /// Base64 signature.
    pub signature: String,
    /// When the manifest was signed.
    #[serde(with = "timestamp")]
    pub signed_at: DateTime<Utc>,
}

/// Signed description of one run's sealed artifacts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RunManifest {
    /// Always [`MANIFEST_SCHEMA_VERSION`].
    pub schema_version: String,
    /// Run id.
    pub run_id: String,
    /// Tenant id.
    pub tenant_id: String,
    /// When the manifest was built.
    #[serde(with = "timestamp")]
    pub issued_at: DateTime<Utc>,
    /// Run mode.
    pub mode: RunMode,
    /// Scenario label.
    pub scenario: String,
    /// Provenance.
    pub source: ManifestSource,
    /// Scope.
    pub scope: RunScope,
    /// Observed safety properties.
    pub invariants: ManifestInvariants,
    /// Persisted artifacts.
    pub artifacts: Vec<ArtifactEntry>,
    /// Ledger rollup.
    pub rollup: Rollup,
    /// Signature block. Absent from the signed bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest_signature: Option<ManifestSignature>,
}

impl RunManifest {
    /// Copy of the manifest with the signature block removed.
    #[must_use]
    pub fn unsigned(&self) -> Self {
        Self {
            manifest_signature: None,
            ..self.clone()
        }
    }

    /// Copy of the manifest carrying `signature`.
    #[must_use]
    pub fn with_signature(&self, signature: ManifestSignature) -> Self {
        Self {
            manifest_signature: Some(signature),
            ..self.clone()
        }
    }
}

// =============================================================================
// Pack index
// =============================================================================

/// One run in the pack index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PackRunEntry {
    /// Run id.
    pub run_id: String,
    /// Scenario label.
    pub scenario: String,
    /// Run mode.
    pub mode: RunMode,
    /// Pack-relative path of the signed manifest.
    pub path: String,
    /// Digest of the signed manifest bytes on disk.
    pub digest: ContentDigest,
}

/// Top-level index of a sealed pack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PackIndex {
    /// Always [`PACK_INDEX_SCHEMA_VERSION`].
    pub schema_version: String,
    /// When the pack was sealed.
    #[serde(with = "timestamp")]
    pub created_at: DateTime<Utc>,
    /// Pack id.
    pub pack_id: String,
    /// Tenant every run belongs to.
    pub tenant_id: String,
    /// Runs, sorted by run id.
    pub runs: Vec<PackRunEntry>,
    /// Digest over the manifest digests; see
    /// [`compute_pack_digest`](super::compute_pack_digest).
    pub pack_digest: ContentDigest,
}
