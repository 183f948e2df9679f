//! Gate packet, result, and evidence types.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::boundary::EffectParameters;
use crate::canonical::{ContentDigest, timestamp};
use crate::receipt::OperationKind;

// =============================================================================
// Denial codes
// =============================================================================

/// Stable denial codes carried by [`GateResult::denial_code`].
pub mod codes {
    /// A required packet field is empty.
    pub const PRECHECK_MISSING_FIELD: &str = "PRECHECK_MISSING_FIELD";
    /// Destination is not in the allow-list.
    pub const PRECHECK_DESTINATION_NOT_ALLOWED: &str = "PRECHECK_DESTINATION_NOT_ALLOWED";
    /// Tenant differs from the configured identity.
    pub const PRECHECK_TENANT_MISMATCH: &str = "PRECHECK_TENANT_MISMATCH";
    /// Actor differs from the configured identity.
    pub const PRECHECK_ACTOR_MISMATCH: &str = "PRECHECK_ACTOR_MISMATCH";
    /// Payload reference is not a safe relative path.
    pub const PRECHECK_UNSAFE_PAYLOAD_REF: &str = "PRECHECK_UNSAFE_PAYLOAD_REF";
    /// Payload reference names a kind outside the allow-list.
    pub const PRECHECK_PAYLOAD_KIND_NOT_ALLOWED: &str = "PRECHECK_PAYLOAD_KIND_NOT_ALLOWED";

    /// No payload digest was supplied.
    pub const CANONICAL_HASH_MISSING: &str = "CANONICAL_HASH_MISSING";
    /// The packet could not be canonicalized.
    pub const CANONICAL_HASH_FAILED: &str = "CANONICAL_HASH_FAILED";

    /// The decision service could not be reached.
    pub const DECISION_UNAVAILABLE: &str = "DECISION_UNAVAILABLE";
    /// The decision service reported failure.
    pub const DECISION_FAILED: &str = "DECISION_FAILED";
    /// The decision was not an approval.
    pub const DECISION_NOT_APPROVED: &str = "DECISION_NOT_APPROVED";
    /// An approval arrived without a receipt id.
    pub const DECISION_RECEIPT_MISSING: &str = "DECISION_RECEIPT_MISSING";

    /// Execution is enabled but no executor is reachable.
    pub const EXECUTION_UNAVAILABLE: &str = "EXECUTION_UNAVAILABLE";
    /// The executor reported failure.
    pub const EXECUTION_FAILED: &str = "EXECUTION_FAILED";

    /// The audit service could not be reached.
    pub const AUDIT_UNAVAILABLE: &str = "AUDIT_UNAVAILABLE";
    /// The audit write did not complete.
    pub const AUDIT_WRITE_FAILED: &str = "AUDIT_WRITE_FAILED";

    /// Evidence did not verify and no collaborator code was given.
    pub const VERIFY_INVALID: &str = "VERIFY_INVALID";
    /// The verification service could not answer.
    pub const VERIFY_UNAVAILABLE: &str = "VERIFY_UNAVAILABLE";

    /// A collaborator failed internally.
    pub const GATE_EXCEPTION: &str = "GATE_EXCEPTION";
}

// =============================================================================
// Gate Packet
// =============================================================================

/// A request to perform one consequential operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct GatePacket {
    /// Run the operation belongs to.
    pub run_id: String,
    /// Tenant the request claims.
    pub tenant_id: String,
    /// Actor the request claims.
    pub actor_id: String,
    /// Where the operation lands.
    pub destination: String,
    /// Operation being requested.
    pub operation_kind: OperationKind,
    /// Relative path of the payload.
    pub payload_ref: String,
    /// Digest of the payload. `None` when the producer could not supply one.
    pub payload_digest: Option<ContentDigest>,
    /// Operation parameters.
    #[serde(default)]
    pub parameters: EffectParameters,
}

// =============================================================================
// Failure Stage
// =============================================================================

/// Pipeline stage that produced a denial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    /// Structural and identity checks.
    Precheck,
    /// Packet digest computation.
    Hash,
    /// External decision.
    Decision,
    /// Optional execution.
    Execution,
    /// Audit write.
    Audit,
    /// Evidence verification.
    Verify,
    /// A collaborator failed internally.
    Exception,
}

impl FailureStage {
    /// Wire label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Precheck => "precheck",
            Self::Hash => "hash",
            Self::Decision => "decision",
            Self::Execution => "execution",
            Self::Audit => "audit",
            Self::Verify => "verify",
            Self::Exception => "exception",
        }
    }
}

impl fmt::Display for FailureStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Governance Evidence
// =============================================================================

/// What an allowed request leaves behind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct GovernanceEvidence {
    /// Receipt id issued by the decision service.
    pub receipt_id: String,
    /// Decision outcome label.
    pub outcome: String,
    /// When the decision was made.
    #[serde(with = "timestamp")]
    pub decided_at: DateTime<Utc>,
    /// Where the audit service stored the receipt.
    pub receipt_path: String,
    /// Audit evidence id.
    pub evidence_id: String,
    /// Where the audit service stored the evidence.
    pub evidence_path: String,
    /// Execution id, when the execution stage ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
    /// Verifier verdict.
    pub verdict: String,
}

// =============================================================================
// Gate Result
// =============================================================================

/// Outcome of [`GateEvaluator::evaluate`](super::GateEvaluator::evaluate).
///
/// Fields are private and the only constructors are [`GateResult::allow`]
/// and [`GateResult::deny`], so a result is allowed exactly when it has no
/// failure stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GateResult {
    allowed: bool,
    failure_stage: Option<FailureStage>,
    denial_code: Option<String>,
    message: Option<String>,
    packet_digest: Option<ContentDigest>,
    evidence: Option<GovernanceEvidence>,
}

impl GateResult {
    /// A request that passed every stage.
    #[must_use]
    pub fn allow(packet_digest: ContentDigest, evidence: GovernanceEvidence) -> Self {
        Self {
            allowed: true,
            failure_stage: None,
            denial_code: None,
            message: None,
            packet_digest: Some(packet_digest),
            evidence: Some(evidence),
        }
    }

    /// A request denied at `stage`.
    #[must_use]
    pub fn deny(stage: FailureStage, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            allowed: false,
            failure_stage: Some(stage),
            denial_code: Some(code.into()),
            message: Some(message.into()),
            packet_digest: None,
            evidence: None,
        }
    }

    /// Records the packet digest on a denial from a stage after Hash.
    #[must_use]
    pub(crate) fn with_packet_digest(mut self, digest: Option<&ContentDigest>) -> Self {
        self.packet_digest = digest.cloned();
        self
    }

    /// Whether the operation may proceed.
    #[must_use]
    pub const fn is_allowed(&self) -> bool {
        self.allowed
    }

    /// Stage that denied, if any.
    #[must_use]
    pub const fn failure_stage(&self) -> Option<FailureStage> {
        self.failure_stage
    }

    /// Machine-readable denial code, if any.
    #[must_use]
    pub fn denial_code(&self) -> Option<&str> {
        self.denial_code.as_deref()
    }

    /// Human-readable denial detail, if any.
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Canonical digest of the packet, once computed.
    #[must_use]
    pub const fn packet_digest(&self) -> Option<&ContentDigest> {
        self.packet_digest.as_ref()
    }

    /// Governance evidence of an allowed request.
    #[must_use]
    pub const fn evidence(&self) -> Option<&GovernanceEvidence> {
        self.evidence.as_ref()
    }
}
