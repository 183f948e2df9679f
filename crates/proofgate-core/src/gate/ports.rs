//! Collaborator ports.
//!
//! The evaluator owns no transport. Each external service is reached through
//! a synchronous trait so adapters decide how to talk to the real service;
//! retries and timeouts belong in those adapters.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::boundary::{BoundaryScope, EffectParameters};
use crate::canonical::ContentDigest;
use crate::receipt::{AdvisoryOutcome, OperationKind};

/// Failure reported by a collaborator adapter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum PortError {
    /// The service could not be reached or declined to answer.
    #[error("collaborator unavailable: {reason}")]
    Unavailable {
        /// Transport or availability detail.
        reason: String,
    },

    /// The service answered with an error code.
    #[error("collaborator rejected request with {code}: {reason}")]
    Rejected {
        /// Collaborator's own error code.
        code: String,
        /// Detail.
        reason: String,
    },

    /// The adapter itself failed.
    #[error("collaborator internal error: {reason}")]
    Internal {
        /// Detail.
        reason: String,
    },
}

// =============================================================================
// Decision
// =============================================================================

/// Input to the decision service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecisionRequest {
    /// Run id.
    pub run_id: String,
    /// Tenant id.
    pub tenant_id: String,
    /// Actor id.
    pub actor_id: String,
    /// Destination.
    pub destination: String,
    /// Requested operation.
    pub operation_kind: OperationKind,
    /// Canonical digest of the packet.
    pub packet_digest: ContentDigest,
}

/// Output of the decision service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecisionResponse {
    /// Whether the service completed the decision.
    pub success: bool,
    /// Receipt id minted for the decision.
    pub receipt_id: Option<String>,
    /// What was decided.
    pub outcome: AdvisoryOutcome,
    /// When it was decided.
    pub decided_at: DateTime<Utc>,
}

/// Decision service.
pub trait DecisionPort: Send + Sync {
    /// Decides whether the operation may proceed.
    fn decide(&self, request: &DecisionRequest) -> Result<DecisionResponse, PortError>;
}

// =============================================================================
// Execution
// =============================================================================

/// Input to the execution service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionRequest {
    /// Receipt id authorizing the execution.
    pub receipt_id: String,
    /// Destination.
    pub target: String,
    /// Payload reference.
    pub payload_ref: String,
    /// Operation parameters.
    pub parameters: EffectParameters,
}

/// Output of the execution service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResponse {
    /// Whether execution succeeded.
    pub success: bool,
    /// Execution id.
    pub execution_id: Option<String>,
    /// Status label.
    pub status: String,
    /// Service output, if any.
    pub output: Option<String>,
}

/// Optional execution service.
///
/// Execution is an external effect, so the evaluator only calls it inside a
/// boundary scope. Adapters should check
/// `scope.call_context().assert_in_scope()` before touching the service.
pub trait ExecutionPort: Send + Sync {
    /// Executes the approved operation.
    fn execute(
        &self,
        scope: &BoundaryScope<'_>,
        request: &ExecutionRequest,
    ) -> Result<ExecutionResponse, PortError>;
}

// =============================================================================
// Audit
// =============================================================================

/// Input to the audit service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditRequest {
    /// Receipt id being recorded.
    pub receipt_id: String,
    /// Artifact the evidence is about (the packet digest).
    pub artifact_id: ContentDigest,
    /// Decision outcome.
    pub outcome: AdvisoryOutcome,
    /// When it was decided.
    pub decided_at: DateTime<Utc>,
    /// Execution id, if the execution stage ran.
    pub execution_id: Option<String>,
}

/// Output of the audit service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditResponse {
    /// Whether the write completed.
    pub success: bool,
    /// Where the receipt was stored.
    pub receipt_path: Option<String>,
    /// Evidence id.
    pub evidence_id: Option<String>,
    /// Where the evidence was stored.
    pub evidence_path: Option<String>,
}

/// Audit-write service.
pub trait AuditPort: Send + Sync {
    /// Records the receipt and its evidence.
    fn write(&self, request: &AuditRequest) -> Result<AuditResponse, PortError>;
}

// =============================================================================
// Verification
// =============================================================================

/// Input to the verification service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationRequest {
    /// Digest the evidence must match.
    pub content_digest: ContentDigest,
    /// Evidence to check.
    pub evidence_id: String,
}

/// Output of the verification service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationResponse {
    /// Whether the service completed verification.
    pub success: bool,
    /// Whether the evidence matches.
    pub valid: bool,
    /// Verdict label.
    pub verdict: String,
    /// Error codes, most significant first.
    pub error_codes: Vec<String>,
}

/// Evidence-verification service.
pub trait VerificationPort: Send + Sync {
    /// Verifies stored evidence against a digest.
    fn verify(&self, request: &VerificationRequest) -> Result<VerificationResponse, PortError>;
}
