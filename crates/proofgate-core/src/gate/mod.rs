//! Fail-closed gate evaluation for consequential operations.
//!
//! [`GateEvaluator::evaluate`] runs a fixed pipeline and stops at the first
//! failing stage:
//!
//! ```text
//! Precheck -> Hash -> Decision -> Execution (if enabled) -> Audit -> Verify
//! ```
//!
//! Every denial carries exactly one [`FailureStage`] and a stable code from
//! [`codes`]. A collaborator's internal failure denies with
//! [`FailureStage::Exception`]. Stages run strictly in sequence; nothing is
//! retried here.
//!
//! # Security Invariants
//!
//! - A packet without a payload digest is denied at Hash. There is no
//!   fallback hash.
//! - A failed audit write always denies, even after an approval. Unrecorded
//!   approvals are indistinguishable from unauthorized actions.
//! - `allowed` is true only when every stage succeeded.
//! - The execution collaborator is only called inside a boundary scope on
//!   the request's [`CallContext`].

mod ports;
mod types;

#[cfg(test)]
mod tests;

use std::sync::Arc;

pub use ports::{
    AuditPort, AuditRequest, AuditResponse, DecisionPort, DecisionRequest, DecisionResponse,
    ExecutionPort, ExecutionRequest, ExecutionResponse, PortError, VerificationPort,
    VerificationRequest, VerificationResponse,
};
use tracing::{debug, info, warn};
pub use types::{FailureStage, GatePacket, GateResult, GovernanceEvidence, codes};

use crate::boundary::{self, CallContext};
use crate::canonical::{ContentDigest, digest_of};
use crate::config::{GateConfig, IdentityConfig, ProofgateConfig};
use crate::receipt::AdvisoryOutcome;

/// Result of a single stage: `Err` is the final denial.
type StageResult<T> = Result<T, GateResult>;

/// Runs the gate pipeline against configured identity and collaborators.
#[derive(Clone)]
pub struct GateEvaluator {
    identity: IdentityConfig,
    gate: GateConfig,
    decision: Arc<dyn DecisionPort>,
    audit: Arc<dyn AuditPort>,
    verification: Arc<dyn VerificationPort>,
    execution: Option<Arc<dyn ExecutionPort>>,
}

impl std::fmt::Debug for GateEvaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GateEvaluator")
            .field("identity", &self.identity)
            .field("gate", &self.gate)
            .field("has_execution_port", &self.execution.is_some())
            .finish_non_exhaustive()
    }
}

impl GateEvaluator {
    /// Evaluator for `config` with the three mandatory collaborators.
    #[must_use]
    pub fn new(
        config: &ProofgateConfig,
        decision: Arc<dyn DecisionPort>,
        audit: Arc<dyn AuditPort>,
        verification: Arc<dyn VerificationPort>,
    ) -> Self {
        Self {
            identity: config.identity.clone(),
            gate: config.gate.clone(),
            decision,
            audit,
            verification,
            execution: None,
        }
    }

    /// Wires the execution collaborator. It only runs when
    /// `gate.execution_enabled` is set.
    #[must_use]
    pub fn with_execution(mut self, execution: Arc<dyn ExecutionPort>) -> Self {
        self.execution = Some(execution);
        self
    }

    /// Evaluates `packet` as a request of its own.
    #[must_use]
    pub fn evaluate(&self, packet: &GatePacket) -> GateResult {
        self.evaluate_in(&CallContext::new(), packet)
    }

    /// Evaluates `packet` on the caller's call chain.
    #[must_use]
    pub fn evaluate_in(&self, call: &CallContext, packet: &GatePacket) -> GateResult {
        let result = self.run_pipeline(call, packet);
        match (result.failure_stage(), result.denial_code()) {
            (Some(stage), code) => warn!(
                run_id = %packet.run_id,
                operation = %packet.operation_kind,
                stage = %stage,
                code = code.unwrap_or_default(),
                "gate denied"
            ),
            (None, _) => info!(
                run_id = %packet.run_id,
                operation = %packet.operation_kind,
                receipt_id = result.evidence().map_or("", |e| e.receipt_id.as_str()),
                "gate allowed"
            ),
        }
        result
    }

    fn run_pipeline(&self, call: &CallContext, packet: &GatePacket) -> GateResult {
        let outcome = self.precheck(packet).and_then(|()| {
            let digest = Self::hash(packet)?;
            self.decide_through_verify(call, packet, &digest)
                .map_err(|denial| denial.with_packet_digest(Some(&digest)))
        });
        match outcome {
            Ok(allowed) | Err(allowed) => allowed,
        }
    }

    fn decide_through_verify(
        &self,
        call: &CallContext,
        packet: &GatePacket,
        digest: &ContentDigest,
    ) -> StageResult<GateResult> {
        let decision = self.decide(packet, digest)?;
        let execution_id = self.execute(call, packet, &decision.receipt_id)?;
        let audit = self.audit(&decision, digest, execution_id.clone())?;
        let verdict = self.verify(digest, &audit.evidence_id)?;

        Ok(GateResult::allow(
            digest.clone(),
            GovernanceEvidence {
                receipt_id: decision.receipt_id,
                outcome: outcome_label(decision.outcome).to_string(),
                decided_at: decision.decided_at,
                receipt_path: audit.receipt_path,
                evidence_id: audit.evidence_id,
                evidence_path: audit.evidence_path,
                execution_id,
                verdict,
            },
        ))
    }

    // =========================================================================
    // Precheck
    // =========================================================================

    fn precheck(&self, packet: &GatePacket) -> StageResult<()> {
        let deny =
            |code: &str, message: String| GateResult::deny(FailureStage::Precheck, code, message);

        for (field, value) in [
            ("runId", &packet.run_id),
            ("tenantId", &packet.tenant_id),
            ("actorId", &packet.actor_id),
            ("destination", &packet.destination),
            ("payloadRef", &packet.payload_ref),
        ] {
            if value.trim().is_empty() {
                return Err(deny(
                    codes::PRECHECK_MISSING_FIELD,
                    format!("{field} is required"),
                ));
            }
        }

        if !self.gate.allowed_destinations.contains(&packet.destination) {
            return Err(deny(
                codes::PRECHECK_DESTINATION_NOT_ALLOWED,
                format!("destination {} is not allowed", packet.destination),
            ));
        }
        if packet.tenant_id != self.identity.tenant_id {
            return Err(deny(
                codes::PRECHECK_TENANT_MISMATCH,
                format!("tenant {} does not match configured tenant", packet.tenant_id),
            ));
        }
        if packet.actor_id != self.identity.actor_id {
            return Err(deny(
                codes::PRECHECK_ACTOR_MISMATCH,
                format!("actor {} does not match configured actor", packet.actor_id),
            ));
        }

        let kind = payload_kind(&packet.payload_ref).ok_or_else(|| {
            deny(
                codes::PRECHECK_UNSAFE_PAYLOAD_REF,
                format!("payload reference {:?} is not a safe relative path", packet.payload_ref),
            )
        })?;
        if !self.gate.allowed_payload_kinds.iter().any(|k| k == kind) {
            return Err(deny(
                codes::PRECHECK_PAYLOAD_KIND_NOT_ALLOWED,
                format!("payload kind {kind:?} is not allowed"),
            ));
        }

        debug!(stage = %FailureStage::Precheck, "gate stage passed");
        Ok(())
    }

    // =========================================================================
    // Hash
    // =========================================================================

    fn hash(packet: &GatePacket) -> StageResult<ContentDigest> {
        if packet.payload_digest.is_none() {
            return Err(GateResult::deny(
                FailureStage::Hash,
                codes::CANONICAL_HASH_MISSING,
                "payload digest was not supplied",
            ));
        }
        let digest = digest_of(packet).map_err(|e| {
            GateResult::deny(FailureStage::Hash, codes::CANONICAL_HASH_FAILED, e.to_string())
        })?;
        debug!(stage = %FailureStage::Hash, packet_digest = %digest, "gate stage passed");
        Ok(digest)
    }

    // =========================================================================
    // Decision
    // =========================================================================

    fn decide(&self, packet: &GatePacket, digest: &ContentDigest) -> StageResult<Decision> {
        let request = DecisionRequest {
            run_id: packet.run_id.clone(),
            tenant_id: packet.tenant_id.clone(),
            actor_id: packet.actor_id.clone(),
            destination: packet.destination.clone(),
            operation_kind: packet.operation_kind,
            packet_digest: digest.clone(),
        };
        let response = self.decision.decide(&request).map_err(|e| {
            port_denial(
                FailureStage::Decision,
                codes::DECISION_UNAVAILABLE,
                codes::DECISION_FAILED,
                &e,
            )
        })?;

        if !response.success {
            return Err(GateResult::deny(
                FailureStage::Decision,
                codes::DECISION_FAILED,
                "decision service reported failure",
            ));
        }
        if response.outcome != AdvisoryOutcome::Approve {
            return Err(GateResult::deny(
                FailureStage::Decision,
                codes::DECISION_NOT_APPROVED,
                format!("decision outcome was {}", outcome_label(response.outcome)),
            ));
        }
        let receipt_id = response
            .receipt_id
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| {
                GateResult::deny(
                    FailureStage::Decision,
                    codes::DECISION_RECEIPT_MISSING,
                    "approval carried no receipt id",
                )
            })?;

        debug!(stage = %FailureStage::Decision, receipt_id = %receipt_id, "gate stage passed");
        Ok(Decision {
            receipt_id,
            outcome: response.outcome,
            decided_at: response.decided_at,
        })
    }

    // =========================================================================
    // Execution
    // =========================================================================

    fn execute(
        &self,
        call: &CallContext,
        packet: &GatePacket,
        receipt_id: &str,
    ) -> StageResult<Option<String>> {
        if !self.gate.execution_enabled {
            return Ok(None);
        }
        let Some(port) = &self.execution else {
            return Err(GateResult::deny(
                FailureStage::Execution,
                codes::EXECUTION_UNAVAILABLE,
                "execution is enabled but no executor is configured",
            ));
        };

        let request = ExecutionRequest {
            receipt_id: receipt_id.to_string(),
            target: packet.destination.clone(),
            payload_ref: packet.payload_ref.clone(),
            parameters: packet.parameters.clone(),
        };
        let response = boundary::within_scope(call, |scope| port.execute(scope, &request))
            .map_err(|e| {
                port_denial(
                    FailureStage::Execution,
                    codes::EXECUTION_UNAVAILABLE,
                    codes::EXECUTION_FAILED,
                    &e,
                )
            })?;
        if !response.success {
            return Err(GateResult::deny(
                FailureStage::Execution,
                codes::EXECUTION_FAILED,
                format!("execution finished with status {}", response.status),
            ));
        }

        debug!(
            stage = %FailureStage::Execution,
            execution_id = response.execution_id.as_deref().unwrap_or_default(),
            "gate stage passed"
        );
        Ok(response.execution_id)
    }

    // =========================================================================
    // Audit
    // =========================================================================

    fn audit(
        &self,
        decision: &Decision,
        digest: &ContentDigest,
        execution_id: Option<String>,
    ) -> StageResult<AuditRecord> {
        let request = AuditRequest {
            receipt_id: decision.receipt_id.clone(),
            artifact_id: digest.clone(),
            outcome: decision.outcome,
            decided_at: decision.decided_at,
            execution_id,
        };
        let response = self.audit.write(&request).map_err(|e| {
            port_denial(
                FailureStage::Audit,
                codes::AUDIT_UNAVAILABLE,
                codes::AUDIT_WRITE_FAILED,
                &e,
            )
        })?;

        let write_failed = |detail: &str| {
            GateResult::deny(FailureStage::Audit, codes::AUDIT_WRITE_FAILED, detail.to_string())
        };
        if !response.success {
            return Err(write_failed("audit service reported failure"));
        }
        let (Some(receipt_path), Some(evidence_id), Some(evidence_path)) =
            (response.receipt_path, response.evidence_id, response.evidence_path)
        else {
            return Err(write_failed("audit response is missing evidence locations"));
        };

        debug!(stage = %FailureStage::Audit, evidence_id = %evidence_id, "gate stage passed");
        Ok(AuditRecord {
            receipt_path,
            evidence_id,
            evidence_path,
        })
    }

    // =========================================================================
    // Verify
    // =========================================================================

    fn verify(&self, digest: &ContentDigest, evidence_id: &str) -> StageResult<String> {
        let request = VerificationRequest {
            content_digest: digest.clone(),
            evidence_id: evidence_id.to_string(),
        };
        let response = self.verification.verify(&request).map_err(|e| {
            port_denial(
                FailureStage::Verify,
                codes::VERIFY_UNAVAILABLE,
                codes::VERIFY_INVALID,
                &e,
            )
        })?;

        let first_code_or = |fallback: &str| {
            response
                .error_codes
                .first()
                .cloned()
                .unwrap_or_else(|| fallback.to_string())
        };
        if !response.success {
            return Err(GateResult::deny(
                FailureStage::Verify,
                first_code_or(codes::VERIFY_UNAVAILABLE),
                "verification service reported failure",
            ));
        }
        if !response.valid {
            return Err(GateResult::deny(
                FailureStage::Verify,
                first_code_or(codes::VERIFY_INVALID),
                format!("evidence verdict {}", response.verdict),
            ));
        }

        debug!(stage = %FailureStage::Verify, verdict = %response.verdict, "gate stage passed");
        Ok(response.verdict)
    }
}

struct Decision {
    receipt_id: String,
    outcome: AdvisoryOutcome,
    decided_at: chrono::DateTime<chrono::Utc>,
}

struct AuditRecord {
    receipt_path: String,
    evidence_id: String,
    evidence_path: String,
}

/// Maps a port error onto its stage. A rejection keeps the collaborator's
/// own code; `rejected_code` only stands in when that code is blank.
/// Internal adapter failures become [`FailureStage::Exception`] regardless
/// of which stage raised them.
fn port_denial(
    stage: FailureStage,
    unavailable_code: &str,
    rejected_code: &str,
    error: &PortError,
) -> GateResult {
    match error {
        PortError::Unavailable { .. } => {
            GateResult::deny(stage, unavailable_code, error.to_string())
        },
        PortError::Rejected { code, .. } if !code.trim().is_empty() => {
            GateResult::deny(stage, code.as_str(), error.to_string())
        },
        PortError::Rejected { .. } => GateResult::deny(stage, rejected_code, error.to_string()),
        PortError::Internal { .. } => GateResult::deny(
            FailureStage::Exception,
            codes::GATE_EXCEPTION,
            format!("{stage} stage: {error}"),
        ),
    }
}

const fn outcome_label(outcome: AdvisoryOutcome) -> &'static str {
    match outcome {
        AdvisoryOutcome::Approve => "approve",
        AdvisoryOutcome::Deny => "deny",
        AdvisoryOutcome::Escalate => "escalate",
    }
}

/// Returns the payload kind (final extension) of a safe relative path.
///
/// Safe means: non-empty, `/`-separated, not absolute, no backslashes, no
/// drive prefix, no control characters, no empty, `.` or `..` segments.
fn payload_kind(payload_ref: &str) -> Option<&str> {
    if payload_ref.is_empty()
        || payload_ref.starts_with('/')
        || payload_ref.contains('\\')
        || payload_ref.contains(':')
        || payload_ref.chars().any(char::is_control)
    {
        return None;
    }
    let mut last = "";
    for segment in payload_ref.split('/') {
        if segment.is_empty() || segment == "." || segment == ".." {
            return None;
        }
        last = segment;
    }
    match last.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => Some(ext),
        _ => None,
    }
}
