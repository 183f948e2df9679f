//! Stage-by-stage gate pipeline behaviour.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{TimeZone, Utc};

use super::*;
use crate::boundary::{BoundaryScope, CallContext, EffectParameters};
use crate::canonical::hash_bytes;
use crate::config::{GateConfig, IdentityConfig, ReceiptConfig, SourceConfig};
use crate::receipt::OperationKind;

// =============================================================================
// Fakes
// =============================================================================

struct FakeDecision {
    reply: Result<DecisionResponse, PortError>,
    calls: AtomicUsize,
}

impl FakeDecision {
    fn approving() -> Self {
        Self::replying(Ok(DecisionResponse {
            success: true,
            receipt_id: Some("rcpt-42".to_string()),
            outcome: AdvisoryOutcome::Approve,
            decided_at: Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap(),
        }))
    }

    fn replying(reply: Result<DecisionResponse, PortError>) -> Self {
        Self {
            reply,
            calls: AtomicUsize::new(0),
        }
    }
}

impl DecisionPort for FakeDecision {
    fn decide(&self, _: &DecisionRequest) -> Result<DecisionResponse, PortError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.reply.clone()
    }
}

struct FakeAudit {
    reply: Result<AuditResponse, PortError>,
    seen: Mutex<Vec<AuditRequest>>,
}

impl FakeAudit {
    fn ok() -> Self {
        Self::replying(Ok(AuditResponse {
            success: true,
            receipt_path: Some("audit/receipts/rcpt-42.json".to_string()),
            evidence_id: Some("ev-7".to_string()),
            evidence_path: Some("audit/evidence/ev-7.json".to_string()),
        }))
    }

    fn replying(reply: Result<AuditResponse, PortError>) -> Self {
        Self {
            reply,
            seen: Mutex::new(Vec::new()),
        }
    }
}

impl AuditPort for FakeAudit {
    fn write(&self, request: &AuditRequest) -> Result<AuditResponse, PortError> {
        self.seen.lock().unwrap().push(request.clone());
        self.reply.clone()
    }
}

struct FakeVerify {
    reply: Result<VerificationResponse, PortError>,
    calls: AtomicUsize,
}

impl FakeVerify {
    fn valid() -> Self {
        Self::replying(Ok(VerificationResponse {
            success: true,
            valid: true,
            verdict: "match".to_string(),
            error_codes: Vec::new(),
        }))
    }

    fn replying(reply: Result<VerificationResponse, PortError>) -> Self {
        Self {
            reply,
            calls: AtomicUsize::new(0),
        }
    }
}

impl VerificationPort for FakeVerify {
    fn verify(&self, _: &VerificationRequest) -> Result<VerificationResponse, PortError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.reply.clone()
    }
}

struct FakeExecution {
    reply: Result<ExecutionResponse, PortError>,
    seen: Mutex<Vec<ExecutionRequest>>,
    depths: Mutex<Vec<u32>>,
}

impl FakeExecution {
    fn replying(reply: Result<ExecutionResponse, PortError>) -> Self {
        Self {
            reply,
            seen: Mutex::new(Vec::new()),
            depths: Mutex::new(Vec::new()),
        }
    }
}

impl ExecutionPort for FakeExecution {
    fn execute(
        &self,
        scope: &BoundaryScope<'_>,
        request: &ExecutionRequest,
    ) -> Result<ExecutionResponse, PortError> {
        scope
            .call_context()
            .assert_in_scope()
            .map_err(|e| PortError::Internal {
                reason: e.to_string(),
            })?;
        self.depths.lock().unwrap().push(scope.call_context().depth());
        self.seen.lock().unwrap().push(request.clone());
        self.reply.clone()
    }
}

// =============================================================================
// Fixtures
// =============================================================================

fn config(execution_enabled: bool) -> ProofgateConfig {
    ProofgateConfig {
        identity: IdentityConfig {
            tenant_id: "acme".to_string(),
            actor_id: "release-bot".to_string(),
        },
        gate: GateConfig {
            allowed_destinations: vec!["registry".to_string()],
            allowed_payload_kinds: vec!["json".to_string(), "tgz".to_string()],
            execution_enabled,
        },
        receipts: ReceiptConfig::default(),
        source: SourceConfig::default(),
    }
}

fn packet() -> GatePacket {
    GatePacket {
        run_id: "run-1".to_string(),
        tenant_id: "acme".to_string(),
        actor_id: "release-bot".to_string(),
        destination: "registry".to_string(),
        operation_kind: OperationKind::Publish,
        payload_ref: "dist/widget-1.4.0.tgz".to_string(),
        payload_digest: Some(hash_bytes(b"widget tarball")),
        parameters: EffectParameters::from_pairs([("version", "1.4.0")]).unwrap(),
    }
}

struct Harness {
    decision: Arc<FakeDecision>,
    audit: Arc<FakeAudit>,
    verify: Arc<FakeVerify>,
}

impl Harness {
    fn new(decision: FakeDecision, audit: FakeAudit, verify: FakeVerify) -> Self {
        Self {
            decision: Arc::new(decision),
            audit: Arc::new(audit),
            verify: Arc::new(verify),
        }
    }

    fn happy() -> Self {
        Self::new(FakeDecision::approving(), FakeAudit::ok(), FakeVerify::valid())
    }

    fn evaluator(&self, config: &ProofgateConfig) -> GateEvaluator {
        GateEvaluator::new(
            config,
            self.decision.clone(),
            self.audit.clone(),
            self.verify.clone(),
        )
    }
}

type Mutation = fn(&mut GatePacket);

const fn case(mutate: Mutation, code: &'static str) -> (Mutation, &'static str) {
    (mutate, code)
}

fn assert_denied(result: &GateResult, stage: FailureStage, code: &str) {
    assert!(!result.is_allowed());
    assert!(result.evidence().is_none());
    assert_eq!(result.failure_stage(), Some(stage), "{result:?}");
    assert_eq!(result.denial_code(), Some(code), "{result:?}");
}

// =============================================================================
// Pipeline
// =============================================================================

#[test]
fn all_stages_pass() {
    let h = Harness::happy();
    let result = h.evaluator(&config(false)).evaluate(&packet());

    assert!(result.is_allowed());
    assert_eq!(result.failure_stage(), None);
    assert_eq!(result.denial_code(), None);
    let evidence = result.evidence().unwrap();
    assert_eq!(evidence.receipt_id, "rcpt-42");
    assert_eq!(evidence.outcome, "approve");
    assert_eq!(evidence.evidence_id, "ev-7");
    assert_eq!(evidence.verdict, "match");
    assert!(evidence.execution_id.is_none());
    assert_eq!(
        result.packet_digest(),
        Some(&crate::canonical::digest_of(&packet()).unwrap())
    );
}

#[test]
fn missing_payload_digest_denies_at_hash() {
    let h = Harness::happy();
    let mut p = packet();
    p.payload_digest = None;
    let result = h.evaluator(&config(false)).evaluate(&p);

    assert_denied(&result, FailureStage::Hash, codes::CANONICAL_HASH_MISSING);
    assert!(result.packet_digest().is_none());
    assert_eq!(h.decision.calls.load(Ordering::SeqCst), 0);
}

#[test]
fn packet_digest_is_deterministic() {
    let h = Harness::happy();
    let evaluator = h.evaluator(&config(false));
    let a = evaluator.evaluate(&packet());
    let b = evaluator.evaluate(&packet());
    assert_eq!(a.packet_digest(), b.packet_digest());
}

// =============================================================================
// Precheck
// =============================================================================

#[test]
fn precheck_denials() {
    let h = Harness::happy();
    let evaluator = h.evaluator(&config(false));

    let cases = [
        case(|p: &mut GatePacket| p.run_id.clear(), codes::PRECHECK_MISSING_FIELD),
        case(|p: &mut GatePacket| p.actor_id = " ".to_string(), codes::PRECHECK_MISSING_FIELD),
        case(
            |p: &mut GatePacket| p.destination = "forge".to_string(),
            codes::PRECHECK_DESTINATION_NOT_ALLOWED,
        ),
        case(
            |p: &mut GatePacket| p.tenant_id = "globex".to_string(),
            codes::PRECHECK_TENANT_MISMATCH,
        ),
        case(
            |p: &mut GatePacket| p.actor_id = "intruder".to_string(),
            codes::PRECHECK_ACTOR_MISMATCH,
        ),
        case(
            |p: &mut GatePacket| p.payload_ref = "../secrets/key.json".to_string(),
            codes::PRECHECK_UNSAFE_PAYLOAD_REF,
        ),
        case(
            |p: &mut GatePacket| p.payload_ref = "/etc/passwd.json".to_string(),
            codes::PRECHECK_UNSAFE_PAYLOAD_REF,
        ),
        case(
            |p: &mut GatePacket| p.payload_ref = "dist\\widget.tgz".to_string(),
            codes::PRECHECK_UNSAFE_PAYLOAD_REF,
        ),
        case(
            |p: &mut GatePacket| p.payload_ref = "dist/widget".to_string(),
            codes::PRECHECK_UNSAFE_PAYLOAD_REF,
        ),
        case(
            |p: &mut GatePacket| p.payload_ref = "dist/widget.exe".to_string(),
            codes::PRECHECK_PAYLOAD_KIND_NOT_ALLOWED,
        ),
    ];

    for (mutate, code) in cases {
        let mut p = packet();
        mutate(&mut p);
        assert_denied(&evaluator.evaluate(&p), FailureStage::Precheck, code);
    }
    assert_eq!(h.decision.calls.load(Ordering::SeqCst), 0);
}

#[test]
fn precheck_runs_before_hash() {
    let h = Harness::happy();
    let mut p = packet();
    p.payload_digest = None;
    p.destination = "forge".to_string();
    assert_denied(
        &h.evaluator(&config(false)).evaluate(&p),
        FailureStage::Precheck,
        codes::PRECHECK_DESTINATION_NOT_ALLOWED,
    );
}

#[test]
fn payload_kind_rules() {
    assert_eq!(payload_kind("a/b/c.json"), Some("json"));
    assert_eq!(payload_kind("release.tar.gz"), Some("gz"));
    assert_eq!(payload_kind(".hidden"), None);
    assert_eq!(payload_kind("a//b.json"), None);
    assert_eq!(payload_kind("./b.json"), None);
    assert_eq!(payload_kind("C:/b.json"), None);
    assert_eq!(payload_kind("a/b.json\n"), None);
    assert_eq!(payload_kind("trailing."), None);
}

// =============================================================================
// Decision
// =============================================================================

#[test]
fn decision_denials() {
    let approved = FakeDecision::approving().reply.unwrap();
    let cases = [
        (
            Err(PortError::Unavailable {
                reason: "timeout".to_string(),
            }),
            FailureStage::Decision,
            codes::DECISION_UNAVAILABLE,
        ),
        (
            Err(PortError::Rejected {
                code: "POLICY_ENGINE_ERROR".to_string(),
                reason: "bad input".to_string(),
            }),
            FailureStage::Decision,
            "POLICY_ENGINE_ERROR",
        ),
        (
            Err(PortError::Rejected {
                code: "  ".to_string(),
                reason: "no code given".to_string(),
            }),
            FailureStage::Decision,
            codes::DECISION_FAILED,
        ),
        (
            Ok(DecisionResponse {
                success: false,
                ..approved.clone()
            }),
            FailureStage::Decision,
            codes::DECISION_FAILED,
        ),
        (
            Ok(DecisionResponse {
                outcome: AdvisoryOutcome::Escalate,
                ..approved.clone()
            }),
            FailureStage::Decision,
            codes::DECISION_NOT_APPROVED,
        ),
        (
            Ok(DecisionResponse {
                receipt_id: None,
                ..approved.clone()
            }),
            FailureStage::Decision,
            codes::DECISION_RECEIPT_MISSING,
        ),
        (
            Err(PortError::Internal {
                reason: "adapter panicked".to_string(),
            }),
            FailureStage::Exception,
            codes::GATE_EXCEPTION,
        ),
    ];

    for (reply, stage, code) in cases {
        let h = Harness::new(
            FakeDecision::replying(reply),
            FakeAudit::ok(),
            FakeVerify::valid(),
        );
        let result = h.evaluator(&config(false)).evaluate(&packet());
        assert_denied(&result, stage, code);
        assert!(result.packet_digest().is_some());
        assert!(h.audit.seen.lock().unwrap().is_empty());
    }
}

// =============================================================================
// Execution
// =============================================================================

#[test]
fn execution_runs_only_when_enabled() {
    let exec = Arc::new(FakeExecution::replying(Ok(ExecutionResponse {
        success: true,
        execution_id: Some("exec-9".to_string()),
        status: "done".to_string(),
        output: None,
    })));

    let h = Harness::happy();
    let disabled = h.evaluator(&config(false)).with_execution(exec.clone());
    assert!(disabled.evaluate(&packet()).is_allowed());
    assert!(exec.seen.lock().unwrap().is_empty());

    let enabled = h.evaluator(&config(true)).with_execution(exec.clone());
    let result = enabled.evaluate(&packet());
    assert!(result.is_allowed());
    assert_eq!(
        result.evidence().unwrap().execution_id.as_deref(),
        Some("exec-9")
    );
    let seen = exec.seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].receipt_id, "rcpt-42");
    assert_eq!(seen[0].target, "registry");

    let audited = h.audit.seen.lock().unwrap();
    assert_eq!(audited.last().unwrap().execution_id.as_deref(), Some("exec-9"));
}

#[test]
fn enabled_execution_without_port_denies() {
    let h = Harness::happy();
    assert_denied(
        &h.evaluator(&config(true)).evaluate(&packet()),
        FailureStage::Execution,
        codes::EXECUTION_UNAVAILABLE,
    );
}

#[test]
fn failed_execution_denies_before_audit() {
    let h = Harness::happy();
    let exec = Arc::new(FakeExecution::replying(Ok(ExecutionResponse {
        success: false,
        execution_id: Some("exec-9".to_string()),
        status: "rejected".to_string(),
        output: Some("403".to_string()),
    })));
    let result = h.evaluator(&config(true)).with_execution(exec).evaluate(&packet());
    assert_denied(&result, FailureStage::Execution, codes::EXECUTION_FAILED);
    assert!(h.audit.seen.lock().unwrap().is_empty());
}

#[test]
fn execution_runs_inside_a_boundary_scope() {
    let exec = Arc::new(FakeExecution::replying(Ok(ExecutionResponse {
        success: true,
        execution_id: Some("exec-1".to_string()),
        status: "done".to_string(),
        output: None,
    })));
    let h = Harness::happy();
    let evaluator = h.evaluator(&config(true)).with_execution(exec.clone());

    let call = CallContext::with_request_id("req-gate");
    assert!(evaluator.evaluate_in(&call, &packet()).is_allowed());
    assert_eq!(*exec.depths.lock().unwrap(), vec![1]);
    assert_eq!(call.depth(), 0);
    assert!(call.assert_in_scope().is_err());
}

#[test]
fn rejected_execution_keeps_collaborator_code() {
    let h = Harness::happy();
    let exec = Arc::new(FakeExecution::replying(Err(PortError::Rejected {
        code: "TARGET_LOCKED".to_string(),
        reason: "registry is read-only".to_string(),
    })));
    let result = h.evaluator(&config(true)).with_execution(exec).evaluate(&packet());
    assert_denied(&result, FailureStage::Execution, "TARGET_LOCKED");
    assert!(h.audit.seen.lock().unwrap().is_empty());
}

// =============================================================================
// Audit
// =============================================================================

#[test]
fn audit_failure_is_fatal() {
    let cases = [
        (
            Err(PortError::Unavailable {
                reason: "store offline".to_string(),
            }),
            codes::AUDIT_UNAVAILABLE,
        ),
        (
            Ok(AuditResponse {
                success: false,
                receipt_path: None,
                evidence_id: None,
                evidence_path: None,
            }),
            codes::AUDIT_WRITE_FAILED,
        ),
        (
            Ok(AuditResponse {
                success: true,
                receipt_path: Some("r".to_string()),
                evidence_id: None,
                evidence_path: Some("e".to_string()),
            }),
            codes::AUDIT_WRITE_FAILED,
        ),
        (
            Err(PortError::Rejected {
                code: "QUOTA_EXCEEDED".to_string(),
                reason: "evidence store full".to_string(),
            }),
            "QUOTA_EXCEEDED",
        ),
    ];
    for (reply, code) in cases {
        let h = Harness::new(
            FakeDecision::approving(),
            FakeAudit::replying(reply),
            FakeVerify::valid(),
        );
        assert_denied(
            &h.evaluator(&config(false)).evaluate(&packet()),
            FailureStage::Audit,
            code,
        );
        assert_eq!(h.verify.calls.load(Ordering::SeqCst), 0);
    }
}

// =============================================================================
// Verify
// =============================================================================

#[test]
fn verify_surfaces_first_collaborator_code() {
    let h = Harness::new(
        FakeDecision::approving(),
        FakeAudit::ok(),
        FakeVerify::replying(Ok(VerificationResponse {
            success: true,
            valid: false,
            verdict: "mismatch".to_string(),
            error_codes: vec!["DIGEST_MISMATCH".to_string(), "SIZE_MISMATCH".to_string()],
        })),
    );
    assert_denied(
        &h.evaluator(&config(false)).evaluate(&packet()),
        FailureStage::Verify,
        "DIGEST_MISMATCH",
    );
}

#[test]
fn verify_fallback_codes() {
    let invalid = FakeVerify::replying(Ok(VerificationResponse {
        success: true,
        valid: false,
        verdict: "mismatch".to_string(),
        error_codes: Vec::new(),
    }));
    let unavailable = FakeVerify::replying(Ok(VerificationResponse {
        success: false,
        valid: false,
        verdict: String::new(),
        error_codes: Vec::new(),
    }));
    let offline = FakeVerify::replying(Err(PortError::Unavailable {
        reason: "down".to_string(),
    }));
    let rejected = FakeVerify::replying(Err(PortError::Rejected {
        code: "EVIDENCE_NOT_FOUND".to_string(),
        reason: "no such evidence".to_string(),
    }));

    for (verify, code) in [
        (invalid, codes::VERIFY_INVALID),
        (unavailable, codes::VERIFY_UNAVAILABLE),
        (offline, codes::VERIFY_UNAVAILABLE),
        (rejected, "EVIDENCE_NOT_FOUND"),
    ] {
        let h = Harness::new(FakeDecision::approving(), FakeAudit::ok(), verify);
        assert_denied(
            &h.evaluator(&config(false)).evaluate(&packet()),
            FailureStage::Verify,
            code,
        );
    }
}

#[test]
fn internal_verify_error_is_an_exception() {
    let h = Harness::new(
        FakeDecision::approving(),
        FakeAudit::ok(),
        FakeVerify::replying(Err(PortError::Internal {
            reason: "bug".to_string(),
        })),
    );
    assert_denied(
        &h.evaluator(&config(false)).evaluate(&packet()),
        FailureStage::Exception,
        codes::GATE_EXCEPTION,
    );
}

#[test]
fn result_serializes_with_stage() {
    let result = GateResult::deny(FailureStage::Hash, codes::CANONICAL_HASH_MISSING, "none");
    let json = serde_json::to_value(&result).unwrap();
    assert_eq!(json["allowed"], false);
    assert_eq!(json["failureStage"], "hash");
    assert_eq!(json["denialCode"], "CANONICAL_HASH_MISSING");
}
