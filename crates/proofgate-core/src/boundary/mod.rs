//! The single execution boundary for externally observable effects.
//!
//! Every effect is submitted as a [`SideEffectIntent`] to a
//! [`SideEffectBoundary`]. The boundary records the intent, decides, and
//! answers with a [`SideEffectReceipt`]. Two implementations exist and
//! [`select_boundary`] picks one from the run mode:
//!
//! - [`AdvisorySink`] (dry run) records the intent as blocked by mode and
//!   never calls anything.
//! - [`LiveBoundary`] (prod) runs its checks, records the intent, consumes
//!   the authorization receipt, opens a [`BoundaryScope`], and only then
//!   calls the [`EffectExecutor`].
//!
//! # Live check order
//!
//! 1. run mode is prod (`mode_not_prod`)
//! 2. authorization present (`authorization_missing`)
//! 3. authorization enforceable (`authorization_not_enforceable`)
//! 4. intent requires enforceable authorization
//!    (`intent_missing_authorization_requirement`)
//! 5. [`ReceiptValidator`] MAC, binding, expiry, and staleness checks
//!    (its [`ReceiptDenial`](crate::receipt::ReceiptDenial) code)
//! 6. the intent is appended to the [`IntentLog`] (`intent_log_unavailable`)
//! 7. the receipt is revalidated and atomically consumed
//!
//! The receipt is only consumed once the intent is on record, so a log
//! outage leaves the authorization usable for a retry.
//!
//! # Scope tokens
//!
//! [`EffectExecutor::execute`] takes a [`BoundaryScope`], which only this
//! module can mint. Adapters that hold a [`CallContext`] instead check
//! [`CallContext::assert_in_scope`] before any external call. A failed
//! assertion is a [`BoundaryViolation`] returned as `Err`, never folded
//! into a refusal receipt.

mod context;
mod intent_log;
mod types;


use std::sync::Arc;

pub use context::{BoundaryScope, BoundaryViolation, CallContext};
pub use intent_log::{InMemoryIntentLog, IntentLog, IntentLogError};
use thiserror::Error;
use tracing::{debug, info, warn};
pub use types::{
    EffectParameter, EffectParameters, EffectRequest, ParameterError, RequiredAuthorization,
    SideEffectIntent, SideEffectReceipt,
};

use crate::canonical::timestamp;
use crate::receipt::{ReceiptValidator, RequestContext, RunMode};

/// Refusal code of every dry-run intent.
pub const BLOCKED_BY_MODE: &str = "blocked_by_mode";
/// Live boundary reached outside prod.
pub const MODE_NOT_PROD: &str = "mode_not_prod";
/// No authorization accompanied the intent.
pub const AUTHORIZATION_MISSING: &str = "authorization_missing";
/// The authorization is advisory only.
pub const AUTHORIZATION_NOT_ENFORCEABLE: &str = "authorization_not_enforceable";
/// The intent does not declare that it needs enforceable authorization.
pub const INTENT_MISSING_AUTHORIZATION_REQUIREMENT: &str =
    "intent_missing_authorization_requirement";
/// The intent could not be recorded, so the effect did not run.
pub const INTENT_LOG_UNAVAILABLE: &str = "intent_log_unavailable";
/// The executor ran and reported failure.
pub const EXECUTION_FAILED: &str = "execution_failed";

/// Executor failure.
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// The effect was attempted and failed.
    #[error("effect failed: {reason}")]
    Failed {
        /// Executor detail.
        reason: String,
    },

    /// The executor detected a boundary bypass.
    #[error(transparent)]
    Violation(#[from] BoundaryViolation),
}

/// Performs real effects. Callable only with a scope token.
pub trait EffectExecutor: Send + Sync {
    /// Performs the effect described by `intent`.
    fn execute(
        &self,
        scope: &BoundaryScope<'_>,
        intent: &SideEffectIntent,
    ) -> Result<(), ExecutorError>;
}

/// Mode-selected boundary.
pub trait SideEffectBoundary: Send + Sync {
    /// Mode this boundary serves.
    fn mode(&self) -> RunMode;

    /// Records and answers one effect request.
    ///
    /// # Errors
    ///
    /// Returns [`BoundaryViolation`] only for internal bypass defects.
    /// Every refusal is an `Ok` receipt with `success == false`.
    fn submit(
        &self,
        call: &CallContext,
        request: EffectRequest,
    ) -> Result<SideEffectReceipt, BoundaryViolation>;
}

/// Runs `effect` inside a fresh boundary scope on `call`. Other modules
/// that own an external call (the gate's execution stage) go through here
/// rather than minting scopes themselves.
pub(crate) fn within_scope<T>(
    call: &CallContext,
    effect: impl FnOnce(&BoundaryScope<'_>) -> T,
) -> T {
    let scope = call.enter();
    effect(&scope)
}

/// Returns the boundary for `mode`.
#[must_use]
pub fn select_boundary(
    mode: RunMode,
    intent_log: Arc<dyn IntentLog>,
    executor: Arc<dyn EffectExecutor>,
    validator: ReceiptValidator,
) -> Box<dyn SideEffectBoundary> {
    match mode {
        RunMode::DryRun => Box::new(AdvisorySink::new(intent_log)),
        RunMode::Prod => Box::new(LiveBoundary::new(mode, intent_log, executor, validator)),
    }
}

// =============================================================================
// Advisory Sink
// =============================================================================

/// Dry-run boundary: records every intent and refuses it.
#[derive(Clone)]
pub struct AdvisorySink {
    intent_log: Arc<dyn IntentLog>,
}

impl std::fmt::Debug for AdvisorySink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdvisorySink").finish_non_exhaustive()
    }
}

impl AdvisorySink {
    /// Sink recording into `intent_log`.
    #[must_use]
    pub fn new(intent_log: Arc<dyn IntentLog>) -> Self {
        Self { intent_log }
    }
}

impl SideEffectBoundary for AdvisorySink {
    fn mode(&self) -> RunMode {
        RunMode::DryRun
    }

    fn submit(
        &self,
        _call: &CallContext,
        request: EffectRequest,
    ) -> Result<SideEffectReceipt, BoundaryViolation> {
        let mut intent = request.intent;
        intent.blocked_by_mode = true;
        if let Err(e) = self.intent_log.append(&intent) {
            warn!(intent_id = %intent.id, error = %e, "dry-run intent not recorded");
        }
        debug!(
            run_id = %request.run_id,
            intent_id = %intent.id,
            effect = %intent.effect_kind,
            "intent blocked by mode"
        );
        Ok(SideEffectReceipt::refused(
            RunMode::DryRun,
            &intent,
            BLOCKED_BY_MODE,
        ))
    }
}

// =============================================================================
// Live Boundary
// =============================================================================

/// Prod boundary: authorizes, consumes, scopes, then executes.
#[derive(Clone)]
pub struct LiveBoundary {
    mode: RunMode,
    intent_log: Arc<dyn IntentLog>,
    executor: Arc<dyn EffectExecutor>,
    validator: ReceiptValidator,
}

impl std::fmt::Debug for LiveBoundary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveBoundary")
            .field("mode", &self.mode)
            .field("validator", &self.validator)
            .finish_non_exhaustive()
    }
}

struct Refusal {
    code: &'static str,
    blocked_by_mode: bool,
}

impl Refusal {
    const fn policy(code: &'static str) -> Self {
        Self {
            code,
            blocked_by_mode: false,
        }
    }
}

impl LiveBoundary {
    /// Live boundary for a run in `mode`.
    #[must_use]
    pub fn new(
        mode: RunMode,
        intent_log: Arc<dyn IntentLog>,
        executor: Arc<dyn EffectExecutor>,
        validator: ReceiptValidator,
    ) -> Self {
        Self {
            mode,
            intent_log,
            executor,
            validator,
        }
    }

    /// Every check short of consumption. Returns the context to consume
    /// under.
    fn authorize(&self, request: &EffectRequest) -> Result<RequestContext, Refusal> {
        if self.mode != RunMode::Prod || request.intent.mode != RunMode::Prod {
            return Err(Refusal {
                code: MODE_NOT_PROD,
                blocked_by_mode: true,
            });
        }
        let receipt = request
            .authorization
            .as_ref()
            .ok_or(Refusal::policy(AUTHORIZATION_MISSING))?;
        if !receipt.enforceable {
            return Err(Refusal::policy(AUTHORIZATION_NOT_ENFORCEABLE));
        }
        if !request.intent.required_authorization.enforceable {
            return Err(Refusal::policy(INTENT_MISSING_AUTHORIZATION_REQUIREMENT));
        }

        let ctx = RequestContext {
            run_id: request.run_id.clone(),
            operation_kind: request.intent.effect_kind,
            mode: self.mode,
            now: timestamp::now_millis(),
        };
        self.validator
            .validate(Some(receipt), &ctx)
            .map_err(|denial| Refusal::policy(denial.code()))?;
        Ok(ctx)
    }
}

impl SideEffectBoundary for LiveBoundary {
    fn mode(&self) -> RunMode {
        self.mode
    }

    fn submit(
        &self,
        call: &CallContext,
        request: EffectRequest,
    ) -> Result<SideEffectReceipt, BoundaryViolation> {
        let verdict = self.authorize(&request);
        let mut intent = request.intent;

        let ctx = match verdict {
            Ok(ctx) => ctx,
            Err(refusal) => {
                intent.blocked_by_mode = refusal.blocked_by_mode;
                intent.blocked_by_policy = !refusal.blocked_by_mode;
                if let Err(e) = self.intent_log.append(&intent) {
                    warn!(intent_id = %intent.id, error = %e, "refused intent not recorded");
                }
                warn!(
                    run_id = %request.run_id,
                    intent_id = %intent.id,
                    effect = %intent.effect_kind,
                    code = refusal.code,
                    "effect refused"
                );
                return Ok(SideEffectReceipt::refused(self.mode, &intent, refusal.code));
            },
        };

        if let Err(e) = self.intent_log.append(&intent) {
            warn!(intent_id = %intent.id, error = %e, "intent not recorded, effect withheld");
            return Ok(SideEffectReceipt::refused(
                self.mode,
                &intent,
                INTENT_LOG_UNAVAILABLE,
            ));
        }

        // A concurrent caller may have consumed the receipt since `authorize`.
        if let Err(denial) = self
            .validator
            .validate_and_consume(request.authorization.as_ref(), &ctx)
        {
            warn!(
                run_id = %request.run_id,
                intent_id = %intent.id,
                code = denial.code(),
                "recorded intent lost its authorization"
            );
            return Ok(SideEffectReceipt::refused(self.mode, &intent, denial.code()));
        }

        let scope = call.enter();
        match self.executor.execute(&scope, &intent) {
            Ok(()) => {
                info!(
                    run_id = %request.run_id,
                    intent_id = %intent.id,
                    effect = %intent.effect_kind,
                    target = %intent.target,
                    "effect executed"
                );
                Ok(SideEffectReceipt::succeeded(self.mode, &intent))
            },
            Err(ExecutorError::Failed { reason }) => {
                warn!(intent_id = %intent.id, reason = %reason, "effect failed");
                Ok(SideEffectReceipt::refused(self.mode, &intent, EXECUTION_FAILED))
            },
            Err(ExecutorError::Violation(violation)) => Err(violation),
        }
    }
}
