//! Binding and replay validation.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tracing::{debug, warn};

use super::consume::{ConsumeError, ConsumeIndex};
use super::types::{AuthorizationReceipt, OperationKind, RunMode};
use crate::crypto::ReceiptMac;

/// Default staleness window: receipts older than 24h are refused even if
/// not yet expired.
pub const DEFAULT_STALENESS_WINDOW_SECS: i64 = 86_400;

/// What the caller is trying to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    /// Run the operation belongs to.
    pub run_id: String,
    /// Operation being requested.
    pub operation_kind: OperationKind,
    /// Mode of the run.
    pub mode: RunMode,
    /// Evaluation time.
    pub now: DateTime<Utc>,
}

impl RequestContext {
    /// Context evaluated at the current time.
    #[must_use]
    pub fn now(run_id: impl Into<String>, operation_kind: OperationKind, mode: RunMode) -> Self {
        Self {
            run_id: run_id.into(),
            operation_kind,
            mode,
            now: Utc::now(),
        }
    }
}

/// Why a receipt was refused. Expected outcomes, not errors: every variant
/// carries a stable machine code via [`ReceiptDenial::code`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ReceiptDenial {
    /// The request is not in prod mode.
    #[error("mode must be prod, got {mode}")]
    ModeNotProd {
        /// Mode of the request.
        mode: RunMode,
    },

    /// No receipt accompanied the request.
    #[error("authorization receipt missing")]
    ReceiptMissing,

    /// The receipt MAC or self-digest did not verify.
    #[error("receipt signature invalid: {reason}")]
    SignatureInvalid {
        /// Verification failure detail.
        reason: String,
    },

    /// The receipt is advisory only.
    #[error("receipt is not enforceable")]
    NotEnforceable,

    /// The receipt was minted for another run.
    #[error("receipt bound to run {bound}, requested {requested}")]
    RunIdMismatch {
        /// Run in the receipt.
        bound: String,
        /// Run in the request.
        requested: String,
    },

    /// The receipt was minted for another operation.
    #[error("receipt bound to operation {bound}, requested {requested}")]
    OperationMismatch {
        /// Operation in the receipt.
        bound: OperationKind,
        /// Operation in the request.
        requested: OperationKind,
    },

    /// The receipt was already used.
    #[error("receipt already consumed")]
    AlreadyConsumed,

    /// `now` is at or past `expiresAt`.
    #[error("receipt expired at {expires_at}")]
    Expired {
        /// Expiry of the receipt.
        expires_at: DateTime<Utc>,
    },

    /// `issuedAt` is outside the staleness window (or in the future).
    #[error("receipt issued at {issued_at} is outside the {window_secs}s staleness window")]
    Stale {
        /// Issue time of the receipt.
        issued_at: DateTime<Utc>,
        /// Configured window.
        window_secs: i64,
    },

    /// The consume index could not record consumption.
    #[error("consume index unavailable: {reason}")]
    ConsumeStoreUnavailable {
        /// Index failure detail.
        reason: String,
    },
}

impl ReceiptDenial {
    /// Stable machine-readable code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::ModeNotProd { .. } => "mode_not_prod",
            Self::ReceiptMissing => "receipt_missing",
            Self::SignatureInvalid { .. } => "signature_invalid",
            Self::NotEnforceable => "not_enforceable",
            Self::RunIdMismatch { .. } => "run_id_mismatch",
            Self::OperationMismatch { .. } => "operation_mismatch",
            Self::AlreadyConsumed => "already_consumed",
            Self::Expired { .. } => "expired",
            Self::Stale { .. } => "stale",
            Self::ConsumeStoreUnavailable { .. } => "consume_store_unavailable",
        }
    }
}

/// Proof that a receipt passed every check and has now been consumed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumedAuthorization {
    /// Consumed receipt.
    pub receipt_id: String,
    /// Bound run.
    pub run_id: String,
    /// Bound operation.
    pub operation_kind: OperationKind,
    /// When consumption was recorded.
    pub consumed_at: DateTime<Utc>,
}

/// Decides whether a receipt may authorize one operation right now.
///
/// A validator always holds the shared MAC secret: a receipt whose MAC
/// cannot be checked is never accepted.
#[derive(Clone)]
pub struct ReceiptValidator {
    consume_index: Arc<dyn ConsumeIndex>,
    mac: Arc<ReceiptMac>,
    staleness_window: Duration,
}

impl std::fmt::Debug for ReceiptValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceiptValidator")
            .field("mac_key_id", &self.mac.key_id())
            .field("staleness_window_secs", &self.staleness_window.num_seconds())
            .finish_non_exhaustive()
    }
}

impl ReceiptValidator {
    /// Validator backed by `consume_index` that verifies MACs with `mac`,
    /// using the default staleness window.
    #[must_use]
    pub fn new(consume_index: Arc<dyn ConsumeIndex>, mac: Arc<ReceiptMac>) -> Self {
        Self {
            consume_index,
            mac,
            staleness_window: Duration::seconds(DEFAULT_STALENESS_WINDOW_SECS),
        }
    }

    /// Overrides the staleness window.
    #[must_use]
    pub const fn with_staleness_window(mut self, window: Duration) -> Self {
        self.staleness_window = window;
        self
    }

    /// Runs every check without consuming the receipt.
    ///
    /// Callers that must record something before committing (the live
    /// boundary writes its intent first) check here, then call
    /// [`validate_and_consume`](Self::validate_and_consume), which checks
    /// again and consumes.
    ///
    /// # Errors
    ///
    /// Returns the first [`ReceiptDenial`] encountered.
    pub fn validate(
        &self,
        receipt: Option<&AuthorizationReceipt>,
        ctx: &RequestContext,
    ) -> Result<(), ReceiptDenial> {
        self.check(receipt, ctx)
            .map(|_| ())
            .inspect_err(|denial| log_denial(denial, ctx))
    }

    /// Runs every check and, on success, consumes the receipt.
    ///
    /// # Errors
    ///
    /// Returns the first [`ReceiptDenial`] encountered. Nothing is consumed
    /// on denial.
    pub fn validate_and_consume(
        &self,
        receipt: Option<&AuthorizationReceipt>,
        ctx: &RequestContext,
    ) -> Result<ConsumedAuthorization, ReceiptDenial> {
        let result = self
            .check(receipt, ctx)
            .and_then(|receipt| self.consume(receipt, ctx));
        match &result {
            Ok(consumed) => debug!(
                receipt_id = %consumed.receipt_id,
                run_id = %consumed.run_id,
                operation = %consumed.operation_kind,
                "receipt consumed"
            ),
            Err(denial) => log_denial(denial, ctx),
        }
        result
    }

    fn check<'r>(
        &self,
        receipt: Option<&'r AuthorizationReceipt>,
        ctx: &RequestContext,
    ) -> Result<&'r AuthorizationReceipt, ReceiptDenial> {
        if ctx.mode != RunMode::Prod {
            return Err(ReceiptDenial::ModeNotProd { mode: ctx.mode });
        }

        let receipt = receipt.ok_or(ReceiptDenial::ReceiptMissing)?;

        receipt
            .verify_signature(&self.mac)
            .map_err(|e| ReceiptDenial::SignatureInvalid {
                reason: e.to_string(),
            })?;

        if !receipt.enforceable {
            return Err(ReceiptDenial::NotEnforceable);
        }

        if receipt.run_id != ctx.run_id {
            return Err(ReceiptDenial::RunIdMismatch {
                bound: receipt.run_id.clone(),
                requested: ctx.run_id.clone(),
            });
        }

        if receipt.operation_kind != ctx.operation_kind {
            return Err(ReceiptDenial::OperationMismatch {
                bound: receipt.operation_kind,
                requested: ctx.operation_kind,
            });
        }

        match self.consume_index.is_consumed(&receipt.id) {
            Ok(false) => {},
            Ok(true) => return Err(ReceiptDenial::AlreadyConsumed),
            Err(e) => {
                return Err(ReceiptDenial::ConsumeStoreUnavailable {
                    reason: e.to_string(),
                });
            },
        }

        if ctx.now >= receipt.expires_at {
            return Err(ReceiptDenial::Expired {
                expires_at: receipt.expires_at,
            });
        }

        let age = ctx.now - receipt.issued_at;
        if age < Duration::zero() || age > self.staleness_window {
            return Err(ReceiptDenial::Stale {
                issued_at: receipt.issued_at,
                window_secs: self.staleness_window.num_seconds(),
            });
        }

        Ok(receipt)
    }

    fn consume(
        &self,
        receipt: &AuthorizationReceipt,
        ctx: &RequestContext,
    ) -> Result<ConsumedAuthorization, ReceiptDenial> {
        // The is_consumed check in `check` is advisory; this insert decides races.
        match self.consume_index.try_consume(&receipt.id) {
            Ok(()) => Ok(ConsumedAuthorization {
                receipt_id: receipt.id.clone(),
                run_id: receipt.run_id.clone(),
                operation_kind: receipt.operation_kind,
                consumed_at: ctx.now,
            }),
            Err(ConsumeError::AlreadyConsumed { .. }) => Err(ReceiptDenial::AlreadyConsumed),
            Err(e) => Err(ReceiptDenial::ConsumeStoreUnavailable {
                reason: e.to_string(),
            }),
        }
    }
}

fn log_denial(denial: &ReceiptDenial, ctx: &RequestContext) {
    warn!(
        code = denial.code(),
        run_id = %ctx.run_id,
        operation = %ctx.operation_kind,
        "receipt denied: {denial}"
    );
}
