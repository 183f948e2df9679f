//! Per-request boundary scope tracking.
//!
//! A [`CallContext`] belongs to one logical call chain and is threaded
//! through every boundary call explicitly. It is `!Sync`, so concurrent
//! requests cannot share one and cannot disturb each other's depth.

use std::cell::Cell;

use thiserror::Error;
use uuid::Uuid;

/// Internal bypass defect: external work was attempted outside a boundary
/// scope. Never a denial; it signals a bug in the caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BoundaryViolation {
    /// No boundary scope is active on the call chain.
    #[error("external call attempted outside a boundary scope (request {request_id})")]
    NotInScope {
        /// Call chain that violated the boundary.
        request_id: String,
    },
}

/// Call-chain context carrying the boundary scope depth.
#[derive(Debug)]
pub struct CallContext {
    request_id: String,
    depth: Cell<u32>,
}

impl CallContext {
    /// Fresh context with a random request id.
    #[must_use]
    pub fn new() -> Self {
        Self::with_request_id(format!("req-{}", Uuid::new_v4()))
    }

    /// Fresh context for `request_id`.
    #[must_use]
    pub fn with_request_id(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            depth: Cell::new(0),
        }
    }

    /// Request id of the call chain.
    #[must_use]
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Current scope depth.
    #[must_use]
    pub fn depth(&self) -> u32 {
        self.depth.get()
    }

    /// Succeeds only inside a boundary scope. Adapters performing real
    /// external calls must check this first.
    ///
    /// # Errors
    ///
    /// Returns [`BoundaryViolation::NotInScope`] outside a scope.
    pub fn assert_in_scope(&self) -> Result<(), BoundaryViolation> {
        if self.depth.get() == 0 {
            return Err(BoundaryViolation::NotInScope {
                request_id: self.request_id.clone(),
            });
        }
        Ok(())
    }

    /// Opens a scope. Only the boundary mints scopes.
    pub(super) fn enter(&self) -> BoundaryScope<'_> {
        self.depth.set(self.depth.get().saturating_add(1));
        BoundaryScope { context: self }
    }
}

impl Default for CallContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Proof that the caller is inside a boundary scope. Restores the depth
/// when dropped.
#[derive(Debug)]
pub struct BoundaryScope<'a> {
    context: &'a CallContext,
}

impl BoundaryScope<'_> {
    /// Context the scope belongs to.
    #[must_use]
    pub const fn call_context(&self) -> &CallContext {
        self.context
    }
}

impl Drop for BoundaryScope<'_> {
    fn drop(&mut self) {
        let depth = self.context.depth.get();
        self.context.depth.set(depth.saturating_sub(1));
    }
}
