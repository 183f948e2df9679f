//! Append-only intent storage.

use std::sync::Mutex;

use thiserror::Error;

use super::types::SideEffectIntent;

/// Intent log failure.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum IntentLogError {
    /// The backing store refused the write.
    #[error("intent log write failed: {reason}")]
    WriteFailed {
        /// Store detail.
        reason: String,
    },

    /// A previous writer panicked while holding the log.
    #[error("intent log lock poisoned")]
    Poisoned,
}

/// Where the boundary records every intent it sees.
pub trait IntentLog: Send + Sync {
    /// Appends one intent.
    fn append(&self, intent: &SideEffectIntent) -> Result<(), IntentLogError>;

    /// All intents in append order.
    fn intents(&self) -> Result<Vec<SideEffectIntent>, IntentLogError>;
}

/// Process-local intent log.
#[derive(Debug, Default)]
pub struct InMemoryIntentLog {
    intents: Mutex<Vec<SideEffectIntent>>,
}

impl InMemoryIntentLog {
    /// Empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl IntentLog for InMemoryIntentLog {
    fn append(&self, intent: &SideEffectIntent) -> Result<(), IntentLogError> {
        self.intents
            .lock()
            .map_err(|_| IntentLogError::Poisoned)?
            .push(intent.clone());
        Ok(())
    }

    fn intents(&self) -> Result<Vec<SideEffectIntent>, IntentLogError> {
        Ok(self
            .intents
            .lock()
            .map_err(|_| IntentLogError::Poisoned)?
            .clone())
    }
}
