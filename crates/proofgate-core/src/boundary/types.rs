//! Intent, receipt, and parameter records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::canonical::timestamp;
use crate::receipt::{AuthorizationReceipt, OperationKind, RunMode};

/// Parameter bag error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParameterError {
    /// The key already appears in the bag.
    #[error("duplicate parameter key: {key}")]
    DuplicateKey {
        /// Repeated key.
        key: String,
    },
}

/// One key/value parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EffectParameter {
    /// Parameter name.
    pub key: String,
    /// Parameter value.
    pub value: String,
}

/// Ordered parameter sequence.
///
/// Canonical order is insertion order, so the producer fixes the order that
/// gets signed. Keys are unique; decoding rejects duplicates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<EffectParameter>", into = "Vec<EffectParameter>")]
pub struct EffectParameters(Vec<EffectParameter>);

impl EffectParameters {
    /// Empty bag.
    #[must_use]
    pub const fn new() -> Self {
        Self(Vec::new())
    }

    /// Builds a bag from pairs, in order.
    ///
    /// # Errors
    ///
    /// Returns [`ParameterError::DuplicateKey`] on a repeated key.
    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Result<Self, ParameterError>
    where
        K: Into<String>,
        V: Into<String>,
    {
        let mut params = Self::new();
        for (key, value) in pairs {
            params.insert(key, value)?;
        }
        Ok(params)
    }

    /// Appends a parameter.
    ///
    /// # Errors
    ///
    /// Returns [`ParameterError::DuplicateKey`] if `key` is already present.
    pub fn insert(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), ParameterError> {
        let key = key.into();
        if self.get(&key).is_some() {
            return Err(ParameterError::DuplicateKey { key });
        }
        self.0.push(EffectParameter {
            key,
            value: value.into(),
        });
        Ok(())
    }

    /// Value for `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|p| p.key == key)
            .map(|p| p.value.as_str())
    }

    /// Parameters in canonical order.
    pub fn iter(&self) -> impl Iterator<Item = &EffectParameter> {
        self.0.iter()
    }

    /// Number of parameters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the bag is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl TryFrom<Vec<EffectParameter>> for EffectParameters {
    type Error = ParameterError;

    fn try_from(params: Vec<EffectParameter>) -> Result<Self, Self::Error> {
        Self::from_pairs(params.into_iter().map(|p| (p.key, p.value)))
    }
}

impl From<EffectParameters> for Vec<EffectParameter> {
    fn from(params: EffectParameters) -> Self {
        params.0
    }
}

/// Authorization an intent declares it needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RequiredAuthorization {
    /// Whether an enforceable receipt is required.
    pub enforceable: bool,
}

/// A request for one externally observable effect. Recorded whether or not
/// the effect runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SideEffectIntent {
    /// Intent id.
    pub id: String,
    /// Mode the intent was raised in.
    pub mode: RunMode,
    /// Effect kind.
    pub effect_kind: OperationKind,
    /// Effect target.
    pub target: String,
    /// Effect parameters.
    pub parameters: EffectParameters,
    /// Refused because the run is not in prod.
    pub blocked_by_mode: bool,
    /// Refused by an authorization check.
    pub blocked_by_policy: bool,
    /// Authorization the intent requires.
    pub required_authorization: RequiredAuthorization,
    /// When the intent was raised.
    #[serde(with = "timestamp")]
    pub timestamp: DateTime<Utc>,
}

impl SideEffectIntent {
    /// New intent requiring enforceable authorization.
    #[must_use]
    pub fn new(
        mode: RunMode,
        effect_kind: OperationKind,
        target: impl Into<String>,
        parameters: EffectParameters,
    ) -> Self {
        Self {
            id: format!("intent-{}", Uuid::new_v4()),
            mode,
            effect_kind,
            target: target.into(),
            parameters,
            blocked_by_mode: false,
            blocked_by_policy: false,
            required_authorization: RequiredAuthorization { enforceable: true },
            timestamp: timestamp::now_millis(),
        }
    }
}

/// Outcome of one boundary call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SideEffectReceipt {
    /// Receipt id.
    pub id: String,
    /// Intent this receipt answers.
    pub intent_id: String,
    /// Mode of the boundary.
    pub mode: RunMode,
    /// Effect kind.
    pub effect_kind: OperationKind,
    /// Effect target.
    pub target: String,
    /// Whether the effect executed successfully.
    pub success: bool,
    /// Denial or failure code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// When the boundary answered.
    #[serde(with = "timestamp")]
    pub executed_at: DateTime<Utc>,
}

impl SideEffectReceipt {
    pub(crate) fn succeeded(mode: RunMode, intent: &SideEffectIntent) -> Self {
        Self::answer(mode, intent, true, None)
    }

    pub(crate) fn refused(
        mode: RunMode,
        intent: &SideEffectIntent,
        code: impl Into<String>,
    ) -> Self {
        Self::answer(mode, intent, false, Some(code.into()))
    }

    fn answer(
        mode: RunMode,
        intent: &SideEffectIntent,
        success: bool,
        error_message: Option<String>,
    ) -> Self {
        Self {
            id: format!("ser-{}", Uuid::new_v4()),
            intent_id: intent.id.clone(),
            mode,
            effect_kind: intent.effect_kind,
            target: intent.target.clone(),
            success,
            error_message,
            executed_at: timestamp::now_millis(),
        }
    }
}

/// One boundary call: the intent plus the authorization offered for it.
#[derive(Debug, Clone)]
pub struct EffectRequest {
    /// Run the effect belongs to.
    pub run_id: String,
    /// What to do.
    pub intent: SideEffectIntent,
    /// Authorization offered.
    pub authorization: Option<AuthorizationReceipt>,
}
