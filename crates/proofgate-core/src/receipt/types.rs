//! Authorization receipt wire types and the minting builder.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::ReceiptError;
use crate::canonical::{CanonicalBytes, ContentDigest, canonicalize, timestamp};
use crate::crypto::{RECEIPT_MAC_ALGORITHM, ReceiptMac};

/// Schema identifier of [`AuthorizationReceipt`].
pub const RECEIPT_SCHEMA_VERSION: &str = "proofgate.authorization_receipt.v1";

/// Value of `receiptType` for authorization receipts.
pub const RECEIPT_TYPE: &str = "authorization";

/// Maximum encoded receipt size accepted by [`AuthorizationReceipt::from_json`].
pub const MAX_RECEIPT_BYTES: usize = 64 * 1024;

/// Default lifetime of a freshly minted receipt.
pub const DEFAULT_RECEIPT_TTL_SECS: i64 = 3_600;

/// Placeholder value held by the signature and digest slots while the
/// signing payload is canonicalized.
pub(crate) const SIGNATURE_PLACEHOLDER: &str = "";

/// Run mode of the surrounding run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Simulated run; nothing observable may happen.
    DryRun,
    /// Real run; effects may execute with enforceable authorization.
    Prod,
}

impl RunMode {
    /// Wire label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::DryRun => "dry_run",
            Self::Prod => "prod",
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunMode {
    type Err = ReceiptError;

    /// Exact match only: `"PROD"`, `"production"` and `" prod"` are errors.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dry_run" => Ok(Self::DryRun),
            "prod" => Ok(Self::Prod),
            other => Err(ReceiptError::UnknownMode {
                value: other.to_string(),
            }),
        }
    }
}

/// Kind of consequential operation a receipt may authorize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationKind {
    /// Publish a release or package.
    Publish,
    /// Create a tag.
    Tag,
    /// Open a change request.
    OpenRequest,
    /// Post a comment or message.
    Post,
}

impl OperationKind {
    /// Every operation kind, in declaration order.
    pub const ALL: [Self; 4] = [Self::Publish, Self::Tag, Self::OpenRequest, Self::Post];

    /// Wire label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Publish => "publish",
            Self::Tag => "tag",
            Self::OpenRequest => "open-request",
            Self::Post => "post",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = ReceiptError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| ReceiptError::UnknownOperation {
                value: s.to_string(),
            })
    }
}

/// Advisory outcome recorded by the authority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdvisoryOutcome {
    /// The authority would approve.
    Approve,
    /// The authority would deny.
    Deny,
    /// The authority wants a human to decide.
    Escalate,
}

/// Issuing authority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Issuer {
    /// Stable issuer identifier.
    pub issuer_id: String,
    /// Endpoint the receipt was minted by.
    pub endpoint: String,
}

/// Digests of the artifacts a receipt is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SubjectDigests {
    /// Digest of the canonical run plan.
    pub plan_digest: ContentDigest,
    /// Digest of the canonical intent ledger, when known at issue time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ledger_digest: Option<ContentDigest>,
}

/// What the receipt is about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Subject {
    /// Subject type, `run` for run-scoped receipts.
    pub subject_type: String,
    /// Reference to the subject, normally the run id.
    pub subject_ref: String,
    /// Bound artifact digests.
    pub subject_digests: SubjectDigests,
}

/// Policy set the authority evaluated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PolicySet {
    /// Policy set identifier.
    pub policy_set_id: String,
    /// Policy set version.
    pub version: String,
    /// Digest of the policy set contents.
    pub digest: ContentDigest,
}

/// Self-digest of the receipt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ReceiptDigests {
    /// `sha256:<hex>` over the receipt with this field and the signature
    /// value set to the placeholder.
    pub receipt_digest: String,
}

/// Signature slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ReceiptSignature {
    /// Always [`RECEIPT_MAC_ALGORITHM`].
    pub alg: String,
    /// Shared-secret key id.
    pub key_id: String,
    /// Hex MAC. Excluded from its own payload via the placeholder.
    pub sig: String,
}

/// The trust object: an authority-minted, MAC-protected authorization.
///
/// Field order is the canonical order. Single use is tracked outside the
/// receipt by a [`ConsumeIndex`](super::ConsumeIndex) keyed on `id`, so
/// copies of the same receipt share one consumption state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AuthorizationReceipt {
    /// Always [`RECEIPT_SCHEMA_VERSION`].
    pub schema_version: String,
    /// Always [`RECEIPT_TYPE`].
    pub receipt_type: String,
    /// Unique receipt id.
    pub id: String,
    /// Mode the receipt was minted for.
    pub mode: RunMode,
    /// Whether this receipt may justify a real action.
    pub enforceable: bool,
    /// Run the receipt is bound to.
    pub run_id: String,
    /// Operation the receipt is bound to.
    pub operation_kind: OperationKind,
    /// What the authority would have decided.
    pub advisory_outcome: AdvisoryOutcome,
    /// Reasons attached by the authority.
    pub reasons: Vec<String>,
    /// Issue time.
    #[serde(with = "timestamp")]
    pub issued_at: DateTime<Utc>,
    /// Expiry time (exclusive).
    #[serde(with = "timestamp")]
    pub expires_at: DateTime<Utc>,
    /// Issuing authority.
    pub issuer: Issuer,
    /// Bound subject.
    pub subject: Subject,
    /// Evaluated policy set.
    pub policy_set: PolicySet,
    /// Self-digest.
    pub digests: ReceiptDigests,
    /// MAC over everything except `signature.sig`.
    pub signature: ReceiptSignature,
}

impl AuthorizationReceipt {
    /// Whether the receipt is advisory only.
    #[must_use]
    pub const fn is_advisory(&self) -> bool {
        !self.enforceable
    }

    /// Canonical bytes of the receipt as stored.
    ///
    /// # Errors
    ///
    /// Returns [`ReceiptError::Canonical`] if the receipt violates the
    /// canonical profile.
    pub fn canonical_bytes(&self) -> Result<CanonicalBytes, ReceiptError> {
        Ok(canonicalize(self)?)
    }

    /// Bytes covered by the MAC: the receipt with `signature.sig` set to the
    /// placeholder.
    ///
    /// # Errors
    ///
    /// Returns [`ReceiptError::Canonical`] on canonicalization failure.
    pub fn signing_payload(&self) -> Result<CanonicalBytes, ReceiptError> {
        let mut unsigned = self.clone();
        unsigned.signature.sig = SIGNATURE_PLACEHOLDER.to_string();
        Ok(canonicalize(&unsigned)?)
    }

    /// Recomputes `digests.receiptDigest`: both the digest slot and the
    /// signature value hold the placeholder.
    ///
    /// # Errors
    ///
    /// Returns [`ReceiptError::Canonical`] on canonicalization failure.
    pub fn compute_receipt_digest(&self) -> Result<ContentDigest, ReceiptError> {
        let mut bare = self.clone();
        bare.digests.receipt_digest = SIGNATURE_PLACEHOLDER.to_string();
        bare.signature.sig = SIGNATURE_PLACEHOLDER.to_string();
        Ok(canonicalize(&bare)?.digest())
    }

    /// Verifies the self-digest and the MAC.
    ///
    /// # Errors
    ///
    /// - [`ReceiptError::AlgorithmMismatch`] for a non-HMAC signature block
    /// - [`ReceiptError::KeyMismatch`] if the key id differs from `mac`
    /// - [`ReceiptError::DigestMismatch`] if the self-digest is stale
    /// - [`ReceiptError::SignatureInvalid`] if the MAC does not verify
    pub fn verify_signature(&self, mac: &ReceiptMac) -> Result<(), ReceiptError> {
        if self.signature.alg != RECEIPT_MAC_ALGORITHM {
            return Err(ReceiptError::AlgorithmMismatch {
                expected: RECEIPT_MAC_ALGORITHM.to_string(),
                actual: self.signature.alg.clone(),
            });
        }
        if self.signature.key_id != mac.key_id() {
            return Err(ReceiptError::KeyMismatch {
                expected: mac.key_id().to_string(),
                actual: self.signature.key_id.clone(),
            });
        }
        let recomputed = self.compute_receipt_digest()?;
        if recomputed.to_string() != self.digests.receipt_digest {
            return Err(ReceiptError::DigestMismatch {
                expected: self.digests.receipt_digest.clone(),
                actual: recomputed.to_string(),
            });
        }
        let payload = self.signing_payload()?;
        if mac.verify(payload.as_bytes(), &self.signature.sig) {
            Ok(())
        } else {
            Err(ReceiptError::SignatureInvalid)
        }
    }

    /// Parses a receipt from JSON, enforcing the size bound, schema
    /// identifiers, and the dry-run/enforceable invariant.
    ///
    /// # Errors
    ///
    /// Returns [`ReceiptError`] for oversized input, malformed JSON, unknown
    /// fields, a schema mismatch, or an enforceable dry-run receipt.
    pub fn from_json(bytes: &[u8]) -> Result<Self, ReceiptError> {
        if bytes.len() > MAX_RECEIPT_BYTES {
            return Err(ReceiptError::TooLarge {
                size: bytes.len(),
                max: MAX_RECEIPT_BYTES,
            });
        }
        let receipt: Self = serde_json::from_slice(bytes).map_err(|e| ReceiptError::Parse {
            message: e.to_string(),
        })?;
        receipt.check_structure()?;
        Ok(receipt)
    }

    pub(crate) fn check_structure(&self) -> Result<(), ReceiptError> {
        if self.schema_version != RECEIPT_SCHEMA_VERSION {
            return Err(ReceiptError::SchemaMismatch {
                expected: RECEIPT_SCHEMA_VERSION.to_string(),
                actual: self.schema_version.clone(),
            });
        }
        if self.receipt_type != RECEIPT_TYPE {
            return Err(ReceiptError::SchemaMismatch {
                expected: RECEIPT_TYPE.to_string(),
                actual: self.receipt_type.clone(),
            });
        }
        if self.mode == RunMode::DryRun && self.enforceable {
            return Err(ReceiptError::DryRunEnforceable);
        }
        if self.expires_at <= self.issued_at {
            return Err(ReceiptError::InvalidValidityWindow);
        }
        Ok(())
    }
}

/// Mints [`AuthorizationReceipt`]s.
///
/// Signing follows the placeholder protocol: the full receipt is built with
/// empty digest and signature slots, the self-digest is computed and
/// spliced in, the MAC is computed over the receipt with only the signature
/// slot empty, and finally the MAC is spliced in.
#[derive(Debug, Clone)]
pub struct ReceiptBuilder {
    id: Option<String>,
    mode: RunMode,
    enforceable: bool,
    run_id: String,
    operation_kind: OperationKind,
    advisory_outcome: AdvisoryOutcome,
    reasons: Vec<String>,
    issued_at: Option<DateTime<Utc>>,
    expires_at: Option<DateTime<Utc>>,
    issuer: Option<Issuer>,
    plan_digest: Option<ContentDigest>,
    ledger_digest: Option<ContentDigest>,
    policy_set: Option<PolicySet>,
}

impl ReceiptBuilder {
    /// Starts a receipt bound to `run_id` and `operation_kind`.
    ///
    /// Prod receipts default to enforceable; dry-run receipts are always
    /// advisory.
    #[must_use]
    pub fn new(run_id: impl Into<String>, operation_kind: OperationKind, mode: RunMode) -> Self {
        Self {
            id: None,
            mode,
            enforceable: mode == RunMode::Prod,
            run_id: run_id.into(),
            operation_kind,
            advisory_outcome: AdvisoryOutcome::Approve,
            reasons: Vec::new(),
            issued_at: None,
            expires_at: None,
            issuer: None,
            plan_digest: None,
            ledger_digest: None,
            policy_set: None,
        }
    }

    /// Sets an explicit receipt id (default: `rcpt-<uuid>`).
    #[must_use]
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Overrides enforceability. `true` on a dry-run receipt fails at
    /// [`sign`](Self::sign).
    #[must_use]
    pub const fn enforceable(mut self, enforceable: bool) -> Self {
        self.enforceable = enforceable;
        self
    }

    /// Sets the advisory outcome and reasons.
    #[must_use]
    pub fn advisory(mut self, outcome: AdvisoryOutcome, reasons: Vec<String>) -> Self {
        self.advisory_outcome = outcome;
        self.reasons = reasons;
        self
    }

    /// Sets the issue time (default: now).
    #[must_use]
    pub const fn issued_at(mut self, at: DateTime<Utc>) -> Self {
        self.issued_at = Some(at);
        self
    }

    /// Sets the expiry (default: issue time plus one hour).
    #[must_use]
    pub const fn expires_at(mut self, at: DateTime<Utc>) -> Self {
        self.expires_at = Some(at);
        self
    }

    /// Sets the issuer.
    #[must_use]
    pub fn issuer(mut self, issuer_id: impl Into<String>, endpoint: impl Into<String>) -> Self {
        self.issuer = Some(Issuer {
            issuer_id: issuer_id.into(),
            endpoint: endpoint.into(),
        });
        self
    }

    /// Binds the plan digest.
    #[must_use]
    pub fn plan_digest(mut self, digest: ContentDigest) -> Self {
        self.plan_digest = Some(digest);
        self
    }

    /// Binds the ledger digest.
    #[must_use]
    pub fn ledger_digest(mut self, digest: ContentDigest) -> Self {
        self.ledger_digest = Some(digest);
        self
    }

    /// Sets the evaluated policy set.
    #[must_use]
    pub fn policy_set(
        mut self,
        policy_set_id: impl Into<String>,
        version: impl Into<String>,
        digest: ContentDigest,
    ) -> Self {
        self.policy_set = Some(PolicySet {
            policy_set_id: policy_set_id.into(),
            version: version.into(),
            digest,
        });
        self
    }

    /// Builds and signs the receipt.
    ///
    /// # Errors
    ///
    /// - [`ReceiptError::DryRunEnforceable`] for an enforceable dry-run
    /// - [`ReceiptError::MissingField`] for a missing run id, issuer, plan
    ///   digest, or policy set
    /// - [`ReceiptError::InvalidValidityWindow`] if expiry is not after issue
    /// - [`ReceiptError::Canonical`] / [`ReceiptError::Crypto`] on encoding
    ///   or MAC failure
    pub fn sign(self, mac: &ReceiptMac) -> Result<AuthorizationReceipt, ReceiptError> {
        if self.mode == RunMode::DryRun && self.enforceable {
            return Err(ReceiptError::DryRunEnforceable);
        }
        if self.run_id.trim().is_empty() {
            return Err(ReceiptError::MissingField { field: "runId" });
        }
        let issuer = self
            .issuer
            .ok_or(ReceiptError::MissingField { field: "issuer" })?;
        let plan_digest = self
            .plan_digest
            .ok_or(ReceiptError::MissingField {
                field: "subject.subjectDigests.planDigest",
            })?;
        let policy_set = self
            .policy_set
            .ok_or(ReceiptError::MissingField { field: "policySet" })?;

        let issued_at = self.issued_at.unwrap_or_else(timestamp::now_millis);
        let expires_at = self
            .expires_at
            .unwrap_or_else(|| issued_at + Duration::seconds(DEFAULT_RECEIPT_TTL_SECS));

        let mut receipt = AuthorizationReceipt {
            schema_version: RECEIPT_SCHEMA_VERSION.to_string(),
            receipt_type: RECEIPT_TYPE.to_string(),
            id: self
                .id
                .unwrap_or_else(|| format!("rcpt-{}", Uuid::new_v4())),
            mode: self.mode,
            enforceable: self.enforceable,
            subject: Subject {
                subject_type: "run".to_string(),
                subject_ref: self.run_id.clone(),
                subject_digests: SubjectDigests {
                    plan_digest,
                    ledger_digest: self.ledger_digest,
                },
            },
            run_id: self.run_id,
            operation_kind: self.operation_kind,
            advisory_outcome: self.advisory_outcome,
            reasons: self.reasons,
            issued_at,
            expires_at,
            issuer,
            policy_set,
            digests: ReceiptDigests {
                receipt_digest: SIGNATURE_PLACEHOLDER.to_string(),
            },
            signature: ReceiptSignature {
                alg: RECEIPT_MAC_ALGORITHM.to_string(),
                key_id: mac.key_id().to_string(),
                sig: SIGNATURE_PLACEHOLDER.to_string(),
            },
        };
        receipt.check_structure()?;

        receipt.digests.receipt_digest = receipt.compute_receipt_digest()?.to_string();
        let payload = receipt.signing_payload()?;
        receipt.signature.sig = mac.sign(payload.as_bytes())?;
        Ok(receipt)
    }
}
