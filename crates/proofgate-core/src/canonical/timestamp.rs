//! Fixed timestamp format for canonical records.
//!
//! Timestamps are RFC 3339 with exactly three fractional digits and an
//! explicit `+00:00` offset, e.g. `2026-01-15T12:00:00.000+00:00`. Values are
//! truncated to millisecond precision at creation time so that a record
//! parsed back from disk compares equal to the one that was written.

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde::{Deserialize, Deserializer, Serializer};

/// Current time truncated to millisecond precision.
#[must_use]
pub fn now_millis() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

/// Formats `ts` in the canonical timestamp format.
#[must_use]
pub fn format(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, false)
}

/// Serde `serialize_with` helper.
pub fn serialize<S>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&format(ts))
}

/// Serde `deserialize_with` helper. Accepts any RFC 3339 offset and
/// normalizes to UTC.
pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(serde::de::Error::custom)
}
