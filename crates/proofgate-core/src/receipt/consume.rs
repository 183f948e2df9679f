//! Single-use enforcement for authorization receipts.
//!
//! The consume index is the only shared mutable state on the decision path.
//! [`ConsumeIndex::try_consume`] is an atomic check-and-insert: at most one
//! caller ever receives `Ok(())` for a given receipt id.
//!
//! [`FileBackedConsumeIndex`] persists consumption in an append-only log.
//! Each line is the JSON-encoded receipt id. The log is fsynced before
//! `try_consume` returns, so a consumed receipt stays consumed across
//! restarts. An exclusive file lock is held for the lifetime of the index so
//! two processes cannot interleave writes.
//!
//! A crash mid-append can leave a partial last line. Replay drops such a
//! torn tail and truncates it away: its `try_consume` never returned, so no
//! effect was admitted on it. A bad line anywhere else is corruption and
//! the log refuses to open.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use fs2::FileExt;
use thiserror::Error;
use tracing::{debug, warn};

/// Maximum length of a receipt id accepted by the index.
const MAX_RECEIPT_ID_LEN: usize = 256;

/// Errors from consume operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConsumeError {
    /// The receipt id has already been consumed.
    #[error("receipt already consumed: {receipt_id}")]
    AlreadyConsumed {
        /// The consumed id.
        receipt_id: String,
    },

    /// The receipt id is empty, too long, or contains control characters.
    #[error("invalid receipt id: {reason}")]
    InvalidReceiptId {
        /// Why it was rejected.
        reason: String,
    },

    /// Durable write or fsync failed.
    #[error("durable write failed: {0}")]
    Io(#[from] std::io::Error),

    /// A log line could not be decoded during replay.
    #[error("corrupt consume log entry at line {line}: {reason}")]
    CorruptLog {
        /// 1-based line number.
        line: usize,
        /// Decoder message.
        reason: String,
    },

    /// A previous holder of the index lock panicked.
    #[error("consume index lock poisoned")]
    Poisoned,
}

/// Tracks which receipts have been consumed.
pub trait ConsumeIndex: Send + Sync {
    /// Atomically marks `receipt_id` consumed.
    ///
    /// Returns `Err(ConsumeError::AlreadyConsumed)` if it already was.
    fn try_consume(&self, receipt_id: &str) -> Result<(), ConsumeError>;

    /// Whether `receipt_id` has been consumed.
    ///
    /// # Errors
    ///
    /// Returns [`ConsumeError::Poisoned`] when the index cannot answer.
    /// Callers must treat that as "cannot decide", never as "not consumed".
    fn is_consumed(&self, receipt_id: &str) -> Result<bool, ConsumeError>;
}

fn validate_receipt_id(receipt_id: &str) -> Result<(), ConsumeError> {
    if receipt_id.is_empty() {
        return Err(ConsumeError::InvalidReceiptId {
            reason: "empty".to_string(),
        });
    }
    if receipt_id.len() > MAX_RECEIPT_ID_LEN {
        return Err(ConsumeError::InvalidReceiptId {
            reason: format!("longer than {MAX_RECEIPT_ID_LEN} bytes"),
        });
    }
    if receipt_id.chars().any(char::is_control) {
        return Err(ConsumeError::InvalidReceiptId {
            reason: "contains control characters".to_string(),
        });
    }
    Ok(())
}

/// Process-local consume index.
#[derive(Debug, Default)]
pub struct InMemoryConsumeIndex {
    consumed: Mutex<HashSet<String>>,
}

impl InMemoryConsumeIndex {
    /// Empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConsumeIndex for InMemoryConsumeIndex {
    fn try_consume(&self, receipt_id: &str) -> Result<(), ConsumeError> {
        validate_receipt_id(receipt_id)?;
        let mut consumed = self.consumed.lock().map_err(|_| ConsumeError::Poisoned)?;
        if consumed.insert(receipt_id.to_string()) {
            Ok(())
        } else {
            Err(ConsumeError::AlreadyConsumed {
                receipt_id: receipt_id.to_string(),
            })
        }
    }

    fn is_consumed(&self, receipt_id: &str) -> Result<bool, ConsumeError> {
        let consumed = self.consumed.lock().map_err(|_| ConsumeError::Poisoned)?;
        Ok(consumed.contains(receipt_id))
    }
}

/// Append-only, fsynced consume log.
pub struct FileBackedConsumeIndex {
    path: PathBuf,
    // Held across the durable write so check-and-insert stays atomic.
    state: Mutex<ConsumeLogState>,
}

struct ConsumeLogState {
    consumed: HashSet<String>,
    file: File,
}

impl std::fmt::Debug for FileBackedConsumeIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileBackedConsumeIndex")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl FileBackedConsumeIndex {
    /// Opens or creates the log at `path` and replays it.
    ///
    /// A torn last record is truncated away with a warning.
    ///
    /// # Errors
    ///
    /// Returns [`ConsumeError::Io`] if the file cannot be opened, locked, or
    /// repaired and [`ConsumeError::CorruptLog`] if a line before the last
    /// does not decode.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ConsumeError> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;
        file.try_lock_exclusive()?;

        let mut raw = Vec::new();
        file.read_to_end(&mut raw)?;
        let replay = replay_log(&raw)?;

        if let Some(torn) = &replay.torn {
            warn!(
                path = %path.display(),
                line = torn.line,
                reason = %torn.reason,
                "truncating torn tail record from consume log"
            );
            file.set_len(replay.valid_len)?;
            file.sync_all()?;
        } else if raw.last().is_some_and(|b| *b != b'\n') {
            // The last record decoded but its newline never landed.
            file.write_all(b"\n")?;
            file.sync_data()?;
        }
        debug!(
            path = %path.display(),
            replayed = replay.consumed.len(),
            "consume log opened"
        );

        Ok(Self {
            path,
            state: Mutex::new(ConsumeLogState {
                consumed: replay.consumed,
                file,
            }),
        })
    }

    /// Number of consumed receipts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().map_or(0, |s| s.consumed.len())
    }

    /// Whether nothing has been consumed yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ConsumeIndex for FileBackedConsumeIndex {
    fn try_consume(&self, receipt_id: &str) -> Result<(), ConsumeError> {
        validate_receipt_id(receipt_id)?;
        let mut state = self.state.lock().map_err(|_| ConsumeError::Poisoned)?;
        if state.consumed.contains(receipt_id) {
            return Err(ConsumeError::AlreadyConsumed {
                receipt_id: receipt_id.to_string(),
            });
        }

        let line = serde_json::to_string(receipt_id).map_err(|e| {
            ConsumeError::InvalidReceiptId {
                reason: e.to_string(),
            }
        })?;
        if let Err(e) = writeln!(state.file, "{line}").and_then(|()| state.file.sync_data()) {
            warn!(path = %self.path.display(), error = %e, "consume log write failed");
            return Err(e.into());
        }
        state.consumed.insert(receipt_id.to_string());
        Ok(())
    }

    fn is_consumed(&self, receipt_id: &str) -> Result<bool, ConsumeError> {
        let state = self.state.lock().map_err(|_| ConsumeError::Poisoned)?;
        Ok(state.consumed.contains(receipt_id))
    }
}

struct Replay {
    consumed: HashSet<String>,
    valid_len: u64,
    torn: Option<TornRecord>,
}

struct TornRecord {
    line: usize,
    reason: String,
}

/// Decodes every record in `raw`. Only the last non-blank record may fail
/// to decode; it is reported as torn and `valid_len` stops before it.
fn replay_log(raw: &[u8]) -> Result<Replay, ConsumeError> {
    let records: Vec<&[u8]> = raw.split(|b| *b == b'\n').collect();
    let last = records.iter().rposition(|r| !r.trim_ascii().is_empty());

    let mut consumed = HashSet::new();
    let mut offset = 0usize;
    for (idx, record) in records.iter().enumerate() {
        if !record.trim_ascii().is_empty() {
            match serde_json::from_slice::<String>(record.trim_ascii()) {
                Ok(receipt_id) => {
                    consumed.insert(receipt_id);
                },
                Err(e) if Some(idx) == last => {
                    return Ok(Replay {
                        consumed,
                        valid_len: offset as u64,
                        torn: Some(TornRecord {
                            line: idx + 1,
                            reason: e.to_string(),
                        }),
                    });
                },
                Err(e) => {
                    return Err(ConsumeError::CorruptLog {
                        line: idx + 1,
                        reason: e.to_string(),
                    });
                },
            }
        }
        offset += record.len() + 1;
    }

    Ok(Replay {
        consumed,
        valid_len: raw.len() as u64,
        torn: None,
    })
}
