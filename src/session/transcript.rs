//! In-memory transcript of a live session

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::transport::Role;

/// One transcribed utterance fragment
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TranscriptEntry {
    /// Speaker
    pub role: Role,
    /// Transcribed text
    pub text: String,
    /// When the fragment arrived
    pub at: DateTime<Utc>,
}

/// Append-only transcript; single writer, entries never change once added
#[derive(Debug, Default)]
pub struct Transcript {
    entries: Vec<TranscriptEntry>,
}

impl Transcript {
    /// Create an empty transcript
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Append a fragment and return the stored entry
    pub fn push(&mut self, role: Role, text: String) -> &TranscriptEntry {
        self.entries.push(TranscriptEntry {
            role,
            text,
            at: Utc::now(),
        });
        &self.entries[self.entries.len() - 1]
    }

    /// All entries in arrival order
    #[must_use]
    pub fn entries(&self) -> &[TranscriptEntry] {
        &self.entries
    }

    /// The last `n` entries
    #[must_use]
    pub fn recent(&self, n: usize) -> &[TranscriptEntry] {
        &self.entries[self.entries.len().saturating_sub(n)..]
    }

    /// Number of entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if nothing was said yet
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop everything; only the session does this, on close
    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }
}
