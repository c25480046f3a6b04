//! Durable home of the calibration history.
//!
//! The controller commits every batch of history entries, together with the
//! validation results the batch consumed, before any of it becomes visible:
//! weights are published and the in-memory ledger grows only after the
//! journal accepted the batch.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use mood_core::{CalibrationRecord, MoodError, MoodResult};
use uuid::Uuid;

#[async_trait]
pub trait HistoryJournal: Send + Sync {
    /// Store `records` and mark `consumed` validation results as used.
    /// All or nothing.
    async fn commit(&self, records: &[CalibrationRecord], consumed: &[Uuid]) -> MoodResult<()>;
}

/// Keeps nothing beyond the controller's own ledger.
#[derive(Debug, Clone, Copy, Default)]
pub struct InMemoryJournal;

#[async_trait]
impl HistoryJournal for InMemoryJournal {
    async fn commit(&self, _records: &[CalibrationRecord], _consumed: &[Uuid]) -> MoodResult<()> {
        Ok(())
    }
}

/// Rejects commits while switched off. Used to drive the persistence
/// failure paths.
#[derive(Debug, Default)]
pub struct SwitchableJournal {
    failing: AtomicBool,
}

impl SwitchableJournal {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl HistoryJournal for SwitchableJournal {
    async fn commit(&self, _records: &[CalibrationRecord], _consumed: &[Uuid]) -> MoodResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(MoodError::HistoryPersistence("journal unavailable".to_string()));
        }
        Ok(())
    }
}
