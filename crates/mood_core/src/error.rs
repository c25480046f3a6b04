//! Error taxonomy shared across the engine.
//!
//! Low-signal input and incomplete validations are not errors; they surface
//! as `AnalysisIssue::LowSignalInput` and `ValidationStatus::Incomplete`.

use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum MoodError {
    /// A score sequence handed to delta detection went backwards in time.
    #[error("score sequence is not time-ordered at index {index}: {current} precedes {previous}")]
    Ordering {
        index: usize,
        previous: DateTime<Utc>,
        current: DateTime<Utc>,
    },

    #[error("calibration proposal rejected: {reason}")]
    CalibrationRejected { reason: String },

    #[error("calibration application failed: {reason}")]
    CalibrationApplicationFailure { reason: String },

    #[error("conversational unit {0} does not exist")]
    UnitNotFound(Uuid),

    #[error("invalid weight profile: {0}")]
    InvalidWeights(String),

    #[error("calibration cycle {0} is not awaiting review")]
    ReviewNotPending(Uuid),

    /// The calibration history could not be stored; nothing was applied.
    #[error("calibration history not persisted: {0}")]
    HistoryPersistence(String),
}

pub type MoodResult<T> = std::result::Result<T, MoodError>;
