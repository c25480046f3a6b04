//! # Mood Core
//!
//! Shared vocabulary of the mood engine: the conversational unit it reads,
//! the append-only records it writes, the versioned weight profile that
//! calibration tunes, and the configuration everything else is built from.

pub mod clock;
pub mod config;
pub mod error;
pub mod lexicon;
pub mod model;
pub mod unit;
pub mod weights;

pub use clock::{Clock, FixedClock, SystemClock};
pub use config::{
    CalibrationConfig, DeltaConfig, EngineConfig, ScoringConfig, StorageConfig, ValidationConfig,
};
pub use error::{MoodError, MoodResult};
pub use model::*;
pub use unit::{ConversationalUnit, MemoryStore, Message, Participant, ParticipantRole};
pub use weights::{WeightProfile, WeightSet, WeightStore, WEIGHT_NORMALIZATION};
