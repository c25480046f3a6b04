//! # Mood Memory
//!
//! Persistence and orchestration for the mood engine.
//!
//! - `SqliteMoodStore`: SQLite storage for units, scores, deltas, patterns,
//!   turning points, validation results and calibration history. Also serves
//!   as a `MemoryStore` for units recorded through it.
//! - `MoodEngine`: scoring, trajectory analysis, validation and calibration
//!   behind one coordinator.
//! - `CalibrationScheduler`: periodic calibration cycles.

pub mod engine;
pub mod scheduler;
pub mod sqlite;

pub use engine::{MoodEngine, ScoringReport, Trajectory, ValidationSubmission};
pub use scheduler::CalibrationScheduler;
pub use sqlite::SqliteMoodStore;
