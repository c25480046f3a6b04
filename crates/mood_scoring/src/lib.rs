//! # Mood Scoring
//!
//! The analysis half of the engine:
//!
//! - **Extractors** read one kind of evidence from a conversational unit
//!   (sentiment, psychological indicators, relationship dynamics, how the
//!   exchange closes) and place it on the 0-10 scale.
//! - **MoodScorer** combines the readings under the current weight profile
//!   into a single score with confidence, descriptors and diagnostics.
//! - **DeltaDetector** walks a time-ordered score sequence and reports the
//!   changes between neighbours, runs of same-direction change, and the
//!   turning points worth surfacing.
//!
//! Everything here is synchronous and side-effect free apart from reading
//! the shared weight snapshot.

pub mod delta;
pub mod extractors;
pub mod scorer;

pub use delta::{rank_by_significance, DeltaDetector, SequenceLabels, TrajectoryAnalysis};
pub use extractors::{
    default_extractors, ConversationalPositionExtractor, FactorExtractor, FactorReading,
    PsychologicalIndicatorExtractor, RelationshipDynamicsExtractor, SentimentExtractor,
};
pub use scorer::{MoodScorer, PriorContext, ScoreOutcome, ALGORITHM_VERSION};
