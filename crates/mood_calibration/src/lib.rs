//! # Mood Calibration
//!
//! The feedback half of the engine. `ValidationEngine` compares scores with
//! human judgments and keeps per-validator bias and accuracy windows;
//! `CalibrationController` turns the pending complete results into bounded,
//! back-tested weight updates and keeps the append-only calibration history,
//! committed through a `HistoryJournal` before any weights go live.

pub mod calibration;
pub mod journal;
pub mod outcome;
pub mod validation;

pub use calibration::{
    backtest, check_proposal, propose_weights, replay_score, CalibrationController,
    CalibrationPhase, CycleOutcome, CycleReport, CycleTrigger, WEIGHTS_COMPONENT,
};
pub use journal::{HistoryJournal, InMemoryJournal, SwitchableJournal};
pub use outcome::{AlwaysSucceeds, ApplyOutcome, RandomOutcomes, ScriptedOutcomes, ScriptedStep};
pub use validation::ValidationEngine;
