//! Application outcome sources.
//!
//! Publishing a calibrated weight profile is gated by an `ApplyOutcome`. In
//! production it always succeeds; tests inject scripted or seeded sources to
//! drive the failure and rollback paths deterministically.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use mood_core::WeightProfile;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::Mutex;
use uuid::Uuid;

#[async_trait]
pub trait ApplyOutcome: Send + Sync {
    /// Whether applying `proposed` for cycle `cycle_id` completes.
    async fn attempt(&self, cycle_id: Uuid, proposed: &WeightProfile) -> bool;
}

/// Production source.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysSucceeds;

#[async_trait]
impl ApplyOutcome for AlwaysSucceeds {
    async fn attempt(&self, _cycle_id: Uuid, _proposed: &WeightProfile) -> bool {
        true
    }
}

/// One scripted application attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScriptedStep {
    Succeed,
    Fail,
    /// Hang for the given time before succeeding; used to exercise timeouts
    Stall(Duration),
}

/// Replays a fixed sequence of outcomes, then succeeds once it runs out.
pub struct ScriptedOutcomes {
    steps: Mutex<VecDeque<ScriptedStep>>,
}

impl ScriptedOutcomes {
    pub fn new<I: IntoIterator<Item = ScriptedStep>>(steps: I) -> Self {
        Self {
            steps: Mutex::new(steps.into_iter().collect()),
        }
    }

    /// Shorthand for a success/failure sequence.
    pub fn from_bools<I: IntoIterator<Item = bool>>(outcomes: I) -> Self {
        Self::new(outcomes.into_iter().map(|ok| {
            if ok {
                ScriptedStep::Succeed
            } else {
                ScriptedStep::Fail
            }
        }))
    }

    pub async fn remaining(&self) -> usize {
        self.steps.lock().await.len()
    }
}

#[async_trait]
impl ApplyOutcome for ScriptedOutcomes {
    async fn attempt(&self, _cycle_id: Uuid, _proposed: &WeightProfile) -> bool {
        let step = self.steps.lock().await.pop_front();
        match step {
            Some(ScriptedStep::Fail) => false,
            Some(ScriptedStep::Stall(delay)) => {
                tokio::time::sleep(delay).await;
                true
            }
            Some(ScriptedStep::Succeed) | None => true,
        }
    }
}

/// Succeeds with a fixed probability, drawn from an owned generator.
pub struct RandomOutcomes {
    rng: Mutex<StdRng>,
    success_probability: f64,
}

impl RandomOutcomes {
    /// Reproducible sequence for a given seed.
    pub fn seeded(seed: u64, success_probability: f64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed), success_probability)
    }

    pub fn from_entropy(success_probability: f64) -> Self {
        Self::with_rng(StdRng::from_entropy(), success_probability)
    }

    fn with_rng(rng: StdRng, success_probability: f64) -> Self {
        Self {
            rng: Mutex::new(rng),
            success_probability: success_probability.clamp(0.0, 1.0),
        }
    }
}

#[async_trait]
impl ApplyOutcome for RandomOutcomes {
    async fn attempt(&self, _cycle_id: Uuid, _proposed: &WeightProfile) -> bool {
        self.rng.lock().await.gen_bool(self.success_probability)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_sequence_then_success() {
        let source = ScriptedOutcomes::from_bools([false, true, false]);
        let profile = WeightProfile::default();
        let mut seen = Vec::new();
        for _ in 0..5 {
            seen.push(source.attempt(Uuid::nil(), &profile).await);
        }
        assert_eq!(seen, vec![false, true, false, true, true]);
        assert_eq!(source.remaining().await, 0);
    }

    #[tokio::test]
    async fn test_seeded_outcomes_repeat() {
        let profile = WeightProfile::default();
        let a = RandomOutcomes::seeded(42, 0.5);
        let b = RandomOutcomes::seeded(42, 0.5);
        for _ in 0..32 {
            assert_eq!(
                a.attempt(Uuid::nil(), &profile).await,
                b.attempt(Uuid::nil(), &profile).await
            );
        }
    }

    #[tokio::test]
    async fn test_probability_extremes() {
        let profile = WeightProfile::default();
        let never = RandomOutcomes::seeded(7, 0.0);
        let always = RandomOutcomes::seeded(7, 1.0);
        for _ in 0..16 {
            assert!(!never.attempt(Uuid::nil(), &profile).await);
            assert!(always.attempt(Uuid::nil(), &profile).await);
        }
    }
}
