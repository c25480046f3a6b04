//! Validation Engine - compares algorithm output with human judgment
//!
//! - Pure comparison layer: never scores content itself
//! - Rolling per-validator windows for bias and accuracy
//! - Missing human scores yield `incomplete` results that never reach calibration
//! - Complete results wait in a bounded pending queue until one calibration
//!   cycle consumes them

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use mood_core::{
    AccuracyMetrics, BiasDirection, BiasIndicators, FactorSample, MoodScore, ValidationConfig,
    ValidationMethod, ValidationResult, ValidationStatus, SCORE_MAX, SCORE_MIN,
};
use uuid::Uuid;

/// Width of the score range used to normalise discrepancy.
const SCORE_RANGE: f64 = SCORE_MAX - SCORE_MIN;

/// One (algorithm, human) pair in a validator's window.
#[derive(Debug, Clone, Copy)]
struct Comparison {
    algorithm: f64,
    human: f64,
}

impl Comparison {
    fn signed_error(&self) -> f64 {
        self.algorithm - self.human
    }

    fn agreement(&self) -> f64 {
        1.0 - (self.signed_error().abs() / SCORE_RANGE).min(1.0)
    }
}

pub struct ValidationEngine {
    config: ValidationConfig,
    windows: HashMap<String, VecDeque<Comparison>>,
    pending: VecDeque<ValidationResult>,
}

impl ValidationEngine {
    pub fn new(config: ValidationConfig) -> Self {
        Self {
            config,
            windows: HashMap::new(),
            pending: VecDeque::new(),
        }
    }

    /// Compare one score with a validator's judgment.
    ///
    /// A missing or non-finite human score produces an `Incomplete` result
    /// carrying the validator's current window metrics; it is not added to the
    /// window or the pending queue.
    pub fn validate(
        &mut self,
        score: &MoodScore,
        human_score: Option<f64>,
        validator_id: &str,
        method: ValidationMethod,
        validated_at: DateTime<Utc>,
    ) -> ValidationResult {
        let human = match human_score {
            Some(h) if h.is_finite() => {
                if !(SCORE_MIN..=SCORE_MAX).contains(&h) {
                    tracing::warn!(validator = validator_id, human = h, "Human score out of range, clamping");
                }
                Some(h.clamp(SCORE_MIN, SCORE_MAX))
            }
            Some(h) => {
                tracing::warn!(validator = validator_id, human = h, "Discarding non-finite human score");
                None
            }
            None => None,
        };

        let factor_samples = score
            .factors
            .iter()
            .filter_map(|f| {
                f.internal_score.map(|s| FactorSample {
                    factor_type: f.factor_type,
                    internal_score: s,
                })
            })
            .collect();

        let (status, discrepancy) = match human {
            Some(h) => {
                let comparison = Comparison {
                    algorithm: score.score,
                    human: h,
                };
                self.push_comparison(validator_id, comparison);
                (ValidationStatus::Complete, Some(1.0 - comparison.agreement()))
            }
            None => (ValidationStatus::Incomplete, None),
        };

        let result = ValidationResult {
            id: Uuid::new_v4(),
            unit_id: score.unit_id,
            score_id: score.id,
            validator_id: validator_id.to_string(),
            method,
            status,
            human_score: human,
            algorithm_score: score.score,
            agreement: discrepancy.map(|d| 1.0 - d),
            discrepancy,
            factor_samples,
            weights_version: score.weights_version,
            bias_indicators: self.bias_for(validator_id),
            accuracy_metrics: self.accuracy_for(validator_id),
            validated_at,
        };

        if result.is_complete() {
            self.enqueue(result.clone());
        }

        tracing::debug!(
            validator = validator_id,
            unit = %score.unit_id,
            agreement = ?result.agreement,
            complete = result.is_complete(),
            "Recorded validation"
        );
        result
    }

    fn push_comparison(&mut self, validator_id: &str, comparison: Comparison) {
        let window = self.windows.entry(validator_id.to_string()).or_default();
        window.push_back(comparison);
        while window.len() > self.config.window_size.max(1) {
            window.pop_front();
        }
    }

    fn enqueue(&mut self, result: ValidationResult) {
        self.pending.push_back(result);
        while self.pending.len() > self.config.pending_capacity.max(1) {
            if let Some(dropped) = self.pending.pop_front() {
                tracing::debug!(id = %dropped.id, "Pending validation dropped from full queue");
            }
        }
    }

    /// Systematic-direction analysis over a validator's window.
    pub fn bias_for(&self, validator_id: &str) -> BiasIndicators {
        let window = match self.windows.get(validator_id) {
            Some(w) if !w.is_empty() => w,
            _ => return BiasIndicators::default(),
        };
        let n = window.len() as f64;
        let mean_signed_error = window.iter().map(Comparison::signed_error).sum::<f64>() / n;

        let over = window.iter().filter(|c| c.signed_error() > 0.0).count();
        let under = window.iter().filter(|c| c.signed_error() < 0.0).count();
        let consistency = over.max(under) as f64 / n;

        let direction = if mean_signed_error > f64::EPSILON {
            BiasDirection::Overestimates
        } else if mean_signed_error < -f64::EPSILON {
            BiasDirection::Underestimates
        } else {
            BiasDirection::None
        };

        let systematic = window.len() >= 2
            && direction != BiasDirection::None
            && mean_signed_error.abs() >= self.config.bias_threshold
            && consistency >= self.config.bias_consistency;

        BiasIndicators {
            mean_signed_error,
            consistency,
            direction,
            systematic,
            sample_size: window.len(),
        }
    }

    /// MAE, RMSE, Pearson correlation and mean agreement over a validator's window.
    pub fn accuracy_for(&self, validator_id: &str) -> AccuracyMetrics {
        let window = match self.windows.get(validator_id) {
            Some(w) if !w.is_empty() => w,
            _ => return AccuracyMetrics::default(),
        };
        let n = window.len() as f64;
        let mean_absolute_error = window.iter().map(|c| c.signed_error().abs()).sum::<f64>() / n;
        let root_mean_squared_error =
            (window.iter().map(|c| c.signed_error().powi(2)).sum::<f64>() / n).sqrt();
        let mean_agreement = window.iter().map(Comparison::agreement).sum::<f64>() / n;

        AccuracyMetrics {
            mean_absolute_error,
            root_mean_squared_error,
            correlation: pearson(window),
            mean_agreement,
            sample_size: window.len(),
        }
    }

    /// Complete results not yet consumed by a calibration cycle, oldest first.
    pub fn pending(&self) -> Vec<ValidationResult> {
        self.pending.iter().cloned().collect()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Drop results a calibration cycle has used. Unknown ids are ignored.
    pub fn mark_consumed(&mut self, ids: &[Uuid]) {
        self.pending.retain(|r| !ids.contains(&r.id));
    }

    /// Re-seed windows and the pending queue from stored results, oldest first.
    /// `consumed` tells whether a result was already used by a cycle.
    pub fn restore<I>(&mut self, results: I)
    where
        I: IntoIterator<Item = (ValidationResult, bool)>,
    {
        for (result, consumed) in results {
            let human = match (result.is_complete(), result.human_score) {
                (true, Some(h)) => h,
                _ => continue,
            };
            self.push_comparison(
                &result.validator_id,
                Comparison {
                    algorithm: result.algorithm_score,
                    human,
                },
            );
            if !consumed {
                self.enqueue(result);
            }
        }
    }
}

impl Default for ValidationEngine {
    fn default() -> Self {
        Self::new(ValidationConfig::default())
    }
}

fn pearson(window: &VecDeque<Comparison>) -> Option<f64> {
    if window.len() < 2 {
        return None;
    }
    let n = window.len() as f64;
    let mean_a = window.iter().map(|c| c.algorithm).sum::<f64>() / n;
    let mean_h = window.iter().map(|c| c.human).sum::<f64>() / n;

    let mut cov = 0.0;
    let mut var_a = 0.0;
    let mut var_h = 0.0;
    for c in window {
        let da = c.algorithm - mean_a;
        let dh = c.human - mean_h;
        cov += da * dh;
        var_a += da * da;
        var_h += dh * dh;
    }
    if var_a <= f64::EPSILON || var_h <= f64::EPSILON {
        return None;
    }
    Some((cov / (var_a.sqrt() * var_h.sqrt())).clamp(-1.0, 1.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mood_core::{FactorType, MoodFactor};

    fn score(value: f64) -> MoodScore {
        MoodScore {
            id: Uuid::new_v4(),
            unit_id: Uuid::new_v4(),
            score: value,
            confidence: 0.8,
            descriptors: vec![],
            algorithm_version: "test".into(),
            weights_version: 3,
            processing_time_ms: 0,
            observed_at: Utc::now(),
            calculated_at: Utc::now(),
            factors: vec![MoodFactor {
                factor_type: FactorType::Sentiment,
                weight: 1.0,
                description: String::new(),
                evidence: vec!["happy".into()],
                internal_score: Some(value),
            }],
        }
    }

    #[test]
    fn test_agreement_and_discrepancy() {
        let mut engine = ValidationEngine::default();
        let r = engine.validate(&score(7.0), Some(4.0), "v1", ValidationMethod::ExpertReview, Utc::now());
        assert_eq!(r.status, ValidationStatus::Complete);
        assert!((r.discrepancy.unwrap() - 0.3).abs() < 1e-9);
        assert!((r.agreement.unwrap() - 0.7).abs() < 1e-9);
        assert_eq!(r.weights_version, 3);
        assert_eq!(r.factor_samples.len(), 1);
        assert_eq!(engine.pending_count(), 1);
    }

    #[test]
    fn test_missing_human_score_is_incomplete() {
        let mut engine = ValidationEngine::default();
        let r = engine.validate(&score(7.0), None, "v1", ValidationMethod::SelfReport, Utc::now());
        assert_eq!(r.status, ValidationStatus::Incomplete);
        assert!(r.agreement.is_none());
        assert!(r.discrepancy.is_none());
        assert_eq!(engine.pending_count(), 0);

        let nan = engine.validate(&score(7.0), Some(f64::NAN), "v1", ValidationMethod::SelfReport, Utc::now());
        assert!(!nan.is_complete());
        assert_eq!(engine.accuracy_for("v1").sample_size, 0);
    }

    #[test]
    fn test_systematic_overestimation() {
        let mut engine = ValidationEngine::default();
        for human in [5.0, 4.0, 6.0, 3.0, 5.5] {
            engine.validate(&score(human + 1.5), Some(human), "v1", ValidationMethod::ExpertReview, Utc::now());
        }
        let bias = engine.bias_for("v1");
        assert_eq!(bias.direction, BiasDirection::Overestimates);
        assert!(bias.systematic);
        assert!((bias.mean_signed_error - 1.5).abs() < 1e-9);
        assert_eq!(bias.consistency, 1.0);

        let acc = engine.accuracy_for("v1");
        assert!((acc.mean_absolute_error - 1.5).abs() < 1e-9);
        assert!((acc.correlation.unwrap() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_mixed_errors_are_not_systematic() {
        let mut engine = ValidationEngine::default();
        for (alg, human) in [(6.0, 5.0), (4.0, 5.0), (6.0, 5.0), (4.0, 5.0)] {
            engine.validate(&score(alg), Some(human), "v1", ValidationMethod::Crowdsourced, Utc::now());
        }
        let bias = engine.bias_for("v1");
        assert!(!bias.systematic);
        assert_eq!(bias.direction, BiasDirection::None);
        // Constant human score has no variance
        assert!(engine.accuracy_for("v1").correlation.is_none());
    }

    #[test]
    fn test_windows_are_per_validator_and_bounded() {
        let mut engine = ValidationEngine::new(ValidationConfig {
            window_size: 3,
            pending_capacity: 4,
            ..Default::default()
        });
        for _ in 0..5 {
            engine.validate(&score(8.0), Some(2.0), "harsh", ValidationMethod::ExpertReview, Utc::now());
        }
        engine.validate(&score(8.0), Some(8.0), "fair", ValidationMethod::ExpertReview, Utc::now());

        assert_eq!(engine.bias_for("harsh").sample_size, 3);
        assert_eq!(engine.bias_for("fair").sample_size, 1);
        assert_eq!(engine.bias_for("fair").direction, BiasDirection::None);
        assert_eq!(engine.pending_count(), 4);
    }

    #[test]
    fn test_mark_consumed() {
        let mut engine = ValidationEngine::default();
        let a = engine.validate(&score(5.0), Some(5.0), "v1", ValidationMethod::ExpertReview, Utc::now());
        let b = engine.validate(&score(6.0), Some(5.0), "v1", ValidationMethod::ExpertReview, Utc::now());
        engine.mark_consumed(&[a.id]);
        let pending = engine.pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, b.id);
    }

    #[test]
    fn test_restore_rebuilds_windows_and_queue() {
        let mut source = ValidationEngine::default();
        let a = source.validate(&score(6.0), Some(4.0), "v1", ValidationMethod::ExpertReview, Utc::now());
        let b = source.validate(&score(7.0), Some(4.0), "v1", ValidationMethod::ExpertReview, Utc::now());
        let c = source.validate(&score(7.0), None, "v1", ValidationMethod::ExpertReview, Utc::now());

        let mut restored = ValidationEngine::default();
        restored.restore(vec![(a, true), (b.clone(), false), (c, false)]);
        assert_eq!(restored.bias_for("v1").sample_size, 2);
        assert_eq!(restored.pending().len(), 1);
        assert_eq!(restored.pending()[0].id, b.id);
    }
}
