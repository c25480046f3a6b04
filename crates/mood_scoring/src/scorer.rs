//! Multi-factor mood scorer.
//!
//! `score = Σ(internal_i × w_i) / Σ(w_i)` over the factors that found
//! evidence. The recorded factor weights are the renormalised coefficients,
//! so the factor set alone reconstructs the score.
//!
//! Confidence is `agreement × (0.5·density + 0.3·coverage + 0.2·length)`:
//! - agreement: 1 − (std-dev of factor scores / 5)
//! - density: evidence hits relative to `evidence_saturation`
//! - coverage: base-weight share of the factors that fired
//! - length: word count relative to `length_saturation`

use std::sync::Arc;

use mood_core::{
    AnalysisIssue, AnalysisMetadata, Clock, ConversationalUnit, FactorType, MoodFactor, MoodScore,
    QualityMetrics, ScoringConfig, SystemClock, WeightProfile, WeightStore, SCORE_MAX,
    SCORE_MIDPOINT, SCORE_MIN,
};
use uuid::Uuid;

use crate::extractors::{default_extractors, FactorExtractor, FactorReading};

pub const ALGORITHM_VERSION: &str = "mood-scorer/1.0";

/// Largest possible standard deviation of values on the 0-10 scale.
const MAX_SPREAD: f64 = 5.0;

/// Optional history supplied by the caller.
#[derive(Debug, Clone, Default)]
pub struct PriorContext {
    /// Recent scores for the same subject, oldest first
    pub recent_scores: Vec<f64>,
    pub baseline: Option<f64>,
}

impl PriorContext {
    /// Explicit baseline, or the mean of recent scores.
    pub fn baseline(&self) -> Option<f64> {
        self.baseline.or_else(|| {
            if self.recent_scores.is_empty() {
                None
            } else {
                Some(self.recent_scores.iter().sum::<f64>() / self.recent_scores.len() as f64)
            }
        })
    }
}

/// A score plus its diagnostics.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreOutcome {
    pub score: MoodScore,
    pub metadata: AnalysisMetadata,
}

pub struct MoodScorer {
    extractors: Vec<Box<dyn FactorExtractor>>,
    weights: Arc<WeightStore>,
    config: ScoringConfig,
    clock: Arc<dyn Clock>,
}

impl MoodScorer {
    pub fn new(weights: Arc<WeightStore>, config: ScoringConfig) -> Self {
        Self::with_extractors(weights, config, default_extractors())
    }

    pub fn with_extractors(
        weights: Arc<WeightStore>,
        config: ScoringConfig,
        extractors: Vec<Box<dyn FactorExtractor>>,
    ) -> Self {
        Self {
            extractors,
            weights,
            config,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn weights(&self) -> &Arc<WeightStore> {
        &self.weights
    }

    /// Score one unit. Never fails: a unit without evidence gets the neutral
    /// low-signal result.
    pub fn score(&self, unit: &ConversationalUnit, prior: Option<&PriorContext>) -> ScoreOutcome {
        let started = self.clock.now();
        let profile = self.weights.snapshot();

        let readings: Vec<(FactorType, FactorReading)> = self
            .extractors
            .iter()
            .filter_map(|e| e.extract(unit).map(|r| (e.factor_type(), r)))
            .collect();

        let word_count = unit.word_count();
        let message_count = unit.messages.len();

        let (score, confidence, factors, quality, mut issues) = if readings.is_empty() {
            self.low_signal(&profile, word_count, message_count)
        } else {
            self.combine(&profile, readings, word_count, message_count, prior)
        };

        if word_count < 5 && !issues.contains(&AnalysisIssue::LowSignalInput) {
            issues.push(AnalysisIssue::ShortContent);
        }

        let descriptors = self.descriptors(&factors);
        let calculated_at = self.clock.now();
        let processing_time_ms = (calculated_at - started).num_milliseconds().max(0) as u64;

        let key = format!(
            "score:{}:{}:{}:{}",
            unit.id,
            ALGORITHM_VERSION,
            profile.version(),
            calculated_at.timestamp_nanos_opt().unwrap_or_default()
        );
        let id = Uuid::new_v5(&Uuid::NAMESPACE_OID, key.as_bytes());

        tracing::debug!(
            unit = %unit.id,
            score,
            confidence,
            factors = factors.len(),
            weights_version = profile.version(),
            "Scored unit"
        );

        ScoreOutcome {
            metadata: AnalysisMetadata {
                unit_id: unit.id,
                score_id: id,
                processing_duration_ms: processing_time_ms,
                confidence,
                quality,
                issues,
            },
            score: MoodScore {
                id,
                unit_id: unit.id,
                score,
                confidence,
                descriptors,
                algorithm_version: ALGORITHM_VERSION.to_string(),
                weights_version: profile.version(),
                processing_time_ms,
                observed_at: unit.timestamp,
                calculated_at,
                factors,
            },
        }
    }

    /// Neutral result for units without evidence. Every factor is recorded
    /// at the midpoint so the factor set still reconstructs 5.0.
    fn low_signal(
        &self,
        profile: &WeightProfile,
        word_count: usize,
        message_count: usize,
    ) -> (f64, f64, Vec<MoodFactor>, QualityMetrics, Vec<AnalysisIssue>) {
        let types: Vec<FactorType> = self.extractors.iter().map(|e| e.factor_type()).collect();
        let coefficients = effective_weights(profile, &types);

        let factors = types
            .iter()
            .zip(coefficients)
            .map(|(t, w)| MoodFactor {
                factor_type: *t,
                weight: w,
                description: "no evidence found".to_string(),
                evidence: Vec::new(),
                internal_score: Some(SCORE_MIDPOINT),
            })
            .collect();

        tracing::debug!("Unit carries no evidence, returning low-signal score");
        let quality = QualityMetrics {
            evidence_count: 0,
            factor_coverage: 0.0,
            factor_agreement: 0.0,
            word_count,
            message_count,
        };
        (
            SCORE_MIDPOINT,
            self.config.low_signal_confidence.clamp(0.0, 1.0),
            factors,
            quality,
            vec![AnalysisIssue::LowSignalInput],
        )
    }

    fn combine(
        &self,
        profile: &WeightProfile,
        readings: Vec<(FactorType, FactorReading)>,
        word_count: usize,
        message_count: usize,
        prior: Option<&PriorContext>,
    ) -> (f64, f64, Vec<MoodFactor>, QualityMetrics, Vec<AnalysisIssue>) {
        let types: Vec<FactorType> = readings.iter().map(|(t, _)| *t).collect();
        let coefficients = effective_weights(profile, &types);

        let score = readings
            .iter()
            .zip(&coefficients)
            .map(|((_, r), w)| r.internal_score * w)
            .sum::<f64>()
            .clamp(SCORE_MIN, SCORE_MAX);

        // Confidence ingredients
        let n = readings.len() as f64;
        let mean = readings.iter().map(|(_, r)| r.internal_score).sum::<f64>() / n;
        let variance = readings
            .iter()
            .map(|(_, r)| (r.internal_score - mean).powi(2))
            .sum::<f64>()
            / n;
        let agreement = 1.0 - (variance.sqrt() / MAX_SPREAD).min(1.0);

        let evidence_count: usize = readings.iter().map(|(_, r)| r.evidence.len()).sum();
        let density = saturate(evidence_count, self.config.evidence_saturation);

        let all_types: Vec<FactorType> = self.extractors.iter().map(|e| e.factor_type()).collect();
        let total_base: f64 = all_types.iter().map(|t| profile.weight(*t)).sum();
        let fired_base: f64 = types.iter().map(|t| profile.weight(*t)).sum();
        let coverage = if total_base > 0.0 {
            fired_base / total_base
        } else {
            types.len() as f64 / all_types.len().max(1) as f64
        };

        let length = saturate(word_count, self.config.length_saturation);

        let mut confidence = agreement * (0.5 * density + 0.3 * coverage + 0.2 * length);

        // A big jump away from the baseline on thin evidence is less believable
        if let Some(baseline) = prior.and_then(|p| p.baseline()) {
            let jump = (score - baseline).abs() / SCORE_MAX;
            confidence *= 1.0 - 0.3 * jump * (1.0 - density);
        }
        let confidence = confidence.clamp(0.0, 1.0);

        let mut issues = Vec::new();
        if density < 0.5 {
            issues.push(AnalysisIssue::SparseEvidence);
        }
        if agreement < 0.6 {
            issues.push(AnalysisIssue::FactorDisagreement);
        }

        let factors = readings
            .into_iter()
            .zip(coefficients)
            .map(|((factor_type, r), weight)| MoodFactor {
                factor_type,
                weight,
                description: r.description,
                evidence: r.evidence,
                internal_score: Some(r.internal_score),
            })
            .collect();

        let quality = QualityMetrics {
            evidence_count,
            factor_coverage: coverage,
            factor_agreement: agreement,
            word_count,
            message_count,
        };
        (score, confidence, factors, quality, issues)
    }

    /// Top evidence phrases, heaviest factor first, without repeats.
    fn descriptors(&self, factors: &[MoodFactor]) -> Vec<String> {
        let mut ordered: Vec<&MoodFactor> = factors.iter().collect();
        ordered.sort_by(|a, b| {
            b.weight
                .total_cmp(&a.weight)
                .then_with(|| a.factor_type.cmp(&b.factor_type))
        });

        let mut out: Vec<String> = Vec::new();
        for phrase in ordered.iter().flat_map(|f| f.evidence.iter()) {
            if out.len() >= self.config.descriptor_count {
                break;
            }
            if !out.contains(phrase) {
                out.push(phrase.clone());
            }
        }
        out
    }
}

/// Profile weights for `types`, rescaled to sum to one. Falls back to equal
/// shares when the profile gives those factors no weight at all.
fn effective_weights(profile: &WeightProfile, types: &[FactorType]) -> Vec<f64> {
    let raw: Vec<f64> = types.iter().map(|t| profile.weight(*t)).collect();
    let total: f64 = raw.iter().sum();
    if total > 0.0 {
        raw.iter().map(|w| w / total).collect()
    } else {
        let share = 1.0 / types.len().max(1) as f64;
        vec![share; types.len()]
    }
}

fn saturate(count: usize, at: usize) -> f64 {
    if at == 0 {
        1.0
    } else {
        (count as f64 / at as f64).min(1.0)
    }
}
