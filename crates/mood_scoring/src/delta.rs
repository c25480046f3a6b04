//! Delta detection over a time-ordered sequence of mood scores.
//!
//! significance = min(1, magnitude / magnitude_scale)
//!              × position weight (conclusion_boost in the final quartile)
//!              × √(confidence_prev × confidence_cur)
//!              × type weight (repair_discount for repairs, 1 otherwise)
//! clamped to [0, 1]. Open-ended sequences never reach the conclusion phase.

use mood_core::{
    DeltaConfig, DeltaPattern, DeltaType, Direction, FactorShift, MoodDelta, MoodError,
    MoodResult, MoodScore, SequencePhase, TemporalContext, TurningPoint, TurningPointType,
};
use uuid::Uuid;

/// Labels stamped onto every delta of one analysed sequence.
#[derive(Debug, Clone, Default)]
pub struct SequenceLabels {
    pub subject_id: Option<String>,
    pub conversation_id: Option<String>,
    /// Sequence number given to the first delta
    pub first_sequence: u32,
    /// The sequence may still grow, so none of its deltas is known to sit in
    /// the conclusion: phase stops at `Middle` and no boost applies
    pub open_ended: bool,
}

/// Output of a full pass over one sequence.
#[derive(Debug, Clone, Default)]
pub struct TrajectoryAnalysis {
    pub deltas: Vec<MoodDelta>,
    pub patterns: Vec<DeltaPattern>,
    pub turning_points: Vec<TurningPoint>,
}

pub struct DeltaDetector {
    config: DeltaConfig,
}

impl DeltaDetector {
    pub fn new(config: DeltaConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DeltaConfig {
        &self.config
    }

    pub fn detect(&self, scores: &[MoodScore]) -> MoodResult<Vec<MoodDelta>> {
        self.detect_labeled(scores, &SequenceLabels::default())
    }

    /// One delta per consecutive pair. Fewer than two scores yield nothing;
    /// a score older than its predecessor is an `Ordering` error.
    pub fn detect_labeled(
        &self,
        scores: &[MoodScore],
        labels: &SequenceLabels,
    ) -> MoodResult<Vec<MoodDelta>> {
        for (i, pair) in scores.windows(2).enumerate() {
            if pair[1].observed_at < pair[0].observed_at {
                return Err(MoodError::Ordering {
                    index: i + 1,
                    previous: pair[0].observed_at,
                    current: pair[1].observed_at,
                });
            }
        }
        if scores.len() < 2 {
            return Ok(Vec::new());
        }

        let total = scores.len() - 1;
        let mut deltas: Vec<MoodDelta> = Vec::with_capacity(total);

        for (i, pair) in scores.windows(2).enumerate() {
            let (prev, cur) = (&pair[0], &pair[1]);
            let magnitude = (cur.score - prev.score).abs();
            let direction = self.direction(prev.score, cur.score);

            let position = (i + 1) as f64 / total as f64;
            let phase = if position <= 0.25 {
                SequencePhase::Opening
            } else if position > 0.75 && !labels.open_ended {
                SequencePhase::Conclusion
            } else {
                SequencePhase::Middle
            };

            let last_shift = deltas.iter().rev().find(|d| d.direction != Direction::Stable);
            let delta_type = self.classify(magnitude, direction, cur.score, last_shift);

            let confidence = (prev.confidence * cur.confidence).max(0.0).sqrt();
            let position_weight = if phase == SequencePhase::Conclusion {
                self.config.conclusion_boost
            } else {
                1.0
            };
            let type_weight = if delta_type == DeltaType::Repair {
                self.config.repair_discount
            } else {
                1.0
            };
            let normalized = if self.config.magnitude_scale > 0.0 {
                (magnitude / self.config.magnitude_scale).min(1.0)
            } else {
                1.0
            };
            let significance =
                (normalized * position_weight * confidence * type_weight).clamp(0.0, 1.0);

            let key = format!(
                "delta:{}:{}:{}",
                labels.subject_id.as_deref().unwrap_or("-"),
                prev.id,
                cur.id
            );

            deltas.push(MoodDelta {
                id: Uuid::new_v5(&Uuid::NAMESPACE_OID, key.as_bytes()),
                unit_id: cur.unit_id,
                previous_score_id: prev.id,
                current_score_id: cur.id,
                subject_id: labels.subject_id.clone(),
                conversation_id: labels.conversation_id.clone(),
                delta_sequence: labels.first_sequence + i as u32,
                previous_score: prev.score,
                current_score: cur.score,
                magnitude,
                direction,
                delta_type,
                confidence,
                significance,
                factors: self.factor_shifts(prev, cur),
                temporal_context: TemporalContext {
                    index: i,
                    position,
                    phase,
                    seconds_since_previous: (cur.observed_at - prev.observed_at).num_seconds(),
                },
                previous_at: prev.observed_at,
                occurred_at: cur.observed_at,
            });
        }

        tracing::debug!(deltas = deltas.len(), "Detected mood deltas");
        Ok(deltas)
    }

    /// Greedy runs of consecutive same-direction deltas that each exceed the
    /// pattern magnitude floor. Runs shorter than two are dropped.
    pub fn find_patterns(&self, deltas: &[MoodDelta]) -> Vec<DeltaPattern> {
        let mut patterns = Vec::new();
        let mut run: Vec<&MoodDelta> = Vec::new();

        for delta in deltas {
            let qualifies = delta.magnitude > self.config.pattern_min_magnitude;
            let continues = run.last().map_or(true, |last| last.direction == delta.direction);

            if qualifies && continues {
                run.push(delta);
                continue;
            }

            if let Some(pattern) = DeltaPattern::from_run(&run) {
                patterns.push(pattern);
            }
            run.clear();
            if qualifies {
                run.push(delta);
            }
        }
        if let Some(pattern) = DeltaPattern::from_run(&run) {
            patterns.push(pattern);
        }

        patterns
    }

    /// Deltas whose significance exceeds the turning-point threshold, in
    /// chronological order. Pattern membership is irrelevant.
    pub fn find_turning_points(&self, deltas: &[MoodDelta]) -> Vec<TurningPoint> {
        deltas
            .iter()
            .filter(|d| d.significance > self.config.turning_point_threshold)
            .map(|d| TurningPoint {
                id: Uuid::new_v5(&Uuid::NAMESPACE_OID, format!("turning:{}", d.id).as_bytes()),
                delta_id: Some(d.id),
                unit_id: d.unit_id,
                subject_id: d.subject_id.clone(),
                timestamp: d.occurred_at,
                turning_type: TurningPointType::for_direction(d.direction),
                magnitude: d.magnitude,
                significance: d.significance,
                confidence: d.confidence,
                temporal_context: d.temporal_context.clone(),
            })
            .collect()
    }

    pub fn analyze(
        &self,
        scores: &[MoodScore],
        labels: &SequenceLabels,
    ) -> MoodResult<TrajectoryAnalysis> {
        let deltas = self.detect_labeled(scores, labels)?;
        let patterns = self.find_patterns(&deltas);
        let turning_points = self.find_turning_points(&deltas);
        Ok(TrajectoryAnalysis {
            deltas,
            patterns,
            turning_points,
        })
    }

    fn direction(&self, previous: f64, current: f64) -> Direction {
        let change = current - previous;
        if change.abs() < self.config.stability_band {
            Direction::Stable
        } else if change > 0.0 {
            Direction::Improving
        } else {
            Direction::Declining
        }
    }

    fn classify(
        &self,
        magnitude: f64,
        direction: Direction,
        current: f64,
        last_shift: Option<&MoodDelta>,
    ) -> DeltaType {
        if direction == Direction::Stable {
            return DeltaType::Steady;
        }
        if let Some(shift) = last_shift {
            let reverses = shift.direction != direction;
            let restored = (current - shift.previous_score).abs() < self.config.stability_band;
            if reverses && restored {
                return DeltaType::Repair;
            }
        }
        if magnitude >= self.config.abrupt_threshold {
            DeltaType::Abrupt
        } else {
            DeltaType::Gradual
        }
    }

    /// Factors scored on both sides that moved by at least the stability
    /// band, largest movement first.
    fn factor_shifts(&self, prev: &MoodScore, cur: &MoodScore) -> Vec<FactorShift> {
        let mut shifts: Vec<FactorShift> = cur
            .factors
            .iter()
            .filter_map(|f| {
                let current = f.internal_score?;
                let previous = prev.factor(f.factor_type)?.internal_score?;
                Some(FactorShift {
                    factor_type: f.factor_type,
                    previous,
                    current,
                })
            })
            .filter(|s| s.change().abs() >= self.config.stability_band)
            .collect();
        shifts.sort_by(|a, b| b.change().abs().total_cmp(&a.change().abs()));
        shifts
    }
}

impl Default for DeltaDetector {
    fn default() -> Self {
        Self::new(DeltaConfig::default())
    }
}

/// Deltas by descending significance; equal significance keeps the earlier
/// delta first.
pub fn rank_by_significance(deltas: &[MoodDelta]) -> Vec<&MoodDelta> {
    let mut ranked: Vec<&MoodDelta> = deltas.iter().collect();
    // sort_by is stable, so ties keep chronological order
    ranked.sort_by(|a, b| b.significance.total_cmp(&a.significance));
    ranked
}
