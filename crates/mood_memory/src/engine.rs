//! Engine coordinator.
//!
//! Wires the scorer, delta detector, validation engine and calibration
//! controller to the SQLite store and exposes the consumer and admin APIs.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use mood_calibration::{
    AlwaysSucceeds, ApplyOutcome, CalibrationController, CycleReport, CycleTrigger,
    ValidationEngine,
};
use mood_core::{
    AnalysisMetadata, CalibrationRecord, Clock, ConversationalUnit, DeltaPattern, EngineConfig,
    MemoryStore, MoodDelta, MoodError, MoodScore, SystemClock, TurningPoint, ValidationMethod,
    ValidationResult, WeightProfile, WeightStore,
};
use mood_scoring::{DeltaDetector, MoodScorer, PriorContext, SequenceLabels, TrajectoryAnalysis};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::sqlite::SqliteMoodStore;

/// Everything one `score_unit` call wrote.
#[derive(Debug, Clone, Serialize)]
pub struct ScoringReport {
    pub score: MoodScore,
    pub metadata: AnalysisMetadata,
    pub deltas: Vec<MoodDelta>,
    pub turning_points: Vec<TurningPoint>,
}

/// A participant's stored trajectory over a time window.
#[derive(Debug, Clone, Serialize)]
pub struct Trajectory {
    pub participant_id: String,
    pub since: DateTime<Utc>,
    pub until: DateTime<Utc>,
    pub scores: Vec<MoodScore>,
    pub deltas: Vec<MoodDelta>,
    pub patterns: Vec<DeltaPattern>,
    pub turning_points: Vec<TurningPoint>,
}

/// A stored validation and the calibration cycle it triggered, if any.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationSubmission {
    pub result: ValidationResult,
    pub cycle: Option<CycleReport>,
}

pub struct MoodEngine {
    config: EngineConfig,

    /// Persistence for every engine record
    store: Arc<SqliteMoodStore>,

    /// Source of conversational units
    memory: Arc<dyn MemoryStore>,

    scorer: MoodScorer,
    detector: DeltaDetector,
    validation: Arc<RwLock<ValidationEngine>>,
    calibration: Arc<CalibrationController>,
    clock: Arc<dyn Clock>,

    /// Serializes scoring so delta sequence numbers are allocated once
    scoring_lock: Mutex<()>,
}

impl MoodEngine {
    /// Open the store named by the config and use it as the unit source too.
    pub async fn open(config: EngineConfig) -> Result<Self> {
        let store = Arc::new(SqliteMoodStore::new(&config.storage.db_path).await?);
        let memory: Arc<dyn MemoryStore> = store.clone();
        Self::with_parts(
            config,
            store,
            memory,
            Arc::new(AlwaysSucceeds),
            Arc::new(SystemClock),
        )
        .await
    }

    /// Build an engine over explicit collaborators and restore calibration
    /// state from the store.
    pub async fn with_parts(
        config: EngineConfig,
        store: Arc<SqliteMoodStore>,
        memory: Arc<dyn MemoryStore>,
        outcome: Arc<dyn ApplyOutcome>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let weights = Arc::new(WeightStore::new(WeightProfile::default()));

        let mut validation = ValidationEngine::new(config.validation.clone());
        let stored = store
            .load_validations(config.validation.window_size, config.validation.pending_capacity)
            .await?;
        if !stored.is_empty() {
            tracing::info!("Loaded {} stored validation results", stored.len());
        }
        validation.restore(stored);
        let validation = Arc::new(RwLock::new(validation));

        let history = store.calibration_history().await?;
        if !history.is_empty() {
            tracing::info!("Loaded {} calibration history entries", history.len());
        }
        let calibration = CalibrationController::new(
            config.calibration.clone(),
            weights.clone(),
            validation.clone(),
        )
        .with_outcome(outcome)
        .with_journal(store.clone())
        .with_clock(clock.clone())
        .with_history(history)
        .context("Failed to restore calibration history")?;

        let scorer = MoodScorer::new(weights, config.scoring.clone()).with_clock(clock.clone());
        let detector = DeltaDetector::new(config.delta.clone());

        Ok(Self {
            config,
            store,
            memory,
            scorer,
            detector,
            validation,
            calibration: Arc::new(calibration),
            clock,
            scoring_lock: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<SqliteMoodStore> {
        &self.store
    }

    pub fn calibration(&self) -> &Arc<CalibrationController> {
        &self.calibration
    }

    // ========================================================================
    // Scoring
    // ========================================================================

    /// Score a unit and record, per participant, the delta from their
    /// previous score within the lookback window. One transaction.
    pub async fn score_unit(&self, unit_id: Uuid) -> Result<ScoringReport> {
        let unit = self
            .memory
            .get_unit(unit_id)
            .await?
            .ok_or(MoodError::UnitNotFound(unit_id))?;
        self.store.record_unit(&unit).await?;

        let _guard = self.scoring_lock.lock().await;
        let since = unit.timestamp - Duration::hours(self.config.delta.lookback_hours.max(0));

        // Prior trajectories, excluding earlier scores of this same unit
        let mut histories: Vec<(String, Vec<MoodScore>)> = Vec::new();
        for participant in &unit.participants {
            let history: Vec<MoodScore> = self
                .participant_scores(&participant.id, since, unit.timestamp)
                .await?
                .into_iter()
                .filter(|(u, _)| u.id != unit.id)
                .map(|(_, score)| score)
                .collect();
            histories.push((participant.id.clone(), history));
        }

        let prior = prior_context(&histories);
        let outcome = self.scorer.score(&unit, prior.as_ref());

        let mut deltas = Vec::new();
        for (participant_id, mut history) in histories {
            if history.is_empty() {
                continue;
            }
            history.push(outcome.score.clone());
            let labels = SequenceLabels {
                subject_id: Some(participant_id.clone()),
                conversation_id: unit.conversation_id.clone(),
                first_sequence: 0,
                open_ended: true,
            };
            // Only the delta ending at the new score is new; earlier pairs
            // give it its type and position within the trajectory so far.
            if let Some(mut delta) = self.detector.detect_labeled(&history, &labels)?.pop() {
                delta.delta_sequence = self.store.next_delta_sequence(&participant_id).await?;
                deltas.push(delta);
            }
        }
        let turning_points = self.detector.find_turning_points(&deltas);

        self.store
            .save_scoring(&outcome.score, &outcome.metadata, &deltas, &turning_points)
            .await?;

        tracing::info!(
            unit = %unit.id,
            score = outcome.score.score,
            confidence = outcome.score.confidence,
            deltas = deltas.len(),
            turning_points = turning_points.len(),
            "Unit scored"
        );

        Ok(ScoringReport {
            score: outcome.score,
            metadata: outcome.metadata,
            deltas,
            turning_points,
        })
    }

    /// Run delta, pattern and turning point detection over a participant's
    /// closed window. Stored deltas covered by the window are replaced by the
    /// recomputed ones and keep their sequence numbers.
    pub async fn analyze_trajectory(
        &self,
        participant_id: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<TrajectoryAnalysis> {
        let _guard = self.scoring_lock.lock().await;
        let scored = self.participant_scores(participant_id, since, until).await?;
        let conversations: HashMap<Uuid, Option<String>> = scored
            .iter()
            .map(|(u, _)| (u.id, u.conversation_id.clone()))
            .collect();
        let scores: Vec<MoodScore> = scored.into_iter().map(|(_, score)| score).collect();

        let labels = SequenceLabels {
            subject_id: Some(participant_id.to_string()),
            ..Default::default()
        };
        let mut deltas = self.detector.detect_labeled(&scores, &labels)?;

        let known: HashMap<Uuid, u32> = self
            .store
            .deltas_for_participant(participant_id, since, until)
            .await?
            .into_iter()
            .map(|d| (d.id, d.delta_sequence))
            .collect();
        let mut next_sequence = self.store.next_delta_sequence(participant_id).await?;
        for delta in &mut deltas {
            delta.conversation_id = conversations.get(&delta.unit_id).cloned().flatten();
            delta.delta_sequence = match known.get(&delta.id) {
                Some(sequence) => *sequence,
                None => {
                    let sequence = next_sequence;
                    next_sequence += 1;
                    sequence
                }
            };
        }

        let analysis = TrajectoryAnalysis {
            patterns: self.detector.find_patterns(&deltas),
            turning_points: self.detector.find_turning_points(&deltas),
            deltas,
        };
        self.store
            .save_analysis(&analysis.deltas, &analysis.patterns, &analysis.turning_points)
            .await?;

        tracing::info!(
            participant = participant_id,
            scores = scores.len(),
            deltas = analysis.deltas.len(),
            patterns = analysis.patterns.len(),
            turning_points = analysis.turning_points.len(),
            "Trajectory analyzed"
        );
        Ok(analysis)
    }

    /// A participant's units from the unit source within `[since, until]`,
    /// oldest first, each paired with its current score. Unscored units are
    /// skipped.
    async fn participant_scores(
        &self,
        participant_id: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<(ConversationalUnit, MoodScore)>> {
        let units = self.memory.get_recent_units(participant_id, since).await?;
        let mut scored = Vec::with_capacity(units.len());
        for unit in units.into_iter().filter(|u| u.timestamp <= until) {
            if let Some(score) = self.store.latest_score_for_unit(unit.id).await? {
                scored.push((unit, score));
            }
        }
        Ok(scored)
    }

    // ========================================================================
    // Consumer API
    // ========================================================================

    /// The unit's current score, if it has been scored.
    pub async fn get_current_mood(&self, unit_id: Uuid) -> Result<Option<MoodScore>> {
        self.store.latest_score_for_unit(unit_id).await
    }

    /// Quality metrics and issues recorded with the unit's current score.
    pub async fn get_analysis_metadata(&self, unit_id: Uuid) -> Result<Option<AnalysisMetadata>> {
        match self.store.latest_score_for_unit(unit_id).await? {
            Some(score) => self.store.analysis_metadata(score.id).await,
            None => Ok(None),
        }
    }

    /// Stored scores, deltas, patterns and turning points for a participant.
    pub async fn get_trajectory(
        &self,
        participant_id: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Trajectory> {
        let scores = self
            .participant_scores(participant_id, since, until)
            .await?
            .into_iter()
            .map(|(_, score)| score)
            .collect();
        Ok(Trajectory {
            participant_id: participant_id.to_string(),
            since,
            until,
            scores,
            deltas: self
                .store
                .deltas_for_participant(participant_id, since, until)
                .await?,
            patterns: self
                .store
                .patterns_for_participant(participant_id, since, until)
                .await?,
            turning_points: self
                .store
                .turning_points_for_participant(participant_id, since, until)
                .await?,
        })
    }

    // ========================================================================
    // Validation & calibration
    // ========================================================================

    /// Compare the unit's current score with a human judgment. Runs a
    /// calibration cycle when enough samples are pending.
    pub async fn submit_validation(
        &self,
        unit_id: Uuid,
        human_score: Option<f64>,
        validator_id: &str,
        method: ValidationMethod,
    ) -> Result<ValidationSubmission> {
        let score = self
            .store
            .latest_score_for_unit(unit_id)
            .await?
            .with_context(|| format!("Unit {} has no mood score to validate", unit_id))?;

        let result = self.validation.write().await.validate(
            &score,
            human_score,
            validator_id,
            method,
            self.clock.now(),
        );
        self.store.save_validation(&result).await?;

        let cycle = match self.calibration.due().await {
            Some(trigger) => Some(self.run_calibration_cycle(trigger).await?),
            None => None,
        };

        Ok(ValidationSubmission { result, cycle })
    }

    /// Run one calibration cycle. The controller commits its history and
    /// consumed samples to the store before any weights go live.
    pub async fn run_calibration_cycle(&self, trigger: CycleTrigger) -> Result<CycleReport> {
        Ok(self.calibration.run_cycle(trigger).await)
    }

    // ========================================================================
    // Calibration admin
    // ========================================================================

    /// The live weight profile.
    pub fn weights(&self) -> Arc<WeightProfile> {
        self.calibration.weights().snapshot()
    }

    pub async fn calibration_history(&self) -> Vec<CalibrationRecord> {
        self.calibration.history().await
    }

    pub async fn pending_reviews(&self) -> Vec<CalibrationRecord> {
        self.calibration.pending_reviews().await
    }

    pub async fn force_apply(&self, record_id: Uuid) -> Result<CalibrationRecord> {
        Ok(self.calibration.force_apply(record_id).await?)
    }

    pub async fn force_rollback(&self, record_id: Uuid) -> Result<CalibrationRecord> {
        Ok(self.calibration.force_rollback(record_id).await?)
    }

    pub async fn rollback_last_applied(&self) -> Result<CalibrationRecord> {
        Ok(self.calibration.rollback_last_applied().await?)
    }
}

/// Recent scores across the unit's participants, oldest first, each score
/// once.
fn prior_context(histories: &[(String, Vec<MoodScore>)]) -> Option<PriorContext> {
    let mut by_id: BTreeMap<Uuid, &MoodScore> = BTreeMap::new();
    for (_, history) in histories {
        for s in history {
            by_id.insert(s.id, s);
        }
    }
    if by_id.is_empty() {
        return None;
    }
    let mut recent: Vec<&MoodScore> = by_id.into_values().collect();
    recent.sort_by_key(|s| s.observed_at);
    Some(PriorContext {
        recent_scores: recent.iter().map(|s| s.score).collect(),
        baseline: None,
    })
}
