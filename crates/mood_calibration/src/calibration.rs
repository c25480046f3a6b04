//! Calibration Controller - closed-loop tuning of scoring weights
//!
//! One cycle walks `Idle → Proposing → Validating → Applying` and ends
//! applied, rejected, flagged for review or rolled back:
//!
//! - agreement < auto_reject_threshold: manual review, no weight change
//! - agreement in [reject, approve): bounded gradient step on the weights
//! - agreement ≥ auto_approve_threshold: nothing to do
//!
//! Every transition appends to the history; nothing is ever edited. Cycles and
//! admin overrides are serialized on one lock. Weights go live only after the
//! journal has committed the entries describing them.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use mood_core::weights::{check_weights, normalize};
use mood_core::{
    AdjustmentType, CalibrationConfig, CalibrationRecord, CalibrationStatus, Clock, FactorSample,
    FactorType, MoodError, MoodResult, PerformanceSnapshot, SystemClock, ValidationResult,
    WeightProfile, WeightSet, WeightStore, SCORE_MAX, SCORE_MIN,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::journal::{HistoryJournal, InMemoryJournal};
use crate::outcome::{AlwaysSucceeds, ApplyOutcome};
use crate::validation::ValidationEngine;

/// Component name stamped on weight history entries.
pub const WEIGHTS_COMPONENT: &str = "scoring_weights";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalibrationPhase {
    Idle,
    Proposing,
    Validating,
    Applying,
}

/// What started a cycle. Each trigger has its own minimum window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleTrigger {
    /// Pending results reached `min_samples`
    SampleThreshold,
    /// Scheduled interval elapsed; needs `min_scheduled_samples`
    Interval,
    /// Operator request; runs on any non-empty window
    Manual,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CycleOutcome {
    InsufficientSamples { available: usize, required: usize },
    NoAdjustmentNeeded { agreement: f64 },
    FlaggedForReview { record_id: Uuid },
    Applied { version: u64 },
    Rejected { reason: String },
    RolledBack { reason: String },
}

/// Everything one cycle did, for the caller to persist.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleReport {
    pub cycle_id: Uuid,
    pub trigger: CycleTrigger,
    pub sample_size: usize,
    pub agreement: Option<f64>,
    pub outcome: CycleOutcome,
    /// History entries appended by this cycle, in order
    pub records: Vec<CalibrationRecord>,
    /// Validation results this cycle used up
    pub consumed: Vec<Uuid>,
}

/// Weights that were live before an applied change, most recent last.
#[derive(Debug, Clone)]
struct AppliedEntry {
    version: u64,
    weights: WeightSet,
}

#[derive(Debug)]
struct Ledger {
    phase: CalibrationPhase,
    history: Vec<CalibrationRecord>,
    applied: Vec<AppliedEntry>,
}

impl Ledger {
    fn replay(history: Vec<CalibrationRecord>) -> Self {
        let mut applied = Vec::new();
        for record in &history {
            if record.adjustment_type == AdjustmentType::Rollback {
                applied.pop();
            } else if record.status == CalibrationStatus::Applied {
                applied.push(AppliedEntry {
                    version: record.previous_version,
                    weights: record.previous_value.clone(),
                });
            }
        }
        Self {
            phase: CalibrationPhase::Idle,
            history,
            applied,
        }
    }

    fn pending_review(&self, record_id: Uuid) -> Option<&CalibrationRecord> {
        let review = self.history.iter().find(|r| {
            r.id == record_id
                && r.adjustment_type == AdjustmentType::ManualReview
                && r.status == CalibrationStatus::Proposed
        })?;
        let resolved = self.history.iter().any(|r| {
            r.cycle_id == review.cycle_id
                && r.adjustment_type == AdjustmentType::ManualReview
                && r.status != CalibrationStatus::Proposed
        });
        (!resolved).then_some(review)
    }
}

/// Fields that differ between history entries of one cycle.
struct Draft {
    adjustment_type: AdjustmentType,
    status: CalibrationStatus,
    new_value: WeightSet,
    new_version: Option<u64>,
    reason: Option<String>,
}

enum StackChange {
    Keep,
    Push(AppliedEntry),
    Pop,
}

/// Changes held back until the journal has accepted `records`.
struct Staged {
    records: Vec<CalibrationRecord>,
    consumed: Vec<Uuid>,
    publish: Option<WeightProfile>,
    stack: StackChange,
}

impl Staged {
    fn records(records: Vec<CalibrationRecord>) -> Self {
        Self {
            records,
            consumed: Vec::new(),
            publish: None,
            stack: StackChange::Keep,
        }
    }

    fn consuming(mut self, ids: &[Uuid]) -> Self {
        self.consumed = ids.to_vec();
        self
    }
}

pub struct CalibrationController {
    config: CalibrationConfig,
    weights: Arc<WeightStore>,
    validation: Arc<RwLock<ValidationEngine>>,
    outcome: Arc<dyn ApplyOutcome>,
    journal: Arc<dyn HistoryJournal>,
    clock: Arc<dyn Clock>,
    ledger: RwLock<Ledger>,
    /// Serializes cycles and admin overrides
    cycle_lock: Mutex<()>,
}

impl CalibrationController {
    pub fn new(
        config: CalibrationConfig,
        weights: Arc<WeightStore>,
        validation: Arc<RwLock<ValidationEngine>>,
    ) -> Self {
        Self {
            config,
            weights,
            validation,
            outcome: Arc::new(AlwaysSucceeds),
            journal: Arc::new(InMemoryJournal),
            clock: Arc::new(SystemClock),
            ledger: RwLock::new(Ledger::replay(Vec::new())),
            cycle_lock: Mutex::new(()),
        }
    }

    pub fn with_outcome(mut self, outcome: Arc<dyn ApplyOutcome>) -> Self {
        self.outcome = outcome;
        self
    }

    pub fn with_journal(mut self, journal: Arc<dyn HistoryJournal>) -> Self {
        self.journal = journal;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Resume from stored history: rebuilds the rollback stack and publishes
    /// the last applied profile if it is newer than the live one.
    pub fn with_history(mut self, history: Vec<CalibrationRecord>) -> MoodResult<Self> {
        if let Some(profile) = latest_profile(&history)? {
            if profile.version() > self.weights.version() {
                self.weights.publish(profile)?;
            }
        }
        self.ledger = RwLock::new(Ledger::replay(history));
        Ok(self)
    }

    pub fn config(&self) -> &CalibrationConfig {
        &self.config
    }

    pub fn weights(&self) -> &Arc<WeightStore> {
        &self.weights
    }

    pub async fn phase(&self) -> CalibrationPhase {
        self.ledger.read().await.phase
    }

    pub async fn history(&self) -> Vec<CalibrationRecord> {
        self.ledger.read().await.history.clone()
    }

    /// Review-flagged proposals nobody has resolved yet.
    pub async fn pending_reviews(&self) -> Vec<CalibrationRecord> {
        let ledger = self.ledger.read().await;
        ledger
            .history
            .iter()
            .filter(|r| ledger.pending_review(r.id).is_some())
            .cloned()
            .collect()
    }

    /// The trigger that would fire now from sample count alone.
    pub async fn due(&self) -> Option<CycleTrigger> {
        let pending = self.validation.read().await.pending_count();
        (pending >= self.config.min_samples).then_some(CycleTrigger::SampleThreshold)
    }

    fn required_samples(&self, trigger: CycleTrigger) -> usize {
        let required = match trigger {
            CycleTrigger::SampleThreshold => self.config.min_samples,
            CycleTrigger::Interval => self.config.min_scheduled_samples,
            CycleTrigger::Manual => 1,
        };
        required.max(1)
    }

    /// Run one calibration cycle. Concurrent callers queue on the cycle lock.
    pub async fn run_cycle(&self, trigger: CycleTrigger) -> CycleReport {
        let _guard = self.cycle_lock.lock().await;
        let cycle_id = Uuid::new_v4();
        let window = self.validation.read().await.pending();
        let required = self.required_samples(trigger);

        let mut report = CycleReport {
            cycle_id,
            trigger,
            sample_size: window.len(),
            agreement: None,
            outcome: CycleOutcome::InsufficientSamples {
                available: window.len(),
                required,
            },
            records: Vec::new(),
            consumed: Vec::new(),
        };
        if window.len() < required {
            tracing::debug!(available = window.len(), required, "Calibration skipped, window too small");
            return report;
        }

        self.enter(CalibrationPhase::Proposing).await;
        let current = self.weights.snapshot();
        let mut performance = window_performance(&window);
        report.agreement = Some(performance.agreement);
        tracing::info!(
            cycle = %cycle_id,
            ?trigger,
            samples = window.len(),
            agreement = performance.agreement,
            weights_version = current.version(),
            "Calibration cycle started"
        );

        let (outcome, staged) = self
            .plan_cycle(cycle_id, &current, &mut performance, &window)
            .await;

        match self.commit(staged).await {
            Ok(staged) => {
                if let CycleOutcome::Applied { version } = outcome {
                    tracing::info!(cycle = %cycle_id, version, "Calibration applied");
                }
                report.outcome = outcome;
                report.records = staged.records;
                report.consumed = staged.consumed;
            }
            Err(err) => {
                // Nothing was applied or consumed; the next cycle retries
                let reason = err.to_string();
                tracing::error!(cycle = %cycle_id, %reason, "Calibration cycle could not be persisted");
                report.records = self
                    .record_failure(cycle_id, &current, &performance, current.weights().clone(), &reason)
                    .await
                    .into_iter()
                    .collect();
                report.outcome = CycleOutcome::RolledBack { reason };
            }
        }

        self.enter(CalibrationPhase::Idle).await;
        report
    }

    /// Decide what a cycle does over `window`. Nothing is published here.
    async fn plan_cycle(
        &self,
        cycle_id: Uuid,
        current: &WeightProfile,
        performance: &mut PerformanceSnapshot,
        window: &[ValidationResult],
    ) -> (CycleOutcome, Staged) {
        let ids: Vec<Uuid> = window.iter().map(|r| r.id).collect();

        if performance.agreement >= self.config.auto_approve_threshold {
            let outcome = CycleOutcome::NoAdjustmentNeeded {
                agreement: performance.agreement,
            };
            return (outcome, Staged::records(Vec::new()).consuming(&ids));
        }

        let proposed = propose_weights(current.weights(), window, &self.config);

        if performance.agreement < self.config.auto_reject_threshold {
            let record = self.draft(
                cycle_id,
                current,
                performance,
                Draft {
                    adjustment_type: AdjustmentType::ManualReview,
                    status: CalibrationStatus::Proposed,
                    new_value: proposed,
                    new_version: None,
                    reason: Some(format!(
                        "agreement {:.3} below review threshold {:.2}",
                        performance.agreement, self.config.auto_reject_threshold
                    )),
                },
            );
            tracing::warn!(cycle = %cycle_id, record = %record.id, "Calibration flagged for manual review");
            let outcome = CycleOutcome::FlaggedForReview { record_id: record.id };
            return (outcome, Staged::records(vec![record]).consuming(&ids));
        }

        let proposal_record = self.draft(
            cycle_id,
            current,
            performance,
            Draft {
                adjustment_type: AdjustmentType::WeightAdjustment,
                status: CalibrationStatus::Proposed,
                new_value: proposed.clone(),
                new_version: None,
                reason: None,
            },
        );

        self.enter(CalibrationPhase::Validating).await;
        match check_proposal(current.weights(), &proposed, window, self.config.epsilon) {
            Ok(backtested) => performance.backtested_agreement = Some(backtested),
            Err(err) => {
                let reason = rejection_reason(err);
                tracing::warn!(cycle = %cycle_id, %reason, "Calibration proposal rejected");
                let record = self.draft(
                    cycle_id,
                    current,
                    performance,
                    Draft {
                        adjustment_type: AdjustmentType::WeightAdjustment,
                        status: CalibrationStatus::Rejected,
                        new_value: proposed,
                        new_version: None,
                        reason: Some(reason.clone()),
                    },
                );
                let staged = Staged::records(vec![proposal_record, record]).consuming(&ids);
                return (CycleOutcome::Rejected { reason }, staged);
            }
        }

        self.enter(CalibrationPhase::Applying).await;
        match self.attempt(cycle_id, current, proposed.clone()).await {
            Ok(next) => {
                let version = next.version();
                let record = self.draft(
                    cycle_id,
                    current,
                    performance,
                    Draft {
                        adjustment_type: AdjustmentType::WeightAdjustment,
                        status: CalibrationStatus::Applied,
                        new_value: proposed,
                        new_version: Some(version),
                        reason: None,
                    },
                );
                let staged = Staged {
                    publish: Some(next),
                    stack: StackChange::Push(AppliedEntry {
                        version: current.version(),
                        weights: current.weights().clone(),
                    }),
                    ..Staged::records(vec![proposal_record, record]).consuming(&ids)
                };
                (CycleOutcome::Applied { version }, staged)
            }
            Err(err) => {
                // Samples stay pending so the next cycle retries
                let reason = err.to_string();
                tracing::warn!(cycle = %cycle_id, %reason, "Calibration application failed, rolled back");
                let record = self.draft(
                    cycle_id,
                    current,
                    performance,
                    Draft {
                        adjustment_type: AdjustmentType::WeightAdjustment,
                        status: CalibrationStatus::RolledBack,
                        new_value: proposed,
                        new_version: None,
                        reason: Some(reason.clone()),
                    },
                );
                let staged = Staged::records(vec![proposal_record, record]);
                (CycleOutcome::RolledBack { reason }, staged)
            }
        }
    }

    /// Gate the proposal through the outcome source. Returns the successor
    /// profile once the attempt has completed in time; it is not published.
    async fn attempt(
        &self,
        cycle_id: Uuid,
        current: &WeightProfile,
        proposed: WeightSet,
    ) -> MoodResult<WeightProfile> {
        let next = current
            .successor(proposed)
            .map_err(|e| MoodError::CalibrationApplicationFailure {
                reason: e.to_string(),
            })?;
        let timeout = Duration::from_millis(self.config.apply_timeout_ms);

        match tokio::time::timeout(timeout, self.outcome.attempt(cycle_id, &next)).await {
            Ok(true) => Ok(next),
            Ok(false) => Err(MoodError::CalibrationApplicationFailure {
                reason: "weight update did not complete".to_string(),
            }),
            Err(_) => Err(MoodError::CalibrationApplicationFailure {
                reason: format!("weight update timed out after {}ms", self.config.apply_timeout_ms),
            }),
        }
    }

    // ========================================================================
    // Admin overrides
    // ========================================================================

    /// Apply the weights proposed by a review-flagged cycle.
    pub async fn force_apply(&self, record_id: Uuid) -> MoodResult<CalibrationRecord> {
        let _guard = self.cycle_lock.lock().await;
        let review = self
            .ledger
            .read()
            .await
            .pending_review(record_id)
            .cloned()
            .ok_or(MoodError::ReviewNotPending(record_id))?;

        let current = self.weights.snapshot();
        let next = current.successor(review.new_value.clone())?;
        let version = next.version();
        let record = self.draft(
            review.cycle_id,
            &current,
            &review.performance,
            Draft {
                adjustment_type: AdjustmentType::ManualReview,
                status: CalibrationStatus::Applied,
                new_value: review.new_value.clone(),
                new_version: Some(version),
                reason: Some("approved by reviewer".to_string()),
            },
        );
        let staged = Staged {
            publish: Some(next),
            stack: StackChange::Push(AppliedEntry {
                version: current.version(),
                weights: current.weights().clone(),
            }),
            ..Staged::records(vec![record.clone()])
        };
        if let Err(err) = self.commit(staged).await {
            self.record_failure(review.cycle_id, &current, &review.performance, review.new_value, &err.to_string())
                .await;
            return Err(err);
        }

        tracing::info!(review = %record_id, version, "Review-flagged calibration force-applied");
        Ok(record)
    }

    /// Close a review-flagged cycle without touching the weights.
    pub async fn force_rollback(&self, record_id: Uuid) -> MoodResult<CalibrationRecord> {
        let _guard = self.cycle_lock.lock().await;
        let review = self
            .ledger
            .read()
            .await
            .pending_review(record_id)
            .cloned()
            .ok_or(MoodError::ReviewNotPending(record_id))?;

        let current = self.weights.snapshot();
        let record = self.draft(
            review.cycle_id,
            &current,
            &review.performance,
            Draft {
                adjustment_type: AdjustmentType::ManualReview,
                status: CalibrationStatus::RolledBack,
                new_value: current.weights().clone(),
                new_version: None,
                reason: Some("dismissed by reviewer".to_string()),
            },
        );
        self.commit(Staged::records(vec![record.clone()])).await?;

        tracing::info!(review = %record_id, "Review-flagged calibration dismissed");
        Ok(record)
    }

    /// Restore the weights that were live before the most recent applied
    /// change. Published as a new version; history only grows.
    pub async fn rollback_last_applied(&self) -> MoodResult<CalibrationRecord> {
        let _guard = self.cycle_lock.lock().await;
        let restore = self
            .ledger
            .read()
            .await
            .applied
            .last()
            .cloned()
            .ok_or_else(|| MoodError::CalibrationRejected {
                reason: "no applied calibration to roll back".to_string(),
            })?;

        let current = self.weights.snapshot();
        let next = current.successor(restore.weights.clone())?;
        let version = next.version();
        let cycle_id = Uuid::new_v4();
        let record = self.draft(
            cycle_id,
            &current,
            &PerformanceSnapshot::default(),
            Draft {
                adjustment_type: AdjustmentType::Rollback,
                status: CalibrationStatus::RolledBack,
                new_value: restore.weights.clone(),
                new_version: Some(version),
                reason: Some(format!("restored weights of version {}", restore.version)),
            },
        );
        let staged = Staged {
            publish: Some(next),
            stack: StackChange::Pop,
            ..Staged::records(vec![record.clone()])
        };
        if let Err(err) = self.commit(staged).await {
            self.record_failure(cycle_id, &current, &PerformanceSnapshot::default(), restore.weights, &err.to_string())
                .await;
            return Err(err);
        }

        tracing::warn!(from = current.version(), to = version, "Calibration rolled back");
        Ok(record)
    }

    // ========================================================================
    // Bookkeeping
    // ========================================================================

    async fn enter(&self, phase: CalibrationPhase) {
        self.ledger.write().await.phase = phase;
        tracing::debug!(?phase, "Calibration phase");
    }

    /// Hand `staged` to the journal; on success publish its weights, extend
    /// the ledger and consume its samples. On failure nothing changes.
    async fn commit(&self, staged: Staged) -> MoodResult<Staged> {
        self.journal.commit(&staged.records, &staged.consumed).await?;

        let mut ledger = self.ledger.write().await;
        if let Some(next) = &staged.publish {
            self.weights.publish(next.clone())?;
        }
        match &staged.stack {
            StackChange::Keep => {}
            StackChange::Push(entry) => ledger.applied.push(entry.clone()),
            StackChange::Pop => {
                ledger.applied.pop();
            }
        }
        ledger.history.extend(staged.records.iter().cloned());
        drop(ledger);

        if !staged.consumed.is_empty() {
            self.validation.write().await.mark_consumed(&staged.consumed);
        }
        Ok(staged)
    }

    /// Best-effort `RolledBack` entry for a change whose history could not
    /// be committed. Returns it if the journal accepted it.
    async fn record_failure(
        &self,
        cycle_id: Uuid,
        current: &WeightProfile,
        performance: &PerformanceSnapshot,
        withheld: WeightSet,
        reason: &str,
    ) -> Option<CalibrationRecord> {
        let record = self.draft(
            cycle_id,
            current,
            performance,
            Draft {
                adjustment_type: AdjustmentType::WeightAdjustment,
                status: CalibrationStatus::RolledBack,
                new_value: withheld,
                new_version: None,
                reason: Some(reason.to_string()),
            },
        );
        match self.commit(Staged::records(vec![record])).await {
            Ok(mut staged) => staged.records.pop(),
            Err(err) => {
                tracing::error!(cycle = %cycle_id, error = %err, "Rollback entry could not be persisted either");
                None
            }
        }
    }

    fn draft(
        &self,
        cycle_id: Uuid,
        previous: &WeightProfile,
        performance: &PerformanceSnapshot,
        draft: Draft,
    ) -> CalibrationRecord {
        let now: DateTime<Utc> = self.clock.now();
        let applied_at = draft.new_version.map(|_| now);
        CalibrationRecord {
            id: Uuid::new_v4(),
            cycle_id,
            adjustment_type: draft.adjustment_type,
            target_component: WEIGHTS_COMPONENT.to_string(),
            previous_value: previous.weights().clone(),
            new_value: draft.new_value,
            previous_version: previous.version(),
            new_version: draft.new_version,
            performance: performance.clone(),
            status: draft.status,
            reason: draft.reason,
            recorded_at: now,
            applied_at,
        }
    }
}

fn rejection_reason(err: MoodError) -> String {
    match err {
        MoodError::CalibrationRejected { reason } => reason,
        other => other.to_string(),
    }
}

/// Profile in effect after replaying `history`, if any entry changed weights.
fn latest_profile(history: &[CalibrationRecord]) -> MoodResult<Option<WeightProfile>> {
    let last = history.iter().rev().find(|r| {
        r.new_version.is_some()
            && (r.status == CalibrationStatus::Applied
                || r.adjustment_type == AdjustmentType::Rollback)
    });
    match last {
        Some(r) => {
            let version = r.new_version.unwrap_or(r.previous_version);
            Ok(Some(WeightProfile::new(version, r.new_value.clone())?))
        }
        None => Ok(None),
    }
}

// ============================================================================
// Proposal math
// ============================================================================

fn window_performance(window: &[ValidationResult]) -> PerformanceSnapshot {
    let pairs: Vec<(f64, f64)> = window
        .iter()
        .filter_map(|r| r.human_score.map(|h| (r.algorithm_score, h)))
        .collect();
    if pairs.is_empty() {
        return PerformanceSnapshot::default();
    }
    let n = pairs.len() as f64;
    let mean_absolute_error = pairs.iter().map(|(a, h)| (a - h).abs()).sum::<f64>() / n;
    let agreement = pairs.iter().map(|(a, h)| agreement_of(*a, *h)).sum::<f64>() / n;
    PerformanceSnapshot {
        agreement,
        backtested_agreement: None,
        mean_absolute_error,
        sample_size: pairs.len(),
    }
}

fn agreement_of(algorithm: f64, human: f64) -> f64 {
    1.0 - ((algorithm - human).abs() / (SCORE_MAX - SCORE_MIN)).min(1.0)
}

/// Score a result would have received under `weights`, from its stored
/// factor readings. Results without readings keep their recorded score.
pub fn replay_score(weights: &WeightSet, samples: &[FactorSample], fallback: f64) -> f64 {
    let mut total = 0.0;
    let mut weight_sum = 0.0;
    for s in samples {
        let w = weights.get(&s.factor_type).copied().unwrap_or(0.0);
        total += s.internal_score * w;
        weight_sum += w;
    }
    if weight_sum <= 0.0 {
        return fallback;
    }
    (total / weight_sum).clamp(SCORE_MIN, SCORE_MAX)
}

/// Mean agreement over the window if every result were rescored with `weights`.
pub fn backtest(weights: &WeightSet, window: &[ValidationResult]) -> f64 {
    let agreements: Vec<f64> = window
        .iter()
        .filter_map(|r| {
            let human = r.human_score?;
            let replayed = replay_score(weights, &r.factor_samples, r.algorithm_score);
            Some(agreement_of(replayed, human))
        })
        .collect();
    if agreements.is_empty() {
        return 0.0;
    }
    agreements.iter().sum::<f64>() / agreements.len() as f64
}

/// One bounded gradient step. Each factor's step is proportional to how much
/// worse (or better) its readings track the human scores than the average
/// factor; the largest step is capped at `max_step`. Steps are centred so
/// the set keeps its sum. A step that leaves [0, 1] is returned as is so the
/// safety check can reject it.
pub fn propose_weights(
    current: &WeightSet,
    window: &[ValidationResult],
    config: &CalibrationConfig,
) -> WeightSet {
    let mut totals: BTreeMap<FactorType, (f64, usize)> = BTreeMap::new();
    for result in window {
        let Some(human) = result.human_score else {
            continue;
        };
        for sample in &result.factor_samples {
            let entry = totals.entry(sample.factor_type).or_insert((0.0, 0));
            entry.0 += (sample.internal_score - human).abs();
            entry.1 += 1;
        }
    }
    if totals.is_empty() {
        return current.clone();
    }

    let errors: BTreeMap<FactorType, f64> = totals
        .into_iter()
        .map(|(t, (sum, n))| (t, sum / n as f64))
        .collect();
    let mean_error = errors.values().sum::<f64>() / errors.len() as f64;

    let mut steps: BTreeMap<FactorType, f64> = errors
        .iter()
        .map(|(t, e)| (*t, -config.learning_rate * (e - mean_error)))
        .collect();
    let largest = steps.values().fold(0.0f64, |m, s| m.max(s.abs()));
    if largest > config.max_step && largest > 0.0 {
        let scale = config.max_step / largest;
        for s in steps.values_mut() {
            *s *= scale;
        }
    }

    let mut proposed = current.clone();
    for (t, step) in steps {
        *proposed.entry(t).or_insert(0.0) += step;
    }
    if proposed.values().all(|w| (0.0..=1.0).contains(w)) {
        normalize(&mut proposed);
    }
    proposed
}

/// Safety gate. Returns the back-tested agreement of an acceptable proposal.
pub fn check_proposal(
    current: &WeightSet,
    proposed: &WeightSet,
    window: &[ValidationResult],
    epsilon: f64,
) -> MoodResult<f64> {
    if let Some((t, w)) = proposed
        .iter()
        .find(|(_, w)| !w.is_finite() || **w < 0.0 || **w > 1.0)
    {
        return Err(MoodError::CalibrationRejected {
            reason: format!("weight for {} would leave [0, 1]: {:.4}", t, w),
        });
    }
    check_weights(proposed).map_err(|e| MoodError::CalibrationRejected {
        reason: e.to_string(),
    })?;

    let before = backtest(current, window);
    let after = backtest(proposed, window);
    if (after - before).abs() < epsilon {
        return Err(MoodError::CalibrationRejected {
            reason: format!(
                "back-tested agreement change {:.6} below epsilon {}",
                after - before,
                epsilon
            ),
        });
    }
    if after < before {
        return Err(MoodError::CalibrationRejected {
            reason: format!(
                "proposal lowers back-tested agreement from {:.4} to {:.4}",
                before, after
            ),
        });
    }
    Ok(after)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::SwitchableJournal;
    use crate::outcome::{ScriptedOutcomes, ScriptedStep};
    use mood_core::{MoodFactor, MoodScore, ValidationConfig, ValidationMethod};

    fn score_with(algorithm: f64, factors: &[(FactorType, f64)]) -> MoodScore {
        MoodScore {
            id: Uuid::new_v4(),
            unit_id: Uuid::new_v4(),
            score: algorithm,
            confidence: 0.8,
            descriptors: vec![],
            algorithm_version: "test".into(),
            weights_version: 1,
            processing_time_ms: 0,
            observed_at: Utc::now(),
            calculated_at: Utc::now(),
            factors: factors
                .iter()
                .map(|(t, s)| MoodFactor {
                    factor_type: *t,
                    weight: 0.25,
                    description: String::new(),
                    evidence: vec!["marker".into()],
                    internal_score: Some(*s),
                })
                .collect(),
        }
    }

    fn factors(sentiment: f64, others: f64) -> Vec<(FactorType, f64)> {
        vec![
            (FactorType::Sentiment, sentiment),
            (FactorType::PsychologicalIndicator, others),
            (FactorType::RelationshipDynamics, others),
            (FactorType::ConversationalPosition, others),
        ]
    }

    async fn seed(
        validation: &Arc<RwLock<ValidationEngine>>,
        n: usize,
        algorithm: f64,
        human: f64,
        readings: &[(FactorType, f64)],
    ) {
        let mut engine = validation.write().await;
        for _ in 0..n {
            engine.validate(
                &score_with(algorithm, readings),
                Some(human),
                "expert-1",
                ValidationMethod::ExpertReview,
                Utc::now(),
            );
        }
    }

    fn controller() -> (CalibrationController, Arc<RwLock<ValidationEngine>>) {
        let validation = Arc::new(RwLock::new(ValidationEngine::new(ValidationConfig::default())));
        let controller = CalibrationController::new(
            CalibrationConfig::default(),
            Arc::new(WeightStore::default()),
            validation.clone(),
        );
        (controller, validation)
    }

    fn statuses(records: &[CalibrationRecord]) -> Vec<CalibrationStatus> {
        records.iter().map(|r| r.status).collect()
    }

    #[tokio::test]
    async fn test_moderate_agreement_applies_bounded_adjustment() {
        let (controller, validation) = controller();
        // 0.35·2.0 + 0.65·7.3846 ≈ 5.5 against a human 1.0: discrepancy 0.45
        seed(&validation, 20, 5.5, 1.0, &factors(2.0, 7.3846)).await;

        let before = controller.weights().snapshot();
        let report = controller.run_cycle(CycleTrigger::SampleThreshold).await;

        assert!((report.agreement.unwrap() - 0.55).abs() < 1e-9);
        assert_eq!(report.outcome, CycleOutcome::Applied { version: 2 });
        assert_eq!(
            statuses(&report.records),
            vec![CalibrationStatus::Proposed, CalibrationStatus::Applied]
        );
        assert!(report.records.iter().all(|r| r.cycle_id == report.cycle_id));

        let after = controller.weights().snapshot();
        assert_eq!(after.version(), 2);
        let sum: f64 = after.weights().values().sum();
        assert!((sum - 1.0).abs() < 1e-9);
        for (t, w) in after.weights() {
            assert!((w - before.weight(*t)).abs() <= 0.05 + 1e-9);
        }
        // Sentiment tracked the human best, so it gains weight
        assert!(after.weight(FactorType::Sentiment) > before.weight(FactorType::Sentiment));

        let applied = &report.records[1];
        assert!(applied.performance.backtested_agreement.unwrap() > 0.55);
        assert_eq!(validation.read().await.pending_count(), 0);
        assert_eq!(controller.phase().await, CalibrationPhase::Idle);
    }

    #[tokio::test]
    async fn test_low_agreement_flags_for_review() {
        let (controller, validation) = controller();
        seed(&validation, 20, 7.0, 1.0, &factors(7.0, 7.0)).await;

        let report = controller.run_cycle(CycleTrigger::SampleThreshold).await;

        assert!((report.agreement.unwrap() - 0.40).abs() < 1e-9);
        assert_eq!(report.records.len(), 1);
        let record = &report.records[0];
        assert_eq!(record.status, CalibrationStatus::Proposed);
        assert_eq!(record.adjustment_type, AdjustmentType::ManualReview);
        assert!(record.new_version.is_none());
        assert_eq!(
            report.outcome,
            CycleOutcome::FlaggedForReview { record_id: record.id }
        );
        assert_eq!(controller.weights().version(), 1);
        assert_eq!(controller.pending_reviews().await.len(), 1);
    }

    #[tokio::test]
    async fn test_high_agreement_needs_nothing() {
        let (controller, validation) = controller();
        seed(&validation, 20, 6.0, 5.0, &factors(6.0, 6.0)).await;

        let report = controller.run_cycle(CycleTrigger::SampleThreshold).await;
        assert!(matches!(report.outcome, CycleOutcome::NoAdjustmentNeeded { .. }));
        assert!(report.records.is_empty());
        assert_eq!(report.consumed.len(), 20);
        assert!(controller.history().await.is_empty());
    }

    #[tokio::test]
    async fn test_window_too_small() {
        let (controller, validation) = controller();
        seed(&validation, 5, 5.5, 1.0, &factors(2.0, 7.3846)).await;

        assert!(controller.due().await.is_none());
        let report = controller.run_cycle(CycleTrigger::SampleThreshold).await;
        assert_eq!(
            report.outcome,
            CycleOutcome::InsufficientSamples {
                available: 5,
                required: 20
            }
        );
        assert_eq!(validation.read().await.pending_count(), 5);

        // The interval trigger accepts a smaller window
        let report = controller.run_cycle(CycleTrigger::Interval).await;
        assert!(matches!(report.outcome, CycleOutcome::Applied { .. }));
    }

    #[tokio::test]
    async fn test_no_op_proposal_is_rejected() {
        let (controller, validation) = controller();
        // Every factor errs equally, so there is nothing to shift
        seed(&validation, 20, 4.0, 0.0, &factors(4.0, 4.0)).await;

        let report = controller.run_cycle(CycleTrigger::SampleThreshold).await;
        assert_eq!(
            statuses(&report.records),
            vec![CalibrationStatus::Proposed, CalibrationStatus::Rejected]
        );
        match &report.outcome {
            CycleOutcome::Rejected { reason } => assert!(reason.contains("epsilon")),
            other => panic!("expected rejection, got {:?}", other),
        }
        assert_eq!(controller.weights().version(), 1);
    }

    #[tokio::test]
    async fn test_out_of_bounds_proposal_is_rejected() {
        let validation = Arc::new(RwLock::new(ValidationEngine::default()));
        let weights = WeightProfile::new(
            7,
            BTreeMap::from([
                (FactorType::Sentiment, 0.01),
                (FactorType::PsychologicalIndicator, 0.33),
                (FactorType::RelationshipDynamics, 0.33),
                (FactorType::ConversationalPosition, 0.33),
            ]),
        )
        .unwrap();
        let controller = CalibrationController::new(
            CalibrationConfig::default(),
            Arc::new(WeightStore::new(weights)),
            validation.clone(),
        );
        seed(&validation, 20, 5.0, 1.0, &factors(10.0, 2.0)).await;

        let report = controller.run_cycle(CycleTrigger::SampleThreshold).await;
        match &report.outcome {
            CycleOutcome::Rejected { reason } => assert!(reason.contains("[0, 1]")),
            other => panic!("expected rejection, got {:?}", other),
        }
        assert_eq!(controller.weights().version(), 7);
    }

    #[tokio::test]
    async fn test_failed_application_rolls_back_and_retries() {
        let (controller, validation) = controller();
        let controller = controller.with_outcome(Arc::new(ScriptedOutcomes::from_bools([false])));
        seed(&validation, 20, 5.5, 1.0, &factors(2.0, 7.3846)).await;

        let first = controller.run_cycle(CycleTrigger::SampleThreshold).await;
        assert!(matches!(first.outcome, CycleOutcome::RolledBack { .. }));
        assert_eq!(
            statuses(&first.records),
            vec![CalibrationStatus::Proposed, CalibrationStatus::RolledBack]
        );
        assert_eq!(controller.weights().version(), 1);
        assert!(first.consumed.is_empty());
        assert_eq!(validation.read().await.pending_count(), 20);

        let second = controller.run_cycle(CycleTrigger::SampleThreshold).await;
        assert_eq!(second.outcome, CycleOutcome::Applied { version: 2 });
        assert_eq!(controller.history().await.len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_application_timeout_rolls_back() {
        let (controller, validation) = controller();
        let controller = controller.with_outcome(Arc::new(ScriptedOutcomes::new([
            ScriptedStep::Stall(Duration::from_secs(60)),
        ])));
        seed(&validation, 20, 5.5, 1.0, &factors(2.0, 7.3846)).await;

        let report = controller.run_cycle(CycleTrigger::SampleThreshold).await;
        match &report.outcome {
            CycleOutcome::RolledBack { reason } => assert!(reason.contains("timed out")),
            other => panic!("expected rollback, got {:?}", other),
        }
        assert_eq!(controller.weights().version(), 1);
    }

    #[tokio::test]
    async fn test_force_apply_and_dismiss_reviews() {
        let (controller, validation) = controller();
        // 0.35·2 + 0.65·9 = 6.55 vs human 1.0: agreement 0.445
        seed(&validation, 20, 6.55, 1.0, &factors(2.0, 9.0)).await;
        let report = controller.run_cycle(CycleTrigger::SampleThreshold).await;
        let CycleOutcome::FlaggedForReview { record_id } = report.outcome else {
            panic!("expected review flag");
        };

        let applied = controller.force_apply(record_id).await.unwrap();
        assert_eq!(applied.status, CalibrationStatus::Applied);
        assert_eq!(applied.cycle_id, report.cycle_id);
        assert_eq!(controller.weights().version(), 2);
        assert!(controller.weights().snapshot().weight(FactorType::Sentiment) > 0.35);

        // Already resolved
        assert!(matches!(
            controller.force_apply(record_id).await,
            Err(MoodError::ReviewNotPending(_))
        ));

        seed(&validation, 20, 7.0, 1.0, &factors(7.0, 7.0)).await;
        let report = controller.run_cycle(CycleTrigger::SampleThreshold).await;
        let CycleOutcome::FlaggedForReview { record_id } = report.outcome else {
            panic!("expected review flag");
        };
        let dismissed = controller.force_rollback(record_id).await.unwrap();
        assert_eq!(dismissed.status, CalibrationStatus::RolledBack);
        assert_eq!(controller.weights().version(), 2);
        assert!(controller.pending_reviews().await.is_empty());
    }

    #[tokio::test]
    async fn test_rollback_restores_previous_weights() {
        let (controller, validation) = controller();
        seed(&validation, 20, 5.5, 1.0, &factors(2.0, 7.3846)).await;
        controller.run_cycle(CycleTrigger::SampleThreshold).await;
        assert_eq!(controller.weights().version(), 2);

        let record = controller.rollback_last_applied().await.unwrap();
        assert_eq!(record.adjustment_type, AdjustmentType::Rollback);
        assert_eq!(record.new_version, Some(3));
        let live = controller.weights().snapshot();
        assert_eq!(live.version(), 3);
        assert_eq!(live.weights(), WeightProfile::default().weights());

        assert!(matches!(
            controller.rollback_last_applied().await,
            Err(MoodError::CalibrationRejected { .. })
        ));
        // 2 entries from the cycle plus the rollback
        assert_eq!(controller.history().await.len(), 3);
    }

    #[tokio::test]
    async fn test_concurrent_cycles_are_serialized() {
        let (controller, validation) = controller();
        seed(&validation, 20, 5.5, 1.0, &factors(2.0, 7.3846)).await;
        let controller = Arc::new(controller);

        let (a, b) = tokio::join!(
            controller.run_cycle(CycleTrigger::SampleThreshold),
            controller.run_cycle(CycleTrigger::SampleThreshold)
        );
        let applied = [&a, &b]
            .iter()
            .filter(|r| matches!(r.outcome, CycleOutcome::Applied { .. }))
            .count();
        assert_eq!(applied, 1);
        assert_eq!(controller.weights().version(), 2);
    }

    #[tokio::test]
    async fn test_history_restores_live_weights_and_rollback_stack() {
        let (controller, validation) = controller();
        seed(&validation, 20, 5.5, 1.0, &factors(2.0, 7.3846)).await;
        controller.run_cycle(CycleTrigger::SampleThreshold).await;
        let history = controller.history().await;

        let resumed = CalibrationController::new(
            CalibrationConfig::default(),
            Arc::new(WeightStore::default()),
            Arc::new(RwLock::new(ValidationEngine::default())),
        )
        .with_history(history)
        .unwrap();
        assert_eq!(resumed.weights().version(), 2);

        resumed.rollback_last_applied().await.unwrap();
        assert_eq!(
            resumed.weights().snapshot().weights(),
            WeightProfile::default().weights()
        );
    }

    #[tokio::test]
    async fn test_uncommitted_cycle_publishes_nothing() {
        let (controller, validation) = controller();
        let journal = Arc::new(SwitchableJournal::default());
        let controller = controller.with_journal(journal.clone());
        seed(&validation, 20, 5.5, 1.0, &factors(2.0, 7.3846)).await;

        journal.set_failing(true);
        let report = controller.run_cycle(CycleTrigger::SampleThreshold).await;
        match &report.outcome {
            CycleOutcome::RolledBack { reason } => assert!(reason.contains("not persisted")),
            other => panic!("expected rollback, got {:?}", other),
        }
        assert!(report.records.is_empty());
        assert!(report.consumed.is_empty());
        assert_eq!(controller.weights().version(), 1);
        assert!(controller.history().await.is_empty());
        assert_eq!(validation.read().await.pending_count(), 20);
        assert_eq!(controller.phase().await, CalibrationPhase::Idle);

        journal.set_failing(false);
        let report = controller.run_cycle(CycleTrigger::SampleThreshold).await;
        assert_eq!(report.outcome, CycleOutcome::Applied { version: 2 });
        assert_eq!(controller.history().await.len(), 2);
    }

    #[tokio::test]
    async fn test_uncommitted_admin_overrides_leave_weights_alone() {
        let (controller, validation) = controller();
        let journal = Arc::new(SwitchableJournal::default());
        let controller = controller.with_journal(journal.clone());
        seed(&validation, 20, 6.55, 1.0, &factors(2.0, 9.0)).await;
        let report = controller.run_cycle(CycleTrigger::SampleThreshold).await;
        let CycleOutcome::FlaggedForReview { record_id } = report.outcome else {
            panic!("expected review flag");
        };

        journal.set_failing(true);
        assert!(matches!(
            controller.force_apply(record_id).await,
            Err(MoodError::HistoryPersistence(_))
        ));
        assert_eq!(controller.weights().version(), 1);
        assert_eq!(controller.history().await.len(), 1);
        assert_eq!(controller.pending_reviews().await.len(), 1);
        assert!(controller.rollback_last_applied().await.is_err());

        journal.set_failing(false);
        let applied = controller.force_apply(record_id).await.unwrap();
        assert_eq!(applied.new_version, Some(2));
        assert_eq!(controller.weights().version(), 2);

        journal.set_failing(true);
        assert!(matches!(
            controller.rollback_last_applied().await,
            Err(MoodError::HistoryPersistence(_))
        ));
        assert_eq!(controller.weights().version(), 2);

        journal.set_failing(false);
        let rollback = controller.rollback_last_applied().await.unwrap();
        assert_eq!(rollback.new_version, Some(3));
        assert_eq!(
            controller.weights().snapshot().weights(),
            WeightProfile::default().weights()
        );
    }

    #[tokio::test]
    async fn test_failed_commit_is_recorded_when_journal_recovers() {
        let (controller, validation) = controller();
        let journal = Arc::new(FailOnce::default());
        let controller = controller.with_journal(journal);
        seed(&validation, 20, 5.5, 1.0, &factors(2.0, 7.3846)).await;

        let report = controller.run_cycle(CycleTrigger::SampleThreshold).await;
        assert!(matches!(report.outcome, CycleOutcome::RolledBack { .. }));
        assert_eq!(statuses(&report.records), vec![CalibrationStatus::RolledBack]);
        assert!(report.records[0].new_version.is_none());
        assert_eq!(controller.weights().version(), 1);
        assert_eq!(controller.history().await.len(), 1);
        assert_eq!(validation.read().await.pending_count(), 20);
    }

    /// Fails the first commit only.
    #[derive(Default)]
    struct FailOnce {
        failed: std::sync::atomic::AtomicBool,
    }

    #[async_trait::async_trait]
    impl HistoryJournal for FailOnce {
        async fn commit(&self, _records: &[CalibrationRecord], _consumed: &[Uuid]) -> MoodResult<()> {
            if self.failed.swap(true, std::sync::atomic::Ordering::SeqCst) {
                Ok(())
            } else {
                Err(MoodError::HistoryPersistence("disk full".to_string()))
            }
        }
    }

    #[test]
    fn test_replay_score_renormalizes_over_present_factors() {
        let weights = mood_core::weights::default_weights();
        let samples = vec![
            FactorSample {
                factor_type: FactorType::Sentiment,
                internal_score: 8.0,
            },
            FactorSample {
                factor_type: FactorType::PsychologicalIndicator,
                internal_score: 2.0,
            },
        ];
        // (0.35·8 + 0.25·2) / 0.6 = 5.5
        assert!((replay_score(&weights, &samples, 0.0) - 5.5).abs() < 1e-9);
        assert_eq!(replay_score(&weights, &[], 4.2), 4.2);
    }
}
