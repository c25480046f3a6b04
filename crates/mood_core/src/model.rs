//! Mood records produced by the engine.
//!
//! Everything here is append-only history keyed to a conversational unit by
//! id. Records are built once and superseded, never edited.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::weights::WeightSet;

/// Lowest and highest values on the mood scale.
pub const SCORE_MIN: f64 = 0.0;
pub const SCORE_MAX: f64 = 10.0;
/// Neutral score returned when a unit carries no usable evidence.
pub const SCORE_MIDPOINT: f64 = 5.0;

// ============================================================================
// Scores and factors
// ============================================================================

/// Evidence categories the scorer combines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactorType {
    Sentiment,
    PsychologicalIndicator,
    RelationshipDynamics,
    ConversationalPosition,
}

impl FactorType {
    pub const ALL: [FactorType; 4] = [
        FactorType::Sentiment,
        FactorType::PsychologicalIndicator,
        FactorType::RelationshipDynamics,
        FactorType::ConversationalPosition,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FactorType::Sentiment => "sentiment",
            FactorType::PsychologicalIndicator => "psychological_indicator",
            FactorType::RelationshipDynamics => "relationship_dynamics",
            FactorType::ConversationalPosition => "conversational_position",
        }
    }
}

impl fmt::Display for FactorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FactorType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FactorType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown factor type: {}", s))
    }
}

/// One factor's contribution to a score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoodFactor {
    pub factor_type: FactorType,
    /// Effective coefficient at scoring time. Coefficients of one score sum to 1.
    pub weight: f64,
    pub description: String,
    pub evidence: Vec<String>,
    pub internal_score: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoodScore {
    pub id: Uuid,
    pub unit_id: Uuid,
    pub score: f64,
    pub confidence: f64,
    pub descriptors: Vec<String>,
    pub algorithm_version: String,
    /// Version of the weight profile the score was computed with
    pub weights_version: u64,
    pub processing_time_ms: u64,
    /// Timestamp of the scored unit; orders scores on a timeline
    pub observed_at: DateTime<Utc>,
    pub calculated_at: DateTime<Utc>,
    pub factors: Vec<MoodFactor>,
}

impl MoodScore {
    /// Rebuild the score from its factors. Matches `score` within 1e-6.
    pub fn reconstructed_score(&self) -> f64 {
        self.factors
            .iter()
            .filter_map(|f| f.internal_score.map(|s| s * f.weight))
            .sum()
    }

    pub fn factor(&self, factor_type: FactorType) -> Option<&MoodFactor> {
        self.factors.iter().find(|f| f.factor_type == factor_type)
    }

    /// True when no factor found any evidence in the unit.
    pub fn is_low_signal(&self) -> bool {
        self.factors.iter().all(|f| f.evidence.is_empty())
    }
}

// ============================================================================
// Deltas, patterns, turning points
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Improving,
    Declining,
    Stable,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Improving => "improving",
            Direction::Declining => "declining",
            Direction::Stable => "stable",
        }
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "improving" => Ok(Direction::Improving),
            "declining" => Ok(Direction::Declining),
            "stable" => Ok(Direction::Stable),
            other => Err(format!("unknown direction: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeltaType {
    /// Inside the stability band
    Steady,
    Gradual,
    Abrupt,
    /// Undoes the preceding shift and lands back near where it started
    Repair,
}

impl DeltaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeltaType::Steady => "steady",
            DeltaType::Gradual => "gradual",
            DeltaType::Abrupt => "abrupt",
            DeltaType::Repair => "repair",
        }
    }
}

impl FromStr for DeltaType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "steady" => Ok(DeltaType::Steady),
            "gradual" => Ok(DeltaType::Gradual),
            "abrupt" => Ok(DeltaType::Abrupt),
            "repair" => Ok(DeltaType::Repair),
            other => Err(format!("unknown delta type: {}", other)),
        }
    }
}

/// Coarse stage of a sequence a delta falls in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SequencePhase {
    Opening,
    Middle,
    Conclusion,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemporalContext {
    /// Index of the delta within the analysed sequence
    pub index: usize,
    /// Relative position in (0, 1]; 1.0 is the last delta
    pub position: f64,
    pub phase: SequencePhase,
    pub seconds_since_previous: i64,
}

/// Movement of a single factor between the two scores of a delta.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactorShift {
    pub factor_type: FactorType,
    pub previous: f64,
    pub current: f64,
}

impl FactorShift {
    pub fn change(&self) -> f64 {
        self.current - self.previous
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoodDelta {
    pub id: Uuid,
    /// Unit of the later score
    pub unit_id: Uuid,
    pub previous_score_id: Uuid,
    pub current_score_id: Uuid,
    /// Participant whose timeline this delta belongs to, when tracked per person
    pub subject_id: Option<String>,
    pub conversation_id: Option<String>,
    pub delta_sequence: u32,
    pub previous_score: f64,
    pub current_score: f64,
    pub magnitude: f64,
    pub direction: Direction,
    pub delta_type: DeltaType,
    pub confidence: f64,
    pub significance: f64,
    pub factors: Vec<FactorShift>,
    pub temporal_context: TemporalContext,
    pub previous_at: DateTime<Utc>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternType {
    SustainedImprovement,
    SustainedDecline,
    Plateau,
}

impl PatternType {
    pub fn for_direction(direction: Direction) -> Self {
        match direction {
            Direction::Improving => PatternType::SustainedImprovement,
            Direction::Declining => PatternType::SustainedDecline,
            Direction::Stable => PatternType::Plateau,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PatternType::SustainedImprovement => "sustained_improvement",
            PatternType::SustainedDecline => "sustained_decline",
            PatternType::Plateau => "plateau",
        }
    }
}

impl FromStr for PatternType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sustained_improvement" => Ok(PatternType::SustainedImprovement),
            "sustained_decline" => Ok(PatternType::SustainedDecline),
            "plateau" => Ok(PatternType::Plateau),
            other => Err(format!("unknown pattern type: {}", other)),
        }
    }
}

/// Association row between a pattern and one of its deltas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternMember {
    pub delta_id: Uuid,
    /// Rank within the pattern, contiguous from 0
    pub sequence_order: u32,
}

/// A run of same-direction deltas. Aggregates are derived from the members
/// by [`DeltaPattern::from_run`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeltaPattern {
    pub id: Uuid,
    pub pattern_type: PatternType,
    pub direction: Direction,
    pub subject_id: Option<String>,
    pub significance: f64,
    pub confidence: f64,
    pub duration_secs: i64,
    pub average_magnitude: f64,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub members: Vec<PatternMember>,
}

impl DeltaPattern {
    /// Build a pattern from an ordered run of at least two deltas sharing a
    /// direction. Returns `None` for anything shorter or mixed.
    pub fn from_run(run: &[&MoodDelta]) -> Option<Self> {
        let (first, last) = match run {
            [first, .., last] => (*first, *last),
            _ => return None,
        };
        if run.iter().any(|d| d.direction != first.direction) {
            return None;
        }

        let n = run.len() as f64;
        let average_magnitude = run.iter().map(|d| d.magnitude).sum::<f64>() / n;
        let significance = run.iter().map(|d| d.significance).sum::<f64>() / n;
        let confidence = run.iter().map(|d| d.confidence).sum::<f64>() / n;

        let members = run
            .iter()
            .enumerate()
            .map(|(i, d)| PatternMember {
                delta_id: d.id,
                sequence_order: i as u32,
            })
            .collect();

        let key = format!("pattern:{}:{}", first.id, last.id);
        Some(Self {
            id: Uuid::new_v5(&Uuid::NAMESPACE_OID, key.as_bytes()),
            pattern_type: PatternType::for_direction(first.direction),
            direction: first.direction,
            subject_id: first.subject_id.clone(),
            significance,
            confidence,
            duration_secs: (last.occurred_at - first.occurred_at).num_seconds(),
            average_magnitude,
            started_at: first.occurred_at,
            ended_at: last.occurred_at,
            members,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurningPointType {
    Breakthrough,
    Setback,
    Shift,
}

impl TurningPointType {
    pub fn for_direction(direction: Direction) -> Self {
        match direction {
            Direction::Improving => TurningPointType::Breakthrough,
            Direction::Declining => TurningPointType::Setback,
            Direction::Stable => TurningPointType::Shift,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TurningPointType::Breakthrough => "breakthrough",
            TurningPointType::Setback => "setback",
            TurningPointType::Shift => "shift",
        }
    }
}

impl FromStr for TurningPointType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "breakthrough" => Ok(TurningPointType::Breakthrough),
            "setback" => Ok(TurningPointType::Setback),
            "shift" => Ok(TurningPointType::Shift),
            other => Err(format!("unknown turning point type: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurningPoint {
    pub id: Uuid,
    pub delta_id: Option<Uuid>,
    pub unit_id: Uuid,
    pub subject_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub turning_type: TurningPointType,
    pub magnitude: f64,
    pub significance: f64,
    pub confidence: f64,
    pub temporal_context: TemporalContext,
}

// ============================================================================
// Validation
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationMethod {
    ExpertReview,
    SelfReport,
    Crowdsourced,
}

impl ValidationMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationMethod::ExpertReview => "expert_review",
            ValidationMethod::SelfReport => "self_report",
            ValidationMethod::Crowdsourced => "crowdsourced",
        }
    }
}

impl FromStr for ValidationMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "expert_review" => Ok(ValidationMethod::ExpertReview),
            "self_report" => Ok(ValidationMethod::SelfReport),
            "crowdsourced" => Ok(ValidationMethod::Crowdsourced),
            other => Err(format!("unknown validation method: {}", other)),
        }
    }
}

/// `Incomplete` results have no human score and never feed calibration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStatus {
    Complete,
    Incomplete,
}

impl ValidationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationStatus::Complete => "complete",
            ValidationStatus::Incomplete => "incomplete",
        }
    }
}

impl FromStr for ValidationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "complete" => Ok(ValidationStatus::Complete),
            "incomplete" => Ok(ValidationStatus::Incomplete),
            other => Err(format!("unknown validation status: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BiasDirection {
    None,
    Overestimates,
    Underestimates,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BiasIndicators {
    /// Mean of (algorithm - human) over the validator's window
    pub mean_signed_error: f64,
    /// Share of window samples erring in the dominant direction
    pub consistency: f64,
    pub direction: BiasDirection,
    /// Direction is consistent and large enough to count as systematic
    pub systematic: bool,
    pub sample_size: usize,
}

impl Default for BiasIndicators {
    fn default() -> Self {
        Self {
            mean_signed_error: 0.0,
            consistency: 0.0,
            direction: BiasDirection::None,
            systematic: false,
            sample_size: 0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccuracyMetrics {
    pub mean_absolute_error: f64,
    pub root_mean_squared_error: f64,
    /// Pearson correlation; `None` with fewer than two samples or zero variance
    pub correlation: Option<f64>,
    pub mean_agreement: f64,
    pub sample_size: usize,
}

/// Factor reading captured at validation time so calibration can replay the
/// score under different weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactorSample {
    pub factor_type: FactorType,
    pub internal_score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub id: Uuid,
    pub unit_id: Uuid,
    pub score_id: Uuid,
    pub validator_id: String,
    pub method: ValidationMethod,
    pub status: ValidationStatus,
    pub human_score: Option<f64>,
    pub algorithm_score: f64,
    pub agreement: Option<f64>,
    pub discrepancy: Option<f64>,
    pub factor_samples: Vec<FactorSample>,
    pub weights_version: u64,
    pub bias_indicators: BiasIndicators,
    pub accuracy_metrics: AccuracyMetrics,
    pub validated_at: DateTime<Utc>,
}

impl ValidationResult {
    pub fn is_complete(&self) -> bool {
        self.status == ValidationStatus::Complete
    }
}

// ============================================================================
// Calibration history
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdjustmentType {
    WeightAdjustment,
    ManualReview,
    Rollback,
}

impl AdjustmentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdjustmentType::WeightAdjustment => "weight_adjustment",
            AdjustmentType::ManualReview => "manual_review",
            AdjustmentType::Rollback => "rollback",
        }
    }
}

impl FromStr for AdjustmentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "weight_adjustment" => Ok(AdjustmentType::WeightAdjustment),
            "manual_review" => Ok(AdjustmentType::ManualReview),
            "rollback" => Ok(AdjustmentType::Rollback),
            other => Err(format!("unknown adjustment type: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalibrationStatus {
    Proposed,
    Applied,
    Rejected,
    RolledBack,
}

impl CalibrationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CalibrationStatus::Proposed => "proposed",
            CalibrationStatus::Applied => "applied",
            CalibrationStatus::Rejected => "rejected",
            CalibrationStatus::RolledBack => "rolled_back",
        }
    }
}

impl FromStr for CalibrationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "proposed" => Ok(CalibrationStatus::Proposed),
            "applied" => Ok(CalibrationStatus::Applied),
            "rejected" => Ok(CalibrationStatus::Rejected),
            "rolled_back" => Ok(CalibrationStatus::RolledBack),
            other => Err(format!("unknown calibration status: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSnapshot {
    pub agreement: f64,
    /// Window agreement replayed under the proposed weights
    pub backtested_agreement: Option<f64>,
    pub mean_absolute_error: f64,
    pub sample_size: usize,
}

/// One append-only calibration history entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationRecord {
    pub id: Uuid,
    /// Groups the entries written by one calibration cycle
    pub cycle_id: Uuid,
    pub adjustment_type: AdjustmentType,
    pub target_component: String,
    pub previous_value: WeightSet,
    pub new_value: WeightSet,
    pub previous_version: u64,
    pub new_version: Option<u64>,
    pub performance: PerformanceSnapshot,
    pub status: CalibrationStatus,
    pub reason: Option<String>,
    pub recorded_at: DateTime<Utc>,
    pub applied_at: Option<DateTime<Utc>>,
}

// ============================================================================
// Diagnostics
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisIssue {
    LowSignalInput,
    SparseEvidence,
    FactorDisagreement,
    ShortContent,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QualityMetrics {
    pub evidence_count: usize,
    /// Base-weight share of the factors that produced evidence
    pub factor_coverage: f64,
    pub factor_agreement: f64,
    pub word_count: usize,
    pub message_count: usize,
}

/// Per-unit diagnostics written next to a score. Not authoritative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisMetadata {
    pub unit_id: Uuid,
    pub score_id: Uuid,
    pub processing_duration_ms: u64,
    pub confidence: f64,
    pub quality: QualityMetrics,
    pub issues: Vec<AnalysisIssue>,
}
