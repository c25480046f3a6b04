use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

// ============================================================================
// Top-level config
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub scoring: ScoringConfig,
    pub delta: DeltaConfig,
    pub validation: ValidationConfig,
    pub calibration: CalibrationConfig,
    pub storage: StorageConfig,
}

impl EngineConfig {
    /// Load config from a TOML file, falling back to defaults for missing fields.
    /// After loading, env var overrides are applied.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;
        let mut config: EngineConfig =
            toml::from_str(&content).with_context(|| "Failed to parse TOML config")?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Try to load from path; if file doesn't exist, return defaults with env overrides.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        match Self::load(path) {
            Ok(cfg) => cfg,
            Err(e) => {
                tracing::info!("Config file not found or invalid ({}), using defaults", e);
                let mut cfg = Self::default();
                cfg.apply_env_overrides();
                cfg
            }
        }
    }

    /// Apply environment variable overrides on top of file-based config.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("MOOD_DB_PATH") {
            self.storage.db_path = v;
        }
        if let Ok(v) = std::env::var("MOOD_STABILITY_BAND") {
            if let Ok(n) = v.parse() {
                self.delta.stability_band = n;
            }
        }
        if let Ok(v) = std::env::var("MOOD_TURNING_POINT_THRESHOLD") {
            if let Ok(n) = v.parse() {
                self.delta.turning_point_threshold = n;
            }
        }
        if let Ok(v) = std::env::var("MOOD_CALIBRATION_MIN_SAMPLES") {
            if let Ok(n) = v.parse() {
                self.calibration.min_samples = n;
            }
        }
        if let Ok(v) = std::env::var("MOOD_CALIBRATION_INTERVAL_SECS") {
            if let Ok(n) = v.parse() {
                self.calibration.interval_secs = n;
            }
        }
    }
}

// ============================================================================
// Sub-configs
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    /// Number of evidence phrases kept as descriptors
    pub descriptor_count: usize,
    /// Evidence hits at which evidence density saturates
    pub evidence_saturation: usize,
    /// Word count at which the length factor saturates
    pub length_saturation: usize,
    /// Confidence reported for units without any evidence
    pub low_signal_confidence: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            descriptor_count: 5,
            evidence_saturation: 4,
            length_saturation: 20,
            low_signal_confidence: 0.05,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeltaConfig {
    /// Changes smaller than this are `stable`
    pub stability_band: f64,
    /// Magnitude at or above which a shift is `abrupt`
    pub abrupt_threshold: f64,
    /// Magnitude treated as a full-scale change when normalising significance
    pub magnitude_scale: f64,
    /// Multiplier for deltas in the final quartile of a sequence
    pub conclusion_boost: f64,
    /// Significance multiplier for repair deltas
    pub repair_discount: f64,
    /// Every member of a pattern must exceed this magnitude
    pub pattern_min_magnitude: f64,
    pub turning_point_threshold: f64,
    /// How far back `score_unit` looks for a participant's previous scores
    pub lookback_hours: i64,
}

impl Default for DeltaConfig {
    fn default() -> Self {
        Self {
            stability_band: 0.5,
            abrupt_threshold: 2.0,
            magnitude_scale: 4.0,
            conclusion_boost: 1.2,
            repair_discount: 0.5,
            pattern_min_magnitude: 0.5,
            turning_point_threshold: 0.75,
            lookback_hours: 24 * 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    /// Results kept per validator for bias and accuracy
    pub window_size: usize,
    /// Mean signed error (score points) above which bias counts as systematic
    pub bias_threshold: f64,
    /// Share of same-signed errors required for systematic bias
    pub bias_consistency: f64,
    /// Complete results held for calibration; the oldest are dropped beyond this
    pub pending_capacity: usize,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            window_size: 50,
            bias_threshold: 0.5,
            bias_consistency: 0.7,
            pending_capacity: 200,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Pending complete results that trigger a cycle
    pub min_samples: usize,
    /// Scheduled cycle interval; 0 disables the schedule
    pub interval_secs: u64,
    /// Fewest pending results a scheduled cycle will run on
    pub min_scheduled_samples: usize,
    pub auto_reject_threshold: f64,
    pub auto_approve_threshold: f64,
    /// Largest per-factor weight change in one cycle
    pub max_step: f64,
    /// Scales per-factor error into a weight gradient
    pub learning_rate: f64,
    /// Back-tested agreement changes below this are no-ops
    pub epsilon: f64,
    pub apply_timeout_ms: u64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            min_samples: 20,
            interval_secs: 3600,
            min_scheduled_samples: 2,
            auto_reject_threshold: 0.50,
            auto_approve_threshold: 0.75,
            max_step: 0.05,
            learning_rate: 0.02,
            epsilon: 1e-4,
            apply_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: "mood.db".to_string(),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
