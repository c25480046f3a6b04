//! Versioned scoring weights.
//!
//! A `WeightProfile` is immutable once built. Calibration publishes a new
//! profile through `WeightStore`; scorers load one `Arc` snapshot per call so
//! a score never mixes old and new coefficients.

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{MoodError, MoodResult};
use crate::model::FactorType;

/// Factor coefficients, ordered by factor type for deterministic iteration.
pub type WeightSet = BTreeMap<FactorType, f64>;

/// Every published weight set sums to this.
pub const WEIGHT_NORMALIZATION: f64 = 1.0;

/// Tolerance used when checking the normalization invariant.
pub const WEIGHT_SUM_TOLERANCE: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightProfile {
    version: u64,
    weights: WeightSet,
}

impl Default for WeightProfile {
    fn default() -> Self {
        Self {
            version: 1,
            weights: default_weights(),
        }
    }
}

pub fn default_weights() -> WeightSet {
    BTreeMap::from([
        (FactorType::Sentiment, 0.35),
        (FactorType::PsychologicalIndicator, 0.25),
        (FactorType::RelationshipDynamics, 0.20),
        (FactorType::ConversationalPosition, 0.20),
    ])
}

impl WeightProfile {
    /// Build a profile, rejecting anything that breaks the weight invariants.
    pub fn new(version: u64, weights: WeightSet) -> MoodResult<Self> {
        check_weights(&weights)?;
        Ok(Self { version, weights })
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn weights(&self) -> &WeightSet {
        &self.weights
    }

    pub fn weight(&self, factor_type: FactorType) -> f64 {
        self.weights.get(&factor_type).copied().unwrap_or(0.0)
    }

    /// Successor profile carrying `weights`, one version higher.
    pub fn successor(&self, weights: WeightSet) -> MoodResult<Self> {
        Self::new(self.version + 1, weights)
    }
}

/// Checks that every weight lies in [0, 1], every factor type is present and
/// the set sums to [`WEIGHT_NORMALIZATION`].
pub fn check_weights(weights: &WeightSet) -> MoodResult<()> {
    for factor_type in FactorType::ALL {
        match weights.get(&factor_type) {
            None => {
                return Err(MoodError::InvalidWeights(format!(
                    "missing weight for {}",
                    factor_type
                )))
            }
            Some(w) if !w.is_finite() || *w < 0.0 || *w > 1.0 => {
                return Err(MoodError::InvalidWeights(format!(
                    "weight for {} out of [0, 1]: {}",
                    factor_type, w
                )))
            }
            Some(_) => {}
        }
    }
    let sum: f64 = weights.values().sum();
    if (sum - WEIGHT_NORMALIZATION).abs() > WEIGHT_SUM_TOLERANCE {
        return Err(MoodError::InvalidWeights(format!(
            "weights sum to {} instead of {}",
            sum, WEIGHT_NORMALIZATION
        )));
    }
    Ok(())
}

/// Rescale so the set sums to [`WEIGHT_NORMALIZATION`]. Leaves an all-zero
/// set untouched.
pub fn normalize(weights: &mut WeightSet) {
    let sum: f64 = weights.values().sum();
    if sum <= 0.0 || !sum.is_finite() {
        return;
    }
    for w in weights.values_mut() {
        *w = *w / sum * WEIGHT_NORMALIZATION;
    }
}

/// Shared holder of the live profile.
pub struct WeightStore {
    current: ArcSwap<WeightProfile>,
}

impl WeightStore {
    pub fn new(profile: WeightProfile) -> Self {
        Self {
            current: ArcSwap::from_pointee(profile),
        }
    }

    /// Consistent view for one scoring call.
    pub fn snapshot(&self) -> Arc<WeightProfile> {
        self.current.load_full()
    }

    /// Swap in a new profile. Returns the one it replaced.
    pub fn publish(&self, profile: WeightProfile) -> MoodResult<Arc<WeightProfile>> {
        check_weights(profile.weights())?;
        tracing::info!(version = profile.version(), "Publishing weight profile");
        Ok(self.current.swap(Arc::new(profile)))
    }

    pub fn version(&self) -> u64 {
        self.current.load().version()
    }
}

impl Default for WeightStore {
    fn default() -> Self {
        Self::new(WeightProfile::default())
    }
}
