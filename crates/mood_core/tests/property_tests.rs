//! Property-based tests for mood_core weight profiles and lexicon scoring.

use mood_core::lexicon;
use mood_core::weights::{check_weights, normalize};
use mood_core::{FactorType, WeightProfile, WeightSet, WeightStore, WEIGHT_NORMALIZATION};
use proptest::prelude::*;

// ============================================================================
// Strategies
// ============================================================================

fn arb_weight_set() -> impl Strategy<Value = WeightSet> {
    prop::array::uniform4(0.01f64..=1.0).prop_map(|raw| {
        FactorType::ALL
            .iter()
            .copied()
            .zip(raw)
            .collect::<WeightSet>()
    })
}

// ============================================================================
// Weight Properties
// ============================================================================

proptest! {
    /// Normalizing any positive set yields a publishable profile.
    #[test]
    fn normalized_sets_are_valid(mut weights in arb_weight_set()) {
        normalize(&mut weights);
        let sum: f64 = weights.values().sum();
        prop_assert!((sum - WEIGHT_NORMALIZATION).abs() < 1e-9);
        prop_assert!(weights.values().all(|w| (0.0..=1.0).contains(w)));
        prop_assert!(check_weights(&weights).is_ok());
    }

    /// Scaling a set never changes the relative order of its weights.
    #[test]
    fn normalize_preserves_order(mut weights in arb_weight_set()) {
        let before: Vec<f64> = weights.values().copied().collect();
        normalize(&mut weights);
        let after: Vec<f64> = weights.values().copied().collect();
        for i in 0..before.len() {
            for j in 0..before.len() {
                if before[i] < before[j] {
                    prop_assert!(after[i] <= after[j]);
                }
            }
        }
    }

    /// The store only ever holds valid profiles and versions climb by one.
    #[test]
    fn store_publishes_successors(mut weights in arb_weight_set(), unnormalized in arb_weight_set()) {
        let store = WeightStore::default();
        let v = store.version();

        let sum: f64 = unnormalized.values().sum();
        let bad = WeightProfile::new(v + 1, unnormalized);
        prop_assert_eq!(bad.is_ok(), (sum - WEIGHT_NORMALIZATION).abs() <= 1e-9);

        normalize(&mut weights);
        let next = store.snapshot().successor(weights).unwrap();
        store.publish(next).unwrap();
        prop_assert_eq!(store.version(), v + 1);
        prop_assert!(check_weights(store.snapshot().weights()).is_ok());
    }
}

// ============================================================================
// Lexicon Properties
// ============================================================================

proptest! {
    #[test]
    fn sentiment_stays_bounded(text in "\\PC{0,200}") {
        let (valence, intensity) = lexicon::analyze_sentiment(&text);
        prop_assert!((-1.0..=1.0).contains(&valence));
        prop_assert!((0.0..=1.0).contains(&intensity));
    }
}
