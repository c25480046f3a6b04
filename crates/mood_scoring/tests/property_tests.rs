//! Property-based tests for mood scoring and delta detection.
//!
//! Scores must stay on the 0-10 scale with confidence in [0, 1] and be
//! reconstructible from their factors. Deltas must be consistent with the
//! scores they were computed from, and patterns must only ever group
//! same-direction runs.

use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use mood_core::{
    ConversationalUnit, Direction, FixedClock, Message, MoodScore, Participant, ParticipantRole,
    ScoringConfig, WeightStore,
};
use mood_scoring::{rank_by_significance, DeltaDetector, MoodScorer};
use proptest::prelude::*;
use uuid::Uuid;

// ============================================================================
// Strategies
// ============================================================================

const VOCABULARY: &[&str] = &[
    "happy", "sad", "thanks", "sorry", "anxious", "hopeful", "never", "always", "see you",
    "whatever", "great", "awful", "really", "so", "the", "train", "was", "late", "I", "you",
    "appreciate", "blame", "calm", "stressed", "!", "ok", "fine", "hmm", "love", "hate",
];

fn arb_message() -> impl Strategy<Value = String> {
    prop::collection::vec(prop::sample::select(VOCABULARY), 0..12).prop_map(|w| w.join(" "))
}

fn arb_unit() -> impl Strategy<Value = ConversationalUnit> {
    prop::collection::vec(arb_message(), 0..6).prop_map(|messages| ConversationalUnit {
        id: Uuid::new_v4(),
        conversation_id: None,
        participants: vec![Participant {
            id: "alice".into(),
            role: ParticipantRole::User,
        }],
        content: String::new(),
        messages: messages
            .into_iter()
            .map(|text| Message {
                speaker: "alice".into(),
                text,
            })
            .collect(),
        timestamp: Utc::now(),
    })
}

fn arb_scores() -> impl Strategy<Value = Vec<MoodScore>> {
    prop::collection::vec((0.0f64..=10.0, 0.0f64..=1.0, 0i64..600), 0..20).prop_map(|raw| {
        let mut at = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        raw.into_iter()
            .map(|(score, confidence, gap)| {
                at += Duration::seconds(gap);
                MoodScore {
                    id: Uuid::new_v4(),
                    unit_id: Uuid::new_v4(),
                    score,
                    confidence,
                    descriptors: vec![],
                    algorithm_version: "test".into(),
                    weights_version: 1,
                    processing_time_ms: 0,
                    observed_at: at,
                    calculated_at: at,
                    factors: vec![],
                }
            })
            .collect()
    })
}

fn scorer() -> MoodScorer {
    MoodScorer::new(Arc::new(WeightStore::default()), ScoringConfig::default())
}

// ============================================================================
// Scoring
// ============================================================================

proptest! {
    #[test]
    fn score_and_confidence_stay_in_range(unit in arb_unit()) {
        let outcome = scorer().score(&unit, None);
        prop_assert!((0.0..=10.0).contains(&outcome.score.score));
        prop_assert!((0.0..=1.0).contains(&outcome.score.confidence));
        prop_assert_eq!(outcome.metadata.confidence, outcome.score.confidence);
    }

    #[test]
    fn factors_reconstruct_the_score(unit in arb_unit()) {
        let outcome = scorer().score(&unit, None);
        let s = &outcome.score;
        prop_assert!((s.reconstructed_score() - s.score).abs() < 1e-6);
        let weight_sum: f64 = s.factors.iter().map(|f| f.weight).sum();
        prop_assert!((weight_sum - 1.0).abs() < 1e-6);
    }

    #[test]
    fn scoring_is_deterministic_under_a_fixed_clock(unit in arb_unit()) {
        let clock = Arc::new(FixedClock(Utc.timestamp_opt(1_750_000_000, 0).unwrap()));
        let a = scorer().with_clock(clock.clone()).score(&unit, None);
        let b = scorer().with_clock(clock).score(&unit, None);
        prop_assert_eq!(a, b);
    }

    #[test]
    fn descriptors_are_bounded_and_unique(unit in arb_unit()) {
        let outcome = scorer().score(&unit, None);
        let d = &outcome.score.descriptors;
        prop_assert!(d.len() <= ScoringConfig::default().descriptor_count);
        for (i, x) in d.iter().enumerate() {
            prop_assert!(!d[i + 1..].contains(x));
        }
    }
}

// ============================================================================
// Deltas
// ============================================================================

proptest! {
    #[test]
    fn one_delta_per_consecutive_pair(scores in arb_scores()) {
        let deltas = DeltaDetector::default().detect(&scores).unwrap();
        prop_assert_eq!(deltas.len(), scores.len().saturating_sub(1));

        for (i, d) in deltas.iter().enumerate() {
            let (prev, cur) = (&scores[i], &scores[i + 1]);
            prop_assert_eq!(d.previous_score_id, prev.id);
            prop_assert_eq!(d.current_score_id, cur.id);
            prop_assert!((d.magnitude - (cur.score - prev.score).abs()).abs() < 1e-12);
            prop_assert!((0.0..=1.0).contains(&d.significance));
            prop_assert!((0.0..=1.0).contains(&d.confidence));
            if d.magnitude < 0.5 {
                prop_assert_eq!(d.direction, Direction::Stable);
            }
        }
    }

    #[test]
    fn patterns_hold_same_direction_runs(scores in arb_scores()) {
        let detector = DeltaDetector::default();
        let deltas = detector.detect(&scores).unwrap();
        for pattern in detector.find_patterns(&deltas) {
            prop_assert!(pattern.members.len() >= 2);
            prop_assert!(pattern.direction != Direction::Stable);
            for (i, m) in pattern.members.iter().enumerate() {
                prop_assert_eq!(m.sequence_order as usize, i);
                let d = deltas.iter().find(|d| d.id == m.delta_id).unwrap();
                prop_assert_eq!(d.direction, pattern.direction);
                prop_assert!(d.magnitude > 0.5);
            }
        }
    }

    #[test]
    fn turning_points_exceed_threshold(scores in arb_scores()) {
        let detector = DeltaDetector::default();
        let deltas = detector.detect(&scores).unwrap();
        let points = detector.find_turning_points(&deltas);
        for tp in &points {
            prop_assert!(tp.significance > 0.75);
        }
        for pair in points.windows(2) {
            prop_assert!(pair[0].timestamp <= pair[1].timestamp);
        }
    }

    #[test]
    fn ranking_is_descending(scores in arb_scores()) {
        let deltas = DeltaDetector::default().detect(&scores).unwrap();
        let ranked = rank_by_significance(&deltas);
        prop_assert_eq!(ranked.len(), deltas.len());
        for pair in ranked.windows(2) {
            prop_assert!(pair[0].significance >= pair[1].significance);
        }
    }
}
