//! Factor extractors.
//!
//! Each extractor is a pure function of the unit: it looks for one kind of
//! evidence and maps what it finds onto the 0-10 mood scale. An extractor that
//! finds nothing returns `None`; the scorer treats that as "no opinion" rather
//! than as a neutral vote.

use mood_core::lexicon::{self, find_markers};
use mood_core::{ConversationalUnit, FactorType, SCORE_MAX, SCORE_MIDPOINT, SCORE_MIN};

/// What one extractor found in a unit.
#[derive(Debug, Clone, PartialEq)]
pub struct FactorReading {
    /// Position on the mood scale, [0, 10]
    pub internal_score: f64,
    pub evidence: Vec<String>,
    pub description: String,
}

pub trait FactorExtractor: Send + Sync {
    fn factor_type(&self) -> FactorType;

    fn extract(&self, unit: &ConversationalUnit) -> Option<FactorReading>;
}

/// The four standard extractors, one per factor type.
pub fn default_extractors() -> Vec<Box<dyn FactorExtractor>> {
    vec![
        Box::new(SentimentExtractor),
        Box::new(PsychologicalIndicatorExtractor),
        Box::new(RelationshipDynamicsExtractor),
        Box::new(ConversationalPositionExtractor),
    ]
}

/// Map weighted positive/negative hit counts onto the mood scale.
/// Saturates towards the ends as hits accumulate: 1 hit -> 7.5, 3 hits -> 8.75.
fn polarity_score(positive: f64, negative: f64) -> f64 {
    let raw = SCORE_MIDPOINT + SCORE_MIDPOINT * (positive - negative) / (positive + negative + 1.0);
    raw.clamp(SCORE_MIN, SCORE_MAX)
}

fn collect_evidence(groups: &[&[&'static str]]) -> Vec<String> {
    let mut evidence: Vec<String> = Vec::new();
    for group in groups {
        for marker in group.iter() {
            if !evidence.iter().any(|e| e == marker) {
                evidence.push((*marker).to_string());
            }
        }
    }
    evidence
}

fn joined(unit: &ConversationalUnit) -> String {
    unit.texts().join("\n")
}

// ============================================================================
// Sentiment polarity
// ============================================================================

pub struct SentimentExtractor;

impl FactorExtractor for SentimentExtractor {
    fn factor_type(&self) -> FactorType {
        FactorType::Sentiment
    }

    fn extract(&self, unit: &ConversationalUnit) -> Option<FactorReading> {
        let text = joined(unit);
        let positive = find_markers(&text, lexicon::POSITIVE);
        let negative = find_markers(&text, lexicon::NEGATIVE);
        if positive.is_empty() && negative.is_empty() {
            return None;
        }

        let (valence, intensity) = lexicon::analyze_sentiment(&text);
        // Intensifiers push the reading further from neutral
        let internal_score = (SCORE_MIDPOINT + SCORE_MIDPOINT * valence * (0.6 + 0.4 * intensity))
            .clamp(SCORE_MIN, SCORE_MAX);

        Some(FactorReading {
            internal_score,
            evidence: collect_evidence(&[&positive, &negative]),
            description: format!(
                "sentiment polarity {:+.2} ({} positive, {} negative markers)",
                valence,
                positive.len(),
                negative.len()
            ),
        })
    }
}

// ============================================================================
// Psychological indicators
// ============================================================================

pub struct PsychologicalIndicatorExtractor;

impl FactorExtractor for PsychologicalIndicatorExtractor {
    fn factor_type(&self) -> FactorType {
        FactorType::PsychologicalIndicator
    }

    fn extract(&self, unit: &ConversationalUnit) -> Option<FactorReading> {
        let text = joined(unit);
        let wellbeing = find_markers(&text, lexicon::WELLBEING);
        let distress = find_markers(&text, lexicon::DISTRESS);
        if wellbeing.is_empty() && distress.is_empty() {
            return None;
        }

        Some(FactorReading {
            internal_score: polarity_score(wellbeing.len() as f64, distress.len() as f64),
            evidence: collect_evidence(&[&wellbeing, &distress]),
            description: format!(
                "{} wellbeing and {} distress indicators",
                wellbeing.len(),
                distress.len()
            ),
        })
    }
}

// ============================================================================
// Relationship dynamics
// ============================================================================

pub struct RelationshipDynamicsExtractor;

impl FactorExtractor for RelationshipDynamicsExtractor {
    fn factor_type(&self) -> FactorType {
        FactorType::RelationshipDynamics
    }

    fn extract(&self, unit: &ConversationalUnit) -> Option<FactorReading> {
        let text = joined(unit);
        let supportive = find_markers(&text, lexicon::SUPPORTIVE);
        let repair = find_markers(&text, lexicon::REPAIR);
        let strained = find_markers(&text, lexicon::STRAINED);
        if supportive.is_empty() && repair.is_empty() && strained.is_empty() {
            return None;
        }

        // An apology is a bid to mend the relationship: half a positive signal
        let positive = supportive.len() as f64 + 0.5 * repair.len() as f64;
        Some(FactorReading {
            internal_score: polarity_score(positive, strained.len() as f64),
            evidence: collect_evidence(&[&supportive, &repair, &strained]),
            description: format!(
                "{} supportive, {} repair and {} strained markers",
                supportive.len(),
                repair.len(),
                strained.len()
            ),
        })
    }
}

// ============================================================================
// Conversational position
// ============================================================================

/// Looks at how the exchange ends. Closure markers in the final third of the
/// messages count double.
pub struct ConversationalPositionExtractor;

const CLOSING_WEIGHT: f64 = 2.0;

impl FactorExtractor for ConversationalPositionExtractor {
    fn factor_type(&self) -> FactorType {
        FactorType::ConversationalPosition
    }

    fn extract(&self, unit: &ConversationalUnit) -> Option<FactorReading> {
        let texts = unit.texts();
        if texts.is_empty() {
            return None;
        }
        let closing_len = texts.len().div_ceil(3);
        let split = texts.len() - closing_len;
        let body = texts[..split].join("\n");
        let closing = texts[split..].join("\n");

        let body_resolved = find_markers(&body, lexicon::RESOLVED);
        let body_unresolved = find_markers(&body, lexicon::UNRESOLVED);
        let end_resolved = find_markers(&closing, lexicon::RESOLVED);
        let end_unresolved = find_markers(&closing, lexicon::UNRESOLVED);

        let resolved = body_resolved.len() as f64 + CLOSING_WEIGHT * end_resolved.len() as f64;
        let unresolved = body_unresolved.len() as f64 + CLOSING_WEIGHT * end_unresolved.len() as f64;
        if resolved == 0.0 && unresolved == 0.0 {
            return None;
        }

        let closes = if end_resolved.len() > end_unresolved.len() {
            "closes on resolution"
        } else if end_unresolved.len() > end_resolved.len() {
            "closes unresolved"
        } else {
            "closes without a clear ending"
        };

        Some(FactorReading {
            internal_score: polarity_score(resolved, unresolved),
            evidence: collect_evidence(&[&end_resolved, &end_unresolved, &body_resolved, &body_unresolved]),
            description: format!("conversation {}", closes),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use mood_core::{Message, Participant, ParticipantRole};
    use uuid::Uuid;

    fn unit_from(messages: &[&str]) -> ConversationalUnit {
        ConversationalUnit {
            id: Uuid::new_v4(),
            conversation_id: None,
            participants: vec![Participant {
                id: "alice".into(),
                role: ParticipantRole::User,
            }],
            content: String::new(),
            messages: messages
                .iter()
                .map(|t| Message {
                    speaker: "alice".into(),
                    text: (*t).to_string(),
                })
                .collect(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_polarity_score_shape() {
        assert_eq!(polarity_score(0.0, 0.0), 5.0);
        assert!((polarity_score(1.0, 0.0) - 7.5).abs() < 1e-9);
        assert!((polarity_score(0.0, 3.0) - 1.25).abs() < 1e-9);
    }

    #[test]
    fn test_sentiment_positive_and_negative() {
        let pos = SentimentExtractor
            .extract(&unit_from(&["what a wonderful, happy day"]))
            .unwrap();
        assert!(pos.internal_score > 7.0);
        assert_eq!(pos.evidence, vec!["happy", "wonderful"]);

        let neg = SentimentExtractor
            .extract(&unit_from(&["this is awful, I'm so upset"]))
            .unwrap();
        assert!(neg.internal_score < 3.0);
    }

    #[test]
    fn test_sentiment_none_without_markers() {
        assert!(SentimentExtractor
            .extract(&unit_from(&["the train leaves at nine"]))
            .is_none());
    }

    #[test]
    fn test_psychological_distress() {
        let r = PsychologicalIndicatorExtractor
            .extract(&unit_from(&["I'm anxious and overwhelmed at work"]))
            .unwrap();
        assert!(r.internal_score < 2.5);
        assert_eq!(r.evidence.len(), 2);
    }

    #[test]
    fn test_relationship_apology_counts_as_repair() {
        let strained = RelationshipDynamicsExtractor
            .extract(&unit_from(&["you never listen, I blame you"]))
            .unwrap();
        let mended = RelationshipDynamicsExtractor
            .extract(&unit_from(&["you never listen", "I'm sorry, my fault"]))
            .unwrap();
        assert!(mended.internal_score > strained.internal_score);
    }

    #[test]
    fn test_position_weights_closing_messages() {
        let resolved_late = ConversationalPositionExtractor
            .extract(&unit_from(&["forget it", "hmm", "ok that helps, take care"]))
            .unwrap();
        let resolved_early = ConversationalPositionExtractor
            .extract(&unit_from(&["ok that helps, take care", "hmm", "forget it"]))
            .unwrap();
        assert!(resolved_late.internal_score > 5.0);
        assert!(resolved_early.internal_score < resolved_late.internal_score);
        assert!(resolved_late.description.contains("resolution"));
        assert!(resolved_early.description.contains("unresolved"));
    }

    #[test]
    fn test_empty_unit_yields_nothing() {
        let empty = unit_from(&[]);
        for extractor in default_extractors() {
            assert!(extractor.extract(&empty).is_none());
        }
    }
}
