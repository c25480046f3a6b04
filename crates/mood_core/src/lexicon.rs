//! Keyword lexicons for the factor extractors.
//!
//! Shared across crates to avoid duplicating word lists. Matching is done on
//! whole words/phrases of a normalised lowercase form; emoji are matched on
//! the raw text.

pub const POSITIVE: &[&str] = &[
    "happy", "glad", "great", "wonderful", "love", "awesome", "excited", "amazing", "good",
    "nice", "fun", "delighted", "joy", "lovely", "😊", "❤️", "👍",
];

pub const NEGATIVE: &[&str] = &[
    "sad", "angry", "upset", "terrible", "awful", "hate", "bad", "miserable", "annoyed",
    "frustrated", "disappointed", "hurt", "horrible", "😢", "😡", "💔",
];

pub const INTENSE: &[&str] = &[
    "very", "really", "so", "extremely", "incredibly", "totally", "absolutely",
];

pub const WELLBEING: &[&str] = &[
    "hopeful", "grateful", "calm", "relieved", "confident", "proud", "peaceful",
    "optimistic", "motivated", "rested", "feel better", "feeling better",
];

pub const DISTRESS: &[&str] = &[
    "anxious", "worried", "stressed", "overwhelmed", "lonely", "hopeless", "exhausted",
    "scared", "afraid", "depressed", "nervous", "can't cope", "panic", "worthless",
];

pub const SUPPORTIVE: &[&str] = &[
    "thank you", "thanks", "appreciate", "i understand", "here for you", "support",
    "you're right", "agree", "miss you", "proud of you", "means a lot",
];

pub const STRAINED: &[&str] = &[
    "leave me alone", "shut up", "you never", "you always", "blame", "don't care",
    "ignore", "not listening", "argue", "your fault",
];

pub const REPAIR: &[&str] = &["sorry", "apologize", "my fault", "forgive", "make it up"];

pub const RESOLVED: &[&str] = &[
    "glad we talked", "see you", "talk soon", "that helps", "sounds good", "good night",
    "take care", "makes sense", "thanks", "thank you", "feel better", "looking forward",
];

pub const UNRESOLVED: &[&str] = &[
    "forget it", "never mind", "whatever", "i give up", "doesn't matter", "i'm done",
    "nothing helps", "still upset", "pointless",
];

/// Lowercase, strip punctuation except apostrophes, collapse whitespace, and
/// pad with spaces so phrase lookups can match on word boundaries.
fn normalise(text: &str) -> String {
    let lowered: String = text
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '\'' {
                c
            } else {
                ' '
            }
        })
        .collect();
    let mut out = String::with_capacity(lowered.len() + 2);
    out.push(' ');
    for word in lowered.split_whitespace() {
        out.push_str(word);
        out.push(' ');
    }
    out
}

fn is_symbolic(marker: &str) -> bool {
    !marker.chars().any(|c| c.is_alphanumeric())
}

/// Markers from `lexicon` present in `text`, in lexicon order.
pub fn find_markers(text: &str, lexicon: &[&'static str]) -> Vec<&'static str> {
    let norm = normalise(text);
    lexicon
        .iter()
        .copied()
        .filter(|marker| {
            if is_symbolic(marker) {
                text.contains(marker)
            } else {
                norm.contains(&format!(" {} ", marker))
            }
        })
        .collect()
}

/// Number of intensifiers plus exclamation marks, capped at 5.
pub fn intensity_hits(text: &str) -> usize {
    let words = find_markers(text, INTENSE).len();
    let bangs = text.matches('!').count();
    (words + bangs).min(5)
}

/// Analyze text for emotional valence and intensity.
///
/// Returns `(valence, intensity)` where:
/// - `valence` is in `[-1.0, 1.0]` (negative to positive)
/// - `intensity` is in `[0.1, 1.0]`
pub fn analyze_sentiment(text: &str) -> (f64, f64) {
    let pos = find_markers(text, POSITIVE).len() as f64;
    let neg = find_markers(text, NEGATIVE).len() as f64;
    let int = intensity_hits(text) as f64;

    let valence = (pos - neg) / (pos + neg + 1.0);
    let intensity = ((pos + neg + int) / 5.0).clamp(0.1, 1.0);

    (valence, intensity)
}
