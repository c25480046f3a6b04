use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A memory-worthy chunk of dialogue. Owned by the memory store; the engine
/// only reads it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationalUnit {
    pub id: Uuid,
    pub conversation_id: Option<String>,
    pub participants: Vec<Participant>,
    /// Summary of the content as produced by ingestion
    pub content: String,
    /// Ordered sub-messages; may be empty when only a summary exists
    pub messages: Vec<Message>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub id: String,
    pub role: ParticipantRole,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantRole {
    User,
    Assistant,
    Other,
}

impl ParticipantRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParticipantRole::User => "user",
            ParticipantRole::Assistant => "assistant",
            ParticipantRole::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "user" => ParticipantRole::User,
            "assistant" => ParticipantRole::Assistant,
            _ => ParticipantRole::Other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub speaker: String,
    pub text: String,
}

impl ConversationalUnit {
    /// Message texts in order, falling back to the summary when the unit
    /// carries no sub-messages.
    pub fn texts(&self) -> Vec<&str> {
        if self.messages.is_empty() {
            if self.content.trim().is_empty() {
                Vec::new()
            } else {
                vec![self.content.as_str()]
            }
        } else {
            self.messages
                .iter()
                .map(|m| m.text.as_str())
                .filter(|t| !t.trim().is_empty())
                .collect()
        }
    }

    pub fn word_count(&self) -> usize {
        self.texts().iter().map(|t| t.split_whitespace().count()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.texts().is_empty()
    }

    pub fn role_of(&self, speaker: &str) -> Option<ParticipantRole> {
        self.participants
            .iter()
            .find(|p| p.id == speaker)
            .map(|p| p.role)
    }
}

/// Read side of the memory store that owns conversational units.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    async fn get_unit(&self, id: Uuid) -> anyhow::Result<Option<ConversationalUnit>>;

    /// Units the participant took part in at or after `since`, oldest first.
    async fn get_recent_units(
        &self,
        participant_id: &str,
        since: DateTime<Utc>,
    ) -> anyhow::Result<Vec<ConversationalUnit>>;
}
