use crate::error::StoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Generate a unique record ID (`<millis>_<random>`).
pub fn new_record_id() -> String {
    let ts = Utc::now().timestamp_millis();
    let rand: String = uuid::Uuid::new_v4().simple().to_string()[..7].to_string();
    format!("{}_{}", ts, rand)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request waiting in the prompt queue.
///
/// Producers insert these with every flag cleared. Lifecycle:
/// `processed=false` → `processing=true` (claimed) → `processed=true`, or
/// `failed=true` when the turn could not be completed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PromptRecord {
    pub id: String,
    pub user_id: String,
    pub message: String,
    #[serde(default)]
    pub processed: bool,
    #[serde(default)]
    pub processing: bool,
    #[serde(default)]
    pub failed: bool,
    #[serde(default)]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub processed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub response_id: Option<String>,
}

impl PromptRecord {
    pub fn new(user_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: new_record_id(),
            user_id: user_id.into(),
            message: message.into(),
            processed: false,
            processing: false,
            failed: false,
            error: None,
            created_at: Utc::now(),
            processed_at: None,
            response_id: None,
        }
    }

    /// Whether the poller should consider this prompt at all.
    pub fn is_pending(&self) -> bool {
        !self.processed && !self.failed
    }

    /// Conditional claim. Returns false if someone already owns the prompt.
    pub fn claim(&mut self, response_id: &str, now: DateTime<Utc>) -> bool {
        if self.processed || self.processing || self.failed {
            return false;
        }
        self.processing = true;
        self.response_id = Some(response_id.to_string());
        self.processed_at = Some(now);
        true
    }

    pub fn complete(&mut self, response_id: &str, now: DateTime<Utc>) {
        self.processed = true;
        self.processing = false;
        self.response_id = Some(response_id.to_string());
        self.processed_at = Some(now);
    }

    pub fn fail(&mut self, error: &str) {
        self.failed = true;
        self.processing = false;
        self.error = Some(error.to_string());
    }
}

/// Streamed output for one dispatched prompt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResponseRecord {
    pub id: String,
    pub user_id: String,
    #[serde(default)]
    pub tokens: Vec<String>,
    #[serde(default)]
    pub complete: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub full_response: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ResponseRecord {
    pub fn new(id: impl Into<String>, user_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            user_id: user_id.into(),
            tokens: Vec::new(),
            complete: false,
            error: None,
            full_response: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.complete {
            return Err(StoreError::ResponseFinalized(self.id.clone()));
        }
        Ok(())
    }

    pub fn push_token(&mut self, fragment: &str, now: DateTime<Utc>) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.tokens.push(fragment.to_string());
        self.updated_at = now;
        Ok(())
    }

    pub fn finish(&mut self, full_response: &str, now: DateTime<Utc>) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.complete = true;
        self.full_response = Some(full_response.to_string());
        self.updated_at = now;
        Ok(())
    }

    pub fn fail(&mut self, error: &str, now: DateTime<Utc>) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.complete = true;
        self.error = Some(error.to_string());
        self.updated_at = now;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryMessage {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl HistoryMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Per-user conversation, oldest message first.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatHistoryRecord {
    pub user_id: String,
    #[serde(default)]
    pub messages: Vec<HistoryMessage>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ChatHistoryRecord {
    pub fn new(user_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            user_id: user_id.into(),
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn push(&mut self, message: HistoryMessage, now: DateTime<Utc>) {
        self.messages.push(message);
        self.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_ids_are_unique() {
        let a = new_record_id();
        let b = new_record_id();
        assert_ne!(a, b);
        assert!(a.contains('_'));
    }

    #[test]
    fn test_prompt_claim_is_conditional() {
        let mut prompt = PromptRecord::new("u1", "hello");
        assert!(prompt.is_pending());
        assert!(prompt.claim("r1", Utc::now()));
        assert!(prompt.processing);
        assert_eq!(prompt.response_id.as_deref(), Some("r1"));

        // Second claim must not steal the prompt.
        assert!(!prompt.claim("r2", Utc::now()));
        assert_eq!(prompt.response_id.as_deref(), Some("r1"));

        prompt.complete("r1", Utc::now());
        assert!(prompt.processed);
        assert!(!prompt.processing);
        assert!(!prompt.is_pending());
    }

    #[test]
    fn test_failed_prompt_cannot_be_reclaimed() {
        let mut prompt = PromptRecord::new("u1", "hello");
        assert!(prompt.claim("r1", Utc::now()));
        prompt.fail("boom");
        assert!(!prompt.processing);
        assert!(!prompt.processed);
        assert!(!prompt.is_pending());
        assert!(!prompt.claim("r2", Utc::now()));
    }

    #[test]
    fn test_response_is_frozen_after_finish() {
        let mut response = ResponseRecord::new("r1", "u1");
        response.push_token("Good", Utc::now()).unwrap();
        response.finish("Good", Utc::now()).unwrap();

        assert!(matches!(
            response.push_token("late", Utc::now()),
            Err(StoreError::ResponseFinalized(_))
        ));
        assert!(response.fail("late", Utc::now()).is_err());
        assert!(response.finish("other", Utc::now()).is_err());
        assert_eq!(response.tokens, vec!["Good".to_string()]);
        assert_eq!(response.full_response.as_deref(), Some("Good"));
        assert!(response.error.is_none());
    }

    #[test]
    fn test_producer_document_defaults() {
        // Producers only write the minimal fields.
        let json = r#"{
            "id": "p1",
            "user_id": "u1",
            "message": "She is doctor",
            "created_at": "2024-05-01T10:00:00Z"
        }"#;
        let prompt: PromptRecord = serde_json::from_str(json).unwrap();
        assert!(!prompt.processed);
        assert!(!prompt.processing);
        assert!(prompt.response_id.is_none());
    }

    #[test]
    fn test_role_wire_format() {
        let msg = HistoryMessage::assistant("hi");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["role"], "assistant");
    }
}
