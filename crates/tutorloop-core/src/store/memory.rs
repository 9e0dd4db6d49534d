use super::{sort_oldest_first, Datastore};
use crate::error::{StoreError, StoreResult};
use crate::record::{ChatHistoryRecord, HistoryMessage, PromptRecord, ResponseRecord};
use chrono::Utc;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};

/// In-process datastore. Each map entry is locked for the duration of a
/// single update, which gives the same per-record atomicity as `FileStore`.
#[derive(Default)]
pub struct MemoryStore {
    prompts: DashMap<String, PromptRecord>,
    responses: DashMap<String, ResponseRecord>,
    histories: DashMap<String, ChatHistoryRecord>,
    closed: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn check_open(&self) -> StoreResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Datastore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn insert_prompt(&self, prompt: &PromptRecord) -> StoreResult<()> {
        self.check_open()?;
        if self.prompts.contains_key(&prompt.id) {
            return Err(StoreError::Duplicate(prompt.id.clone()));
        }
        self.prompts.insert(prompt.id.clone(), prompt.clone());
        Ok(())
    }

    async fn get_prompt(&self, id: &str) -> StoreResult<Option<PromptRecord>> {
        self.check_open()?;
        Ok(self.prompts.get(id).map(|p| p.value().clone()))
    }

    async fn pending_prompts(&self) -> StoreResult<Vec<PromptRecord>> {
        self.check_open()?;
        let mut pending: Vec<PromptRecord> = self
            .prompts
            .iter()
            .filter(|p| p.value().is_pending())
            .map(|p| p.value().clone())
            .collect();
        sort_oldest_first(&mut pending);
        Ok(pending)
    }

    async fn claim_prompt(&self, id: &str, response_id: &str) -> StoreResult<bool> {
        self.check_open()?;
        let mut prompt = self
            .prompts
            .get_mut(id)
            .ok_or_else(|| StoreError::PromptNotFound(id.to_string()))?;
        Ok(prompt.claim(response_id, Utc::now()))
    }

    async fn complete_prompt(&self, id: &str, response_id: &str) -> StoreResult<()> {
        self.check_open()?;
        let mut prompt = self
            .prompts
            .get_mut(id)
            .ok_or_else(|| StoreError::PromptNotFound(id.to_string()))?;
        prompt.complete(response_id, Utc::now());
        Ok(())
    }

    async fn fail_prompt(&self, id: &str, error: &str) -> StoreResult<()> {
        self.check_open()?;
        let mut prompt = self
            .prompts
            .get_mut(id)
            .ok_or_else(|| StoreError::PromptNotFound(id.to_string()))?;
        prompt.fail(error);
        Ok(())
    }

    async fn create_response(&self, id: &str, user_id: &str) -> StoreResult<()> {
        self.check_open()?;
        if self.responses.contains_key(id) {
            return Err(StoreError::Duplicate(id.to_string()));
        }
        self.responses
            .insert(id.to_string(), ResponseRecord::new(id, user_id));
        Ok(())
    }

    async fn get_response(&self, id: &str) -> StoreResult<Option<ResponseRecord>> {
        self.check_open()?;
        Ok(self.responses.get(id).map(|r| r.value().clone()))
    }

    async fn append_token(&self, id: &str, fragment: &str) -> StoreResult<()> {
        self.check_open()?;
        self.responses
            .get_mut(id)
            .ok_or_else(|| StoreError::ResponseNotFound(id.to_string()))?
            .push_token(fragment, Utc::now())
    }

    async fn finish_response(&self, id: &str, full_response: &str) -> StoreResult<()> {
        self.check_open()?;
        self.responses
            .get_mut(id)
            .ok_or_else(|| StoreError::ResponseNotFound(id.to_string()))?
            .finish(full_response, Utc::now())
    }

    async fn fail_response(&self, id: &str, error: &str) -> StoreResult<()> {
        self.check_open()?;
        self.responses
            .get_mut(id)
            .ok_or_else(|| StoreError::ResponseNotFound(id.to_string()))?
            .fail(error, Utc::now())
    }

    async fn get_history(&self, user_id: &str) -> StoreResult<Option<ChatHistoryRecord>> {
        self.check_open()?;
        Ok(self.histories.get(user_id).map(|r| r.value().clone()))
    }

    async fn load_history(&self, user_id: &str) -> StoreResult<ChatHistoryRecord> {
        self.check_open()?;
        let record = self
            .histories
            .entry(user_id.to_string())
            .or_insert_with(|| ChatHistoryRecord::new(user_id));
        Ok(record.value().clone())
    }

    async fn append_message(&self, user_id: &str, message: HistoryMessage) -> StoreResult<()> {
        self.check_open()?;
        self.histories
            .entry(user_id.to_string())
            .or_insert_with(|| ChatHistoryRecord::new(user_id))
            .push(message, Utc::now());
        Ok(())
    }

    async fn clear_history(&self, user_id: &str) -> StoreResult<bool> {
        self.check_open()?;
        match self.histories.get_mut(user_id) {
            Some(mut record) => {
                record.messages.clear();
                record.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn close(&self) -> StoreResult<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}
