mod file;
mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use crate::error::StoreResult;
use crate::record::{ChatHistoryRecord, HistoryMessage, PromptRecord, ResponseRecord};

/// Persistence contract shared by the poller, the workers and observers.
///
/// Every mutating call is a single atomic update of one record; callers never
/// read-modify-write through this trait.
#[async_trait::async_trait]
pub trait Datastore: Send + Sync + 'static {
    /// Short backend name for logs.
    fn name(&self) -> &str;

    async fn insert_prompt(&self, prompt: &PromptRecord) -> StoreResult<()>;

    async fn get_prompt(&self, id: &str) -> StoreResult<Option<PromptRecord>>;

    /// Unprocessed, non-failed prompts, oldest first.
    async fn pending_prompts(&self) -> StoreResult<Vec<PromptRecord>>;

    /// Mark a prompt in-flight and attach its response id. Returns `false`
    /// when the prompt was already claimed, processed or failed.
    async fn claim_prompt(&self, id: &str, response_id: &str) -> StoreResult<bool>;

    async fn complete_prompt(&self, id: &str, response_id: &str) -> StoreResult<()>;

    async fn fail_prompt(&self, id: &str, error: &str) -> StoreResult<()>;

    async fn create_response(&self, id: &str, user_id: &str) -> StoreResult<()>;

    async fn get_response(&self, id: &str) -> StoreResult<Option<ResponseRecord>>;

    /// Append one fragment. Never batched so observers see progress.
    async fn append_token(&self, id: &str, fragment: &str) -> StoreResult<()>;

    async fn finish_response(&self, id: &str, full_response: &str) -> StoreResult<()>;

    async fn fail_response(&self, id: &str, error: &str) -> StoreResult<()>;

    /// A user's history, if one has been recorded. Never creates a record.
    async fn get_history(&self, user_id: &str) -> StoreResult<Option<ChatHistoryRecord>>;

    /// Load a user's history, creating an empty record on first use.
    async fn load_history(&self, user_id: &str) -> StoreResult<ChatHistoryRecord>;

    async fn append_message(&self, user_id: &str, message: HistoryMessage) -> StoreResult<()>;

    /// Drop all messages for a user. Returns whether a record existed.
    async fn clear_history(&self, user_id: &str) -> StoreResult<bool>;

    /// Release the backend. Later calls fail with `StoreError::Closed`.
    async fn close(&self) -> StoreResult<()>;
}

pub(crate) fn sort_oldest_first(prompts: &mut [PromptRecord]) {
    prompts.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.id.cmp(&b.id))
    });
}
