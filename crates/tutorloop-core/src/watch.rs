//! Read-only observer for streamed responses.
//!
//! Front-ends follow a prompt by first waiting for the poller to attach a
//! response id, then polling the response record and forwarding only the
//! tokens they have not seen yet.

use crate::error::StoreError;
use crate::store::Datastore;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    /// Tokens appended since the previous event.
    Tokens(Vec<String>),
    Completed(String),
    Failed(String),
}

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("prompt not found: {0}")]
    PromptNotFound(String),

    #[error("no response assigned to prompt {0}")]
    NoResponseAssigned(String),

    #[error("prompt {prompt_id} failed: {error}")]
    PromptFailed { prompt_id: String, error: String },

    #[error("response not found: {0}")]
    ResponseNotFound(String),

    #[error("stream timed out after {0:?} without new tokens")]
    Inactive(Duration),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct ResponseWatcher {
    store: Arc<dyn Datastore>,
    poll_interval: Duration,
    resolve_attempts: u32,
    missing_response_grace: Duration,
    inactivity_timeout: Duration,
}

impl ResponseWatcher {
    pub fn new(store: Arc<dyn Datastore>) -> Self {
        Self {
            store,
            poll_interval: Duration::from_millis(500),
            resolve_attempts: 20,
            missing_response_grace: Duration::from_secs(5),
            inactivity_timeout: Duration::from_secs(60),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_resolve_attempts(mut self, attempts: u32) -> Self {
        self.resolve_attempts = attempts.max(1);
        self
    }

    pub fn with_inactivity_timeout(mut self, timeout: Duration) -> Self {
        self.inactivity_timeout = timeout;
        self
    }

    /// Wait until the poller has claimed the prompt and return its response id.
    pub async fn resolve_response_id(&self, prompt_id: &str) -> Result<String, WatchError> {
        for attempt in 1..=self.resolve_attempts {
            match self.store.get_prompt(prompt_id).await? {
                Some(prompt) => {
                    if let Some(id) = prompt.response_id {
                        return Ok(id);
                    }
                    if prompt.failed {
                        return Err(WatchError::PromptFailed {
                            prompt_id: prompt_id.to_string(),
                            error: prompt.error.unwrap_or_default(),
                        });
                    }
                    if attempt == self.resolve_attempts {
                        return Err(WatchError::NoResponseAssigned(prompt_id.to_string()));
                    }
                }
                None if attempt == self.resolve_attempts => {
                    return Err(WatchError::PromptNotFound(prompt_id.to_string()));
                }
                None => {}
            }
            tokio::time::sleep(self.poll_interval).await;
        }
        Err(WatchError::NoResponseAssigned(prompt_id.to_string()))
    }

    /// Follow a prompt's response until it reaches its terminal state.
    ///
    /// `on_event` sees every token batch and the final event; the final event
    /// is also returned.
    pub async fn follow<F>(&self, prompt_id: &str, mut on_event: F) -> Result<WatchEvent, WatchError>
    where
        F: FnMut(&WatchEvent),
    {
        let response_id = self.resolve_response_id(prompt_id).await?;
        tracing::debug!(prompt_id, response_id = %response_id, "Following response");

        let mut seen = 0usize;
        let mut last_update = Instant::now();
        let mut missing_since: Option<Instant> = None;

        loop {
            match self.store.get_response(&response_id).await? {
                None => {
                    let since = *missing_since.get_or_insert_with(Instant::now);
                    if since.elapsed() > self.missing_response_grace {
                        return Err(WatchError::ResponseNotFound(response_id));
                    }
                }
                Some(response) => {
                    if response.tokens.len() > seen {
                        let event = WatchEvent::Tokens(response.tokens[seen..].to_vec());
                        seen = response.tokens.len();
                        last_update = Instant::now();
                        on_event(&event);
                    }

                    if response.complete {
                        let event = match response.error {
                            Some(error) => WatchEvent::Failed(error),
                            None => WatchEvent::Completed(response.full_response.unwrap_or_default()),
                        };
                        on_event(&event);
                        return Ok(event);
                    }
                }
            }

            if last_update.elapsed() > self.inactivity_timeout {
                return Err(WatchError::Inactive(self.inactivity_timeout));
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }
}
