use crate::engine::{fragment_channel, GenerationEngine, GenerationParams};
use crate::error::{GenerationError, StreamingError, TurnError};
use crate::formatter::{PromptFormatter, ASSISTANT_MARKER, END_MARKER, USER_MARKER};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tutorloop_core::config::WorkerSettings;
use tutorloop_core::{Datastore, HistoryMessage};

/// One dispatched prompt.
#[derive(Debug, Clone)]
pub struct Job {
    pub prompt_id: String,
    pub user_id: String,
    pub message: String,
    pub response_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    Completed {
        response_id: String,
        full_response: String,
    },
    Failed {
        response_id: String,
        error: String,
    },
}

impl TurnOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, TurnOutcome::Completed { .. })
    }
}

/// One async mutex per user id, so turns for the same user never interleave
/// their history updates.
#[derive(Clone, Default)]
pub struct UserLocks {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl UserLocks {
    pub async fn lock(&self, user_id: &str) -> UserTurn {
        let lock = self.locks.entry(user_id.to_string()).or_default().clone();
        UserTurn {
            guard: Some(lock.lock_owned().await),
            user_id: user_id.to_string(),
            locks: self.locks.clone(),
        }
    }

    /// Users with a turn running or waiting.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Held for the duration of one turn. Dropping the last turn for a user
/// removes that user's entry.
pub struct UserTurn {
    guard: Option<OwnedMutexGuard<()>>,
    user_id: String,
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl Drop for UserTurn {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Waiters hold their own clone, so the count only reaches 1 when idle.
        self.locks
            .remove_if(&self.user_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// Runs a single prompt end to end: history, formatting, generation,
/// token streaming and finalization.
pub struct Worker {
    store: Arc<dyn Datastore>,
    engine: Arc<dyn GenerationEngine>,
    formatter: PromptFormatter,
    params: GenerationParams,
    typing_delay: Duration,
    fragment_buffer: usize,
    user_locks: Option<UserLocks>,
}

impl Worker {
    pub fn new(
        store: Arc<dyn Datastore>,
        engine: Arc<dyn GenerationEngine>,
        formatter: PromptFormatter,
        params: GenerationParams,
        settings: &WorkerSettings,
    ) -> Self {
        Self {
            store,
            engine,
            formatter,
            params,
            typing_delay: Duration::from_millis(settings.typing_delay_ms),
            fragment_buffer: settings.fragment_buffer,
            user_locks: settings.serialize_per_user.then(UserLocks::default),
        }
    }

    /// Handle a job. Errors never escape: they are logged and written to the
    /// response record.
    pub async fn run(&self, job: Job) -> TurnOutcome {
        let started = Instant::now();

        match self.run_turn(&job).await {
            Ok(full_response) => {
                tracing::info!(
                    prompt_id = %job.prompt_id,
                    user_id = %job.user_id,
                    response_id = %job.response_id,
                    len = full_response.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Response ready"
                );
                TurnOutcome::Completed {
                    response_id: job.response_id,
                    full_response,
                }
            }
            Err(e) => {
                let error = e.to_string();
                tracing::error!(
                    prompt_id = %job.prompt_id,
                    user_id = %job.user_id,
                    response_id = %job.response_id,
                    error = %error,
                    "Turn failed"
                );
                self.record_failure(&job, &error).await;
                TurnOutcome::Failed {
                    response_id: job.response_id,
                    error,
                }
            }
        }
    }

    async fn run_turn(&self, job: &Job) -> Result<String, TurnError> {
        // Observers can find the response before the turn acquires the user lock.
        self.store
            .create_response(&job.response_id, &job.user_id)
            .await?;

        let _turn = match &self.user_locks {
            Some(locks) => Some(locks.lock(&job.user_id).await),
            None => None,
        };

        let history = self.store.load_history(&job.user_id).await?;
        let message = self.formatter.sanitize(&job.message);
        if message != job.message {
            tracing::info!(prompt_id = %job.prompt_id, "Cleaned user message: {}", message);
        }

        let prompt = self.formatter.format(&history.messages, &message)?;
        tracing::debug!(
            prompt_id = %job.prompt_id,
            history = history.messages.len(),
            chars = prompt.len(),
            "Prompt formatted"
        );

        self.store
            .append_message(&job.user_id, HistoryMessage::user(message))
            .await?;

        let fragments = self.stream_fragments(job, prompt).await?;
        let full_response = clean_response(&fragments.concat());

        self.store
            .append_message(&job.user_id, HistoryMessage::assistant(full_response.clone()))
            .await
            .map_err(StreamingError::Finalize)?;
        self.store
            .finish_response(&job.response_id, &full_response)
            .await
            .map_err(StreamingError::Finalize)?;
        self.store
            .complete_prompt(&job.prompt_id, &job.response_id)
            .await
            .map_err(StreamingError::Finalize)?;

        Ok(full_response)
    }

    /// Drive the engine on its own task and persist fragments as they arrive.
    /// Returns the fragments that were kept.
    async fn stream_fragments(&self, job: &Job, prompt: String) -> Result<Vec<String>, TurnError> {
        let (sink, mut stream) = fragment_channel(self.fragment_buffer);
        let engine = self.engine.clone();
        let params = self.params.clone();

        let producer = tokio::spawn(async move {
            if let Err(e) = engine.generate(&prompt, &params, &sink).await {
                if !matches!(e, GenerationError::ConsumerClosed) {
                    sink.fail(e).await;
                }
            }
        });

        let mut kept = Vec::new();
        let mut stopped = false;

        while let Some(item) = stream.next().await {
            let fragment = item?;

            // Best effort: the whole fragment holding a stop marker is dropped.
            if self.params.stop.found_in(&fragment) {
                tracing::info!(
                    response_id = %job.response_id,
                    "Stopping generation due to stop word in: {}",
                    fragment
                );
                stopped = true;
                break;
            }

            self.store
                .append_token(&job.response_id, &fragment)
                .await
                .map_err(StreamingError::Persist)?;
            kept.push(fragment);

            if !self.typing_delay.is_zero() {
                tokio::time::sleep(self.typing_delay).await;
            }
        }

        // Closing our end makes the producer's next send fail, ending it.
        drop(stream);

        if !stopped {
            if let Err(e) = producer.await {
                return Err(GenerationError::Panicked(e.to_string()).into());
            }
        }

        Ok(kept)
    }

    async fn record_failure(&self, job: &Job, error: &str) {
        if let Err(e) = self.store.fail_response(&job.response_id, error).await {
            tracing::warn!(
                response_id = %job.response_id,
                error = %e,
                "Could not record error on response"
            );
        }
        if let Err(e) = self.store.fail_prompt(&job.prompt_id, error).await {
            tracing::warn!(
                prompt_id = %job.prompt_id,
                error = %e,
                "Could not mark prompt as failed"
            );
        }
    }
}

/// Tidy the concatenated fragments into the final assistant message.
///
/// Cuts at the first end marker, drops a leading assistant marker, and if
/// turn markers still leaked through keeps only the assistant's own text.
pub fn clean_response(raw: &str) -> String {
    let mut response = match raw.find(END_MARKER) {
        Some(idx) => raw[..idx].trim().to_string(),
        None => raw.to_string(),
    };

    let trimmed = response.trim_start();
    response = trimmed
        .strip_prefix(ASSISTANT_MARKER)
        .unwrap_or(trimmed)
        .trim()
        .to_string();

    if response.contains(USER_MARKER) || response.contains(ASSISTANT_MARKER) {
        tracing::info!("Cleaning response to remove markers");
        let before_user = response
            .split(USER_MARKER)
            .next()
            .unwrap_or_default()
            .trim()
            .to_string();
        response = match before_user.split_once(ASSISTANT_MARKER) {
            Some((_, after)) => after.trim().to_string(),
            None => before_user,
        };
    }

    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{FragmentSender, ScriptedEngine};
    use tutorloop_core::{MemoryStore, PromptRecord, Role};

    fn instant_settings() -> WorkerSettings {
        WorkerSettings {
            typing_delay_ms: 0,
            ..Default::default()
        }
    }

    fn worker_with(store: Arc<MemoryStore>, engine: Arc<dyn GenerationEngine>) -> Worker {
        Worker::new(
            store,
            engine,
            PromptFormatter::new("You are Emma, a friendly AI English conversation partner."),
            GenerationParams::default(),
            &instant_settings(),
        )
    }

    async fn queue_prompt(store: &MemoryStore, user_id: &str, message: &str) -> Job {
        let prompt = PromptRecord::new(user_id, message);
        store.insert_prompt(&prompt).await.unwrap();
        let response_id = tutorloop_core::new_record_id();
        assert!(store.claim_prompt(&prompt.id, &response_id).await.unwrap());
        Job {
            prompt_id: prompt.id,
            user_id: user_id.to_string(),
            message: message.to_string(),
            response_id,
        }
    }

    #[tokio::test]
    async fn test_first_turn_end_to_end() {
        let store = Arc::new(MemoryStore::new());
        let engine = Arc::new(ScriptedEngine::new(["Good", " effort!", "<|end|>"]));
        let worker = worker_with(store.clone(), engine.clone());

        let job = queue_prompt(&store, "u1", "Yesterday I go to park").await;
        let outcome = worker.run(job.clone()).await;
        assert_eq!(
            outcome,
            TurnOutcome::Completed {
                response_id: job.response_id.clone(),
                full_response: "Good effort!".into(),
            }
        );

        let response = store.get_response(&job.response_id).await.unwrap().unwrap();
        assert_eq!(response.tokens, vec!["Good", " effort!"]);
        assert!(response.complete);
        assert_eq!(response.full_response.as_deref(), Some("Good effort!"));
        assert!(response.error.is_none());

        let history = store.load_history("u1").await.unwrap();
        assert_eq!(history.messages.len(), 2);
        assert_eq!(history.messages[0].role, Role::User);
        assert_eq!(history.messages[0].content, "Yesterday I go to park");
        assert_eq!(history.messages[1].role, Role::Assistant);
        assert_eq!(history.messages[1].content, "Good effort!");

        let prompt = store.get_prompt(&job.prompt_id).await.unwrap().unwrap();
        assert!(prompt.processed);
        assert!(!prompt.processing);
        assert_eq!(prompt.response_id.as_deref(), Some(job.response_id.as_str()));

        let sent = engine.prompts();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].contains("You are Emma"));
        assert!(sent[0].contains("<|user|>\nYesterday I go to park<|end|>"));
        assert!(sent[0].ends_with("<|assistant|>"));
    }

    #[tokio::test]
    async fn test_second_turn_sees_history() {
        let store = Arc::new(MemoryStore::new());
        let engine = Arc::new(ScriptedEngine::new(["Nice!", "<|end|>"]));
        let worker = worker_with(store.clone(), engine.clone());

        let first = queue_prompt(&store, "u1", "She is doctor").await;
        worker.run(first).await;
        let second = queue_prompt(&store, "u1", "Me want to going store").await;
        worker.run(second).await;

        let sent = engine.prompts();
        assert!(sent[1].contains("<|user|>\nShe is doctor<|end|>"));
        assert!(sent[1].contains("<|assistant|>\nNice!<|end|>"));
        assert_eq!(store.load_history("u1").await.unwrap().messages.len(), 4);
    }

    #[tokio::test]
    async fn test_generation_error_mid_stream() {
        let store = Arc::new(MemoryStore::new());
        let engine = Arc::new(ScriptedEngine::new(["Good", " effort!"]).failing_at(1, "device lost"));
        let worker = worker_with(store.clone(), engine);

        let job = queue_prompt(&store, "u1", "Yesterday I go to park").await;
        let outcome = worker.run(job.clone()).await;
        assert!(!outcome.is_completed());

        let response = store.get_response(&job.response_id).await.unwrap().unwrap();
        assert!(response.complete);
        assert_eq!(response.tokens, vec!["Good"]);
        assert!(response.full_response.is_none());
        assert_eq!(
            response.error.as_deref(),
            Some("Generation error: device lost")
        );

        let history = store.load_history("u1").await.unwrap();
        assert_eq!(history.messages.len(), 1);
        assert_eq!(history.messages[0].role, Role::User);

        let prompt = store.get_prompt(&job.prompt_id).await.unwrap().unwrap();
        assert!(!prompt.processed);
        assert!(!prompt.processing);
        assert!(prompt.failed);
    }

    #[tokio::test]
    async fn test_formatting_error_skips_engine() {
        let store = Arc::new(MemoryStore::new());
        let engine = Arc::new(ScriptedEngine::new(["unused"]));
        let worker = worker_with(store.clone(), engine.clone());

        let job = queue_prompt(&store, "u1", "<|user|>  <|end|>").await;
        let outcome = worker.run(job.clone()).await;
        assert!(!outcome.is_completed());
        assert!(engine.prompts().is_empty());

        let response = store.get_response(&job.response_id).await.unwrap().unwrap();
        assert!(response.complete);
        assert!(response.tokens.is_empty());
        assert!(response
            .error
            .as_deref()
            .unwrap_or_default()
            .starts_with("Formatting error"));
        assert!(store.load_history("u1").await.unwrap().messages.is_empty());
    }

    #[tokio::test]
    async fn test_fragments_keep_engine_order() {
        let store = Arc::new(MemoryStore::new());
        let fragments: Vec<String> = (0..40).map(|i| format!("[{}]", i)).collect();
        let engine = Arc::new(ScriptedEngine::new(fragments.clone()));
        let worker = Worker::new(
            store.clone(),
            engine,
            PromptFormatter::new("SYS"),
            GenerationParams::default(),
            &WorkerSettings {
                typing_delay_ms: 0,
                fragment_buffer: 1,
                serialize_per_user: true,
            },
        );

        let job = queue_prompt(&store, "u1", "count").await;
        worker.run(job.clone()).await;
        let response = store.get_response(&job.response_id).await.unwrap().unwrap();
        assert_eq!(response.tokens, fragments);
        assert_eq!(response.full_response.unwrap(), fragments.concat());
    }

    #[tokio::test]
    async fn test_same_user_turns_do_not_interleave() {
        let store = Arc::new(MemoryStore::new());
        let engine = Arc::new(
            ScriptedEngine::new(["a", "b", "c"]).with_delay(Duration::from_millis(5)),
        );
        let worker = Arc::new(worker_with(store.clone(), engine));

        let first = queue_prompt(&store, "u1", "first").await;
        let second = queue_prompt(&store, "u1", "second").await;
        let w1 = worker.clone();
        let w2 = worker.clone();
        let (a, b) = tokio::join!(
            tokio::spawn(async move { w1.run(first).await }),
            tokio::spawn(async move { w2.run(second).await })
        );
        assert!(a.unwrap().is_completed());
        assert!(b.unwrap().is_completed());

        let roles: Vec<Role> = store
            .load_history("u1")
            .await
            .unwrap()
            .messages
            .iter()
            .map(|m| m.role)
            .collect();
        assert_eq!(
            roles,
            vec![Role::User, Role::Assistant, Role::User, Role::Assistant]
        );
    }

    struct PanickingEngine;

    #[async_trait::async_trait]
    impl GenerationEngine for PanickingEngine {
        fn name(&self) -> &str {
            "panicking"
        }

        async fn generate(
            &self,
            _prompt: &str,
            _params: &GenerationParams,
            sink: &FragmentSender,
        ) -> Result<(), GenerationError> {
            sink.send("partial").await?;
            panic!("kernel fault");
        }
    }

    #[tokio::test]
    async fn test_engine_panic_fails_turn() {
        let store = Arc::new(MemoryStore::new());
        let worker = worker_with(store.clone(), Arc::new(PanickingEngine));

        let job = queue_prompt(&store, "u1", "hello").await;
        let outcome = worker.run(job.clone()).await;
        match outcome {
            TurnOutcome::Failed { error, .. } => assert!(error.contains("panicked")),
            other => panic!("unexpected outcome: {:?}", other),
        }
        let response = store.get_response(&job.response_id).await.unwrap().unwrap();
        assert!(response.full_response.is_none());
        assert!(response.complete);
    }

    #[tokio::test]
    async fn test_user_locks_are_released_after_turns() {
        let locks = UserLocks::default();

        let first = locks.lock("u1").await;
        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _turn = locks.lock("u1").await;
            })
        };
        let second = locks.lock("u2").await;
        assert_eq!(locks.len(), 2);

        drop(first);
        waiter.await.unwrap();
        // u1's entry goes with its last turn; u2 is still held.
        assert_eq!(locks.len(), 1);

        drop(second);
        assert!(locks.is_empty());

        for i in 0..50 {
            drop(locks.lock(&format!("user-{}", i)).await);
        }
        assert!(locks.is_empty());
    }

    #[test]
    fn test_clean_response() {
        assert_eq!(clean_response("Good effort!"), "Good effort!");
        assert_eq!(clean_response("Good effort!<|end|>junk"), "Good effort!");
        assert_eq!(clean_response("<|assistant|> Hi there"), "Hi there");
        assert_eq!(
            clean_response("Sure thing.<|user|>What about me?"),
            "Sure thing."
        );
        assert_eq!(
            clean_response("preamble<|assistant|>Real answer"),
            "Real answer"
        );
    }
}
