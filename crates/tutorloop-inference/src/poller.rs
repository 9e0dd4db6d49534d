use crate::error::PollingError;
use crate::worker::{Job, TurnOutcome, Worker};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tutorloop_core::config::PollerSettings;
use tutorloop_core::{new_record_id, Datastore};

/// Recently dispatched prompt ids, oldest first. Once it grows past
/// `capacity` it is trimmed back to the newest `retain` entries.
#[derive(Debug)]
pub struct DedupSet {
    order: VecDeque<String>,
    members: HashSet<String>,
    capacity: usize,
    retain: usize,
}

impl DedupSet {
    pub fn new(capacity: usize, retain: usize) -> Self {
        Self {
            order: VecDeque::new(),
            members: HashSet::new(),
            capacity,
            retain: retain.min(capacity),
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.members.contains(id)
    }

    /// Returns false if the id was already tracked.
    pub fn insert(&mut self, id: String) -> bool {
        if !self.members.insert(id.clone()) {
            return false;
        }
        self.order.push_back(id);

        if self.order.len() > self.capacity {
            while self.order.len() > self.retain {
                if let Some(old) = self.order.pop_front() {
                    self.members.remove(&old);
                }
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Result of one pass over the prompt queue.
#[derive(Debug, Default)]
pub struct SweepReport {
    pub dispatched: Vec<JoinHandle<TurnOutcome>>,
    /// Already tracked or claimed elsewhere.
    pub skipped: usize,
    /// Left for a later sweep because every worker slot was busy.
    pub deferred: usize,
}

/// Watches the prompt queue and hands each new prompt to a worker task.
pub struct Poller {
    store: Arc<dyn Datastore>,
    worker: Arc<Worker>,
    interval: Duration,
    seen: DedupSet,
    slots: Arc<Semaphore>,
}

impl Poller {
    pub fn new(store: Arc<dyn Datastore>, worker: Arc<Worker>, settings: &PollerSettings) -> Self {
        Self {
            store,
            worker,
            interval: Duration::from_millis(settings.interval_ms),
            seen: DedupSet::new(settings.dedup_capacity, settings.dedup_retain),
            slots: Arc::new(Semaphore::new(settings.max_workers.max(1))),
        }
    }

    /// Number of prompt ids currently remembered.
    pub fn tracked(&self) -> usize {
        self.seen.len()
    }

    pub fn idle_workers(&self) -> usize {
        self.slots.available_permits()
    }

    /// Claim and dispatch every unseen pending prompt, oldest first.
    pub async fn sweep(&mut self) -> Result<SweepReport, PollingError> {
        let pending = self
            .store
            .pending_prompts()
            .await
            .map_err(PollingError::Query)?;

        let mut report = SweepReport::default();

        for (idx, prompt) in pending.iter().enumerate() {
            if self.seen.contains(&prompt.id) {
                report.skipped += 1;
                continue;
            }

            let permit = match self.slots.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    report.deferred = pending[idx..]
                        .iter()
                        .filter(|p| !self.seen.contains(&p.id))
                        .count();
                    tracing::debug!(deferred = report.deferred, "All workers busy");
                    break;
                }
            };

            let response_id = new_record_id();
            match self.store.claim_prompt(&prompt.id, &response_id).await {
                Ok(true) => {}
                Ok(false) => {
                    self.seen.insert(prompt.id.clone());
                    report.skipped += 1;
                    continue;
                }
                Err(e) => {
                    // Not retried: a prompt that cannot be claimed would fail every sweep.
                    tracing::error!(prompt_id = %prompt.id, error = %e, "Failed to claim prompt");
                    self.seen.insert(prompt.id.clone());
                    if let Err(e) = self
                        .store
                        .fail_prompt(&prompt.id, &format!("could not claim prompt: {}", e))
                        .await
                    {
                        tracing::warn!(prompt_id = %prompt.id, error = %e, "Could not mark prompt as failed");
                    }
                    report.skipped += 1;
                    continue;
                }
            }
            self.seen.insert(prompt.id.clone());

            tracing::info!(
                prompt_id = %prompt.id,
                user_id = %prompt.user_id,
                response_id = %response_id,
                "Processing new prompt: {}...",
                preview(&prompt.message)
            );

            let job = Job {
                prompt_id: prompt.id.clone(),
                user_id: prompt.user_id.clone(),
                message: prompt.message.clone(),
                response_id,
            };
            let worker = self.worker.clone();
            report.dispatched.push(tokio::spawn(async move {
                let _permit = permit;
                worker.run(job).await
            }));
        }

        Ok(report)
    }

    /// Poll until a shutdown signal arrives. In-flight workers are left to
    /// finish on their own.
    pub async fn run(mut self, mut shutdown: tokio::sync::broadcast::Receiver<()>) -> anyhow::Result<()> {
        tracing::info!(
            store = self.store.name(),
            interval_ms = self.interval.as_millis() as u64,
            "Poller started, watching for prompts"
        );

        loop {
            match self.sweep().await {
                Ok(report) => {
                    if !report.dispatched.is_empty() || report.deferred > 0 {
                        tracing::debug!(
                            dispatched = report.dispatched.len(),
                            deferred = report.deferred,
                            tracked = self.seen.len(),
                            "Sweep finished"
                        );
                    }
                }
                Err(e) => tracing::error!(error = %e, "Error polling for prompts"),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = shutdown.recv() => {
                    tracing::info!("Poller shutting down");
                    break;
                }
            }
        }

        Ok(())
    }
}

fn preview(message: &str) -> String {
    message.chars().take(50).collect()
}
