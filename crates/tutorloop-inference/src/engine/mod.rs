//! Boundary to the text-generation backend.
//!
//! An engine runs on its own task and pushes fragments into a bounded
//! channel; the worker consumes them as they arrive. Failures travel through
//! the same channel so the consumer sees them in order with the fragments.

mod scripted;
mod server;

pub use scripted::ScriptedEngine;
pub use server::ServerEngine;

use crate::error::GenerationError;
use tokio::sync::mpsc;
use tutorloop_core::config::EngineSettings;

#[derive(Debug, Clone, PartialEq)]
pub struct StopSequences(Vec<String>);

impl StopSequences {
    pub fn new(sequences: Vec<String>) -> Self {
        Self(sequences.into_iter().filter(|s| !s.is_empty()).collect())
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    /// Whether generated text so far ends on a stop sequence.
    pub fn ends(&self, generated: &str) -> bool {
        self.0.iter().any(|s| generated.ends_with(s.as_str()))
    }

    /// Whether a single fragment contains any stop sequence.
    pub fn found_in(&self, fragment: &str) -> bool {
        self.0.iter().any(|s| fragment.contains(s.as_str()))
    }
}

#[derive(Debug, Clone)]
pub struct GenerationParams {
    pub max_new_tokens: u32,
    pub temperature: f32,
    pub sample: bool,
    pub stop: StopSequences,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self::from_settings(&EngineSettings::default())
    }
}

impl GenerationParams {
    pub fn from_settings(settings: &EngineSettings) -> Self {
        Self {
            max_new_tokens: settings.max_new_tokens,
            temperature: settings.temperature,
            sample: settings.sample,
            stop: StopSequences::new(settings.stop_sequences.clone()),
        }
    }

    /// Temperature actually sent to the backend; greedy when sampling is off.
    pub fn effective_temperature(&self) -> f32 {
        if self.sample {
            self.temperature
        } else {
            0.0
        }
    }
}

type FragmentItem = Result<String, GenerationError>;

/// Producer half of a fragment stream.
#[derive(Debug, Clone)]
pub struct FragmentSender {
    tx: mpsc::Sender<FragmentItem>,
}

impl FragmentSender {
    /// Wait for buffer space and hand over one fragment.
    pub async fn send(&self, fragment: impl Into<String>) -> Result<(), GenerationError> {
        self.tx
            .send(Ok(fragment.into()))
            .await
            .map_err(|_| GenerationError::ConsumerClosed)
    }

    /// Report a failure to the consumer. Ignored if it already hung up.
    pub async fn fail(&self, error: GenerationError) {
        let _ = self.tx.send(Err(error)).await;
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer half of a fragment stream. Ends when every sender is dropped.
#[derive(Debug)]
pub struct FragmentStream {
    rx: mpsc::Receiver<FragmentItem>,
}

impl FragmentStream {
    pub async fn next(&mut self) -> Option<FragmentItem> {
        self.rx.recv().await
    }
}

pub fn fragment_channel(capacity: usize) -> (FragmentSender, FragmentStream) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (FragmentSender { tx }, FragmentStream { rx })
}

/// A text-generation backend.
#[async_trait::async_trait]
pub trait GenerationEngine: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Generate a continuation of `prompt`, sending fragments to `sink` in
    /// order. Returning is the end-of-stream signal.
    async fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
        sink: &FragmentSender,
    ) -> Result<(), GenerationError>;

    async fn health_check(&self) -> Result<(), GenerationError> {
        Ok(())
    }

    async fn shutdown(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_sequences() {
        let stop = StopSequences::new(vec!["<|end|>".into(), "<|user|>".into(), String::new()]);
        assert_eq!(stop.as_slice().len(), 2);
        assert!(stop.ends("Good effort!<|end|>"));
        assert!(!stop.ends("Good <|end|> effort"));
        assert!(stop.found_in("x<|user|>y"));
        assert!(!stop.found_in("Good effort!"));
    }

    #[test]
    fn test_default_params() {
        let params = GenerationParams::default();
        assert_eq!(params.max_new_tokens, 300);
        assert!(params.sample);
        assert!((params.effective_temperature() - 0.7).abs() < f32::EPSILON);

        let greedy = GenerationParams {
            sample: false,
            ..params
        };
        assert_eq!(greedy.effective_temperature(), 0.0);
    }

    #[tokio::test]
    async fn test_channel_preserves_order_and_errors() {
        let (tx, mut rx) = fragment_channel(2);
        let producer = tokio::spawn(async move {
            for f in ["a", "b", "c"] {
                tx.send(f).await.unwrap();
            }
            tx.fail(GenerationError::Engine("boom".into())).await;
        });

        let mut got = Vec::new();
        let mut error = None;
        while let Some(item) = rx.next().await {
            match item {
                Ok(f) => got.push(f),
                Err(e) => error = Some(e.to_string()),
            }
        }
        producer.await.unwrap();
        assert_eq!(got, vec!["a", "b", "c"]);
        assert_eq!(error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_send_after_consumer_drop() {
        let (tx, rx) = fragment_channel(1);
        drop(rx);
        assert!(tx.is_closed());
        assert!(matches!(
            tx.send("late").await,
            Err(GenerationError::ConsumerClosed)
        ));
    }
}
