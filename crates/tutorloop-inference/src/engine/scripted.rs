use super::{FragmentSender, GenerationEngine, GenerationParams};
use crate::error::GenerationError;
use std::sync::Mutex;
use std::time::Duration;

/// Replays a fixed list of fragments. Stands in for a model server in tests
/// and dry runs.
pub struct ScriptedEngine {
    fragments: Vec<String>,
    fail_at: Option<(usize, String)>,
    delay: Duration,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedEngine {
    pub fn new<I, S>(fragments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fragments: fragments.into_iter().map(Into::into).collect(),
            fail_at: None,
            delay: Duration::ZERO,
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Fail with `message` instead of emitting the fragment at `index`.
    pub fn failing_at(mut self, index: usize, message: impl Into<String>) -> Self {
        self.fail_at = Some((index, message.into()));
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Prompts received so far, in call order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts
            .lock()
            .map(|p| p.clone())
            .unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl GenerationEngine for ScriptedEngine {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
        sink: &FragmentSender,
    ) -> Result<(), GenerationError> {
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(prompt.to_string());
        }

        let mut generated = String::new();
        for (i, fragment) in self.fragments.iter().enumerate() {
            if let Some((at, message)) = &self.fail_at {
                if *at == i {
                    return Err(GenerationError::Engine(message.clone()));
                }
            }
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            sink.send(fragment.as_str()).await?;
            generated.push_str(fragment);
            if params.stop.ends(&generated) {
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::fragment_channel;

    #[tokio::test]
    async fn test_stops_after_stop_sequence() {
        let engine = ScriptedEngine::new(["Good", "<|end|>", "never"]);
        let (tx, mut rx) = fragment_channel(8);
        engine
            .generate("prompt", &GenerationParams::default(), &tx)
            .await
            .unwrap();
        drop(tx);

        let mut got = Vec::new();
        while let Some(Ok(f)) = rx.next().await {
            got.push(f);
        }
        assert_eq!(got, vec!["Good", "<|end|>"]);
        assert_eq!(engine.prompts(), vec!["prompt"]);
    }

    #[tokio::test]
    async fn test_failure_at_index() {
        let engine = ScriptedEngine::new(["a", "b"]).failing_at(1, "device lost");
        let (tx, _rx) = fragment_channel(8);
        let err = engine
            .generate("p", &GenerationParams::default(), &tx)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "device lost");
    }
}
