use super::{FragmentSender, GenerationEngine, GenerationParams};
use crate::error::GenerationError;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tutorloop_core::config::EngineSettings;

/// Streams completions from an OpenAI-compatible inference server.
///
/// When `launch_server` is set, spawns `<launch_command> serve <model> --port
/// <port>` as a subprocess; otherwise expects a server to already be running
/// at `server_url`.
pub struct ServerEngine {
    model_id: String,
    server_url: String,
    http_client: reqwest::Client,
    server_handle: Option<Arc<Mutex<Option<tokio::process::Child>>>>,
}

impl ServerEngine {
    pub async fn new(settings: &EngineSettings) -> anyhow::Result<Self> {
        let server_handle = if settings.launch_server {
            match Self::start_server(settings) {
                Ok(child) => {
                    tracing::info!(
                        port = settings.server_port,
                        model = %settings.model,
                        "Inference server starting"
                    );
                    // Give the server time to bind its port
                    tokio::time::sleep(Duration::from_secs(3)).await;
                    Some(Arc::new(Mutex::new(Some(child))))
                }
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        "Could not start inference server; will connect to existing instance on {}",
                        settings.server_url
                    );
                    None
                }
            }
        } else {
            None
        };

        let engine = Self {
            model_id: settings.model.clone(),
            server_url: settings.server_url.trim_end_matches('/').to_string(),
            http_client: reqwest::Client::builder()
                .timeout(Duration::from_secs(settings.request_timeout_secs))
                .build()?,
            server_handle,
        };

        // Log whether the inference backend is reachable
        match engine.health_check().await {
            Ok(()) => tracing::info!(url = %engine.server_url, "Inference server is reachable"),
            Err(e) => tracing::warn!(
                url = %engine.server_url,
                error = %e,
                "Inference server not reachable yet"
            ),
        }

        Ok(engine)
    }

    fn start_server(settings: &EngineSettings) -> anyhow::Result<tokio::process::Child> {
        let child = tokio::process::Command::new(&settings.launch_command)
            .args([
                "serve",
                settings.model.as_str(),
                "--port",
                &settings.server_port.to_string(),
            ])
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        Ok(child)
    }

    fn request_body(&self, prompt: &str, params: &GenerationParams) -> serde_json::Value {
        serde_json::json!({
            "model": self.model_id,
            "prompt": prompt,
            "max_tokens": params.max_new_tokens,
            "temperature": params.effective_temperature(),
            "stop": params.stop.as_slice(),
            "stream": true
        })
    }
}

#[async_trait::async_trait]
impl GenerationEngine for ServerEngine {
    fn name(&self) -> &str {
        &self.model_id
    }

    async fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
        sink: &FragmentSender,
    ) -> Result<(), GenerationError> {
        let response = self
            .http_client
            .post(format!("{}/v1/completions", self.server_url))
            .json(&self.request_body(prompt, params))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(GenerationError::Status { status, body });
        }

        let mut body = response.bytes_stream();
        let mut buffer: Vec<u8> = Vec::new();
        let mut generated = String::new();

        while let Some(chunk) = body.next().await {
            buffer.extend_from_slice(&chunk?);

            // Only complete lines are decoded so multi-byte characters split
            // across chunks survive.
            while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&line);

                match parse_sse_line(&line)? {
                    SseLine::Done => return Ok(()),
                    SseLine::Ignore => {}
                    SseLine::Text(text) => {
                        if text.is_empty() {
                            continue;
                        }
                        generated.push_str(&text);
                        sink.send(text).await?;
                        if params.stop.ends(&generated) {
                            return Ok(());
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// 404 still means the server is up, just without `/v1/models`.
    async fn health_check(&self) -> Result<(), GenerationError> {
        let resp = self
            .http_client
            .get(format!("{}/v1/models", self.server_url))
            .timeout(Duration::from_secs(5))
            .send()
            .await?;
        if resp.status().is_success() || resp.status().as_u16() == 404 {
            Ok(())
        } else {
            Err(GenerationError::Status {
                status: resp.status().as_u16(),
                body: String::new(),
            })
        }
    }

    async fn shutdown(&self) {
        if let Some(handle) = &self.server_handle {
            if let Some(mut child) = handle.lock().await.take() {
                if let Err(e) = child.kill().await {
                    tracing::warn!(error = %e, "Failed to stop inference server");
                } else {
                    tracing::info!("Inference server stopped");
                }
            }
        }
    }
}

#[derive(Debug, PartialEq)]
enum SseLine {
    Text(String),
    Done,
    Ignore,
}

/// Decode one line of an OpenAI-style completion stream.
fn parse_sse_line(line: &str) -> Result<SseLine, GenerationError> {
    let line = line.trim();
    let Some(data) = line.strip_prefix("data:") else {
        return Ok(SseLine::Ignore);
    };
    let data = data.trim();
    if data == "[DONE]" {
        return Ok(SseLine::Done);
    }
    if data.is_empty() {
        return Ok(SseLine::Ignore);
    }

    let event: serde_json::Value =
        serde_json::from_str(data).map_err(|e| GenerationError::Decode(e.to_string()))?;

    if let Some(error) = event.get("error") {
        let message = error
            .get("message")
            .and_then(|m| m.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());
        return Err(GenerationError::Engine(message));
    }

    let choice = &event["choices"][0];
    let text = choice["text"]
        .as_str()
        .or_else(|| choice["delta"]["content"].as_str())
        .unwrap_or_default();
    Ok(SseLine::Text(text.to_string()))
}
