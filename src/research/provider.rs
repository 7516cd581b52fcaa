use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use tokio::sync::mpsc;
use tracing::debug;

use crate::config::LlmConfig;
use crate::error::{Error, Result};

/// Opaque LLM completion capability.
///
/// Implementations must surface a rejected temperature parameter as
/// `Error::TemperatureRejected` so the caller's one-shot retry shim can
/// strip it; every other provider failure is `Error::CompletionFailed`.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Single-shot completion, used for analysis/planning/gap steps.
    async fn complete(
        &self,
        messages: &[serde_json::Value],
        system: Option<&str>,
        temperature: Option<f32>,
    ) -> Result<String>;

    /// Streaming completion. Text fragments go out through `tx` as they
    /// arrive; the call returns once the provider stream ends.
    async fn complete_streaming(
        &self,
        messages: &[serde_json::Value],
        system: Option<&str>,
        temperature: Option<f32>,
        tx: mpsc::Sender<String>,
    ) -> Result<()>;
}

/// Stream a completion, retrying once without temperature if the provider
/// rejects the parameter. Rejection happens before any fragment is sent,
/// so the retry never duplicates output. A second rejection escalates to
/// `CompletionFailed`.
pub async fn complete_streaming_with_retry(
    provider: Arc<dyn CompletionProvider>,
    messages: Vec<serde_json::Value>,
    system: Option<String>,
    temperature: Option<f32>,
    tx: mpsc::Sender<String>,
) -> Result<()> {
    match provider
        .complete_streaming(&messages, system.as_deref(), temperature, tx.clone())
        .await
    {
        Err(Error::TemperatureRejected) => {
            debug!("provider rejected temperature, retrying without it");
            provider
                .complete_streaming(&messages, system.as_deref(), None, tx)
                .await
                .map_err(|e| match e {
                    Error::TemperatureRejected => {
                        Error::CompletionFailed("temperature rejected on retry".into())
                    }
                    other => other,
                })
        }
        other => other,
    }
}

/// Map a non-success provider response to an error, distinguishing the
/// temperature-rejection case by the error body.
fn classify_http_error(status: reqwest::StatusCode, body: &str) -> Error {
    if status.as_u16() == 400 && body.contains("temperature") {
        Error::TemperatureRejected
    } else {
        Error::CompletionFailed(format!("{status}: {body}"))
    }
}

pub struct AnthropicProvider {
    client: Client,
    api_key: String,
    model: String,
    max_tokens: u32,
}

impl AnthropicProvider {
    pub fn new(api_key: String, model: String, max_tokens: u32) -> Self {
        Self {
            client: Client::new(),
            api_key,
            model,
            max_tokens,
        }
    }

    fn body(
        &self,
        messages: &[serde_json::Value],
        system: Option<&str>,
        temperature: Option<f32>,
        stream: bool,
    ) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "messages": messages,
            "stream": stream,
        });
        if let Some(system) = system {
            body["system"] = serde_json::json!(system);
        }
        if let Some(temperature) = temperature {
            body["temperature"] = serde_json::json!(temperature);
        }
        body
    }

    async fn send(&self, body: &serde_json::Value) -> Result<reqwest::Response> {
        let response = self
            .client
            .post("https://api.anthropic.com/v1/messages")
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| Error::CompletionFailed(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(classify_http_error(status, &text));
        }
        Ok(response)
    }
}

#[async_trait]
impl CompletionProvider for AnthropicProvider {
    async fn complete(
        &self,
        messages: &[serde_json::Value],
        system: Option<&str>,
        temperature: Option<f32>,
    ) -> Result<String> {
        let body = self.body(messages, system, temperature, false);
        let response = self.send(&body).await?;
        let parsed: serde_json::Value = response
            .json()
            .await
            .map_err(|e| Error::CompletionFailed(e.to_string()))?;

        let text = parsed
            .get("content")
            .and_then(|c| c.as_array())
            .map(|blocks| {
                blocks
                    .iter()
                    .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();
        Ok(text)
    }

    async fn complete_streaming(
        &self,
        messages: &[serde_json::Value],
        system: Option<&str>,
        temperature: Option<f32>,
        tx: mpsc::Sender<String>,
    ) -> Result<()> {
        let body = self.body(messages, system, temperature, true);
        let response = self.send(&body).await?;

        let mut stream = response.bytes_stream();
        let mut buffer = String::new();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| Error::CompletionFailed(e.to_string()))?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            // Process complete SSE events
            while let Some(pos) = buffer.find("\n\n") {
                let event = buffer[..pos].to_string();
                buffer = buffer[pos + 2..].to_string();

                for line in event.lines() {
                    let Some(data) = line.strip_prefix("data: ") else {
                        continue;
                    };
                    let parsed: serde_json::Value = match serde_json::from_str(data) {
                        Ok(v) => v,
                        Err(e) => {
                            debug!("skipping unparseable SSE data: {e}");
                            continue;
                        }
                    };
                    if parsed.get("type").and_then(|t| t.as_str()) == Some("message_stop") {
                        return Ok(());
                    }
                    if let Some(text) = parsed
                        .get("delta")
                        .and_then(|d| d.get("text"))
                        .and_then(|t| t.as_str())
                    {
                        if tx.send(text.to_string()).await.is_err() {
                            return Err(Error::Cancelled);
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

pub struct OpenAiProvider {
    client: Client,
    api_key: String,
    model: String,
    max_tokens: u32,
}

impl OpenAiProvider {
    pub fn new(api_key: String, model: String, max_tokens: u32) -> Self {
        Self {
            client: Client::new(),
            api_key,
            model,
            max_tokens,
        }
    }

    fn body(
        &self,
        messages: &[serde_json::Value],
        system: Option<&str>,
        temperature: Option<f32>,
        stream: bool,
    ) -> serde_json::Value {
        // OpenAI carries the system prompt as a leading message
        let mut all_messages = Vec::new();
        if let Some(system) = system {
            all_messages.push(serde_json::json!({
                "role": "system",
                "content": system,
            }));
        }
        all_messages.extend_from_slice(messages);

        let mut body = serde_json::json!({
            "model": self.model,
            "messages": all_messages,
            "max_tokens": self.max_tokens,
            "stream": stream,
        });
        if let Some(temperature) = temperature {
            body["temperature"] = serde_json::json!(temperature);
        }
        body
    }

    async fn send(&self, body: &serde_json::Value) -> Result<reqwest::Response> {
        let response = self
            .client
            .post("https://api.openai.com/v1/chat/completions")
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("content-type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| Error::CompletionFailed(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(classify_http_error(status, &text));
        }
        Ok(response)
    }
}

#[async_trait]
impl CompletionProvider for OpenAiProvider {
    async fn complete(
        &self,
        messages: &[serde_json::Value],
        system: Option<&str>,
        temperature: Option<f32>,
    ) -> Result<String> {
        let body = self.body(messages, system, temperature, false);
        let response = self.send(&body).await?;
        let parsed: serde_json::Value = response
            .json()
            .await
            .map_err(|e| Error::CompletionFailed(e.to_string()))?;

        let text = parsed
            .get("choices")
            .and_then(|c| c.as_array())
            .and_then(|c| c.first())
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|t| t.as_str())
            .unwrap_or_default()
            .to_string();
        Ok(text)
    }

    async fn complete_streaming(
        &self,
        messages: &[serde_json::Value],
        system: Option<&str>,
        temperature: Option<f32>,
        tx: mpsc::Sender<String>,
    ) -> Result<()> {
        let body = self.body(messages, system, temperature, true);
        let response = self.send(&body).await?;

        let mut stream = response.bytes_stream();
        let mut buffer = String::new();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| Error::CompletionFailed(e.to_string()))?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(pos) = buffer.find("\n\n") {
                let event = buffer[..pos].to_string();
                buffer = buffer[pos + 2..].to_string();

                let Some(data) = event.strip_prefix("data: ") else {
                    continue;
                };
                if data == "[DONE]" {
                    return Ok(());
                }
                let parsed: serde_json::Value = match serde_json::from_str(data) {
                    Ok(v) => v,
                    Err(_) => continue,
                };
                if let Some(text) = parsed
                    .get("choices")
                    .and_then(|c| c.as_array())
                    .and_then(|c| c.first())
                    .and_then(|c| c.get("delta"))
                    .and_then(|d| d.get("content"))
                    .and_then(|t| t.as_str())
                {
                    if tx.send(text.to_string()).await.is_err() {
                        return Err(Error::Cancelled);
                    }
                }
            }
        }
        Ok(())
    }
}

/// Create a provider from config.
pub fn from_config(config: &LlmConfig) -> anyhow::Result<Arc<dyn CompletionProvider>> {
    let api_key = config.api_key.clone().ok_or_else(|| {
        anyhow::anyhow!(
            "no API key for provider '{}'. Set {} env var.",
            config.provider,
            match config.provider.as_str() {
                "anthropic" => "ANTHROPIC_API_KEY",
                "openai" => "OPENAI_API_KEY",
                _ => "the appropriate API key",
            }
        )
    })?;

    match config.provider.as_str() {
        "anthropic" => Ok(Arc::new(AnthropicProvider::new(
            api_key,
            config.model.clone(),
            config.max_tokens,
        ))),
        "openai" => Ok(Arc::new(OpenAiProvider::new(
            api_key,
            config.model.clone(),
            config.max_tokens,
        ))),
        other => anyhow::bail!("unknown provider: {other}"),
    }
}
