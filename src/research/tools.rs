use std::collections::HashMap;

use async_trait::async_trait;
use reqwest::Client;

use crate::config::ToolsConfig;
use crate::error::{Error, Result};

/// Opaque search/tool capability (Yahoo Finance, TradingView, SEC EDGAR...).
///
/// The orchestrator does not interpret failures beyond "this sub-question
/// produced no usable result".
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    async fn invoke(&self, tool_name: &str, params: serde_json::Value)
    -> Result<serde_json::Value>;
}

/// Invokes MCP-style tool servers over HTTP JSON. Each tool name maps to a
/// configured endpoint; the request body is the raw params object.
pub struct HttpToolInvoker {
    client: Client,
    endpoints: HashMap<String, String>,
}

impl HttpToolInvoker {
    pub fn new(config: &ToolsConfig) -> Self {
        Self {
            client: Client::new(),
            endpoints: config.endpoints.clone(),
        }
    }
}

#[async_trait]
impl ToolInvoker for HttpToolInvoker {
    async fn invoke(
        &self,
        tool_name: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value> {
        let endpoint = self.endpoints.get(tool_name).ok_or_else(|| Error::Tool {
            tool: tool_name.to_string(),
            message: "no endpoint configured".into(),
        })?;

        let response = self
            .client
            .post(endpoint)
            .json(&params)
            .send()
            .await
            .map_err(|e| Error::Tool {
                tool: tool_name.to_string(),
                message: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(Error::Tool {
                tool: tool_name.to_string(),
                message: format!("status {}", response.status()),
            });
        }

        response.json().await.map_err(|e| Error::Tool {
            tool: tool_name.to_string(),
            message: format!("invalid JSON result: {e}"),
        })
    }
}
