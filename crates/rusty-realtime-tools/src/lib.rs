//! Tools the model can call mid-conversation.
//!
//! Each tool implements the [`Tool`] trait and is registered in a
//! [`ToolRegistry`]. The [`ToolCallCoordinator`] runs calls requested by the
//! model and turns their results into protocol events.

pub mod coordinator;
pub mod web_search;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use rusty_realtime_core::config::ToolsConfig;
use rusty_realtime_core::types::ToolDefinition;

pub use coordinator::{ToolCallCoordinator, ToolResults};

/// Value returned by a tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolOutput {
    /// Structured result, sent to the model as JSON text.
    Json(serde_json::Value),
    /// Plain text, sent as-is.
    Text(String),
}

impl ToolOutput {
    /// Render the output as the text placed in a function call output item.
    pub fn into_text(self) -> String {
        match self {
            Self::Json(value) => serde_json::to_string(&value).unwrap_or_else(|_| value.to_string()),
            Self::Text(text) => text,
        }
    }
}

impl From<serde_json::Value> for ToolOutput {
    fn from(value: serde_json::Value) -> Self {
        Self::Json(value)
    }
}

impl From<String> for ToolOutput {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

/// The core tool trait. Every built-in tool implements this.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool name as exposed to the model (e.g. "web_search").
    fn name(&self) -> &str;

    /// Human-readable description for the model.
    fn description(&self) -> &str;

    /// JSON Schema describing the tool's parameters.
    fn parameters_schema(&self) -> serde_json::Value;

    /// Run the tool with already-parsed arguments.
    async fn invoke(&self, args: serde_json::Value) -> anyhow::Result<ToolOutput>;
}

/// Registry of available tools, keyed by unique name.
#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. A tool with the same name is replaced.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        if let Some(existing) = self.tools.iter_mut().find(|t| t.name() == tool.name()) {
            warn!(tool = tool.name(), "Replacing already registered tool");
            *existing = tool;
        } else {
            self.tools.push(tool);
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.name() == name).cloned()
    }

    pub fn list(&self) -> Vec<String> {
        self.tools.iter().map(|t| t.name().to_string()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Tool definitions for the `session.update` event.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .iter()
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters_schema(),
            })
            .collect()
    }
}

/// Register the built-in tools that are configured.
pub fn register_builtin_tools(registry: &mut ToolRegistry, config: &ToolsConfig) {
    match config.resolve_search_api_key() {
        Some(api_key) => {
            registry.register(Arc::new(web_search::WebSearchTool::new(
                api_key,
                config.search_api_url.clone(),
                config.max_results,
            )));
            info!("web_search tool registered");
        }
        None => warn!("No search API key configured, web_search tool disabled"),
    }
}
