use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ToolError {
    /// The tool ran (or was looked up) and failed. Recorded as call output.
    #[error("tool {tool_name} failed: {message}")]
    Execution { tool_name: String, message: String },
    /// The dispatcher itself could not be reached. Ends the tool loop.
    #[error("tool dispatcher unavailable: {message}")]
    Unavailable { message: String },
}

#[async_trait]
pub trait ToolDispatcher: Send + Sync {
    async fn dispatch(&self, tool_name: &str, arguments: &Value) -> Result<Value, ToolError>;
}

type ToolHandler = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, String>> + Send + Sync>;

/// In-process dispatcher mapping tool names to async handlers.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    handlers: HashMap<String, ToolHandler>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F, Fut>(&mut self, name: impl Into<String>, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, String>> + Send + 'static,
    {
        let handler: ToolHandler = Arc::new(move |arguments| Box::pin(handler(arguments)));
        self.handlers.insert(name.into(), handler);
    }
}

#[async_trait]
impl ToolDispatcher for ToolRegistry {
    async fn dispatch(&self, tool_name: &str, arguments: &Value) -> Result<Value, ToolError> {
        let handler = self
            .handlers
            .get(tool_name)
            .cloned()
            .ok_or_else(|| ToolError::Execution {
                tool_name: tool_name.to_string(),
                message: "unknown tool".to_string(),
            })?;
        handler(arguments.clone())
            .await
            .map_err(|message| ToolError::Execution {
                tool_name: tool_name.to_string(),
                message,
            })
    }
}
