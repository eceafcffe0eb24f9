use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::analysis::Mode;

pub mod alert;
pub mod incident;

#[derive(Debug, Clone, Copy)]
pub struct ToolContext {
    pub session_id: Uuid,
    pub mode: Mode,
}

/// Acknowledgment returned by a side-effect tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolResult {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolResult {
    pub fn ok(id: impl Into<String>) -> Self {
        Self { ok: true, id: Some(id.into()), error: None }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self { ok: false, id: None, error: Some(error.into()) }
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &'static str;
    async fn run(&self, ctx: ToolContext, args: Value) -> anyhow::Result<ToolResult>;
}

pub struct ToolRegistry {
    tools: Vec<Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self { Self { tools: Vec::new() } }
    pub fn with_default_tools() -> Self {
        let mut r = Self::new();
        r.register(Box::new(alert::SendAlertTool));
        r.register(Box::new(incident::LogIncidentTool));
        r
    }
    /// Later registrations shadow earlier ones with the same name.
    pub fn register(&mut self, t: Box<dyn Tool>) { self.tools.insert(0, t); }
    pub fn get(&self, name: &str) -> Option<&dyn Tool> {
        self.tools.iter().map(|b| b.as_ref()).find(|t| t.name() == name)
    }
    pub fn names(&self) -> Vec<&'static str> {
        self.tools.iter().map(|t| t.name()).collect()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self { Self::with_default_tools() }
}

/// Millisecond stamp used in mock acknowledgment ids.
pub(crate) fn mock_id(prefix: &str) -> String {
    format!("{prefix}-{}", chrono::Utc::now().timestamp_millis())
}
