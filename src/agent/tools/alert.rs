use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use super::{Tool, ToolContext, ToolResult, mock_id};

/// Mock SMS gateway. Nothing leaves the process.
pub struct SendAlertTool;

#[async_trait]
impl Tool for SendAlertTool {
    fn name(&self) -> &'static str { "send_alert" }

    async fn run(&self, ctx: ToolContext, args: Value) -> anyhow::Result<ToolResult> {
        let channel = args.get("channel").and_then(|v| v.as_str()).ok_or_else(|| anyhow::anyhow!("missing channel"))?;
        let message = args.get("message").and_then(|v| v.as_str()).ok_or_else(|| anyhow::anyhow!("missing message"))?;
        warn!(session = %ctx.session_id, channel, message, "[mock] sending sms");
        Ok(ToolResult::ok(mock_id("mock-sms")))
    }
}
