use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use super::{Tool, ToolContext, ToolResult, mock_id};
use crate::analysis::AnalysisResult;

/// Mock incident recorder: validates the payload and traces it.
pub struct LogIncidentTool;

#[async_trait]
impl Tool for LogIncidentTool {
    fn name(&self) -> &'static str { "log_incident" }

    async fn run(&self, ctx: ToolContext, args: Value) -> anyhow::Result<ToolResult> {
        let timestamp = args.get("timestamp").and_then(|v| v.as_str()).ok_or_else(|| anyhow::anyhow!("missing timestamp"))?;
        let mode = args.get("mode").and_then(|v| v.as_str()).unwrap_or(ctx.mode.as_str());
        let analysis: AnalysisResult = serde_json::from_value(
            args.get("analysis").cloned().ok_or_else(|| anyhow::anyhow!("missing analysis"))?,
        )?;
        warn!(
            session = %ctx.session_id,
            timestamp,
            mode,
            risk = %analysis.risk_level,
            reason = %analysis.reason,
            "[mock] logging incident"
        );
        Ok(ToolResult::ok(mock_id("mock-incident")))
    }
}
