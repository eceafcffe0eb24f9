use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::analysis::{AnalysisResult, Mode, RiskLevel};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientStatus {
    #[default]
    Idle,
    Processing,
    Thinking,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogSource {
    User,
    System,
    Ai,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Safe,
    Warning,
    Danger,
    Info,
}

impl From<RiskLevel> for Severity {
    fn from(level: RiskLevel) -> Self {
        match level {
            RiskLevel::Safe => Severity::Safe,
            RiskLevel::Warning => Severity::Warning,
            RiskLevel::Danger => Severity::Danger,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LogMessage {
    Analysis(AnalysisResult),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub source: LogSource,
    pub severity: Severity,
    pub message: LogMessage,
    /// Base64 JPEG of the frame the result was computed from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
}

impl LogEntry {
    pub fn text(source: LogSource, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source,
            severity,
            message: LogMessage::Text(message.into()),
            thumbnail: None,
        }
    }

    pub fn system(severity: Severity, message: impl Into<String>) -> Self {
        Self::text(LogSource::System, severity, message)
    }

    /// A final result, tagged with its own risk level.
    pub fn analysis(result: AnalysisResult, thumbnail: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: LogSource::Ai,
            severity: result.risk_level.into(),
            message: LogMessage::Analysis(result),
            thumbnail,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match &self.message {
            LogMessage::Text(t) => Some(t),
            LogMessage::Analysis(_) => None,
        }
    }

    pub fn as_analysis(&self) -> Option<&AnalysisResult> {
        match &self.message {
            LogMessage::Analysis(r) => Some(r),
            LogMessage::Text(_) => None,
        }
    }
}

/// Point-in-time view of the live (or last) monitoring session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: Uuid,
    pub mode: Mode,
    pub created_at: DateTime<Utc>,
    pub running: bool,
    pub status: ClientStatus,
    pub requests_issued: u32,
    pub quota_ceiling: u32,
}
