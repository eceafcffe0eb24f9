use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{error, info, warn};

use crate::session::{ClientStatus, LogEntry, LogMessage, Severity};

/// The only channel through which a session reports upward.
pub trait EventSink: Send + Sync {
    fn log(&self, entry: LogEntry);
    fn status_changed(&self, _status: ClientStatus) {}
    fn disconnected(&self) {}
}

/// Append-only log kept in creation order, plus the latest status.
#[derive(Debug, Default)]
pub struct MemoryLog {
    entries: Mutex<Vec<LogEntry>>,
    status: Mutex<ClientStatus>,
    disconnected: AtomicBool,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.since(0)
    }

    pub fn since(&self, index: usize) -> Vec<LogEntry> {
        let entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        entries.get(index..).map(<[LogEntry]>::to_vec).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn status(&self) -> ClientStatus {
        *self.status.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// True once a session has reported a forced disconnect. Cleared by the next start.
    pub fn was_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }

    pub fn clear_disconnected(&self) {
        self.disconnected.store(false, Ordering::Release);
    }
}

impl EventSink for MemoryLog {
    fn log(&self, entry: LogEntry) {
        self.entries
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(entry);
    }

    fn status_changed(&self, status: ClientStatus) {
        *self.status.lock().unwrap_or_else(|p| p.into_inner()) = status;
    }

    fn disconnected(&self) {
        self.disconnected.store(true, Ordering::Release);
    }
}

/// Renders entries as tracing events; used by the foreground `watch` command.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn log(&self, entry: LogEntry) {
        let source = format!("{:?}", entry.source).to_lowercase();
        match &entry.message {
            LogMessage::Text(text) => match entry.severity {
                Severity::Danger => error!(source = %source, "{text}"),
                Severity::Warning => warn!(source = %source, "{text}"),
                Severity::Safe | Severity::Info => info!(source = %source, "{text}"),
            },
            LogMessage::Analysis(result) => {
                let trace = result.reasoning_trace.as_deref().unwrap_or_default().join(" | ");
                let spoken = result.audio_response.as_deref().unwrap_or("");
                match entry.severity {
                    Severity::Danger => error!(
                        source = %source, risk = %result.risk_level, confidence = result.confidence,
                        reason = %result.reason, suggestion = %result.suggestion, trace = %trace, spoken,
                        "{}", result.status
                    ),
                    Severity::Warning => warn!(
                        source = %source, risk = %result.risk_level, confidence = result.confidence,
                        reason = %result.reason, suggestion = %result.suggestion, trace = %trace, spoken,
                        "{}", result.status
                    ),
                    Severity::Safe | Severity::Info => info!(
                        source = %source, risk = %result.risk_level, confidence = result.confidence,
                        reason = %result.reason, suggestion = %result.suggestion, trace = %trace, spoken,
                        "{}", result.status
                    ),
                }
            }
        }
    }

    fn status_changed(&self, status: ClientStatus) {
        tracing::debug!(?status, "status changed");
    }

    fn disconnected(&self) {
        warn!("session disconnected");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_log_keeps_creation_order() {
        let log = MemoryLog::new();
        log.log(LogEntry::system(Severity::Info, "one"));
        log.log(LogEntry::system(Severity::Info, "two"));
        log.log(LogEntry::system(Severity::Info, "three"));
        let texts: Vec<_> = log
            .entries()
            .iter()
            .map(|e| e.as_text().unwrap().to_string())
            .collect();
        assert_eq!(texts, ["one", "two", "three"]);
        assert_eq!(log.since(2).len(), 1);
        assert!(log.since(9).is_empty());
    }

    #[test]
    fn memory_log_tracks_status_and_disconnect() {
        let log = MemoryLog::new();
        assert_eq!(log.status(), ClientStatus::Idle);
        log.status_changed(ClientStatus::Thinking);
        assert_eq!(log.status(), ClientStatus::Thinking);
        assert!(!log.was_disconnected());
        log.disconnected();
        assert!(log.was_disconnected());
        log.clear_disconnected();
        assert!(!log.was_disconnected());
    }
}
