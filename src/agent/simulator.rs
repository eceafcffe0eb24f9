//! Offline stand-in for the model endpoint.
//!
//! Answers from scripted responses first, then from the current scene, a sticky risk
//! level that the server resets to safe whenever a session starts. Selecting
//! `provider = simulated` wires this in place of a network adapter so the escalation
//! and dispatch paths can be exercised without a camera or network.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use crate::analysis::{AnalysisResult, RiskLevel};
use crate::models::{ModelError, ModelRequest, ModelResponse, VisionModel};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimulatorAction {
    Safe,
    Warn,
    Danger,
    Quota,
}

impl SimulatorAction {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "safe" => Some(SimulatorAction::Safe),
            "warn" | "warning" => Some(SimulatorAction::Warn),
            "danger" => Some(SimulatorAction::Danger),
            "quota" => Some(SimulatorAction::Quota),
            _ => None,
        }
    }

    /// The scene this action selects; `None` for the quota action.
    pub fn scene(&self) -> Option<RiskLevel> {
        match self {
            SimulatorAction::Safe => Some(RiskLevel::Safe),
            SimulatorAction::Warn => Some(RiskLevel::Warning),
            SimulatorAction::Danger => Some(RiskLevel::Danger),
            SimulatorAction::Quota => None,
        }
    }
}

pub fn canned_result(level: RiskLevel) -> AnalysisResult {
    AnalysisResult {
        status: level.as_str().to_uppercase(),
        risk_level: level,
        reason: format!("Simulated {level} event for testing purposes."),
        suggestion: "Verify system response.".into(),
        confidence: match level {
            RiskLevel::Danger => 0.95,
            RiskLevel::Warning => 0.75,
            RiskLevel::Safe => 0.99,
        },
        audio_response: (level == RiskLevel::Danger)
            .then(|| "Warning. Danger detected. Please intervene immediately.".to_string()),
        reasoning_trace: Some(vec![
            "Visual: Motion detected in vertical axis.".into(),
            "Audio: Amplitude spike > -20dB detected.".into(),
            "Context: Subject posture matches 'fall' profile.".into(),
            "Conclusion: High probability of safety incident.".into(),
        ]),
    }
}

pub struct SimulatedModel {
    scene: Mutex<RiskLevel>,
    scripted: Mutex<VecDeque<String>>,
    seen: Mutex<Vec<ModelRequest>>,
    calls: AtomicUsize,
}

impl SimulatedModel {
    pub fn new() -> Self {
        Self {
            scene: Mutex::new(RiskLevel::Safe),
            scripted: Mutex::new(VecDeque::new()),
            seen: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn set_scene(&self, level: RiskLevel) {
        *self.scene.lock().unwrap_or_else(|p| p.into_inner()) = level;
    }

    pub fn scene(&self) -> RiskLevel {
        *self.scene.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Queues a raw reply, returned verbatim before any scene result.
    pub fn push_response(&self, raw: impl Into<String>) {
        self.scripted
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push_back(raw.into());
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Acquire)
    }

    pub fn requests(&self) -> Vec<ModelRequest> {
        self.seen.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

impl Default for SimulatedModel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VisionModel for SimulatedModel {
    fn name(&self) -> &str {
        "simulated"
    }

    async fn generate(&self, req: ModelRequest) -> Result<ModelResponse, ModelError> {
        self.calls.fetch_add(1, Ordering::AcqRel);
        self.seen
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(req);
        let scripted = self
            .scripted
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .pop_front();
        let content = match scripted {
            Some(raw) => raw,
            None => serde_json::to_string(&canned_result(self.scene()))
                .map_err(|err| ModelError::InvalidPart(err.to_string()))?,
        };
        Ok(ModelResponse {
            content,
            model: "simulated".into(),
        })
    }
}
