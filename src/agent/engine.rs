use std::sync::Arc;

use chrono::Utc;
use metrics::counter;
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::agent::tools::{ToolContext, ToolRegistry};
use crate::analysis::{AnalysisResult, Mode, Pass, RiskLevel, compose_instruction, parse_analysis};
use crate::audio::AudioClip;
use crate::events::EventSink;
use crate::frame::Frame;
use crate::models::{ModelError, ModelRequest, ModelResponse, VisionModel};
use crate::quota::QuotaGuard;
use crate::session::{ClientStatus, LogEntry, LogSource, Severity};
use crate::settings::ModelParams;

pub const ALERT_CHANNEL: &str = "911";
pub const ESCALATION_NOTICE: &str =
    "High confidence threat detected. Escalating to deep thinking analysis...";

/// Everything one tick needs to run the escalation policy.
#[derive(Clone)]
pub struct AgentContext {
    pub session_id: Uuid,
    pub mode: Mode,
    pub params: ModelParams,
    pub model: Arc<dyn VisionModel>,
    pub sink: Arc<dyn EventSink>,
    pub tools: Arc<ToolRegistry>,
    pub quota: Arc<QuotaGuard>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// The fast pass produced nothing usable; nothing was logged as a result.
    Abandoned,
    Completed {
        result: AnalysisResult,
        escalated: bool,
        dispatched: bool,
    },
}

/// Resets the reported status to idle however the tick ends, including by unwinding.
struct IdleOnDrop<'a>(&'a dyn EventSink);

impl Drop for IdleOnDrop<'_> {
    fn drop(&mut self) {
        self.0.status_changed(ClientStatus::Idle);
    }
}

/// Fast pass, optional deep pass, final logging and danger dispatch for one sampled frame.
pub async fn run_tick(ctx: &AgentContext, frame: &Frame, audio: Option<&AudioClip>) -> TickOutcome {
    let _idle = IdleOnDrop(ctx.sink.as_ref());
    ctx.sink.status_changed(ClientStatus::Processing);

    let Some(fast) = request(ctx, Pass::Fast, frame, audio).await else {
        return TickOutcome::Abandoned;
    };

    let mut escalated = false;
    let mut result = fast;
    if result.should_escalate() {
        escalated = true;
        counter!("sentient_escalations_total").increment(1);
        info!(session = %ctx.session_id, risk = %result.risk_level, confidence = result.confidence, "escalating to deep pass");
        ctx.sink.log(LogEntry::system(Severity::Warning, ESCALATION_NOTICE));
        ctx.sink.status_changed(ClientStatus::Thinking);
        if let Some(deep) = request(ctx, Pass::Deep, frame, audio).await {
            result = deep;
        }
    }

    ctx.sink.log(LogEntry::analysis(result.clone(), Some(frame.to_base64())));

    let dispatched = result.risk_level == RiskLevel::Danger;
    if dispatched {
        dispatch_danger(ctx, &result).await;
    }

    TickOutcome::Completed { result, escalated, dispatched }
}

/// One model call. Counts against the quota whatever happens next.
async fn request(
    ctx: &AgentContext,
    pass: Pass,
    frame: &Frame,
    audio: Option<&AudioClip>,
) -> Option<AnalysisResult> {
    let issued = ctx.quota.record_call();
    counter!("sentient_model_calls_total", "pass" => pass.as_str()).increment(1);
    debug!(session = %ctx.session_id, pass = pass.as_str(), issued, audio = audio.is_some(), "model call");

    let req = match ModelRequest::new(
        frame.bytes().to_vec(),
        audio.map(|clip| clip.bytes().to_vec()),
        compose_instruction(ctx.mode, pass),
        ctx.params.clone(),
        pass.thinking_mode(),
    ) {
        Ok(req) => req,
        Err(err) => {
            warn!(session = %ctx.session_id, pass = pass.as_str(), error = %err, "request rejected before sending");
            return None;
        }
    };

    match ctx.model.generate(req).await.and_then(interpret) {
        Ok(result) => Some(result),
        Err(ModelError::Empty) => {
            debug!(session = %ctx.session_id, pass = pass.as_str(), "model returned no text");
            None
        }
        Err(ModelError::Unparseable { raw, reason }) => {
            debug!(session = %ctx.session_id, pass = pass.as_str(), %reason, "unparseable model output");
            if pass == Pass::Fast {
                ctx.sink.log(LogEntry::text(
                    LogSource::Ai,
                    Severity::Info,
                    format!("Raw Output (Parse Error): {raw}"),
                ));
            }
            None
        }
        Err(err) => {
            warn!(session = %ctx.session_id, pass = pass.as_str(), error = %err, "model call failed");
            if pass == Pass::Fast {
                ctx.sink.log(LogEntry::system(Severity::Danger, format!("API Error: {err}")));
            }
            None
        }
    }
}

fn interpret(resp: ModelResponse) -> Result<AnalysisResult, ModelError> {
    match parse_analysis(&resp.content) {
        Ok(result) => Ok(result),
        Err(err) => Err(ModelError::Unparseable {
            raw: resp.content,
            reason: err.to_string(),
        }),
    }
}

/// Fires the alert and incident tools. Acknowledgments are not acted on; failures are surfaced.
pub async fn dispatch_danger(ctx: &AgentContext, result: &AnalysisResult) {
    let tctx = ToolContext { session_id: ctx.session_id, mode: ctx.mode };
    let calls = [
        (
            "send_alert",
            json!({
                "channel": ALERT_CHANNEL,
                "message": format!("[SentientSpace] DANGER DETECTED: {}", result.reason),
            }),
        ),
        (
            "log_incident",
            json!({
                "timestamp": Utc::now().to_rfc3339(),
                "mode": ctx.mode.as_str(),
                "analysis": result,
            }),
        ),
    ];

    for (name, args) in calls {
        let Some(tool) = ctx.tools.get(name) else {
            warn!(tool = name, "side-effect tool not registered");
            ctx.sink.log(LogEntry::system(Severity::Warning, format!("Side effect {name} unavailable.")));
            continue;
        };
        counter!("sentient_dispatch_total", "tool" => name).increment(1);
        match tool.run(tctx, args).await {
            Ok(ack) if ack.ok => debug!(tool = name, id = ?ack.id, "side effect acknowledged"),
            Ok(ack) => {
                let reason = ack.error.unwrap_or_else(|| "not acknowledged".into());
                warn!(tool = name, %reason, "side effect failed");
                ctx.sink.log(LogEntry::system(Severity::Warning, format!("Side effect {name} failed: {reason}")));
            }
            Err(err) => {
                warn!(tool = name, error = %err, "side effect failed");
                ctx.sink.log(LogEntry::system(Severity::Warning, format!("Side effect {name} failed: {err}")));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::simulator::SimulatedModel;
    use crate::agent::tools::{Tool, ToolResult};
    use crate::events::MemoryLog;
    use crate::session::LogMessage;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<(String, Value)>>,
    }

    struct RecordingTool {
        name: &'static str,
        recorder: Arc<Recorder>,
        ack: bool,
    }

    #[async_trait]
    impl Tool for RecordingTool {
        fn name(&self) -> &'static str { self.name }
        async fn run(&self, _ctx: ToolContext, args: Value) -> anyhow::Result<ToolResult> {
            self.recorder.calls.lock().unwrap().push((self.name.to_string(), args));
            Ok(if self.ack { ToolResult::ok("x") } else { ToolResult::failed("carrier rejected") })
        }
    }

    struct Unreachable;

    #[async_trait]
    impl VisionModel for Unreachable {
        fn name(&self) -> &str { "unreachable" }
        async fn generate(&self, _req: ModelRequest) -> Result<ModelResponse, ModelError> {
            Err(ModelError::Status { status: 503, body: "overloaded".into() })
        }
    }

    struct Fixture {
        ctx: AgentContext,
        log: Arc<MemoryLog>,
        recorder: Arc<Recorder>,
        model: Arc<SimulatedModel>,
    }

    fn fixture_with(model: Arc<dyn VisionModel>, sim: Arc<SimulatedModel>, ack: bool) -> Fixture {
        let log = Arc::new(MemoryLog::new());
        let recorder = Arc::new(Recorder::default());
        let mut tools = ToolRegistry::new();
        for name in ["send_alert", "log_incident"] {
            tools.register(Box::new(RecordingTool { name, recorder: recorder.clone(), ack }));
        }
        Fixture {
            ctx: AgentContext {
                session_id: Uuid::new_v4(),
                mode: Mode::Health,
                params: ModelParams::default(),
                model,
                sink: log.clone(),
                tools: Arc::new(tools),
                quota: Arc::new(QuotaGuard::new(200)),
            },
            log,
            recorder,
            model: sim,
        }
    }

    fn fixture() -> Fixture {
        let sim = Arc::new(SimulatedModel::new());
        fixture_with(sim.clone(), sim, true)
    }

    fn frame() -> Frame {
        Frame::blank(32, 24).unwrap()
    }

    fn reply(risk: &str, confidence: f64, reason: &str) -> String {
        json!({
            "status": risk.to_uppercase(),
            "risk_level": risk,
            "reason": reason,
            "suggestion": "s",
            "confidence": confidence,
        })
        .to_string()
    }

    fn results(log: &MemoryLog) -> Vec<AnalysisResult> {
        log.entries().iter().filter_map(|e| e.as_analysis().cloned()).collect()
    }

    #[tokio::test]
    async fn warning_escalates_to_danger_and_dispatches_once() {
        let f = fixture();
        f.model.push_response(reply("warning", 0.9, "wobbling"));
        f.model.push_response(reply("danger", 0.95, "fell down"));

        let outcome = run_tick(&f.ctx, &frame(), None).await;

        let TickOutcome::Completed { result, escalated, dispatched } = outcome else {
            panic!("tick abandoned");
        };
        assert!(escalated && dispatched);
        assert_eq!(result.reason, "fell down");
        assert_eq!(f.ctx.quota.issued(), 2);

        let entries = f.log.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].as_text(), Some(ESCALATION_NOTICE));
        assert_eq!(entries[1].severity, Severity::Danger);
        assert!(entries[1].thumbnail.is_some());
        assert_eq!(results(&f.log), vec![result]);

        let calls = f.recorder.calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].0, "send_alert");
        assert_eq!(calls[0].1["channel"], "911");
        assert_eq!(calls[0].1["message"], "[SentientSpace] DANGER DETECTED: fell down");
        assert_eq!(calls[1].0, "log_incident");
        assert_eq!(calls[1].1["mode"], "HEALTH");
        assert_eq!(calls[1].1["analysis"]["reason"], "fell down");
        assert_eq!(f.log.status(), ClientStatus::Idle);
    }

    #[tokio::test]
    async fn confident_safe_never_escalates() {
        let f = fixture();
        f.model.push_response(reply("safe", 0.99, "sitting"));

        let outcome = run_tick(&f.ctx, &frame(), None).await;

        assert!(matches!(outcome, TickOutcome::Completed { escalated: false, dispatched: false, .. }));
        assert_eq!(f.ctx.quota.issued(), 1);
        assert_eq!(results(&f.log).len(), 1);
        assert_eq!(f.log.len(), 1);
        assert!(f.recorder.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn low_confidence_danger_dispatches_without_escalating() {
        let f = fixture();
        f.model.push_response(reply("danger", 0.5, "smoke?"));

        let outcome = run_tick(&f.ctx, &frame(), None).await;

        assert!(matches!(outcome, TickOutcome::Completed { escalated: false, dispatched: true, .. }));
        assert_eq!(f.ctx.quota.issued(), 1);
        assert_eq!(f.recorder.calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn deep_pass_downgrade_suppresses_dispatch() {
        let f = fixture();
        f.model.push_response(reply("danger", 0.92, "knife"));
        f.model.push_response(reply("warning", 0.6, "kitchen utensil"));

        let outcome = run_tick(&f.ctx, &frame(), None).await;

        let TickOutcome::Completed { result, escalated, dispatched } = outcome else {
            panic!("tick abandoned");
        };
        assert!(escalated);
        assert!(!dispatched);
        assert_eq!(result.risk_level, RiskLevel::Warning);
        assert!(f.recorder.calls.lock().unwrap().is_empty());
        assert_eq!(f.log.entries().last().unwrap().severity, Severity::Warning);
    }

    #[tokio::test]
    async fn unparseable_deep_pass_falls_back_silently() {
        let f = fixture();
        f.model.push_response(reply("warning", 0.85, "ladder"));
        f.model.push_response("let me think about that".to_string());

        let outcome = run_tick(&f.ctx, &frame(), None).await;

        let TickOutcome::Completed { result, escalated, .. } = outcome else {
            panic!("tick abandoned");
        };
        assert!(escalated);
        assert_eq!(result.reason, "ladder");
        assert_eq!(f.ctx.quota.issued(), 2);
        let texts: Vec<_> = f.log.entries().iter().filter_map(|e| e.as_text().map(str::to_string)).collect();
        assert_eq!(texts, vec![ESCALATION_NOTICE.to_string()]);
    }

    #[tokio::test]
    async fn unparseable_fast_pass_logs_raw_text_and_abandons() {
        let f = fixture();
        f.model.push_response("no json here".to_string());

        let outcome = run_tick(&f.ctx, &frame(), None).await;

        assert_eq!(outcome, TickOutcome::Abandoned);
        assert_eq!(f.ctx.quota.issued(), 1);
        let entries = f.log.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].source, LogSource::Ai);
        assert_eq!(entries[0].severity, Severity::Info);
        assert_eq!(entries[0].message, LogMessage::Text("Raw Output (Parse Error): no json here".into()));
        assert_eq!(f.log.status(), ClientStatus::Idle);
    }

    #[tokio::test]
    async fn endpoint_failure_on_fast_pass_is_reported() {
        let sim = Arc::new(SimulatedModel::new());
        let f = fixture_with(Arc::new(Unreachable), sim, true);

        let outcome = run_tick(&f.ctx, &frame(), None).await;

        assert_eq!(outcome, TickOutcome::Abandoned);
        assert_eq!(f.ctx.quota.issued(), 1);
        let entries = f.log.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].source, LogSource::System);
        assert_eq!(entries[0].severity, Severity::Danger);
        assert!(entries[0].as_text().unwrap().starts_with("API Error:"));
    }

    #[tokio::test]
    async fn last_allowed_call_still_escalates() {
        let f = fixture();
        for _ in 0..199 {
            f.ctx.quota.record_call();
        }
        f.model.push_response(reply("warning", 0.9, "edge"));
        f.model.push_response(reply("danger", 0.95, "collapse"));

        let outcome = run_tick(&f.ctx, &frame(), None).await;

        match outcome {
            TickOutcome::Completed { result, escalated, dispatched } => {
                assert_eq!(result.risk_level, RiskLevel::Danger);
                assert!(escalated);
                assert!(dispatched);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(f.ctx.quota.issued(), 201);
        assert_eq!(f.model.calls(), 2);
        // the next tick's quota check ends the session
        assert!(f.ctx.quota.exhausted());
        assert!(f.log.entries().iter().any(|e| e.as_text() == Some(ESCALATION_NOTICE)));
        assert_eq!(f.recorder.calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn audio_clip_is_attached_when_given() {
        let f = fixture();
        f.model.push_response(reply("safe", 0.4, "quiet"));
        let clip = AudioClip::from_samples(&[0.5; 64]);

        run_tick(&f.ctx, &frame(), Some(&clip)).await;

        let seen = f.model.requests();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].has_audio());
        assert!(!seen[0].thinking_mode);
    }

    #[tokio::test]
    async fn failed_acknowledgment_is_logged_not_fatal() {
        let sim = Arc::new(SimulatedModel::new());
        let f = fixture_with(sim.clone(), sim, false);
        f.model.push_response(reply("danger", 0.3, "fire"));

        let outcome = run_tick(&f.ctx, &frame(), None).await;

        assert!(matches!(outcome, TickOutcome::Completed { dispatched: true, .. }));
        let failures: Vec<_> = f
            .log
            .entries()
            .iter()
            .filter_map(|e| e.as_text().map(str::to_string))
            .collect();
        assert_eq!(failures.len(), 2);
        assert!(failures[0].contains("send_alert failed: carrier rejected"));
    }
}
