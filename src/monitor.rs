use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use metrics::counter;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::agent::engine::{AgentContext, TickOutcome, run_tick};
use crate::agent::tools::ToolRegistry;
use crate::analysis::Mode;
use crate::audio::{self, RollingWindow};
use crate::events::EventSink;
use crate::frame::capture_frame;
use crate::media::{AudioSource, DeviceError, MediaProvider, VideoSource};
use crate::models::VisionModel;
use crate::quota::QuotaGuard;
use crate::session::{ClientStatus, LogEntry, SessionInfo, Severity};
use crate::settings::{
    EffectiveSettings, GlobalConfigDefaults, SamplingPolicy, SessionSettings,
    resolve_effective_settings,
};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("error accessing media devices: {0}")]
    Device(#[from] DeviceError),
    #[error("no active session")]
    NotRunning,
    #[error("session task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    Stopped,
    QuotaExhausted,
}

/// Forwards to the outer sink and remembers the latest status for snapshots.
struct StatusTap {
    inner: Arc<dyn EventSink>,
    status: Mutex<ClientStatus>,
}

impl StatusTap {
    fn new(inner: Arc<dyn EventSink>) -> Self {
        Self { inner, status: Mutex::new(ClientStatus::Idle) }
    }

    fn current(&self) -> ClientStatus {
        *self.status.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl EventSink for StatusTap {
    fn log(&self, entry: LogEntry) {
        self.inner.log(entry);
    }

    fn status_changed(&self, status: ClientStatus) {
        *self.status.lock().unwrap_or_else(|p| p.into_inner()) = status;
        self.inner.status_changed(status);
    }

    fn disconnected(&self) {
        self.inner.disconnected();
    }
}

/// Device handles owned by one session. Each is released at most once.
struct MediaHandles {
    video: Option<Arc<dyn VideoSource>>,
    audio_cancel: CancellationToken,
    audio_task: Option<JoinHandle<()>>,
}

impl MediaHandles {
    async fn release(&mut self) {
        self.audio_cancel.cancel();
        if let Some(task) = self.audio_task.take() {
            if let Err(err) = task.await {
                warn!(error = %err, "audio producer did not shut down cleanly");
            }
        }
        if let Some(video) = self.video.take() {
            video.stop();
        }
    }
}

/// Moves microphone chunks onto the session loop's queue. Closes the source on exit.
async fn pump_audio(
    mut source: Box<dyn AudioSource>,
    tx: mpsc::Sender<Vec<f32>>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            chunk = source.next_chunk() => match chunk {
                Some(chunk) => {
                    if tx.send(chunk).await.is_err() {
                        break;
                    }
                }
                None => {
                    debug!("audio source ended");
                    break;
                }
            },
        }
    }
    source.stop();
}

struct SessionRuntime {
    ctx: AgentContext,
    sampling: SamplingPolicy,
    video: Arc<dyn VideoSource>,
}

async fn sample_and_analyze(
    ctx: AgentContext,
    video: Arc<dyn VideoSource>,
    sampling: SamplingPolicy,
    samples: Vec<f32>,
) -> TickOutcome {
    let frame = match capture_frame(video, sampling.frame_width, sampling.jpeg_quality).await {
        Ok(frame) => frame,
        Err(err) => {
            warn!(session = %ctx.session_id, error = %err, "frame capture failed; tick skipped");
            return TickOutcome::Abandoned;
        }
    };
    let clip = audio::gate(&samples, sampling.vad_threshold_db);
    run_tick(&ctx, &frame, clip.as_ref()).await
}

/// Single event queue for a session: ticks, audio chunks, tick completion, cancellation.
async fn session_loop(
    rt: SessionRuntime,
    mut media: MediaHandles,
    mut audio_rx: mpsc::Receiver<Vec<f32>>,
    cancel: CancellationToken,
) -> SessionEnd {
    let sink = rt.ctx.sink.clone();
    let period = rt.sampling.tick_interval;
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut window = RollingWindow::new(rt.sampling.audio_window_chunks);
    let mut in_flight: JoinSet<TickOutcome> = JoinSet::new();
    let mut audio_open = true;

    let end = loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break SessionEnd::Stopped,
            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                match joined {
                    Ok(outcome) => debug!(session = %rt.ctx.session_id, ?outcome, "tick finished"),
                    Err(err) => warn!(session = %rt.ctx.session_id, error = %err, "tick failed"),
                }
                sink.status_changed(ClientStatus::Idle);
            }
            _ = ticker.tick() => {
                if !in_flight.is_empty() {
                    counter!("sentient_ticks_skipped_total").increment(1);
                    debug!(session = %rt.ctx.session_id, "analysis in flight; tick dropped");
                    continue;
                }
                if rt.ctx.quota.exhausted() {
                    break SessionEnd::QuotaExhausted;
                }
                in_flight.spawn(sample_and_analyze(
                    rt.ctx.clone(),
                    rt.video.clone(),
                    rt.sampling.clone(),
                    window.flatten(),
                ));
            }
            chunk = audio_rx.recv(), if audio_open => match chunk {
                Some(chunk) => window.push(chunk),
                None => {
                    debug!(session = %rt.ctx.session_id, "audio stream closed");
                    audio_open = false;
                }
            },
        }
    };

    if end == SessionEnd::QuotaExhausted {
        info!(session = %rt.ctx.session_id, issued = rt.ctx.quota.issued(), "request quota reached");
        sink.log(LogEntry::system(
            Severity::Danger,
            format!(
                "Request quota ({}) reached. Monitoring paused.",
                rt.ctx.quota.ceiling()
            ),
        ));
    }

    in_flight.shutdown().await;
    drop(ticker);
    drop(audio_rx);
    window.clear();
    media.release().await;
    sink.status_changed(ClientStatus::Idle);

    if end == SessionEnd::QuotaExhausted {
        sink.disconnected();
    }
    info!(session = %rt.ctx.session_id, ?end, "session loop finished");
    end
}

struct ActiveSession {
    id: Uuid,
    mode: Mode,
    created_at: DateTime<Utc>,
    quota: Arc<QuotaGuard>,
    tap: Arc<StatusTap>,
    cancel: CancellationToken,
    handle: JoinHandle<SessionEnd>,
}

impl ActiveSession {
    fn info(&self, running: bool) -> SessionInfo {
        SessionInfo {
            id: self.id,
            mode: self.mode,
            created_at: self.created_at,
            running,
            status: self.tap.current(),
            requests_issued: self.quota.issued(),
            quota_ceiling: self.quota.ceiling(),
        }
    }
}

/// Owns at most one monitoring session and its lifecycle.
pub struct Monitor {
    model: Arc<dyn VisionModel>,
    media: Arc<dyn MediaProvider>,
    sink: Arc<dyn EventSink>,
    tools: Arc<ToolRegistry>,
    defaults: GlobalConfigDefaults,
    active: Option<ActiveSession>,
    last: Option<SessionInfo>,
}

impl Monitor {
    pub fn new(
        model: Arc<dyn VisionModel>,
        media: Arc<dyn MediaProvider>,
        sink: Arc<dyn EventSink>,
        tools: Arc<ToolRegistry>,
        defaults: GlobalConfigDefaults,
    ) -> Self {
        Self {
            model,
            media,
            sink,
            tools,
            defaults,
            active: None,
            last: None,
        }
    }

    pub fn effective_settings(&self, session: &SessionSettings) -> EffectiveSettings {
        resolve_effective_settings(&self.defaults, session)
    }

    /// Starts a session, first tearing down any previous one.
    pub async fn start(&mut self, session: SessionSettings) -> Result<Uuid, SessionError> {
        if self.active.is_some() {
            self.stop().await?;
        }

        let settings = self.effective_settings(&session);
        let tap = Arc::new(StatusTap::new(self.sink.clone()));
        tap.status_changed(ClientStatus::Idle);

        let streams = match self.media.open().await {
            Ok(streams) => streams,
            Err(err) => {
                warn!(error = %err, "media devices unavailable");
                tap.log(LogEntry::system(Severity::Danger, "Error accessing media devices."));
                tap.disconnected();
                return Err(err.into());
            }
        };

        let id = Uuid::new_v4();
        let quota = Arc::new(QuotaGuard::new(settings.sampling.quota_ceiling));
        let sink: Arc<dyn EventSink> = tap.clone();
        let ctx = AgentContext {
            session_id: id,
            mode: settings.mode,
            params: settings.model_params.clone(),
            model: self.model.clone(),
            sink,
            tools: self.tools.clone(),
            quota: quota.clone(),
        };

        let cancel = CancellationToken::new();
        let audio_cancel = cancel.child_token();
        let (audio_tx, audio_rx) = mpsc::channel(settings.sampling.audio_window_chunks * 2);
        let audio_task = tokio::spawn(pump_audio(streams.audio, audio_tx, audio_cancel.clone()));
        let media = MediaHandles {
            video: Some(streams.video.clone()),
            audio_cancel,
            audio_task: Some(audio_task),
        };

        tap.log(LogEntry::system(
            Severity::Safe,
            format!("Monitoring started in {} mode.", settings.mode),
        ));
        info!(session = %id, mode = %settings.mode, interval = ?settings.sampling.tick_interval, "session started");

        let rt = SessionRuntime {
            ctx,
            sampling: settings.sampling.clone(),
            video: streams.video,
        };
        let handle = tokio::spawn(session_loop(rt, media, audio_rx, cancel.clone()));

        self.active = Some(ActiveSession {
            id,
            mode: settings.mode,
            created_at: Utc::now(),
            quota,
            tap,
            cancel,
            handle,
        });
        Ok(id)
    }

    /// Stops the session and waits until every handle is released. No-op without a session.
    pub async fn stop(&mut self) -> Result<Option<SessionEnd>, SessionError> {
        let Some(mut active) = self.active.take() else {
            return Ok(None);
        };
        let finished = active.handle.is_finished();
        active.cancel.cancel();
        let end = (&mut active.handle).await?;
        if end == SessionEnd::Stopped && !finished {
            active
                .tap
                .log(LogEntry::system(Severity::Info, "Monitoring session ended."));
        }
        info!(session = %active.id, ?end, "session stopped");
        self.last = Some(active.info(false));
        Ok(Some(end))
    }

    pub fn is_running(&self) -> bool {
        self.active.as_ref().is_some_and(|a| !a.handle.is_finished())
    }

    /// Simulator hook: the next tick finds the quota spent.
    pub fn exhaust_quota(&self) -> Result<(), SessionError> {
        match &self.active {
            Some(active) if !active.handle.is_finished() => {
                active.quota.force_exhausted();
                info!(session = %active.id, "quota forced to ceiling");
                Ok(())
            }
            _ => Err(SessionError::NotRunning),
        }
    }

    pub fn snapshot(&self) -> Option<SessionInfo> {
        match &self.active {
            Some(active) => Some(active.info(!active.handle.is_finished())),
            None => self.last.clone(),
        }
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        if let Some(active) = &self.active {
            active.cancel.cancel();
        }
    }
}
