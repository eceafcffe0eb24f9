use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::analysis::Mode;
use crate::audio::{VAD_THRESHOLD_DB, WINDOW_CHUNKS};
use crate::frame::{FRAME_WIDTH, JPEG_QUALITY};
use crate::models::{self, Gemini, OpenAICompatible, VisionModel};
use crate::quota::DEFAULT_CEILING;

pub const DEFAULT_TICK_MS: u64 = 2000;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ModelParams {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub top_p: Option<f32>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    #[default]
    Gemini,
    Openai,
    Simulated,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ProviderSettings {
    pub kind: Option<ProviderKind>,
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SamplingSettings {
    pub tick_interval_ms: Option<u64>,
    pub quota_ceiling: Option<u32>,
    pub vad_threshold_db: Option<f32>,
    pub audio_window_chunks: Option<usize>,
    pub frame_width: Option<u32>,
    pub jpeg_quality: Option<u8>,
}

/// Contents of the `--config` file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct GlobalConfigDefaults {
    pub provider: Option<ProviderSettings>,
    pub model_params: Option<ModelParams>,
    pub sampling: Option<SamplingSettings>,
}

impl GlobalConfigDefaults {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("invalid config {}", path.display()))
    }
}

/// Per-session choices sent with the start action.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SessionSettings {
    #[serde(default)]
    pub mode: Mode,
    pub model_params: Option<ModelParams>,
    pub sampling: Option<SamplingSettings>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SamplingPolicy {
    pub tick_interval: Duration,
    pub quota_ceiling: u32,
    pub vad_threshold_db: f32,
    pub audio_window_chunks: usize,
    pub frame_width: u32,
    pub jpeg_quality: u8,
}

impl Default for SamplingPolicy {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(DEFAULT_TICK_MS),
            quota_ceiling: DEFAULT_CEILING,
            vad_threshold_db: VAD_THRESHOLD_DB,
            audio_window_chunks: WINDOW_CHUNKS,
            frame_width: FRAME_WIDTH,
            jpeg_quality: JPEG_QUALITY,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EffectiveSettings {
    pub mode: Mode,
    pub model_params: ModelParams,
    pub sampling: SamplingPolicy,
}

/// Session overrides win over the config file, which wins over built-in defaults.
pub fn resolve_effective_settings(
    global: &GlobalConfigDefaults,
    session: &SessionSettings,
) -> EffectiveSettings {
    let model_params = ModelParams {
        temperature: session
            .model_params
            .as_ref()
            .and_then(|p| p.temperature)
            .or_else(|| global.model_params.as_ref().and_then(|p| p.temperature)),
        max_tokens: session
            .model_params
            .as_ref()
            .and_then(|p| p.max_tokens)
            .or_else(|| global.model_params.as_ref().and_then(|p| p.max_tokens)),
        top_p: session
            .model_params
            .as_ref()
            .and_then(|p| p.top_p)
            .or_else(|| global.model_params.as_ref().and_then(|p| p.top_p)),
    };

    let pick = |f: fn(&SamplingSettings) -> Option<u64>| {
        session
            .sampling
            .as_ref()
            .and_then(f)
            .or_else(|| global.sampling.as_ref().and_then(f))
    };
    let defaults = SamplingPolicy::default();
    let sampling = SamplingPolicy {
        tick_interval: pick(|s| s.tick_interval_ms)
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
            .unwrap_or(defaults.tick_interval),
        quota_ceiling: pick(|s| s.quota_ceiling.map(u64::from))
            .map(|v| v.min(u64::from(u32::MAX)) as u32)
            .unwrap_or(defaults.quota_ceiling),
        vad_threshold_db: session
            .sampling
            .as_ref()
            .and_then(|s| s.vad_threshold_db)
            .or_else(|| global.sampling.as_ref().and_then(|s| s.vad_threshold_db))
            .unwrap_or(defaults.vad_threshold_db),
        audio_window_chunks: pick(|s| s.audio_window_chunks.map(|v| v as u64))
            .filter(|v| *v > 0)
            .map(|v| v as usize)
            .unwrap_or(defaults.audio_window_chunks),
        frame_width: pick(|s| s.frame_width.map(u64::from))
            .filter(|v| *v > 0)
            .map(|v| v.min(4096) as u32)
            .unwrap_or(defaults.frame_width),
        jpeg_quality: pick(|s| s.jpeg_quality.map(u64::from))
            .map(|v| v.clamp(1, 100) as u8)
            .unwrap_or(defaults.jpeg_quality),
    };

    EffectiveSettings {
        mode: session.mode,
        model_params,
        sampling,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedProvider {
    pub kind: ProviderKind,
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
}

/// CLI override, then config file, then environment, then the provider default.
pub fn resolve_provider(
    global: &GlobalConfigDefaults,
    kind_override: Option<ProviderKind>,
    env: impl Fn(&str) -> Option<String>,
) -> anyhow::Result<ResolvedProvider> {
    let file = global.provider.clone().unwrap_or_default();
    let kind = kind_override.or(file.kind).unwrap_or_default();
    let (url_var, key_vars, default_url, default_model): (&str, &[&str], &str, &str) = match kind {
        ProviderKind::Gemini => (
            "GEMINI_BASE_URL",
            &["GEMINI_API_KEY", "API_KEY"][..],
            models::GEMINI_BASE_URL,
            models::GEMINI_MODEL,
        ),
        ProviderKind::Openai => (
            "OPENAI_BASE_URL",
            &["OPENAI_API_KEY"][..],
            models::OPENAI_BASE_URL,
            models::OPENAI_MODEL,
        ),
        ProviderKind::Simulated => ("", &[][..], "", "simulated"),
    };

    let base_url = file
        .base_url
        .or_else(|| env(url_var))
        .unwrap_or_else(|| default_url.to_string());
    if kind != ProviderKind::Simulated {
        url::Url::parse(&base_url).with_context(|| format!("invalid provider base url '{base_url}'"))?;
    }
    let api_key = file
        .api_key
        .or_else(|| key_vars.iter().find_map(|var| env(var)));

    Ok(ResolvedProvider {
        kind,
        base_url,
        model: file.model.unwrap_or_else(|| default_model.to_string()),
        api_key,
    })
}

impl ResolvedProvider {
    /// Network adapter for this provider; `None` for the simulator, which callers wire up themselves.
    pub fn network_model(&self) -> Option<Arc<dyn VisionModel>> {
        match self.kind {
            ProviderKind::Gemini => Some(Arc::new(Gemini::new(
                self.base_url.clone(),
                self.model.clone(),
                self.api_key.clone(),
            ))),
            ProviderKind::Openai => Some(Arc::new(OpenAICompatible::new(
                self.base_url.clone(),
                self.model.clone(),
                self.api_key.clone(),
            ))),
            ProviderKind::Simulated => None,
        }
    }
}
