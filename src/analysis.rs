use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};

/// Fast-pass confidence at or above which a non-safe result is re-checked.
pub const ESCALATION_CONFIDENCE: f64 = 0.80;

pub const PRIVACY_RULE: &str = "PRIVACY RULE: Data Minimalism is active. Do not describe facial features or identity (e.g., 'Subject A', not 'The blond man'). Describe actions and safety states only.";

pub const OUTPUT_SCHEMA: &str = "Return JSON with:
- status
- risk_level (safe, warning, danger)
- reason
- suggestion
- confidence (0.0-1.0)
- audio_response (text for TTS)
- reasoning_trace (array of strings showing step-by-step logic)";

pub const DEEP_PASS_RIGOR: &str = "CRITICAL: You are in Deep Thinking Mode. Perform a step-by-step reasoning check before concluding. If danger is confirmed, be extremely precise.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Safe,
    Warning,
    Danger,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Safe => "safe",
            RiskLevel::Warning => "warning",
            RiskLevel::Danger => "danger",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "safe" => Some(RiskLevel::Safe),
            "warning" => Some(RiskLevel::Warning),
            "danger" => Some(RiskLevel::Danger),
            _ => None,
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for RiskLevel {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(d)?;
        RiskLevel::parse(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown risk level '{raw}'")))
    }
}

/// Monitoring persona. Unknown names deserialize to `General`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Mode {
    #[default]
    Health,
    Science,
    Business,
    #[serde(other)]
    General,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Health => "HEALTH",
            Mode::Science => "SCIENCE",
            Mode::Business => "BUSINESS",
            Mode::General => "GENERAL",
        }
    }

    pub fn persona(&self) -> &'static str {
        match self {
            Mode::Health => {
                "You are 'NeuroSync', an advanced medical safety agent monitoring 'Alex', a user with mobility challenges. Prioritize fall detection, gait analysis, and pain distress signals in voice. Tone: Empathetic, calm, authoritative in emergencies."
            }
            Mode::Science => {
                "You are 'ChemGuard', an AI lab partner monitoring 'Sarah', a chemistry student. Prioritize PPE compliance (goggles), chemical reaction safety, and hazard identification. Tone: Educational but firm on safety violations."
            }
            Mode::Business => {
                "You are 'BizVibe', a communication coach helping 'Marcus' during a high-stakes sales call. Prioritize engagement detection, sentiment analysis, and objection handling suggestions. Tone: Professional, concise, strategic."
            }
            Mode::General => "Analyze safety and user status.",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pass {
    Fast,
    Deep,
}

impl Pass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Pass::Fast => "fast",
            Pass::Deep => "deep",
        }
    }

    pub fn thinking_mode(&self) -> bool {
        matches!(self, Pass::Deep)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    #[serde(default)]
    pub status: String,
    pub risk_level: RiskLevel,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub suggestion: String,
    #[serde(default, deserialize_with = "lenient_confidence")]
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_response: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_trace: Option<Vec<String>>,
}

impl AnalysisResult {
    /// A confident non-safe fast-pass result earns a deep pass. NaN never escalates.
    pub fn should_escalate(&self) -> bool {
        self.confidence >= ESCALATION_CONFIDENCE && self.risk_level != RiskLevel::Safe
    }
}

/// Null, non-finite and out-of-range confidences read as 0.0, which never escalates.
fn lenient_confidence<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Null,
        Number(f64),
        Text(String),
    }

    let value = match Raw::deserialize(d)? {
        Raw::Null => 0.0,
        Raw::Number(n) => n,
        Raw::Text(s) => s.trim().parse().map_err(serde::de::Error::custom)?,
    };
    Ok(if (0.0..=1.0).contains(&value) { value } else { 0.0 })
}

static CODE_FENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)^\s*```[A-Za-z]*\s*(.*?)\s*```\s*$").expect("static regex")
});

/// Parses model output into a result, tolerating a markdown code fence around the JSON.
pub fn parse_analysis(text: &str) -> Result<AnalysisResult, serde_json::Error> {
    let body = CODE_FENCE
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .unwrap_or(text);
    serde_json::from_str(body)
}

/// Instruction sent with every request: persona, privacy rule, schema, plus rigor on the deep pass.
pub fn compose_instruction(mode: Mode, pass: Pass) -> String {
    let mut prompt = format!("{}\n{}\n{}", mode.persona(), PRIVACY_RULE, OUTPUT_SCHEMA);
    if pass.thinking_mode() {
        prompt.push(' ');
        prompt.push_str(DEEP_PASS_RIGOR);
    }
    prompt
}
