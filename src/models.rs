use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

use crate::settings::ModelParams;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("invalid request part: {0}")]
    InvalidPart(String),
    #[error("{0}")]
    Transport(#[from] reqwest::Error),
    #[error("model call failed: {status} {body}")]
    Status { status: u16, body: String },
    #[error("model returned no text")]
    Empty,
    #[error("unparseable model output ({reason}): {raw}")]
    Unparseable { raw: String, reason: String },
}

/// One piece of a multimodal request. Payloads are checked when built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestPart {
    Image { jpeg: Vec<u8> },
    Audio { wav: Vec<u8> },
    Text(String),
}

impl RequestPart {
    pub fn jpeg(bytes: Vec<u8>) -> Result<Self, ModelError> {
        if bytes.len() < 4 || bytes[..2] != [0xFF, 0xD8] {
            return Err(ModelError::InvalidPart("image is not a JPEG".into()));
        }
        Ok(RequestPart::Image { jpeg: bytes })
    }

    pub fn wav(bytes: Vec<u8>) -> Result<Self, ModelError> {
        if bytes.len() < 44 || &bytes[..4] != b"RIFF" || &bytes[8..12] != b"WAVE" {
            return Err(ModelError::InvalidPart("audio is not a WAV clip".into()));
        }
        Ok(RequestPart::Audio { wav: bytes })
    }

    pub fn text(text: impl Into<String>) -> Result<Self, ModelError> {
        let text = text.into();
        if text.trim().is_empty() {
            return Err(ModelError::InvalidPart("instruction is empty".into()));
        }
        Ok(RequestPart::Text(text))
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            RequestPart::Image { .. } => "image/jpeg",
            RequestPart::Audio { .. } => "audio/wav",
            RequestPart::Text(_) => "text/plain",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub parts: Vec<RequestPart>,
    pub params: ModelParams,
    /// Deep pass; the instruction already carries the extra rigor.
    pub thinking_mode: bool,
}

impl ModelRequest {
    /// Image first, then the optional audio clip, then the instruction.
    pub fn new(
        jpeg: Vec<u8>,
        wav: Option<Vec<u8>>,
        instruction: impl Into<String>,
        params: ModelParams,
        thinking_mode: bool,
    ) -> Result<Self, ModelError> {
        let mut parts = vec![RequestPart::jpeg(jpeg)?];
        if let Some(wav) = wav {
            parts.push(RequestPart::wav(wav)?);
        }
        parts.push(RequestPart::text(instruction)?);
        Ok(Self {
            parts,
            params,
            thinking_mode,
        })
    }

    pub fn has_audio(&self) -> bool {
        self.parts
            .iter()
            .any(|p| matches!(p, RequestPart::Audio { .. }))
    }

    pub fn instruction(&self) -> &str {
        self.parts
            .iter()
            .find_map(|p| match p {
                RequestPart::Text(t) => Some(t.as_str()),
                _ => None,
            })
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ModelResponse {
    pub content: String,
    pub model: String,
}

#[async_trait]
pub trait VisionModel: Send + Sync {
    fn name(&self) -> &str;
    async fn generate(&self, req: ModelRequest) -> Result<ModelResponse, ModelError>;
}

pub const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const GEMINI_MODEL: &str = "gemini-3-pro-preview";
pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const OPENAI_MODEL: &str = "gpt-4o";

#[derive(Clone)]
pub struct Gemini {
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    client: reqwest::Client,
}

impl Gemini {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            base_url: base_url.into(),
            model: model.into(),
            api_key,
            client: reqwest::Client::new(),
        }
    }

    fn body(req: &ModelRequest) -> serde_json::Value {
        let parts: Vec<serde_json::Value> = req
            .parts
            .iter()
            .map(|part| match part {
                RequestPart::Image { jpeg: data } | RequestPart::Audio { wav: data } => json!({
                    "inline_data": { "mime_type": part.mime_type(), "data": BASE64.encode(data) }
                }),
                RequestPart::Text(text) => json!({ "text": text }),
            })
            .collect();

        let mut generation = serde_json::Map::new();
        generation.insert("responseMimeType".into(), json!("application/json"));
        if let Some(t) = req.params.temperature {
            generation.insert("temperature".into(), json!(t));
        }
        if let Some(m) = req.params.max_tokens {
            generation.insert("maxOutputTokens".into(), json!(m));
        }
        if let Some(p) = req.params.top_p {
            generation.insert("topP".into(), json!(p));
        }

        json!({
            "contents": [{ "role": "user", "parts": parts }],
            "generationConfig": generation,
        })
    }
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    #[serde(rename = "modelVersion", default)]
    model_version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiContent>,
}

#[derive(Debug, Deserialize)]
struct GeminiContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Deserialize)]
struct GeminiPart {
    text: Option<String>,
}

#[async_trait]
impl VisionModel for Gemini {
    fn name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, req: ModelRequest) -> Result<ModelResponse, ModelError> {
        let url = format!(
            "{}/models/{}:generateContent",
            self.base_url.trim_end_matches('/'),
            self.model
        );
        let mut rb = self.client.post(url).json(&Self::body(&req));
        if let Some(key) = &self.api_key {
            rb = rb.header("x-goog-api-key", key);
        }
        let resp = rb.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ModelError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let v: GeminiResponse = resp.json().await?;
        let content: String = v
            .candidates
            .first()
            .and_then(|c| c.content.as_ref())
            .map(|c| c.parts.iter().filter_map(|p| p.text.as_deref()).collect())
            .unwrap_or_default();
        if content.trim().is_empty() {
            return Err(ModelError::Empty);
        }
        Ok(ModelResponse {
            content,
            model: v.model_version.unwrap_or_else(|| self.model.clone()),
        })
    }
}

#[derive(Clone)]
pub struct OpenAICompatible {
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    client: reqwest::Client,
}

impl OpenAICompatible {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            base_url: base_url.into(),
            model: model.into(),
            api_key,
            client: reqwest::Client::new(),
        }
    }
}

#[derive(Debug, Serialize)]
struct OaiChatRequest<'a> {
    model: &'a str,
    messages: Vec<serde_json::Value>,
    response_format: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")] temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")] max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")] top_p: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct OaiChatResponse {
    choices: Vec<OaiChoice>,
    model: String,
}

#[derive(Debug, Deserialize)]
struct OaiChoice { message: OaiMessage }

#[derive(Debug, Deserialize)]
struct OaiMessage { content: Option<String> }

fn oai_content(parts: &[RequestPart]) -> Vec<serde_json::Value> {
    parts
        .iter()
        .map(|part| match part {
            RequestPart::Image { jpeg } => json!({
                "type": "image_url",
                "image_url": { "url": format!("data:{};base64,{}", part.mime_type(), BASE64.encode(jpeg)) }
            }),
            RequestPart::Audio { wav } => json!({
                "type": "input_audio",
                "input_audio": { "data": BASE64.encode(wav), "format": "wav" }
            }),
            RequestPart::Text(text) => json!({ "type": "text", "text": text }),
        })
        .collect()
}

#[async_trait]
impl VisionModel for OpenAICompatible {
    fn name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, req: ModelRequest) -> Result<ModelResponse, ModelError> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let body = OaiChatRequest {
            model: &self.model,
            messages: vec![json!({ "role": "user", "content": oai_content(&req.parts) })],
            response_format: json!({ "type": "json_object" }),
            temperature: req.params.temperature,
            max_tokens: req.params.max_tokens,
            top_p: req.params.top_p,
        };
        let mut rb = self.client.post(url).json(&body);
        if let Some(key) = &self.api_key {
            rb = rb.bearer_auth(key);
        }
        let resp = rb.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ModelError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let v: OaiChatResponse = resp.json().await?;
        let content = v
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default();
        if content.trim().is_empty() {
            return Err(ModelError::Empty);
        }
        Ok(ModelResponse { content, model: v.model })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::encode_wav;
    use crate::frame::Frame;
    use axum::{Json, Router, routing::post};

    fn jpeg() -> Vec<u8> {
        Frame::blank(8, 6).unwrap().bytes().to_vec()
    }

    #[test]
    fn unparseable_error_keeps_raw_text() {
        let err = ModelError::Unparseable { raw: "not json".into(), reason: "expected value".into() };
        assert_eq!(err.to_string(), "unparseable model output (expected value): not json");
    }

    #[test]
    fn parts_are_validated() {
        assert!(RequestPart::jpeg(b"not an image".to_vec()).is_err());
        assert!(RequestPart::wav(vec![0; 64]).is_err());
        assert!(RequestPart::text("   ").is_err());
        assert!(RequestPart::jpeg(jpeg()).is_ok());
        assert!(RequestPart::wav(encode_wav(&[0.1; 8], 16_000)).is_ok());
    }

    #[test]
    fn request_orders_image_audio_text() {
        let req = ModelRequest::new(
            jpeg(),
            Some(encode_wav(&[0.2; 16], 16_000)),
            "describe",
            ModelParams::default(),
            false,
        )
        .unwrap();
        assert_eq!(req.parts.len(), 3);
        assert!(matches!(req.parts[0], RequestPart::Image { .. }));
        assert!(req.has_audio());
        assert_eq!(req.instruction(), "describe");

        let req = ModelRequest::new(jpeg(), None, "describe", ModelParams::default(), true).unwrap();
        assert_eq!(req.parts.len(), 2);
        assert!(!req.has_audio());
    }

    #[test]
    fn gemini_body_inlines_parts() {
        let params = ModelParams { temperature: Some(0.2), max_tokens: None, top_p: None };
        let req = ModelRequest::new(jpeg(), None, "watch", params, false).unwrap();
        let body = Gemini::body(&req);
        let parts = body["contents"][0]["parts"].as_array().unwrap();
        assert_eq!(parts[0]["inline_data"]["mime_type"], "image/jpeg");
        assert_eq!(parts[1]["text"], "watch");
        assert_eq!(body["generationConfig"]["responseMimeType"], "application/json");
        assert!(body["generationConfig"].get("maxOutputTokens").is_none());
        assert!((body["generationConfig"]["temperature"].as_f64().unwrap() - 0.2).abs() < 1e-6);
    }

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn gemini_joins_candidate_text() {
        let app = Router::new().route(
            "/models/test-model:generateContent",
            post(|Json(body): Json<serde_json::Value>| async move {
                assert_eq!(body["contents"][0]["parts"][1]["text"], "watch");
                Json(json!({
                    "candidates": [{ "content": { "parts": [{ "text": "{\"risk_level\":" }, { "text": "\"safe\"}" }] } }]
                }))
            }),
        );
        let base = serve(app).await;
        let model = Gemini::new(base, "test-model", Some("k".into()));
        let req = ModelRequest::new(jpeg(), None, "watch", ModelParams::default(), false).unwrap();
        let resp = model.generate(req).await.unwrap();
        assert_eq!(resp.content, "{\"risk_level\":\"safe\"}");
        assert_eq!(resp.model, "test-model");
    }

    #[tokio::test]
    async fn gemini_surfaces_http_errors_and_empty_candidates() {
        let app = Router::new()
            .route(
                "/models/broken:generateContent",
                post(|| async { (axum::http::StatusCode::TOO_MANY_REQUESTS, "slow down") }),
            )
            .route(
                "/models/empty:generateContent",
                post(|| async { Json(json!({ "candidates": [] })) }),
            );
        let base = serve(app).await;

        let req = ModelRequest::new(jpeg(), None, "watch", ModelParams::default(), false).unwrap();
        let err = Gemini::new(base.clone(), "broken", None).generate(req.clone()).await.unwrap_err();
        assert!(matches!(err, ModelError::Status { status: 429, .. }));

        let err = Gemini::new(base, "empty", None).generate(req).await.unwrap_err();
        assert!(matches!(err, ModelError::Empty));
    }

    #[tokio::test]
    async fn openai_compatible_sends_data_uri() {
        let app = Router::new().route(
            "/chat/completions",
            post(|Json(body): Json<serde_json::Value>| async move {
                let content = body["messages"][0]["content"].as_array().unwrap().clone();
                let url = content[0]["image_url"]["url"].as_str().unwrap_or("").to_string();
                let format = content[1]["input_audio"]["format"].as_str().unwrap_or("").to_string();
                Json(json!({
                    "model": "m",
                    "choices": [{ "message": { "content": format!("{}|{}", url.starts_with("data:image/jpeg;base64,"), format) } }]
                }))
            }),
        );
        let base = serve(app).await;
        let model = OpenAICompatible::new(base, "m", None);
        let req = ModelRequest::new(
            jpeg(),
            Some(encode_wav(&[0.3; 32], 16_000)),
            "watch",
            ModelParams::default(),
            false,
        )
        .unwrap();
        let resp = model.generate(req).await.unwrap();
        assert_eq!(resp.content, "true|wav");
    }
}
