//! OpenAI-compatible vision client used by `lumen annotate`.

use std::path::Path;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use lumen_core::annotation::VisionClient;
use lumen_core::error::CoreError;
use serde_json::{json, Value};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const MAX_TOKENS: u32 = 500;
const SYSTEM_MESSAGE: &str = "You are a helpful assistant that describes images.";

pub struct OpenAiVisionClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl OpenAiVisionClient {
    pub fn new(api_key: String, base_url: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            api_key,
        }
    }

    /// Build from `OPENAI_API_KEY` and optional `OPENAI_BASE_URL`.
    pub fn from_env() -> anyhow::Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY is not set"))?;
        let base_url = std::env::var("OPENAI_BASE_URL").ok().filter(|u| !u.is_empty());
        Ok(Self::new(api_key, base_url))
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl VisionClient for OpenAiVisionClient {
    async fn request(&self, image_path: &Path, prompt: &str, model: &str) -> Result<String, CoreError> {
        let bytes = tokio::fs::read(image_path).await.map_err(|source| CoreError::Io {
            path: image_path.to_path_buf(),
            source,
        })?;
        let body = chat_body(model, prompt, &data_url(image_path, &bytes));

        tracing::debug!(image = %image_path.display(), model, "Requesting annotation");

        let resp = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| CoreError::Internal(format!("Vision request failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            tracing::error!(status = status.as_u16(), body = %text, "Vision API error");
            return Err(CoreError::Internal(format!("Vision API returned {status}: {text}")));
        }

        let json: Value = resp
            .json()
            .await
            .map_err(|e| CoreError::Internal(format!("Invalid vision response: {e}")))?;
        reply_text(&json)
            .ok_or_else(|| CoreError::Internal("Vision response missing message content".into()))
    }
}

fn chat_body(model: &str, prompt: &str, image_url: &str) -> Value {
    json!({
        "model": model,
        "messages": [
            {"role": "system", "content": SYSTEM_MESSAGE},
            {
                "role": "user",
                "content": [
                    {"type": "text", "text": prompt},
                    {"type": "image_url", "image_url": {"url": image_url}}
                ]
            }
        ],
        "max_tokens": MAX_TOKENS,
    })
}

fn data_url(path: &Path, bytes: &[u8]) -> String {
    format!("data:{};base64,{}", mime_for(path), BASE64.encode(bytes))
}

fn mime_for(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("png") => "image/png",
        Some("bmp") => "image/bmp",
        Some("webp") => "image/webp",
        _ => "image/jpeg",
    }
}

fn reply_text(json: &Value) -> Option<String> {
    json.pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .map(|s| s.trim().to_string())
}
