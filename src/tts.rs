use anyhow::{Result, anyhow};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

use crate::error::{PipelineError, classify_provider_error};
use crate::pipeline::require_non_empty;
use crate::providers::unary_client;
use crate::settings::Settings;

const DEFAULT_BASE_URL: &str = "https://api.elevenlabs.io/v1";

/// Speech synthesis through ElevenLabs. The voice is looked up per target
/// language from settings; per-request keys take precedence over the
/// environment and are never stored.
#[derive(Debug, Clone)]
pub struct SpeechSynthesizer {
    key: String,
    model: String,
    timeout: Duration,
}

impl SpeechSynthesizer {
    pub fn new(key: impl Into<String>, settings: &Settings) -> Self {
        Self {
            key: key.into(),
            model: settings.tts_model.clone(),
            timeout: Duration::from_secs(settings.timeout_secs),
        }
    }

    pub fn resolve_key(override_key: Option<&str>) -> Result<String> {
        if let Some(key) = override_key {
            let key = key.trim();
            if !key.is_empty() {
                return Ok(key.to_string());
            }
        }
        std::env::var("ELEVENLABS_API_KEY")
            .ok()
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| anyhow!("API key not found for ElevenLabs (ELEVENLABS_API_KEY)"))
    }

    /// Synthesize `text` with the voice mapped to `language`, returning raw
    /// MP3 bytes.
    pub async fn synthesize(
        &self,
        text: &str,
        language: &str,
        settings: &Settings,
    ) -> Result<Vec<u8>, PipelineError> {
        require_non_empty(text, "text")?;
        require_non_empty(language, "language")?;
        let text = text.trim();

        let voice = settings.voice_for(language);
        let url = format!("{}/text-to-speech/{}", base_url(), voice);
        let body = json!({
            "text": text,
            "model_id": self.model,
            "voice_settings": {
                "stability": 0.75,
                "similarity_boost": 0.75,
                "style": 0.25,
                "use_speaker_boost": true
            }
        });

        let timeout_secs = self.timeout.as_secs();
        let client =
            unary_client(self.timeout).map_err(|err| classify_provider_error(err, timeout_secs))?;
        let response = client
            .post(&url)
            .header("xi-api-key", self.key.clone())
            .json(&body)
            .send()
            .await
            .map_err(|err| classify_provider_error(err.into(), timeout_secs))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(PipelineError::Upstream(format!(
                "ElevenLabs API error ({}): {}",
                status,
                extract_tts_error(&text).unwrap_or(text)
            )));
        }

        let audio = response
            .bytes()
            .await
            .map_err(|err| classify_provider_error(err.into(), timeout_secs))?;
        if audio.is_empty() {
            return Err(PipelineError::Upstream(
                "ElevenLabs returned an empty audio body".to_string(),
            ));
        }
        Ok(audio.to_vec())
    }
}

/// Inline data URI the client can play or download directly.
pub fn audio_data_url(audio: &[u8]) -> String {
    format!("data:audio/mpeg;base64,{}", BASE64.encode(audio))
}

fn base_url() -> String {
    std::env::var("ELEVENLABS_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string())
}

fn extract_tts_error(body: &str) -> Option<String> {
    #[derive(Deserialize)]
    struct ErrorBody {
        detail: Option<serde_json::Value>,
    }

    let parsed: ErrorBody = serde_json::from_str(body).ok()?;
    match parsed.detail? {
        serde_json::Value::String(message) => Some(message),
        serde_json::Value::Object(detail) => detail
            .get("message")
            .and_then(|value| value.as_str())
            .map(str::to_string),
        _ => None,
    }
}
