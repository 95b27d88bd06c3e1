use axum::http::StatusCode;
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::pipeline::PresetContext;

/// Per-request "bring your own key" credentials. Used for the one request
/// they arrive with and never stored.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub(crate) struct Credentials {
    pub(crate) api_key: Option<String>,
    pub(crate) tts_api_key: Option<String>,
    pub(crate) model: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub(crate) struct TranslateBody {
    pub(crate) source_text: String,
    pub(crate) target_language: String,
    pub(crate) prompt_override: Option<String>,
    pub(crate) preset_context: Option<PresetContext>,
    pub(crate) preset: Option<String>,
    pub(crate) credentials: Option<Credentials>,
}

/// Callers may also send `sourceText` for their own side-by-side display; it
/// is ignored here so the reviewer only ever sees the translated text.
#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub(crate) struct BackTranslateBody {
    pub(crate) translated_text: String,
    pub(crate) target_language: String,
    pub(crate) credentials: Option<Credentials>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub(crate) struct RefineBody {
    pub(crate) source_text: String,
    pub(crate) current_translation: String,
    pub(crate) target_language: String,
    pub(crate) user_feedback: String,
    pub(crate) prior_analysis_context: Option<String>,
    pub(crate) credentials: Option<Credentials>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub(crate) struct AudioBody {
    pub(crate) text: String,
    pub(crate) language: String,
    pub(crate) credentials: Option<Credentials>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct AudioPayload {
    pub(crate) audio_url: String,
}

/// Uniform response envelope: `{success, data}` or `{success: false, error}`.
#[derive(Debug, Serialize)]
pub(crate) struct ApiResponse<T: Serialize> {
    pub(crate) success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub(crate) fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

impl ApiResponse<()> {
    pub(crate) fn fail(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

#[derive(Debug)]
pub(crate) struct ServerError {
    pub(crate) status: StatusCode,
    pub(crate) message: String,
}

impl ServerError {
    pub(crate) fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<PipelineError> for ServerError {
    fn from(err: PipelineError) -> Self {
        let status = match err {
            PipelineError::Validation(_) => StatusCode::BAD_REQUEST,
            PipelineError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            PipelineError::Upstream(_) | PipelineError::Parse(_) | PipelineError::Cancelled(_) => {
                StatusCode::BAD_GATEWAY
            }
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl From<anyhow::Error> for ServerError {
    fn from(err: anyhow::Error) -> Self {
        ServerError::bad_request(format!("{:#}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_shapes() {
        let ok = serde_json::to_value(ApiResponse::ok(serde_json::json!({"x": 1}))).unwrap();
        assert_eq!(ok["success"], true);
        assert_eq!(ok["data"]["x"], 1);
        assert!(ok.get("error").is_none());

        let fail = serde_json::to_value(ApiResponse::fail("nope")).unwrap();
        assert_eq!(fail["success"], false);
        assert_eq!(fail["error"], "nope");
    }

    #[test]
    fn request_bodies_accept_camel_case() {
        let body: TranslateBody = serde_json::from_str(
            r#"{"sourceText": "hi", "targetLanguage": "Spanish",
                "presetContext": {"tone": "warm", "culturalContext": "family"},
                "credentials": {"apiKey": "sk-1", "model": "claude"}}"#,
        )
        .unwrap();
        assert_eq!(body.source_text, "hi");
        assert_eq!(body.preset_context.unwrap().tone, "warm");
        assert_eq!(body.credentials.unwrap().api_key.as_deref(), Some("sk-1"));
    }

    #[test]
    fn pipeline_errors_map_to_status_codes() {
        assert_eq!(
            ServerError::from(PipelineError::validation("x")).status,
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ServerError::from(PipelineError::Timeout(45)).status,
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            ServerError::from(PipelineError::parse("x")).status,
            StatusCode::BAD_GATEWAY
        );
    }
}
