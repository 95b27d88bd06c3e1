use anyhow::{Result, anyhow};
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{Value, json};
use std::time::Duration;

use super::retry::{Backoff, is_rate_limited, retry_after};
use super::{
    Message, MessageRole, Provider, ProviderFuture, ProviderKind, ProviderResponse, ProviderText,
    ProviderUsage, StreamFuture, TextFuture, ToolCallMissing, ToolSpec,
};

const BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models";
pub(crate) const DEFAULT_MODEL: &str = "gemini-2.0-flash";

#[derive(Debug, Clone)]
pub struct Gemini {
    key: String,
    model: String,
    timeout: Duration,
    messages: Vec<Message>,
    tools: Vec<ToolSpec>,
}

impl Gemini {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            model: DEFAULT_MODEL.to_string(),
            timeout: super::DEFAULT_TIMEOUT,
            messages: Vec::new(),
            tools: Vec::new(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        let model = model.into();
        if !model.trim().is_empty() {
            self.model = model;
        }
        self
    }

    fn find_tool(&self, name: &str) -> Option<&ToolSpec> {
        self.tools.iter().find(|tool| tool.name == name)
    }

    fn body_base(&self) -> serde_json::Value {
        let (system_inputs, user_inputs): (Vec<&Message>, Vec<&Message>) = self
            .messages
            .iter()
            .partition(|message| matches!(message.role, MessageRole::System));

        let system_instruction = system_inputs
            .iter()
            .map(|message| message.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");

        let contents = user_inputs
            .iter()
            .map(|message| json!({"role": "user", "parts": [{"text": message.content}]}))
            .collect::<Vec<_>>();

        json!({
            "contents": contents,
            "systemInstruction": if system_instruction.trim().is_empty() {
                Value::Null
            } else {
                json!({"parts": [{"text": system_instruction}]})
            }
        })
    }
}

impl Provider for Gemini {
    fn append_system_input(mut self, input: String) -> Self {
        self.messages.push(Message::system(input));
        self
    }

    fn append_user_input(mut self, input: String) -> Self {
        self.messages.push(Message::user(input));
        self
    }

    fn register_tool(mut self, tool: ToolSpec) -> Self {
        self.tools.push(tool);
        self
    }

    fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn call_tool(self, tool_name: &str) -> ProviderFuture {
        let tool_name = tool_name.to_string();
        Box::pin(async move {
            let tool = self
                .find_tool(&tool_name)
                .cloned()
                .ok_or_else(|| anyhow!("tool '{}' not registered", tool_name))?;
            let mut body = self.body_base();
            body["tools"] = json!([
                {
                    "function_declarations": [
                        {
                            "name": tool.name,
                            "description": tool.description,
                            "parameters": tool.parameters
                        }
                    ]
                }
            ]);
            body["tool_config"] = json!({
                "function_calling_config": {
                    "mode": "ANY",
                    "allowed_function_names": [tool.name]
                }
            });

            let url = format!("{}/{}:generateContent", BASE_URL, self.model);
            let text = send_with_retry(&self, &url, &body).await?;
            extract_tool_response(&text, &tool_name, &self.model)
        })
    }

    fn call_text(self) -> TextFuture {
        Box::pin(async move {
            let body = self.body_base();
            let url = format!("{}/{}:generateContent", BASE_URL, self.model);
            let text = send_with_retry(&self, &url, &body).await?;
            extract_text_response(&text, &self.model)
        })
    }

    fn stream_text(self) -> StreamFuture {
        Box::pin(async move {
            let client = super::streaming_client(self.timeout)?;
            let body = self.body_base();
            let url = format!("{}/{}:streamGenerateContent?alt=sse", BASE_URL, self.model);

            let response = client
                .post(&url)
                .header("x-goog-api-key", self.key.clone())
                .json(&body)
                .send()
                .await?;
            let status = response.status();
            if !status.is_success() {
                let text = response.text().await.unwrap_or_default();
                return Err(anyhow!(
                    "Gemini API error ({}): {}",
                    status,
                    extract_gemini_error(&text).unwrap_or(text)
                ));
            }

            let chunks = super::sse::data_events(response).filter_map(|event| async move {
                match event {
                    Ok(payload) => extract_stream_delta(&payload).map(Ok),
                    Err(err) => Some(Err(err)),
                }
            });
            Ok(Box::pin(chunks) as super::ChunkStream)
        })
    }
}

async fn send_with_retry(provider: &Gemini, url: &str, body: &serde_json::Value) -> Result<String> {
    let client = super::unary_client(provider.timeout)?;

    let mut backoff = Backoff::new();
    loop {
        let response = client
            .post(url)
            .header("x-goog-api-key", provider.key.clone())
            .json(body)
            .send()
            .await?;

        let status = response.status();
        let retry_after = retry_after(response.headers());
        let text = response.text().await.unwrap_or_default();
        if status.is_success() {
            return Ok(text);
        }
        if is_rate_limited(status, &text) && backoff.can_retry() {
            backoff.wait(ProviderKind::Gemini, retry_after).await;
            continue;
        }
        return Err(anyhow!(
            "Gemini API error ({}): {}",
            status,
            extract_gemini_error(&text).unwrap_or(text)
        ));
    }
}

fn extract_tool_response(
    text: &str,
    tool_name: &str,
    fallback_model: &str,
) -> Result<ProviderResponse> {
    let payload: GeminiResponse = serde_json::from_str(text)
        .map_err(|err| anyhow!("failed to parse Gemini response JSON: {}", err))?;
    let candidate = payload
        .candidates
        .first()
        .and_then(|candidate| candidate.content.as_ref())
        .ok_or_else(|| anyhow!("no candidate returned from Gemini"))?;

    for part in &candidate.parts {
        if let Some(function_call) = &part.function_call
            && function_call.name == tool_name
        {
            return Ok(ProviderResponse {
                args: function_call.args.clone(),
                model: resolve_model(payload.model_version, fallback_model),
                usage: payload.usage_metadata.map(ProviderUsage::from),
            });
        }
    }

    Err(ToolCallMissing {
        provider: ProviderKind::Gemini,
    }
    .into())
}

fn extract_text_response(text: &str, fallback_model: &str) -> Result<ProviderText> {
    let payload: GeminiResponse = serde_json::from_str(text)
        .map_err(|err| anyhow!("failed to parse Gemini response JSON: {}", err))?;
    let candidate = payload
        .candidates
        .first()
        .and_then(|candidate| candidate.content.as_ref())
        .ok_or_else(|| anyhow!("no candidate returned from Gemini"))?;
    let content = candidate
        .parts
        .iter()
        .filter_map(|part| part.text.as_deref())
        .collect::<Vec<_>>()
        .join("");
    if content.trim().is_empty() {
        return Err(anyhow!("no text content returned from Gemini"));
    }
    Ok(ProviderText {
        text: content,
        model: resolve_model(payload.model_version, fallback_model),
        usage: payload.usage_metadata.map(ProviderUsage::from),
    })
}

fn extract_stream_delta(payload: &str) -> Option<String> {
    let parsed: GeminiResponse = serde_json::from_str(payload).ok()?;
    let candidate = parsed.candidates.first()?.content.as_ref()?;
    let text = candidate
        .parts
        .iter()
        .filter_map(|part| part.text.as_deref())
        .collect::<Vec<_>>()
        .join("");
    if text.is_empty() { None } else { Some(text) }
}

fn resolve_model(model: Option<String>, fallback: &str) -> Option<String> {
    model
        .filter(|value| !value.trim().is_empty())
        .or_else(|| Some(fallback.to_string()))
}

fn extract_gemini_error(body: &str) -> Option<String> {
    #[derive(Deserialize)]
    struct ErrorBody {
        error: Option<GeminiError>,
    }

    #[derive(Deserialize)]
    struct GeminiError {
        message: Option<String>,
        status: Option<String>,
        code: Option<i32>,
    }

    let parsed: ErrorBody = serde_json::from_str(body).ok()?;
    let error = parsed.error?;
    let mut parts = Vec::new();
    if let Some(message) = error.message
        && !message.trim().is_empty()
    {
        parts.push(message);
    }
    if let Some(status) = error.status
        && !status.trim().is_empty()
    {
        parts.push(format!("status: {}", status));
    }
    if let Some(code) = error.code {
        parts.push(format!("code: {}", code));
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(" | "))
    }
}

impl From<GeminiUsage> for ProviderUsage {
    fn from(usage: GeminiUsage) -> Self {
        ProviderUsage {
            prompt_tokens: usage.prompt_token_count,
            completion_tokens: usage.candidates_token_count,
            total_tokens: usage.total_token_count,
        }
    }
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    #[serde(rename = "usageMetadata")]
    usage_metadata: Option<GeminiUsage>,
    #[serde(rename = "modelVersion")]
    model_version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiUsage {
    #[serde(rename = "promptTokenCount")]
    prompt_token_count: Option<u64>,
    #[serde(rename = "candidatesTokenCount")]
    candidates_token_count: Option<u64>,
    #[serde(rename = "totalTokenCount")]
    total_token_count: Option<u64>,
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
    #[serde(rename = "functionCall")]
    function_call: Option<GeminiFunctionCall>,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiFunctionCall {
    name: String,
    #[serde(default)]
    args: Value,
}
