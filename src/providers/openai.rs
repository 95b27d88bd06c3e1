use anyhow::{Context, Result, anyhow};
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

use super::retry::{Backoff, is_rate_limited, retry_after};
use super::{
    Message, MessageRole, Provider, ProviderFuture, ProviderKind, ProviderResponse, ProviderText,
    ProviderUsage, StreamFuture, TextFuture, ToolCallMissing, ToolSpec,
};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub(crate) const DEFAULT_MODEL: &str = "gpt-4o-mini";

#[derive(Debug, Clone)]
pub struct OpenAI {
    key: String,
    model: String,
    timeout: Duration,
    messages: Vec<Message>,
    tools: Vec<ToolSpec>,
}

impl OpenAI {
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

    fn find_tool(&self, name: &str) -> Result<&ToolSpec> {
        self.tools
            .iter()
            .find(|tool| tool.name == name)
            .ok_or_else(|| anyhow!("tool '{}' not registered", name))
    }

    fn message_values(&self) -> Vec<serde_json::Value> {
        self.messages
            .iter()
            .map(|message| match message.role {
                MessageRole::System => json!({"role": "system", "content": message.content}),
                MessageRole::User => json!({"role": "user", "content": message.content}),
            })
            .collect()
    }
}

impl Provider for OpenAI {
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
            let tool = self.find_tool(&tool_name)?.clone();
            let body = json!({
                "model": self.model,
                "messages": self.message_values(),
                "tools": [
                    {
                        "type": "function",
                        "function": {
                            "name": tool.name,
                            "description": tool.description,
                            "parameters": tool.parameters
                        }
                    }
                ],
                "tool_choice": {"type": "function", "function": {"name": tool.name}}
            });
            let text = send_with_retry(&self, &body).await?;
            extract_tool_response(&text, &tool_name, &self.model)
        })
    }

    fn call_text(self) -> TextFuture {
        Box::pin(async move {
            let body = json!({
                "model": self.model,
                "messages": self.message_values(),
            });
            let text = send_with_retry(&self, &body).await?;
            extract_text_response(&text, &self.model)
        })
    }

    fn stream_text(self) -> StreamFuture {
        Box::pin(async move {
            let client = super::streaming_client(self.timeout)?;
            let url = format!("{}/chat/completions", base_url());
            let body = json!({
                "model": self.model,
                "messages": self.message_values(),
                "stream": true
            });

            let response = client
                .post(&url)
                .bearer_auth(self.key.clone())
                .json(&body)
                .send()
                .await?;
            let status = response.status();
            if !status.is_success() {
                let text = response.text().await.unwrap_or_default();
                return Err(anyhow!(
                    "OpenAI API error ({}): {}",
                    status,
                    extract_openai_error(&text).unwrap_or(text)
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

fn base_url() -> String {
    std::env::var("OPENAI_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string())
}

async fn send_with_retry(provider: &OpenAI, body: &serde_json::Value) -> Result<String> {
    let client = super::unary_client(provider.timeout)?;
    let url = format!("{}/chat/completions", base_url());

    let mut backoff = Backoff::new();
    loop {
        let response = client
            .post(&url)
            .bearer_auth(provider.key.clone())
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
            backoff.wait(ProviderKind::OpenAI, retry_after).await;
            continue;
        }
        return Err(anyhow!(
            "OpenAI API error ({}): {}",
            status,
            extract_openai_error(&text).unwrap_or(text)
        ));
    }
}

fn extract_tool_response(
    text: &str,
    tool_name: &str,
    fallback_model: &str,
) -> Result<ProviderResponse> {
    let payload: OpenAIResponse =
        serde_json::from_str(text).with_context(|| "failed to parse OpenAI response JSON")?;
    let tool_call = payload
        .choices
        .first()
        .and_then(|choice| choice.message.tool_calls.first())
        .ok_or(ToolCallMissing {
            provider: ProviderKind::OpenAI,
        })?;

    if tool_call.function.name != tool_name {
        return Err(anyhow!(
            "unexpected tool name '{}' from OpenAI",
            tool_call.function.name
        ));
    }

    let args: serde_json::Value = serde_json::from_str(&tool_call.function.arguments)
        .with_context(|| "failed to parse OpenAI tool arguments")?;
    Ok(ProviderResponse {
        args,
        model: resolve_model(payload.model, fallback_model),
        usage: payload.usage.map(ProviderUsage::from),
    })
}

fn extract_text_response(text: &str, fallback_model: &str) -> Result<ProviderText> {
    let payload: OpenAIResponse =
        serde_json::from_str(text).with_context(|| "failed to parse OpenAI response JSON")?;
    let content = payload
        .choices
        .first()
        .and_then(|choice| choice.message.content.clone())
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| anyhow!("no text content returned from OpenAI"))?;
    Ok(ProviderText {
        text: content,
        model: resolve_model(payload.model, fallback_model),
        usage: payload.usage.map(ProviderUsage::from),
    })
}

fn extract_stream_delta(payload: &str) -> Option<String> {
    let parsed: StreamChunk = serde_json::from_str(payload).ok()?;
    let delta = parsed
        .choices
        .first()
        .and_then(|choice| choice.delta.content.clone())?;
    if delta.is_empty() { None } else { Some(delta) }
}

fn resolve_model(model: Option<String>, fallback: &str) -> Option<String> {
    model
        .filter(|value| !value.trim().is_empty())
        .or_else(|| Some(fallback.to_string()))
}

fn extract_openai_error(body: &str) -> Option<String> {
    #[derive(Deserialize)]
    struct ErrorBody {
        error: Option<OpenAIError>,
    }

    #[derive(Deserialize)]
    struct OpenAIError {
        message: Option<String>,
        #[serde(rename = "type")]
        kind: Option<String>,
        code: Option<String>,
    }

    let parsed: ErrorBody = serde_json::from_str(body).ok()?;
    let error = parsed.error?;
    let mut parts = Vec::new();
    if let Some(message) = error.message
        && !message.trim().is_empty()
    {
        parts.push(message);
    }
    if let Some(kind) = error.kind
        && !kind.trim().is_empty()
    {
        parts.push(format!("type: {}", kind));
    }
    if let Some(code) = error.code
        && !code.trim().is_empty()
    {
        parts.push(format!("code: {}", code));
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(" | "))
    }
}

impl From<OpenAIUsage> for ProviderUsage {
    fn from(usage: OpenAIUsage) -> Self {
        ProviderUsage {
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            total_tokens: usage.total_tokens,
        }
    }
}

#[derive(Debug, Deserialize)]
struct OpenAIResponse {
    model: Option<String>,
    choices: Vec<OpenAIChoice>,
    usage: Option<OpenAIUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAIChoice {
    message: OpenAIMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAIMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<OpenAIToolCall>,
}

#[derive(Debug, Deserialize)]
struct OpenAIToolCall {
    function: OpenAIFunctionCall,
}

#[derive(Debug, Deserialize)]
struct OpenAIFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct OpenAIUsage {
    prompt_tokens: Option<u64>,
    completion_tokens: Option<u64>,
    total_tokens: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_forced_tool_call_arguments() {
        let payload = r#"{
            "model": "gpt-4o-mini",
            "choices": [{"message": {"tool_calls": [{"function": {
                "name": "deliver_translation",
                "arguments": "{\"translation\": \"Hola\"}"
            }}]}}],
            "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}
        }"#;
        let response = extract_tool_response(payload, "deliver_translation", "gpt-4o-mini").unwrap();
        assert_eq!(response.args["translation"], "Hola");
        assert_eq!(response.usage.unwrap().total_tokens, Some(15));
    }

    #[test]
    fn missing_tool_call_is_a_typed_error() {
        let payload = r#"{"choices": [{"message": {"content": "Hola"}}]}"#;
        let err =
            extract_tool_response(payload, "deliver_translation", "gpt-4o-mini").unwrap_err();
        assert!(err.downcast_ref::<ToolCallMissing>().is_some());
    }

    #[test]
    fn extracts_plain_text_content() {
        let payload = r#"{"model": "gpt-4o-mini", "choices": [{"message": {"content": "TRANSLATION: Hola"}}]}"#;
        let response = extract_text_response(payload, "gpt-4o-mini").unwrap();
        assert_eq!(response.text, "TRANSLATION: Hola");
    }

    #[test]
    fn stream_delta_extraction() {
        let delta = extract_stream_delta(r#"{"choices":[{"delta":{"content":"Ho"}}]}"#);
        assert_eq!(delta.as_deref(), Some("Ho"));
        assert!(extract_stream_delta(r#"{"choices":[{"delta":{}}]}"#).is_none());
    }
}
