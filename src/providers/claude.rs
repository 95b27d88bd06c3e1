use anyhow::{Result, anyhow};
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

use super::retry::{Backoff, is_rate_limited, retry_after};
use super::{
    Message, MessageRole, Provider, ProviderFuture, ProviderKind, ProviderResponse, ProviderText,
    ProviderUsage, StreamFuture, TextFuture, ToolCallMissing, ToolSpec,
};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1/messages";
pub(crate) const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";
const MAX_TOKENS: u32 = 1024;

#[derive(Debug, Clone)]
pub struct Claude {
    key: String,
    model: String,
    timeout: Duration,
    messages: Vec<Message>,
    tools: Vec<ToolSpec>,
}

impl Claude {
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

    /// Anthropic takes the system prompt as a top-level field, not a message.
    fn body_base(&self) -> serde_json::Value {
        let (system_inputs, user_inputs): (Vec<&Message>, Vec<&Message>) = self
            .messages
            .iter()
            .partition(|message| matches!(message.role, MessageRole::System));

        let system = system_inputs
            .iter()
            .map(|message| message.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");

        let messages = user_inputs
            .iter()
            .map(|message| json!({"role": "user", "content": message.content}))
            .collect::<Vec<_>>();

        let system_value = if system.trim().is_empty() {
            json!(null)
        } else {
            json!(system)
        };

        json!({
            "model": self.model,
            "max_tokens": MAX_TOKENS,
            "messages": messages,
            "system": system_value
        })
    }
}

impl Provider for Claude {
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
                    "name": tool.name,
                    "description": tool.description,
                    "input_schema": tool.parameters
                }
            ]);
            body["tool_choice"] = json!({"type": "tool", "name": tool.name});

            let text = send_with_retry(&self, &body).await?;
            extract_tool_response(&text, &tool_name, &self.model)
        })
    }

    fn call_text(self) -> TextFuture {
        Box::pin(async move {
            let body = self.body_base();
            let text = send_with_retry(&self, &body).await?;
            extract_text_response(&text, &self.model)
        })
    }

    fn stream_text(self) -> StreamFuture {
        Box::pin(async move {
            let client = super::streaming_client(self.timeout)?;
            let mut body = self.body_base();
            body["stream"] = json!(true);

            let response = client
                .post(base_url())
                .header("x-api-key", self.key.clone())
                .header("anthropic-version", "2023-06-01")
                .json(&body)
                .send()
                .await?;
            let status = response.status();
            if !status.is_success() {
                let text = response.text().await.unwrap_or_default();
                return Err(anyhow!(
                    "Claude API error ({}): {}",
                    status,
                    extract_claude_error(&text).unwrap_or(text)
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
    std::env::var("ANTHROPIC_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string())
}

async fn send_with_retry(provider: &Claude, body: &serde_json::Value) -> Result<String> {
    let client = super::unary_client(provider.timeout)?;
    let url = base_url();

    let mut backoff = Backoff::new();
    loop {
        let response = client
            .post(&url)
            .header("x-api-key", provider.key.clone())
            .header("anthropic-version", "2023-06-01")
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
            backoff.wait(ProviderKind::Claude, retry_after).await;
            continue;
        }
        return Err(anyhow!(
            "Claude API error ({}): {}",
            status,
            extract_claude_error(&text).unwrap_or(text)
        ));
    }
}

fn extract_tool_response(
    text: &str,
    tool_name: &str,
    fallback_model: &str,
) -> Result<ProviderResponse> {
    let payload: ClaudeResponse = serde_json::from_str(text)
        .map_err(|err| anyhow!("failed to parse Claude response JSON: {}", err))?;
    for block in &payload.content {
        if block.kind == "tool_use" && block.name.as_deref() == Some(tool_name) {
            let input = block
                .input
                .clone()
                .ok_or_else(|| anyhow!("Claude tool_use missing input"))?;
            return Ok(ProviderResponse {
                args: input,
                model: resolve_model(payload.model, fallback_model),
                usage: payload.usage.map(ProviderUsage::from),
            });
        }
    }

    Err(ToolCallMissing {
        provider: ProviderKind::Claude,
    }
    .into())
}

fn extract_text_response(text: &str, fallback_model: &str) -> Result<ProviderText> {
    let payload: ClaudeResponse = serde_json::from_str(text)
        .map_err(|err| anyhow!("failed to parse Claude response JSON: {}", err))?;
    let content = payload
        .content
        .iter()
        .filter(|block| block.kind == "text")
        .filter_map(|block| block.text.as_deref())
        .collect::<Vec<_>>()
        .join("");
    if content.trim().is_empty() {
        return Err(anyhow!("no text content returned from Claude"));
    }
    Ok(ProviderText {
        text: content,
        model: resolve_model(payload.model, fallback_model),
        usage: payload.usage.map(ProviderUsage::from),
    })
}

fn extract_stream_delta(payload: &str) -> Option<String> {
    let parsed: StreamEvent = serde_json::from_str(payload).ok()?;
    if parsed.kind != "content_block_delta" {
        return None;
    }
    let delta = parsed.delta?;
    if delta.kind.as_deref() != Some("text_delta") {
        return None;
    }
    delta.text.filter(|text| !text.is_empty())
}

fn resolve_model(model: Option<String>, fallback: &str) -> Option<String> {
    model
        .filter(|value| !value.trim().is_empty())
        .or_else(|| Some(fallback.to_string()))
}

fn extract_claude_error(body: &str) -> Option<String> {
    #[derive(Deserialize)]
    struct ErrorBody {
        error: Option<ClaudeError>,
    }

    #[derive(Deserialize)]
    struct ClaudeError {
        #[serde(rename = "type")]
        kind: Option<String>,
        message: Option<String>,
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
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(" | "))
    }
}

impl From<ClaudeUsage> for ProviderUsage {
    fn from(usage: ClaudeUsage) -> Self {
        ProviderUsage {
            prompt_tokens: usage.input_tokens,
            completion_tokens: usage.output_tokens,
            total_tokens: usage
                .input_tokens
                .zip(usage.output_tokens)
                .map(|(input, output)| input + output),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ClaudeResponse {
    content: Vec<ClaudeContent>,
    model: Option<String>,
    usage: Option<ClaudeUsage>,
}

#[derive(Debug, Deserialize)]
struct ClaudeUsage {
    input_tokens: Option<u64>,
    output_tokens: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ClaudeContent {
    #[serde(rename = "type")]
    kind: String,
    name: Option<String>,
    input: Option<serde_json::Value>,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamEvent {
    #[serde(rename = "type")]
    kind: String,
    delta: Option<StreamDelta>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(rename = "type")]
    kind: Option<String>,
    text: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_tool_use_input() {
        let payload = r#"{
            "model": "claude-sonnet-4-20250514",
            "content": [
                {"type": "text", "text": "Working on it."},
                {"type": "tool_use", "name": "deliver_translation",
                 "input": {"translation": "Hola", "cultural_notes": "Informal greeting."}}
            ],
            "usage": {"input_tokens": 20, "output_tokens": 12}
        }"#;
        let response =
            extract_tool_response(payload, "deliver_translation", DEFAULT_MODEL).unwrap();
        assert_eq!(response.args["translation"], "Hola");
        assert_eq!(response.usage.unwrap().total_tokens, Some(32));
    }

    #[test]
    fn text_only_response_is_a_missing_tool_call() {
        let payload = r#"{"content": [{"type": "text", "text": "Hola"}]}"#;
        let err =
            extract_tool_response(payload, "deliver_translation", DEFAULT_MODEL).unwrap_err();
        assert!(err.downcast_ref::<ToolCallMissing>().is_some());
    }

    #[test]
    fn joins_text_blocks_for_plain_completion() {
        let payload = r#"{
            "content": [{"type": "text", "text": "TRANSLATION: Hola\n"},
                        {"type": "text", "text": "CULTURAL_NOTES: casual"}]
        }"#;
        let response = extract_text_response(payload, DEFAULT_MODEL).unwrap();
        assert!(response.text.contains("CULTURAL_NOTES"));
        assert_eq!(response.model.as_deref(), Some(DEFAULT_MODEL));
    }

    #[test]
    fn stream_delta_only_from_text_deltas() {
        let delta = extract_stream_delta(
            r#"{"type":"content_block_delta","delta":{"type":"text_delta","text":"Ho"}}"#,
        );
        assert_eq!(delta.as_deref(), Some("Ho"));
        assert!(extract_stream_delta(r#"{"type":"message_start"}"#).is_none());
        assert!(
            extract_stream_delta(
                r#"{"type":"content_block_delta","delta":{"type":"input_json_delta","partial_json":"{"}}"#,
            )
            .is_none()
        );
    }
}
