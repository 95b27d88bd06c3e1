use anyhow::{Result, anyhow};
use futures_util::Stream;
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

mod claude;
mod gemini;
mod openai;
mod retry;
mod sse;

pub use claude::Claude;
pub use gemini::Gemini;
pub use openai::OpenAI;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(45);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    OpenAI,
    Gemini,
    Claude,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::OpenAI => "openai",
            ProviderKind::Gemini => "gemini",
            ProviderKind::Claude => "claude",
        }
    }
}

/// The model completed the exchange without invoking the forced tool. The
/// invoker treats this as a format miss rather than a transport fault, so it
/// can fall back to a text contract.
#[derive(Debug, thiserror::Error)]
#[error("no tool call returned from {}", .provider.as_str())]
pub struct ToolCallMissing {
    pub provider: ProviderKind,
}

#[derive(Debug, Clone)]
pub struct ProviderSelection {
    pub provider: ProviderKind,
    pub requested_model: Option<String>,
}

/// Structured-output contract: a named operation with a JSON schema the model
/// is forced to satisfy, so the response needs no free-text parsing.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderUsage {
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
    pub total_tokens: Option<u64>,
}

/// Result of a forced tool call: the tool arguments as raw JSON.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderResponse {
    pub args: serde_json::Value,
    pub model: Option<String>,
    pub usage: Option<ProviderUsage>,
}

/// Result of a plain completion call.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderText {
    pub text: String,
    pub model: Option<String>,
    pub usage: Option<ProviderUsage>,
}

#[derive(Debug, Clone, Copy)]
pub enum MessageRole {
    System,
    User,
}

#[derive(Debug, Clone)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
}

impl Message {
    pub fn system(content: String) -> Self {
        Self {
            role: MessageRole::System,
            content,
        }
    }

    pub fn user(content: String) -> Self {
        Self {
            role: MessageRole::User,
            content,
        }
    }
}

pub type ProviderFuture = Pin<Box<dyn Future<Output = Result<ProviderResponse>> + Send>>;
pub type TextFuture = Pin<Box<dyn Future<Output = Result<ProviderText>> + Send>>;
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;
pub type StreamFuture = Pin<Box<dyn Future<Output = Result<ChunkStream>> + Send>>;

pub trait Provider: Clone + Send + Sync {
    fn append_system_input(self, input: String) -> Self;
    fn append_user_input(self, input: String) -> Self;
    fn register_tool(self, tool: ToolSpec) -> Self;
    fn with_timeout(self, timeout: Duration) -> Self;
    /// Forced structured-output invocation of a registered tool.
    fn call_tool(self, tool_name: &str) -> ProviderFuture;
    /// Plain completion; the caller is responsible for parsing the text.
    fn call_text(self) -> TextFuture;
    /// Open an incremental completion stream. Dropping the stream aborts the
    /// underlying connection.
    fn stream_text(self) -> StreamFuture;
}

#[derive(Debug, Clone)]
pub enum ProviderImpl {
    OpenAI(OpenAI),
    Gemini(Gemini),
    Claude(Claude),
}

impl Provider for ProviderImpl {
    fn append_system_input(self, input: String) -> Self {
        match self {
            ProviderImpl::OpenAI(provider) => {
                ProviderImpl::OpenAI(provider.append_system_input(input))
            }
            ProviderImpl::Gemini(provider) => {
                ProviderImpl::Gemini(provider.append_system_input(input))
            }
            ProviderImpl::Claude(provider) => {
                ProviderImpl::Claude(provider.append_system_input(input))
            }
        }
    }

    fn append_user_input(self, input: String) -> Self {
        match self {
            ProviderImpl::OpenAI(provider) => {
                ProviderImpl::OpenAI(provider.append_user_input(input))
            }
            ProviderImpl::Gemini(provider) => {
                ProviderImpl::Gemini(provider.append_user_input(input))
            }
            ProviderImpl::Claude(provider) => {
                ProviderImpl::Claude(provider.append_user_input(input))
            }
        }
    }

    fn register_tool(self, tool: ToolSpec) -> Self {
        match self {
            ProviderImpl::OpenAI(provider) => ProviderImpl::OpenAI(provider.register_tool(tool)),
            ProviderImpl::Gemini(provider) => ProviderImpl::Gemini(provider.register_tool(tool)),
            ProviderImpl::Claude(provider) => ProviderImpl::Claude(provider.register_tool(tool)),
        }
    }

    fn with_timeout(self, timeout: Duration) -> Self {
        match self {
            ProviderImpl::OpenAI(provider) => ProviderImpl::OpenAI(provider.with_timeout(timeout)),
            ProviderImpl::Gemini(provider) => ProviderImpl::Gemini(provider.with_timeout(timeout)),
            ProviderImpl::Claude(provider) => ProviderImpl::Claude(provider.with_timeout(timeout)),
        }
    }

    fn call_tool(self, tool_name: &str) -> ProviderFuture {
        match self {
            ProviderImpl::OpenAI(provider) => provider.call_tool(tool_name),
            ProviderImpl::Gemini(provider) => provider.call_tool(tool_name),
            ProviderImpl::Claude(provider) => provider.call_tool(tool_name),
        }
    }

    fn call_text(self) -> TextFuture {
        match self {
            ProviderImpl::OpenAI(provider) => provider.call_text(),
            ProviderImpl::Gemini(provider) => provider.call_text(),
            ProviderImpl::Claude(provider) => provider.call_text(),
        }
    }

    fn stream_text(self) -> StreamFuture {
        match self {
            ProviderImpl::OpenAI(provider) => provider.stream_text(),
            ProviderImpl::Gemini(provider) => provider.stream_text(),
            ProviderImpl::Claude(provider) => provider.stream_text(),
        }
    }
}

pub fn build_provider(
    provider: ProviderKind,
    key: String,
    model: Option<String>,
    timeout: Duration,
) -> ProviderImpl {
    let base = match provider {
        ProviderKind::OpenAI => ProviderImpl::OpenAI(OpenAI::new(key)),
        ProviderKind::Gemini => ProviderImpl::Gemini(Gemini::new(key)),
        ProviderKind::Claude => ProviderImpl::Claude(Claude::new(key)),
    };
    let base = match (base, model) {
        (ProviderImpl::OpenAI(p), Some(model)) => ProviderImpl::OpenAI(p.with_model(model)),
        (ProviderImpl::Gemini(p), Some(model)) => ProviderImpl::Gemini(p.with_model(model)),
        (ProviderImpl::Claude(p), Some(model)) => ProviderImpl::Claude(p.with_model(model)),
        (base, None) => base,
    };
    base.with_timeout(timeout)
}

/// Resolve which backend to use from an optional `provider` or
/// `provider:model` argument; with no argument, pick the first provider that
/// has an API key in the environment.
pub fn resolve_provider_selection(
    model_arg: Option<&str>,
    override_key: Option<&str>,
) -> Result<ProviderSelection> {
    match model_arg {
        Some(model) => parse_model_arg(model),
        None => default_provider_selection(override_key),
    }
}

/// Per-request keys take precedence over environment keys and are never
/// stored anywhere.
pub fn resolve_key(provider: ProviderKind, override_key: Option<&str>) -> Result<String> {
    if let Some(key) = override_key {
        let key = key.trim();
        if !key.is_empty() {
            return Ok(key.to_string());
        }
    }

    match provider {
        ProviderKind::OpenAI => get_env("OPENAI_API_KEY"),
        ProviderKind::Gemini => get_env("GEMINI_API_KEY").or_else(|| get_env("GOOGLE_API_KEY")),
        ProviderKind::Claude => get_env("ANTHROPIC_API_KEY"),
    }
    .ok_or_else(|| anyhow!("API key not found for provider {}", provider.as_str()))
}

fn default_provider_selection(override_key: Option<&str>) -> Result<ProviderSelection> {
    for (env_keys, provider) in [
        (&["ANTHROPIC_API_KEY"][..], ProviderKind::Claude),
        (&["OPENAI_API_KEY"][..], ProviderKind::OpenAI),
        (&["GEMINI_API_KEY", "GOOGLE_API_KEY"][..], ProviderKind::Gemini),
    ] {
        if env_keys.iter().any(|key| get_env(key).is_some()) {
            return Ok(ProviderSelection {
                provider,
                requested_model: None,
            });
        }
    }

    if override_key.is_some() {
        return Ok(ProviderSelection {
            provider: ProviderKind::Claude,
            requested_model: None,
        });
    }

    Err(anyhow!(
        "no API keys found (checked ANTHROPIC_API_KEY, OPENAI_API_KEY, GEMINI_API_KEY/GOOGLE_API_KEY)"
    ))
}

fn parse_model_arg(model_arg: &str) -> Result<ProviderSelection> {
    let raw = model_arg.trim();
    if raw.is_empty() {
        return Err(anyhow!("model argument is empty"));
    }

    let lower = raw.to_lowercase();
    if let Some(provider) = provider_from_name(&lower) {
        return Ok(ProviderSelection {
            provider,
            requested_model: None,
        });
    }

    if let Some((provider_part, model_part)) = raw.split_once(':') {
        if let Some(provider) = provider_from_name(&provider_part.to_lowercase()) {
            let model = model_part.trim();
            return Ok(ProviderSelection {
                provider,
                requested_model: (!model.is_empty()).then(|| model.to_string()),
            });
        }
    }

    Err(anyhow!(
        "unable to infer provider from model '{}'. Use provider:model (openai:, gemini:, claude:)",
        raw
    ))
}

fn provider_from_name(name: &str) -> Option<ProviderKind> {
    match name {
        "openai" => Some(ProviderKind::OpenAI),
        "gemini" | "google" => Some(ProviderKind::Gemini),
        "claude" | "anthropic" => Some(ProviderKind::Claude),
        _ => None,
    }
}

fn get_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

/// Client for unary calls: the deadline covers the whole exchange.
pub(crate) fn unary_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|err| anyhow!("failed to build HTTP client: {}", err))
}

/// Client for streaming calls: only connection establishment is bounded, so a
/// healthy long-lived stream is not cut off mid-delivery.
pub(crate) fn streaming_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(timeout)
        .build()
        .map_err(|err| anyhow!("failed to build HTTP client: {}", err))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_provider_model_pair() {
        let selection = resolve_provider_selection(Some("openai:gpt-4o-mini"), None).unwrap();
        assert_eq!(selection.provider, ProviderKind::OpenAI);
        assert_eq!(selection.requested_model.as_deref(), Some("gpt-4o-mini"));
    }

    #[test]
    fn bare_provider_name_selects_default_model() {
        let selection = resolve_provider_selection(Some("anthropic"), None).unwrap();
        assert_eq!(selection.provider, ProviderKind::Claude);
        assert!(selection.requested_model.is_none());
    }

    #[test]
    fn unknown_provider_is_rejected() {
        assert!(resolve_provider_selection(Some("mistral:large"), None).is_err());
    }

    #[test]
    fn override_key_beats_missing_env() {
        let key = resolve_key(ProviderKind::Claude, Some("sk-test")).unwrap();
        assert_eq!(key, "sk-test");
    }
}
