use anyhow::anyhow;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::providers::{
    Message, Provider, ProviderFuture, ProviderKind, ProviderResponse, ProviderText, StreamFuture,
    TextFuture, ToolCallMissing, ToolSpec,
};

pub(crate) const TEST_MODEL: &str = "test-model";

#[derive(Debug, Clone)]
pub(crate) struct CapturedCall {
    pub messages: Vec<Message>,
    pub tool_name: Option<String>,
}

/// Scripted stand-in for a real backend. Tool-call and text responses are
/// popped from queues; every invocation records the exact inputs it carried
/// so tests can assert on prompt construction.
#[derive(Debug, Clone, Default)]
pub(crate) struct TestProvider {
    messages: Vec<Message>,
    tools: Vec<ToolSpec>,
    tool_args: Arc<Mutex<VecDeque<serde_json::Value>>>,
    texts: Arc<Mutex<VecDeque<String>>>,
    chunks: Arc<Vec<String>>,
    calls: Arc<Mutex<Vec<CapturedCall>>>,
    decline_tool: bool,
}

impl TestProvider {
    pub fn with_tool_args(args: serde_json::Value) -> Self {
        let provider = Self::default();
        provider.tool_args.lock().unwrap().push_back(args);
        provider
    }

    /// Emulate a model without tool support: every tool invocation reports
    /// "no tool call" and the scripted text answers instead.
    pub fn with_text_only(text: &str) -> Self {
        let provider = Self {
            decline_tool: true,
            ..Self::default()
        };
        provider.texts.lock().unwrap().push_back(text.to_string());
        provider
    }

    pub fn with_stream_chunks(chunks: &[&str]) -> Self {
        Self {
            chunks: Arc::new(chunks.iter().map(|chunk| chunk.to_string()).collect()),
            ..Self::default()
        }
    }

    pub fn captured_calls(&self) -> Vec<CapturedCall> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, tool_name: Option<&str>) {
        self.calls.lock().unwrap().push(CapturedCall {
            messages: self.messages.clone(),
            tool_name: tool_name.map(str::to_string),
        });
    }
}

impl Provider for TestProvider {
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

    fn with_timeout(self, _timeout: Duration) -> Self {
        self
    }

    fn call_tool(self, tool_name: &str) -> ProviderFuture {
        self.record(Some(tool_name));
        let declined = self.decline_tool;
        let args = self.tool_args.lock().unwrap().pop_front();
        Box::pin(async move {
            if declined {
                return Err(ToolCallMissing {
                    provider: ProviderKind::Claude,
                }
                .into());
            }
            let args = args.ok_or_else(|| anyhow!("no scripted tool response"))?;
            Ok(ProviderResponse {
                args,
                model: Some(TEST_MODEL.to_string()),
                usage: None,
            })
        })
    }

    fn call_text(self) -> TextFuture {
        self.record(None);
        let text = self.texts.lock().unwrap().pop_front();
        Box::pin(async move {
            let text = text.ok_or_else(|| anyhow!("no scripted text response"))?;
            Ok(ProviderText {
                text,
                model: Some(TEST_MODEL.to_string()),
                usage: None,
            })
        })
    }

    fn stream_text(self) -> StreamFuture {
        self.record(None);
        let chunks: Vec<anyhow::Result<String>> = self
            .chunks
            .iter()
            .map(|chunk| Ok(chunk.clone()))
            .collect();
        Box::pin(async move {
            Ok(Box::pin(futures_util::stream::iter(chunks)) as crate::providers::ChunkStream)
        })
    }
}
