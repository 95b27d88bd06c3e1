use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use tera::Context as TeraContext;

use super::normalize::{self, FieldSpec};
use super::{CancelToken, PresetContext, apply_prompt_override, render_prompt, require_non_empty};
use crate::error::{PipelineError, classify_provider_error};
use crate::providers::{ChunkStream, Provider, ProviderUsage, ToolCallMissing, ToolSpec};

pub const TOOL_NAME: &str = "deliver_translation";

const PROMPT_TEMPLATE: &str = include_str!("prompts/translation_prompt.tera");

const DEFAULT_TONE: &str = "neutral and clear";
const DEFAULT_CULTURAL_CONTEXT: &str = "a general audience";

const TRANSLATION_FIELD: FieldSpec = FieldSpec {
    key: "translation",
    labels: &["TRANSLATION", "TRANSLATED_TEXT", "FINAL_TRANSLATION"],
    tags: &["translation", "final_translation"],
};
const INTENT_FIELD: FieldSpec = FieldSpec {
    key: "intent",
    labels: &["INTENT", "COMMUNICATIVE_INTENT"],
    tags: &["intent"],
};
const CONSIDERATIONS_FIELD: FieldSpec = FieldSpec {
    key: "cultural_considerations",
    labels: &["CULTURAL_CONSIDERATIONS"],
    tags: &["cultural_considerations"],
};
const STRATEGY_FIELD: FieldSpec = FieldSpec {
    key: "strategy",
    labels: &["STRATEGY", "TRANSLATION_STRATEGY"],
    tags: &["strategy"],
};
const NOTES_FIELD: FieldSpec = FieldSpec {
    key: "cultural_notes",
    labels: &["CULTURAL_NOTES", "CULTURAL NOTES", "NOTES"],
    tags: &["cultural_notes"],
};

const OPTIONAL_FIELDS: [FieldSpec; 4] = [
    INTENT_FIELD,
    CONSIDERATIONS_FIELD,
    STRATEGY_FIELD,
    NOTES_FIELD,
];

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranslationRequest {
    pub source_text: String,
    pub target_language: String,
    #[serde(default)]
    pub prompt_override: Option<String>,
    #[serde(default)]
    pub preset_context: Option<PresetContext>,
}

impl TranslationRequest {
    pub fn new(source_text: impl Into<String>, target_language: impl Into<String>) -> Self {
        Self {
            source_text: source_text.into(),
            target_language: target_language.into(),
            prompt_override: None,
            preset_context: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TranslationResult {
    pub translation: String,
    pub cultural_notes: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cultural_considerations: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<ProviderUsage>,
}

impl TranslationResult {
    /// Flat summary of the structured analysis, fed back into the refinement
    /// prompt as prior context.
    pub fn analysis_summary(&self) -> String {
        let mut parts = Vec::new();
        if let Some(intent) = self.intent.as_deref().filter(|s| !s.is_empty()) {
            parts.push(format!("Intent: {}", intent));
        }
        if let Some(considerations) = self
            .cultural_considerations
            .as_deref()
            .filter(|s| !s.is_empty())
        {
            parts.push(format!("Cultural considerations: {}", considerations));
        }
        if let Some(strategy) = self.strategy.as_deref().filter(|s| !s.is_empty()) {
            parts.push(format!("Strategy: {}", strategy));
        }
        if !self.cultural_notes.is_empty() {
            parts.push(format!("Cultural notes: {}", self.cultural_notes));
        }
        parts.join("\n")
    }
}

pub fn tool_spec() -> ToolSpec {
    ToolSpec {
        name: TOOL_NAME.to_string(),
        description: "Deliver the staged translation analysis and the final translation."
            .to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "intent": {
                    "type": "string",
                    "description": "The communicative intent of the source message."
                },
                "cultural_considerations": {
                    "type": "string",
                    "description": "Cultural factors that shaped the phrasing."
                },
                "strategy": {
                    "type": "string",
                    "description": "The translation strategy chosen."
                },
                "translation": {
                    "type": "string",
                    "description": "The final translation in the target language."
                },
                "cultural_notes": {
                    "type": "string",
                    "description": "Notes the reader should know about the translation."
                }
            },
            "required": [
                "intent",
                "cultural_considerations",
                "strategy",
                "translation",
                "cultural_notes"
            ]
        }),
    }
}

fn validate(request: &TranslationRequest) -> Result<(), PipelineError> {
    require_non_empty(&request.source_text, "sourceText")?;
    require_non_empty(&request.target_language, "targetLanguage")
}

/// Build the system instruction. A caller-supplied override wins verbatim
/// (after placeholder substitution); otherwise the built-in staged prompt is
/// rendered with preset context. `structured` selects between the tool-call
/// contract and the labeled-block fallback format.
pub fn system_prompt(
    request: &TranslationRequest,
    structured: bool,
) -> Result<String, PipelineError> {
    if let Some(prompt) = request.prompt_override.as_deref() {
        return apply_prompt_override(prompt, request.target_language.trim());
    }

    let preset = request.preset_context.clone().unwrap_or_default();
    let tone = non_empty_or(&preset.tone, DEFAULT_TONE);
    let cultural_context = non_empty_or(&preset.cultural_context, DEFAULT_CULTURAL_CONTEXT);
    let custom_instructions = preset
        .custom_instructions
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty());

    let mut context = TeraContext::new();
    context.insert("target_language", request.target_language.trim());
    context.insert("tone", tone);
    context.insert("cultural_context", cultural_context);
    context.insert("custom_instructions", &custom_instructions);
    context.insert("structured", &structured);
    context.insert("tool_name", TOOL_NAME);
    render_prompt(PROMPT_TEMPLATE, &context)
}

/// Structured-output translation. Provider failures surface immediately; the
/// one compatibility path is a model that answered without a tool call, which
/// is retried once on the labeled-block text contract.
pub async fn translate<P: Provider>(
    provider: P,
    request: &TranslationRequest,
    timeout_secs: u64,
) -> Result<TranslationResult, PipelineError> {
    validate(request)?;
    let source_text = request.source_text.trim().to_string();
    let tool_call = provider
        .clone()
        .append_system_input(system_prompt(request, true)?)
        .append_user_input(source_text.clone())
        .register_tool(tool_spec())
        .call_tool(TOOL_NAME)
        .await;

    match tool_call {
        Ok(response) => {
            let fields = normalize::fields_from_tool_args(
                &response.args,
                &TRANSLATION_FIELD,
                &OPTIONAL_FIELDS,
            )?;
            Ok(result_from_fields(fields, response.model, response.usage))
        }
        Err(err) if err.downcast_ref::<ToolCallMissing>().is_some() => {
            let text = provider
                .append_system_input(system_prompt(request, false)?)
                .append_user_input(source_text)
                .call_text()
                .await
                .map_err(|err| classify_provider_error(err, timeout_secs))?;
            let mut result = result_from_text(&text.text)?;
            result.model = text.model;
            result.usage = text.usage;
            Ok(result)
        }
        Err(err) => Err(classify_provider_error(err, timeout_secs)),
    }
}

/// Open the streaming variant. The model is instructed to emit labeled-block
/// text, which the caller normalizes once the stream completes.
pub async fn open_stream<P: Provider>(
    provider: P,
    request: &TranslationRequest,
    timeout_secs: u64,
) -> Result<ChunkStream, PipelineError> {
    validate(request)?;
    let system = system_prompt(request, false)?;
    provider
        .append_system_input(system)
        .append_user_input(request.source_text.trim().to_string())
        .stream_text()
        .await
        .map_err(|err| classify_provider_error(err, timeout_secs))
}

/// Drain a chunk stream to completion, forwarding each chunk. A tripped
/// cancel token stops delivery immediately; the stream is dropped, which
/// aborts the connection.
pub async fn collect_stream(
    mut stream: ChunkStream,
    cancel: &CancelToken,
    mut on_chunk: impl FnMut(&str),
    timeout_secs: u64,
) -> Result<String, PipelineError> {
    let mut full_text = String::new();
    while let Some(chunk) = stream.next().await {
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled(
                "translation stream superseded".to_string(),
            ));
        }
        let chunk = chunk.map_err(|err| classify_provider_error(err, timeout_secs))?;
        full_text.push_str(&chunk);
        on_chunk(&chunk);
    }
    if cancel.is_cancelled() {
        return Err(PipelineError::Cancelled(
            "translation stream superseded".to_string(),
        ));
    }
    Ok(full_text)
}

/// Normalize accumulated stream text into the authoritative result.
pub fn result_from_text(text: &str) -> Result<TranslationResult, PipelineError> {
    let fields = normalize::fields_from_text(text, &TRANSLATION_FIELD, &OPTIONAL_FIELDS)?;
    Ok(result_from_fields(fields, None, None))
}

fn result_from_fields(
    mut fields: HashMap<&'static str, String>,
    model: Option<String>,
    usage: Option<ProviderUsage>,
) -> TranslationResult {
    TranslationResult {
        translation: fields.remove("translation").unwrap_or_default(),
        cultural_notes: fields.remove("cultural_notes").unwrap_or_default(),
        intent: fields.remove("intent"),
        cultural_considerations: fields.remove("cultural_considerations"),
        strategy: fields.remove("strategy"),
        model,
        usage,
    }
}

fn non_empty_or<'a>(value: &'a str, fallback: &'a str) -> &'a str {
    let trimmed = value.trim();
    if trimmed.is_empty() { fallback } else { trimmed }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::TestProvider;
    use serde_json::json;

    fn request() -> TranslationRequest {
        TranslationRequest::new("Please take your medication with food.", "Spanish")
    }

    #[test]
    fn built_in_prompt_carries_preset_context() {
        let mut request = request();
        request.preset_context = Some(PresetContext {
            tone: "warm".to_string(),
            cultural_context: "family caregivers".to_string(),
            custom_instructions: Some("Avoid medical jargon.".to_string()),
        });
        let prompt = system_prompt(&request, true).unwrap();
        assert!(prompt.contains("Spanish"));
        assert!(prompt.contains("warm"));
        assert!(prompt.contains("family caregivers"));
        assert!(prompt.contains("Avoid medical jargon."));
        assert!(prompt.contains(TOOL_NAME));
    }

    #[test]
    fn built_in_prompt_defaults_neutral_placeholders() {
        let prompt = system_prompt(&request(), true).unwrap();
        assert!(prompt.contains("neutral and clear"));
        assert!(prompt.contains("a general audience"));
    }

    #[test]
    fn fallback_prompt_spells_out_labeled_blocks() {
        let prompt = system_prompt(&request(), false).unwrap();
        assert!(prompt.contains("TRANSLATION:"));
        assert!(prompt.contains("CULTURAL_NOTES:"));
        assert!(!prompt.contains(TOOL_NAME));
    }

    #[test]
    fn prompt_override_is_used_verbatim() {
        let mut request = request();
        request.prompt_override =
            Some("Translate into {TARGET_LANGUAGE}. Keep it short.".to_string());
        let prompt = system_prompt(&request, true).unwrap();
        assert_eq!(prompt, "Translate into Spanish. Keep it short.");
    }

    #[tokio::test]
    async fn translate_returns_normalized_result() {
        let provider = TestProvider::with_tool_args(json!({
            "intent": "Give a medication instruction.",
            "cultural_considerations": "Use the formal register.",
            "strategy": "Direct translation with formal address.",
            "translation": "Por favor, tome su medicamento con alimentos.",
            "cultural_notes": "The formal 'tome' suits a healthcare setting."
        }));
        let result = translate(provider, &request(), 45).await.unwrap();
        assert_eq!(
            result.translation,
            "Por favor, tome su medicamento con alimentos."
        );
        assert!(!result.cultural_notes.is_empty());
        assert!(result.intent.is_some());
    }

    #[tokio::test]
    async fn empty_source_text_is_rejected_before_any_call() {
        let provider = TestProvider::with_tool_args(json!({}));
        let err = translate(provider.clone(), &TranslationRequest::new("  ", "Spanish"), 45)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
        assert!(provider.captured_calls().is_empty());
    }

    #[tokio::test]
    async fn missing_translation_in_tool_args_is_a_parse_error() {
        let provider = TestProvider::with_tool_args(json!({"intent": "x"}));
        let err = translate(provider, &request(), 45).await.unwrap_err();
        assert!(matches!(err, PipelineError::Parse(_)));
    }

    #[tokio::test]
    async fn text_only_model_falls_back_to_labeled_blocks() {
        let provider = TestProvider::with_text_only(
            "TRANSLATION: Por favor, tome su medicamento.\nCULTURAL_NOTES: Formal register.",
        );
        let result = translate(provider.clone(), &request(), 45).await.unwrap();
        assert_eq!(result.translation, "Por favor, tome su medicamento.");
        assert_eq!(result.cultural_notes, "Formal register.");

        let calls = provider.captured_calls();
        assert_eq!(calls.len(), 2);
        assert!(calls[0].tool_name.is_some());
        assert!(calls[1].tool_name.is_none());
    }

    #[tokio::test]
    async fn stream_collects_chunks_then_normalizes() {
        let provider = TestProvider::with_stream_chunks(&[
            "TRANSLATION: Por favor, ",
            "tome su medicamento.\n",
            "CULTURAL_NOTES: Formal register.",
        ]);
        let stream = open_stream(provider, &request(), 45).await.unwrap();
        let mut seen = Vec::new();
        let cancel = CancelToken::new();
        let full = collect_stream(stream, &cancel, |chunk| seen.push(chunk.to_string()), 45)
            .await
            .unwrap();
        assert_eq!(seen.len(), 3);
        let result = result_from_text(&full).unwrap();
        assert_eq!(result.translation, "Por favor, tome su medicamento.");
        assert_eq!(result.cultural_notes, "Formal register.");
    }

    #[tokio::test]
    async fn cancelled_stream_stops_delivering_chunks() {
        let provider =
            TestProvider::with_stream_chunks(&["TRANSLATION: Hola", " amigo", " mio"]);
        let stream = open_stream(provider, &request(), 45).await.unwrap();
        let cancel = CancelToken::new();
        let inner = cancel.clone();
        let mut delivered = 0usize;
        let err = collect_stream(
            stream,
            &cancel,
            |_| {
                delivered += 1;
                inner.cancel();
            },
            45,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled(_)));
        assert_eq!(delivered, 1);
    }
}
