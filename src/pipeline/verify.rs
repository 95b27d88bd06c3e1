use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use tera::Context as TeraContext;

use super::normalize::{self, FieldSpec};
use super::{render_prompt, require_non_empty};
use crate::error::{PipelineError, classify_provider_error};
use crate::providers::{Provider, ProviderUsage, ToolSpec};

pub const TOOL_NAME: &str = "report_back_translation";

const PROMPT_TEMPLATE: &str = include_str!("prompts/verification_prompt.tera");

const LITERAL_FIELD: FieldSpec = FieldSpec {
    key: "literal_translation",
    labels: &["LITERAL_TRANSLATION", "BACK_TRANSLATION", "BACK TRANSLATION"],
    tags: &["literal_translation", "back_translation"],
};
const TONE_FIELD: FieldSpec = FieldSpec {
    key: "perceived_tone",
    labels: &["PERCEIVED_TONE", "TONE"],
    tags: &["perceived_tone", "tone"],
};
const NUANCE_FIELD: FieldSpec = FieldSpec {
    key: "cultural_nuance",
    labels: &["CULTURAL_NUANCE", "NUANCE"],
    tags: &["cultural_nuance"],
};
const ASSESSMENT_FIELD: FieldSpec = FieldSpec {
    key: "overall_assessment",
    labels: &["OVERALL_ASSESSMENT", "ASSESSMENT"],
    tags: &["overall_assessment"],
};

const OPTIONAL_FIELDS: [FieldSpec; 3] = [TONE_FIELD, NUANCE_FIELD, ASSESSMENT_FIELD];

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationResult {
    pub literal_translation: String,
    pub perceived_tone: String,
    pub cultural_nuance: String,
    pub overall_assessment: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<ProviderUsage>,
}

pub fn tool_spec() -> ToolSpec {
    ToolSpec {
        name: TOOL_NAME.to_string(),
        description: "Report the blind review of a translated text.".to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "literal_translation": {
                    "type": "string",
                    "description": "A literal English rendering of the text."
                },
                "perceived_tone": {
                    "type": "string",
                    "description": "The tone a native speaker would perceive."
                },
                "cultural_nuance": {
                    "type": "string",
                    "description": "Cultural nuance or hidden meaning in the text."
                },
                "overall_assessment": {
                    "type": "string",
                    "description": "How the message would likely be received."
                }
            },
            "required": [
                "literal_translation",
                "perceived_tone",
                "cultural_nuance",
                "overall_assessment"
            ]
        }),
    }
}

/// Build the reviewer's system instruction. Takes only the target language by
/// construction: the original source text and its stated intent must never
/// reach the reviewer, or the check stops being independent.
pub fn system_prompt(target_language: &str) -> Result<String, PipelineError> {
    let mut context = TeraContext::new();
    context.insert("target_language", target_language.trim());
    context.insert("tool_name", TOOL_NAME);
    render_prompt(PROMPT_TEMPLATE, &context)
}

/// Blind back-translation review of an already-produced translation.
pub async fn verify<P: Provider>(
    provider: P,
    translated_text: &str,
    target_language: &str,
    timeout_secs: u64,
) -> Result<VerificationResult, PipelineError> {
    require_non_empty(translated_text, "translatedText")?;
    require_non_empty(target_language, "targetLanguage")?;

    let system = system_prompt(target_language)?;
    let response = provider
        .append_system_input(system)
        .append_user_input(translated_text.trim().to_string())
        .register_tool(tool_spec())
        .call_tool(TOOL_NAME)
        .await
        .map_err(|err| classify_provider_error(err, timeout_secs))?;

    let fields = normalize::fields_from_tool_args(&response.args, &LITERAL_FIELD, &OPTIONAL_FIELDS)?;
    Ok(result_from_fields(fields, response.model, response.usage))
}

/// Normalize free-text reviewer output, for callers running without the
/// structured contract.
pub fn result_from_text(text: &str) -> Result<VerificationResult, PipelineError> {
    let fields = normalize::fields_from_text(text, &LITERAL_FIELD, &OPTIONAL_FIELDS)?;
    Ok(result_from_fields(fields, None, None))
}

fn result_from_fields(
    mut fields: HashMap<&'static str, String>,
    model: Option<String>,
    usage: Option<ProviderUsage>,
) -> VerificationResult {
    VerificationResult {
        literal_translation: fields.remove("literal_translation").unwrap_or_default(),
        perceived_tone: fields.remove("perceived_tone").unwrap_or_default(),
        cultural_nuance: fields.remove("cultural_nuance").unwrap_or_default(),
        overall_assessment: fields.remove("overall_assessment").unwrap_or_default(),
        model,
        usage,
    }
}
