use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use tera::Context as TeraContext;

use super::normalize::{self, FieldSpec};
use super::{render_prompt, require_non_empty};
use crate::error::{PipelineError, classify_provider_error};
use crate::providers::{Provider, ProviderUsage, ToolSpec};

pub const TOOL_NAME: &str = "deliver_refinement";

const PROMPT_TEMPLATE: &str = include_str!("prompts/refinement_prompt.tera");

const REVISED_FIELD: FieldSpec = FieldSpec {
    key: "revised_translation",
    labels: &["REVISED_TRANSLATION", "REVISED TRANSLATION", "NEW_TRANSLATION"],
    tags: &["revised_translation", "new_translation"],
};
const CHANGES_FIELD: FieldSpec = FieldSpec {
    key: "changes_explanation",
    labels: &["CHANGES_EXPLANATION", "EXPLANATION_OF_CHANGES", "CHANGES"],
    tags: &["changes_explanation"],
};
const IMPROVEMENT_FIELD: FieldSpec = FieldSpec {
    key: "improvement_notes",
    labels: &["IMPROVEMENT_NOTES", "FURTHER_IMPROVEMENTS"],
    tags: &["improvement_notes"],
};

const OPTIONAL_FIELDS: [FieldSpec; 2] = [CHANGES_FIELD, IMPROVEMENT_FIELD];

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefinementRequest {
    pub source_text: String,
    pub current_translation: String,
    pub target_language: String,
    pub user_feedback: String,
    #[serde(default)]
    pub prior_analysis_context: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefinementResult {
    pub revised_translation: String,
    pub changes_explanation: String,
    pub improvement_notes: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<ProviderUsage>,
}

pub fn tool_spec() -> ToolSpec {
    ToolSpec {
        name: TOOL_NAME.to_string(),
        description: "Deliver the revised translation with an explanation of changes.".to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "changes_explanation": {
                    "type": "string",
                    "description": "What was changed and why."
                },
                "revised_translation": {
                    "type": "string",
                    "description": "The revised translation in the target language."
                },
                "improvement_notes": {
                    "type": "string",
                    "description": "Remaining suggestions or trade-offs."
                }
            },
            "required": ["changes_explanation", "revised_translation", "improvement_notes"]
        }),
    }
}

fn validate(request: &RefinementRequest) -> Result<(), PipelineError> {
    require_non_empty(&request.source_text, "sourceText")?;
    require_non_empty(&request.current_translation, "currentTranslation")?;
    require_non_empty(&request.target_language, "targetLanguage")?;
    require_non_empty(&request.user_feedback, "userFeedback")
}

pub fn system_prompt(request: &RefinementRequest) -> Result<String, PipelineError> {
    let prior_analysis = request
        .prior_analysis_context
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty());

    let mut context = TeraContext::new();
    context.insert("target_language", request.target_language.trim());
    context.insert("prior_analysis", &prior_analysis);
    context.insert("tool_name", TOOL_NAME);
    render_prompt(PROMPT_TEMPLATE, &context)
}

fn user_input(request: &RefinementRequest) -> String {
    format!(
        "Original message:\n{}\n\nCurrent translation:\n{}\n\nFeedback from the sender:\n{}",
        request.source_text.trim(),
        request.current_translation.trim(),
        request.user_feedback.trim()
    )
}

/// Feedback-driven revision of an existing translation.
pub async fn refine<P: Provider>(
    provider: P,
    request: &RefinementRequest,
    timeout_secs: u64,
) -> Result<RefinementResult, PipelineError> {
    validate(request)?;
    let system = system_prompt(request)?;
    let response = provider
        .append_system_input(system)
        .append_user_input(user_input(request))
        .register_tool(tool_spec())
        .call_tool(TOOL_NAME)
        .await
        .map_err(|err| classify_provider_error(err, timeout_secs))?;

    let fields = normalize::fields_from_tool_args(&response.args, &REVISED_FIELD, &OPTIONAL_FIELDS)?;
    Ok(result_from_fields(fields, response.model, response.usage))
}

/// Normalize free-text revision output, for callers running without the
/// structured contract.
pub fn result_from_text(text: &str) -> Result<RefinementResult, PipelineError> {
    let fields = normalize::fields_from_text(text, &REVISED_FIELD, &OPTIONAL_FIELDS)?;
    Ok(result_from_fields(fields, None, None))
}

fn result_from_fields(
    mut fields: HashMap<&'static str, String>,
    model: Option<String>,
    usage: Option<ProviderUsage>,
) -> RefinementResult {
    RefinementResult {
        revised_translation: fields.remove("revised_translation").unwrap_or_default(),
        changes_explanation: fields.remove("changes_explanation").unwrap_or_default(),
        improvement_notes: fields.remove("improvement_notes").unwrap_or_default(),
        model,
        usage,
    }
}
