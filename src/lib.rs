use anyhow::{Context, Result, anyhow};
use std::path::Path;
use std::time::Duration;

pub mod error;
pub mod logging;
pub mod pipeline;
pub mod providers;
pub mod server;
pub mod session;
pub mod settings;
pub mod tts;

#[cfg(test)]
mod test_util;

pub use error::PipelineError;
pub use pipeline::{
    CancelToken, Pipeline, PresetContext, RefinementRequest, RefinementResult, TranslationRequest,
    TranslationResult, VerificationResult,
};
pub use providers::{Claude, Gemini, OpenAI, Provider, ProviderImpl, ProviderKind, ProviderUsage};
pub use session::{Command, SessionEvent, Status, WorkflowSession};

#[derive(Debug, Clone)]
pub struct Config {
    pub lang: String,
    pub model: Option<String>,
    pub key: Option<String>,
    pub preset: Option<String>,
    pub prompt_file: Option<String>,
    pub no_verify: bool,
    pub settings_path: Option<String>,
    pub with_using_tokens: bool,
    pub with_using_model: bool,
}

/// One-shot CLI flow: translate stdin, then (unless disabled) run the blind
/// back-translation check against the produced text. A failed check is
/// reported alongside the translation, never instead of it.
pub async fn run(config: Config, input: Option<String>) -> Result<String> {
    let settings_path = config.settings_path.as_deref().map(Path::new);
    let settings = settings::load_settings(settings_path)?;

    let input = input.unwrap_or_default();
    let input = input.trim().to_string();
    if input.is_empty() {
        return Err(anyhow!("stdin is empty"));
    }
    let target_language = config.lang.trim().to_string();
    if target_language.is_empty() {
        return Err(anyhow!("target language is empty"));
    }

    let pipeline = build_pipeline(&config, &settings)?;
    let request = build_request(&config, &settings, input, target_language.clone())?;

    let result = pipeline.translate(&request).await?;

    let mut output = result.translation.clone();
    if !result.cultural_notes.trim().is_empty() {
        output.push_str(&format!("\n\nCultural notes: {}", result.cultural_notes));
    }

    if !config.no_verify {
        match pipeline.verify(&result.translation, &target_language).await {
            Ok(verification) => {
                output.push_str(&format!(
                    "\n\nBack-translation: {}",
                    verification.literal_translation
                ));
                if !verification.perceived_tone.trim().is_empty() {
                    output.push_str(&format!(
                        "\nPerceived tone: {}",
                        verification.perceived_tone
                    ));
                }
                if !verification.overall_assessment.trim().is_empty() {
                    output.push_str(&format!(
                        "\nAssessment: {}",
                        verification.overall_assessment
                    ));
                }
            }
            Err(err) => {
                output.push_str(&format!("\n\nVerification failed: {}", err));
            }
        }
    }

    if config.with_using_model
        && let Some(model) = result.model.as_deref()
    {
        output.push_str(&format!("\n\nModel: {}", model));
    }
    if config.with_using_tokens
        && let Some(usage) = &result.usage
    {
        output.push_str(&format!(
            "\nTokens: prompt={} completion={} total={}",
            usage.prompt_tokens.unwrap_or(0),
            usage.completion_tokens.unwrap_or(0),
            usage.total_tokens.unwrap_or(0)
        ));
    }

    Ok(output)
}

pub fn build_pipeline(
    config: &Config,
    settings: &settings::Settings,
) -> Result<Pipeline<ProviderImpl>> {
    let selection =
        providers::resolve_provider_selection(config.model.as_deref(), config.key.as_deref())?;
    let key = providers::resolve_key(selection.provider, config.key.as_deref())
        .with_context(|| "no API key found for selected provider")?;
    let timeout = Duration::from_secs(settings.timeout_secs);
    let provider =
        providers::build_provider(selection.provider, key, selection.requested_model, timeout);
    Ok(Pipeline::new(provider, timeout))
}

pub fn build_request(
    config: &Config,
    settings: &settings::Settings,
    source_text: String,
    target_language: String,
) -> Result<TranslationRequest> {
    let preset_context = match config.preset.as_deref() {
        Some(name) => {
            let preset = settings
                .preset(name)
                .ok_or_else(|| anyhow!("unknown preset '{}'", name))?;
            Some(PresetContext {
                tone: preset.tone.clone(),
                cultural_context: preset.cultural_context.clone(),
                custom_instructions: preset.custom_instructions.clone(),
            })
        }
        None => None,
    };

    let prompt_override = match config.prompt_file.as_deref() {
        Some(path) => Some(
            std::fs::read_to_string(path)
                .with_context(|| format!("failed to read prompt file: {}", path))?,
        ),
        None => None,
    };

    Ok(TranslationRequest {
        source_text,
        target_language,
        prompt_override,
        preset_context,
    })
}
