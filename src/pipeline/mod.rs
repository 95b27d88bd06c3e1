use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tera::{Context as TeraContext, Tera};

use crate::error::PipelineError;
use crate::providers::{ChunkStream, Provider};

pub mod normalize;
pub mod refine;
pub mod translate;
pub mod verify;

pub use refine::{RefinementRequest, RefinementResult};
pub use translate::{TranslationRequest, TranslationResult};
pub use verify::VerificationResult;

pub const TARGET_LANGUAGE_PLACEHOLDER: &str = "{TARGET_LANGUAGE}";

/// Tone, cultural-context and custom-instruction bundle injected into the
/// translation prompt. Absent fields fall back to neutral wording.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresetContext {
    #[serde(default)]
    pub tone: String,
    #[serde(default)]
    pub cultural_context: String,
    #[serde(default)]
    pub custom_instructions: Option<String>,
}

/// Cooperative cancellation handle shared between the party driving a stream
/// and the party that may supersede it.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// One provider bound to one timeout, exposing the four pipeline operations.
#[derive(Clone)]
pub struct Pipeline<P: Provider> {
    provider: P,
    timeout: Duration,
}

impl<P: Provider> Pipeline<P> {
    pub fn new(provider: P, timeout: Duration) -> Self {
        Self {
            provider: provider.with_timeout(timeout),
            timeout,
        }
    }

    pub fn timeout_secs(&self) -> u64 {
        self.timeout.as_secs()
    }

    pub async fn translate(
        &self,
        request: &TranslationRequest,
    ) -> Result<TranslationResult, PipelineError> {
        translate::translate(self.provider.clone(), request, self.timeout_secs()).await
    }

    /// Open the streaming variant of translate. The caller owns the returned
    /// chunk stream; dropping it aborts the connection.
    pub async fn open_translation_stream(
        &self,
        request: &TranslationRequest,
    ) -> Result<ChunkStream, PipelineError> {
        translate::open_stream(self.provider.clone(), request, self.timeout_secs()).await
    }

    /// Streaming translate driven to completion: chunks are handed to
    /// `on_chunk` as they arrive, and the full text is normalized into the
    /// authoritative result once the stream ends.
    pub async fn translate_stream(
        &self,
        request: &TranslationRequest,
        cancel: &CancelToken,
        on_chunk: impl FnMut(&str),
    ) -> Result<TranslationResult, PipelineError> {
        let stream = self.open_translation_stream(request).await?;
        let full_text = translate::collect_stream(stream, cancel, on_chunk, self.timeout_secs())
            .await?;
        translate::result_from_text(&full_text)
    }

    pub async fn verify(
        &self,
        translated_text: &str,
        target_language: &str,
    ) -> Result<VerificationResult, PipelineError> {
        verify::verify(
            self.provider.clone(),
            translated_text,
            target_language,
            self.timeout_secs(),
        )
        .await
    }

    pub async fn refine(
        &self,
        request: &RefinementRequest,
    ) -> Result<RefinementResult, PipelineError> {
        refine::refine(self.provider.clone(), request, self.timeout_secs()).await
    }
}

/// A caller-supplied system prompt used verbatim after placeholder
/// substitution. The placeholder must be present so the prompt cannot
/// silently target the wrong language.
pub(crate) fn apply_prompt_override(
    prompt: &str,
    target_language: &str,
) -> Result<String, PipelineError> {
    if !prompt.contains(TARGET_LANGUAGE_PLACEHOLDER) {
        return Err(PipelineError::validation(format!(
            "prompt override must contain the {} placeholder",
            TARGET_LANGUAGE_PLACEHOLDER
        )));
    }
    Ok(prompt.replace(TARGET_LANGUAGE_PLACEHOLDER, target_language))
}

pub(crate) fn render_prompt(
    template: &str,
    context: &TeraContext,
) -> Result<String, PipelineError> {
    Tera::one_off(template, context, false)
        .map_err(|err| PipelineError::Validation(format!("failed to render prompt: {}", err)))
}

pub(crate) fn require_non_empty(value: &str, field: &str) -> Result<(), PipelineError> {
    if value.trim().is_empty() {
        return Err(PipelineError::validation(format!("{} must not be empty", field)));
    }
    Ok(())
}
