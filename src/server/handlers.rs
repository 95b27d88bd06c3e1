use anyhow::{Context, Result};
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, Method, Request, Response, StatusCode};
use axum::middleware::Next;
use axum::response::IntoResponse;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::{Stream, StreamExt, stream};
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use super::models::{
    ApiResponse, AudioBody, AudioPayload, BackTranslateBody, Credentials, RefineBody, ServerError,
    TranslateBody,
};
use super::state::ServerState;
use crate::error::classify_provider_error;
use crate::pipeline::{
    Pipeline, PresetContext, RefinementRequest, RefinementResult, TranslationRequest,
    TranslationResult, VerificationResult,
};
use crate::providers::{self, ChunkStream, ProviderImpl};
use crate::settings::Settings;
use crate::tts::{SpeechSynthesizer, audio_data_url};

pub async fn run_server(settings: Settings, addr: String) -> Result<()> {
    let state = Arc::new(ServerState { settings });
    let app = Router::new()
        .route("/health", get(health))
        .route("/api/translate", post(translate))
        .route("/api/translate-stream", post(translate_stream))
        .route("/api/back-translate", post(back_translate))
        .route("/api/refine-translation", post(refine_translation))
        .route("/api/generate-audio", post(generate_audio))
        .with_state(state)
        .layer(axum::middleware::from_fn(cors_middleware));
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| "failed to bind server address")?;
    tracing::info!("listening on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({ "status": "ok" })))
}

async fn cors_middleware(req: Request<Body>, next: Next) -> Result<Response<Body>, StatusCode> {
    if req.method() == Method::OPTIONS {
        let mut response = Response::new(Body::empty());
        *response.status_mut() = StatusCode::NO_CONTENT;
        apply_cors_headers(response.headers_mut());
        return Ok(response);
    }
    let mut response = next.run(req).await;
    apply_cors_headers(response.headers_mut());
    Ok(response)
}

fn apply_cors_headers(headers: &mut HeaderMap) {
    headers.insert("access-control-allow-origin", HeaderValue::from_static("*"));
    headers.insert(
        "access-control-allow-methods",
        HeaderValue::from_static("GET,POST,OPTIONS"),
    );
    headers.insert(
        "access-control-allow-headers",
        HeaderValue::from_static("content-type,authorization"),
    );
}

type Rejection = (StatusCode, Json<ApiResponse<()>>);

fn reject(err: ServerError) -> Rejection {
    (err.status, Json(ApiResponse::fail(err.message)))
}

/// Build a provider pipeline for one request. Request credentials beat
/// environment keys and live only as long as the pipeline value.
fn pipeline_for(
    state: &ServerState,
    credentials: Option<&Credentials>,
) -> Result<Pipeline<ProviderImpl>, ServerError> {
    let key_override = credentials.and_then(|c| c.api_key.as_deref());
    let model_arg = credentials.and_then(|c| c.model.as_deref());
    let selection = providers::resolve_provider_selection(model_arg, key_override)?;
    let key = providers::resolve_key(selection.provider, key_override)?;
    let timeout = Duration::from_secs(state.settings.timeout_secs);
    let provider = providers::build_provider(
        selection.provider,
        key,
        selection.requested_model,
        timeout,
    );
    Ok(Pipeline::new(provider, timeout))
}

fn translation_request(
    state: &ServerState,
    body: &TranslateBody,
) -> Result<TranslationRequest, ServerError> {
    let preset_context = match (&body.preset_context, &body.preset) {
        (Some(context), _) => Some(context.clone()),
        (None, Some(name)) => {
            let preset = state
                .settings
                .preset(name)
                .ok_or_else(|| ServerError::bad_request(format!("unknown preset '{}'", name)))?;
            Some(PresetContext {
                tone: preset.tone.clone(),
                cultural_context: preset.cultural_context.clone(),
                custom_instructions: preset.custom_instructions.clone(),
            })
        }
        (None, None) => None,
    };
    Ok(TranslationRequest {
        source_text: body.source_text.clone(),
        target_language: body.target_language.clone(),
        prompt_override: body.prompt_override.clone(),
        preset_context,
    })
}

async fn translate(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<TranslateBody>,
) -> Result<Json<ApiResponse<TranslationResult>>, Rejection> {
    tracing::info!("translate request for {}", body.target_language);
    let pipeline = pipeline_for(&state, body.credentials.as_ref()).map_err(reject)?;
    let request = translation_request(&state, &body).map_err(reject)?;
    let result = pipeline
        .translate(&request)
        .await
        .map_err(|err| reject(err.into()))?;
    Ok(Json(ApiResponse::ok(result)))
}

enum StreamPhase {
    Init(Box<(Arc<ServerState>, TranslateBody)>),
    Streaming {
        chunks: ChunkStream,
        full_text: String,
        timeout_secs: u64,
    },
    Done,
}

fn sse_event(payload: serde_json::Value) -> Event {
    Event::default().data(payload.to_string())
}

/// Streaming translate as one-directional SSE push. The client cancels by
/// aborting the connection, which drops the provider stream mid-flight.
async fn translate_stream(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<TranslateBody>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    tracing::info!("streaming translate request for {}", body.target_language);
    let events = stream::unfold(
        StreamPhase::Init(Box::new((state, body))),
        |phase| async move {
            match phase {
                StreamPhase::Init(init) => {
                    let (state, body) = *init;
                    let opened = async {
                        let pipeline = pipeline_for(&state, body.credentials.as_ref())?;
                        let request = translation_request(&state, &body)?;
                        let chunks = pipeline.open_translation_stream(&request).await?;
                        Ok::<_, ServerError>((chunks, pipeline.timeout_secs()))
                    }
                    .await;
                    match opened {
                        Ok((chunks, timeout_secs)) => Some((
                            Ok(sse_event(json!({"type": "start"}))),
                            StreamPhase::Streaming {
                                chunks,
                                full_text: String::new(),
                                timeout_secs,
                            },
                        )),
                        Err(err) => Some((
                            Ok(sse_event(json!({"type": "error", "error": err.message}))),
                            StreamPhase::Done,
                        )),
                    }
                }
                StreamPhase::Streaming {
                    mut chunks,
                    mut full_text,
                    timeout_secs,
                } => match chunks.next().await {
                    Some(Ok(chunk)) => {
                        full_text.push_str(&chunk);
                        Some((
                            Ok(sse_event(json!({"type": "chunk", "text": chunk}))),
                            StreamPhase::Streaming {
                                chunks,
                                full_text,
                                timeout_secs,
                            },
                        ))
                    }
                    Some(Err(err)) => {
                        let err = classify_provider_error(err, timeout_secs);
                        Some((
                            Ok(sse_event(
                                json!({"type": "error", "error": err.to_string()}),
                            )),
                            StreamPhase::Done,
                        ))
                    }
                    None => Some((
                        Ok(sse_event(
                            json!({"type": "complete", "fullText": full_text}),
                        )),
                        StreamPhase::Done,
                    )),
                },
                StreamPhase::Done => None,
            }
        },
    );
    Sse::new(events).keep_alive(KeepAlive::default())
}

async fn back_translate(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<BackTranslateBody>,
) -> Result<Json<ApiResponse<VerificationResult>>, Rejection> {
    tracing::info!("back-translate request for {}", body.target_language);
    let pipeline = pipeline_for(&state, body.credentials.as_ref()).map_err(reject)?;
    let result = pipeline
        .verify(&body.translated_text, &body.target_language)
        .await
        .map_err(|err| reject(err.into()))?;
    Ok(Json(ApiResponse::ok(result)))
}

async fn refine_translation(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<RefineBody>,
) -> Result<Json<ApiResponse<RefinementResult>>, Rejection> {
    tracing::info!("refinement request for {}", body.target_language);
    let pipeline = pipeline_for(&state, body.credentials.as_ref()).map_err(reject)?;
    let request = RefinementRequest {
        source_text: body.source_text,
        current_translation: body.current_translation,
        target_language: body.target_language,
        user_feedback: body.user_feedback,
        prior_analysis_context: body.prior_analysis_context,
    };
    let result = pipeline
        .refine(&request)
        .await
        .map_err(|err| reject(err.into()))?;
    Ok(Json(ApiResponse::ok(result)))
}

async fn generate_audio(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<AudioBody>,
) -> Result<Json<ApiResponse<AudioPayload>>, Rejection> {
    tracing::info!("audio request for {}", body.language);
    let key_override = body
        .credentials
        .as_ref()
        .and_then(|c| c.tts_api_key.as_deref());
    let key = SpeechSynthesizer::resolve_key(key_override)
        .map_err(|err| reject(ServerError::bad_request(err.to_string())))?;
    let synthesizer = SpeechSynthesizer::new(key, &state.settings);
    let audio = synthesizer
        .synthesize(&body.text, &body.language, &state.settings)
        .await
        .map_err(|err| reject(err.into()))?;
    Ok(Json(ApiResponse::ok(AudioPayload {
        audio_url: audio_data_url(&audio),
    })))
}
