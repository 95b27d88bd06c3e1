use std::collections::VecDeque;
use std::io::{self, BufRead, Read, Write};
use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;

use translate_bridge::session::{Command, SessionEvent, Status, WorkflowSession};
use translate_bridge::tts::SpeechSynthesizer;
use translate_bridge::{Pipeline, ProviderImpl};

#[derive(Parser, Debug)]
#[command(
    name = "translate-bridge",
    version,
    about = "Translate, verify and refine messages using LLM tool calls"
)]
struct Cli {
    /// Target language (e.g. Spanish, Mandarin)
    #[arg(short = 'l', long = "lang", default_value = "Spanish")]
    lang: String,

    /// Model name or provider:model (e.g. openai:MODEL_ID)
    #[arg(short = 'm', long = "model")]
    model: Option<String>,

    /// API key (overrides environment variables)
    #[arg(short = 'k', long = "key")]
    key: Option<String>,

    /// Preset name (from settings [presets])
    #[arg(short = 'p', long = "preset")]
    preset: Option<String>,

    /// File holding a system prompt override; must contain {TARGET_LANGUAGE}
    #[arg(long = "prompt-file")]
    prompt_file: Option<String>,

    /// Skip the automatic back-translation check
    #[arg(long = "no-verify")]
    no_verify: bool,

    /// Run the HTTP API server on the given address (e.g. 127.0.0.1:8080)
    #[arg(long = "serve")]
    serve: Option<String>,

    /// Read extra settings from a local TOML file
    #[arg(short = 'r', long = "read-settings")]
    read_settings: Option<String>,

    /// Append token usage to output
    #[arg(long = "with-using-tokens")]
    with_using_tokens: bool,

    /// Append model name to output
    #[arg(long = "with-using-model")]
    with_using_model: bool,

    /// Enable verbose logging
    #[arg(long = "verbose")]
    verbose: bool,

    /// Interactive refinement workflow
    #[arg(short = 'i', long = "interactive")]
    interactive: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    translate_bridge::logging::init(cli.verbose, cli.serve.is_some())?;

    if let Some(addr) = cli.serve.clone() {
        let settings =
            translate_bridge::settings::load_settings(cli.read_settings.as_deref().map(Path::new))?;
        return translate_bridge::server::run_server(settings, addr).await;
    }

    if cli.interactive {
        return run_interactive(cli).await;
    }

    let mut buffer = String::new();
    io::stdin().read_to_string(&mut buffer)?;

    let output = translate_bridge::run(config_from(&cli), Some(buffer)).await?;
    println!("{}", output);
    Ok(())
}

fn config_from(cli: &Cli) -> translate_bridge::Config {
    translate_bridge::Config {
        lang: cli.lang.clone(),
        model: cli.model.clone(),
        key: cli.key.clone(),
        preset: cli.preset.clone(),
        prompt_file: cli.prompt_file.clone(),
        no_verify: cli.no_verify,
        settings_path: cli.read_settings.clone(),
        with_using_tokens: cli.with_using_tokens,
        with_using_model: cli.with_using_model,
    }
}

const AUDIO_FILE: &str = "translate-bridge-audio.mp3";

struct InteractiveState {
    config: translate_bridge::Config,
    settings: translate_bridge::settings::Settings,
    pipeline: Pipeline<ProviderImpl>,
    session: WorkflowSession,
}

/// Interactive workflow driven through the session reducer: each user action
/// and provider response is applied as an event, and the returned follow-up
/// commands are executed until the queue drains.
async fn run_interactive(cli: Cli) -> Result<()> {
    let config = config_from(&cli);
    let settings =
        translate_bridge::settings::load_settings(cli.read_settings.as_deref().map(Path::new))?;
    let pipeline = translate_bridge::build_pipeline(&config, &settings)?;
    let mut state = InteractiveState {
        config,
        settings,
        pipeline,
        session: WorkflowSession::new(),
    };

    println!("Interactive mode. Type a message to translate it into {}.", cli.lang);
    println!("Type /help to see available commands.");

    let stdin = io::stdin();
    let mut stdin_lock = stdin.lock();
    let mut line = String::new();
    loop {
        line.clear();
        print!("> ");
        io::stdout().flush()?;
        if stdin_lock.read_line(&mut line)? == 0 {
            break;
        }
        let input = line.trim();
        if input.is_empty() {
            continue;
        }

        let event = match parse_command(input, &state) {
            ParsedInput::Quit => break,
            ParsedInput::Help => {
                print_help();
                continue;
            }
            ParsedInput::Show => {
                print_session(&state.session);
                continue;
            }
            ParsedInput::Event(event) => event,
            ParsedInput::Invalid(message) => {
                println!("{}", message);
                continue;
            }
        };

        drive(&mut state, event).await;
        print_session(&state.session);
    }
    Ok(())
}

enum ParsedInput {
    Event(SessionEvent),
    Help,
    Show,
    Quit,
    Invalid(String),
}

fn parse_command(input: &str, state: &InteractiveState) -> ParsedInput {
    let (command, rest) = match input.split_once(' ') {
        Some((command, rest)) => (command, rest.trim()),
        None => (input, ""),
    };
    if !command.starts_with('/') {
        return ParsedInput::Event(SessionEvent::TranslateRequested {
            source_text: input.to_string(),
            target_language: state.config.lang.clone(),
        });
    }
    match command {
        "/quit" | "/exit" => ParsedInput::Quit,
        "/help" => ParsedInput::Help,
        "/show" => ParsedInput::Show,
        "/restart" => ParsedInput::Event(SessionEvent::Restarted),
        "/accept" => ParsedInput::Event(SessionEvent::RefinementAccepted),
        "/discard" => ParsedInput::Event(SessionEvent::RefinementDiscarded),
        "/audio" => ParsedInput::Event(SessionEvent::AudioRequested),
        "/refine" => {
            if rest.is_empty() {
                ParsedInput::Invalid("usage: /refine <feedback>".to_string())
            } else {
                ParsedInput::Event(SessionEvent::RefinementRequested {
                    feedback: rest.to_string(),
                })
            }
        }
        "/edit" => {
            if rest.is_empty() {
                ParsedInput::Invalid("usage: /edit <new translation text>".to_string())
            } else {
                ParsedInput::Event(SessionEvent::TranslationEdited {
                    new_text: rest.to_string(),
                })
            }
        }
        other => ParsedInput::Invalid(format!("unknown command: {}", other)),
    }
}

fn print_help() {
    println!("Commands:");
    println!("  <text>              translate the text");
    println!("  /refine <feedback>  ask for a revision of the current translation");
    println!("  /accept             accept the pending revision (re-verifies)");
    println!("  /discard            discard the pending revision");
    println!("  /edit <text>        replace the translation manually (re-verifies)");
    println!("  /audio              synthesize speech for the current translation");
    println!("  /show               show the current session");
    println!("  /restart            start over");
    println!("  /quit               exit");
}

async fn drive(state: &mut InteractiveState, event: SessionEvent) {
    let mut queue: VecDeque<Command> = state.session.apply(event).into();
    while let Some(command) = queue.pop_front() {
        let event = execute(state, command).await;
        queue.extend(state.session.apply(event));
    }
}

async fn execute(state: &InteractiveState, command: Command) -> SessionEvent {
    match command {
        Command::Translate {
            seq,
            source_text,
            target_language,
        } => {
            let request = match translate_bridge::build_request(
                &state.config,
                &state.settings,
                source_text,
                target_language,
            ) {
                Ok(request) => request,
                Err(err) => {
                    return SessionEvent::TranslationFailed {
                        seq,
                        error: format!("{:#}", err),
                    };
                }
            };
            match state.pipeline.translate(&request).await {
                Ok(result) => SessionEvent::TranslationSucceeded { seq, result },
                Err(err) => SessionEvent::TranslationFailed {
                    seq,
                    error: err.to_string(),
                },
            }
        }
        Command::Verify {
            seq,
            text_version,
            translated_text,
            target_language,
        } => {
            if state.config.no_verify {
                return SessionEvent::VerificationFailed {
                    seq,
                    text_version,
                    error: "verification disabled (--no-verify)".to_string(),
                };
            }
            match state
                .pipeline
                .verify(&translated_text, &target_language)
                .await
            {
                Ok(result) => SessionEvent::VerificationSucceeded {
                    seq,
                    text_version,
                    result,
                },
                Err(err) => SessionEvent::VerificationFailed {
                    seq,
                    text_version,
                    error: err.to_string(),
                },
            }
        }
        Command::Refine { seq, request } => {
            match state.pipeline.refine(&request).await {
                Ok(result) => SessionEvent::RefinementSucceeded { seq, result },
                Err(err) => SessionEvent::RefinementFailed {
                    seq,
                    error: err.to_string(),
                },
            }
        }
        Command::SynthesizeAudio {
            seq,
            text,
            language,
        } => match synthesize_to_file(state, &text, &language).await {
            Ok(path) => SessionEvent::AudioSucceeded {
                seq,
                audio_url: path,
            },
            Err(err) => SessionEvent::AudioFailed {
                seq,
                error: format!("{:#}", err),
            },
        },
    }
}

async fn synthesize_to_file(
    state: &InteractiveState,
    text: &str,
    language: &str,
) -> Result<String> {
    let key = SpeechSynthesizer::resolve_key(None)?;
    let synthesizer = SpeechSynthesizer::new(key, &state.settings);
    let audio = synthesizer
        .synthesize(text, language, &state.settings)
        .await?;
    std::fs::write(AUDIO_FILE, &audio)
        .with_context(|| format!("failed to write {}", AUDIO_FILE))?;
    Ok(AUDIO_FILE.to_string())
}

fn print_session(session: &WorkflowSession) {
    match session.status() {
        Status::Idle => println!("(session is empty)"),
        Status::Failed(kind) => {
            println!(
                "{} failed: {}",
                kind.as_str(),
                session.last_error().unwrap_or("unknown error")
            );
            print_results(session);
        }
        _ => {
            if let Some(error) = session.last_error() {
                println!("note: {}", error);
            }
            print_results(session);
        }
    }
}

fn print_results(session: &WorkflowSession) {
    if let Some(translation) = session.translation() {
        println!("Translation: {}", translation.translation);
        if !translation.cultural_notes.trim().is_empty() {
            println!("Cultural notes: {}", translation.cultural_notes);
        }
    }
    if let Some(verification) = session.verification() {
        println!("Back-translation: {}", verification.literal_translation);
        if !verification.overall_assessment.trim().is_empty() {
            println!("Assessment: {}", verification.overall_assessment);
        }
    }
    if let Some(refinement) = session.refinement() {
        println!("Proposed revision: {}", refinement.revised_translation);
        if !refinement.changes_explanation.trim().is_empty() {
            println!("Changes: {}", refinement.changes_explanation);
        }
        println!("(/accept to apply, /discard to keep the current translation)");
    }
    if let Some(audio) = session.audio_url() {
        println!("Audio written to {}", audio);
    }
}
