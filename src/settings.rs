use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

const DEFAULT_SETTINGS_TOML: &str = include_str!("../settings.toml");

/// Preset context injected into the translation prompt. Read-only at request
/// construction time; the pipeline never mutates stored presets.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Preset {
    pub tone: String,
    pub cultural_context: String,
    #[serde(default)]
    pub custom_instructions: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub presets: HashMap<String, Preset>,
    pub timeout_secs: u64,
    pub tts_model: String,
    pub tts_default_voice: String,
    pub tts_voices: HashMap<String, String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            presets: HashMap::new(),
            timeout_secs: 45,
            tts_model: "eleven_multilingual_v2".to_string(),
            tts_default_voice: "ErXwobaYiN019PkySvjV".to_string(),
            tts_voices: HashMap::new(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct SettingsFile {
    presets: Option<HashMap<String, Preset>>,
    request: Option<RequestSettings>,
    tts: Option<TtsSettings>,
}

#[derive(Debug, Default, Deserialize)]
struct RequestSettings {
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct TtsSettings {
    model: Option<String>,
    default_voice: Option<String>,
    voices: Option<HashMap<String, String>>,
}

pub fn load_settings(extra_path: Option<&Path>) -> Result<Settings> {
    let mut settings = Settings::default();
    settings.merge(
        toml::from_str(DEFAULT_SETTINGS_TOML)
            .with_context(|| "failed to parse built-in settings")?,
    );
    ensure_home_settings_file()?;

    let mut ordered_paths = Vec::new();
    ordered_paths.push(PathBuf::from("settings.toml"));
    ordered_paths.push(PathBuf::from("settings.local.toml"));

    if let Some(home) = home_dir() {
        ordered_paths.push(home.join("settings.toml"));
        ordered_paths.push(home.join("settings.local.toml"));
    }

    if let Some(extra) = extra_path {
        if !extra.exists() {
            return Err(anyhow!("settings file not found: {}", extra.display()));
        }
        ordered_paths.push(extra.to_path_buf());
    }

    for path in ordered_paths {
        if path.exists() {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("failed to read settings: {}", path.display()))?;
            let parsed: SettingsFile = toml::from_str(&content)
                .with_context(|| format!("failed to parse settings: {}", path.display()))?;
            settings.merge(parsed);
        }
    }

    Ok(settings)
}

impl Settings {
    pub fn preset(&self, name: &str) -> Option<&Preset> {
        self.presets.get(name.trim())
    }

    pub fn voice_for(&self, language: &str) -> String {
        let key = language.trim().to_lowercase();
        self.tts_voices
            .get(&key)
            .cloned()
            .unwrap_or_else(|| self.tts_default_voice.clone())
    }

    fn merge(&mut self, incoming: SettingsFile) {
        if let Some(map) = incoming.presets {
            for (key, value) in map {
                self.presets.insert(key, value);
            }
        }
        if let Some(request) = incoming.request {
            if let Some(secs) = request.timeout_secs {
                if secs > 0 {
                    self.timeout_secs = secs;
                }
            }
        }
        if let Some(tts) = incoming.tts {
            if let Some(model) = tts.model {
                if !model.trim().is_empty() {
                    self.tts_model = model;
                }
            }
            if let Some(voice) = tts.default_voice {
                if !voice.trim().is_empty() {
                    self.tts_default_voice = voice;
                }
            }
            if let Some(voices) = tts.voices {
                for (key, value) in voices {
                    self.tts_voices.insert(key.to_lowercase(), value);
                }
            }
        }
    }
}

fn ensure_home_settings_file() -> Result<()> {
    let Some(home) = home_dir() else {
        return Ok(());
    };
    fs::create_dir_all(&home)
        .with_context(|| format!("failed to create settings directory: {}", home.display()))?;
    let path = home.join("settings.toml");
    if !path.exists() {
        fs::write(&path, DEFAULT_SETTINGS_TOML)
            .with_context(|| format!("failed to write settings: {}", path.display()))?;
    }
    Ok(())
}

fn home_dir() -> Option<PathBuf> {
    std::env::var("HOME").ok().and_then(|home| {
        let home = home.trim();
        if home.is_empty() {
            None
        } else {
            Some(Path::new(home).join(".translate-bridge"))
        }
    })
}
