//! Server configuration loading from file and environment variables.

use converse_engine::LlmConfig;
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use thiserror::Error;

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    /// Chat-completions endpoint used by the answer engine.
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub voice: VoiceConfig,
    #[serde(default)]
    pub chat: ChatConfig,
}

/// Network configuration for the HTTP server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Directory of the browser client. Served only if it holds an
    /// `index.html`.
    #[serde(default = "default_static_dir")]
    pub static_dir: PathBuf,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "converse_chat=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Root of agents, conversations, uploads and knowledge indexes.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

/// Speech synthesis and transcription binaries.
#[derive(Debug, Clone, Deserialize)]
pub struct VoiceConfig {
    #[serde(default = "default_tts_binary")]
    pub tts_binary: PathBuf,
    #[serde(default = "default_voice")]
    pub default_voice: String,
    #[serde(default = "default_stt_binary")]
    pub stt_binary: PathBuf,
    /// whisper.cpp model file. Transcription is unavailable while empty.
    #[serde(default)]
    pub stt_model: PathBuf,
    #[serde(default = "default_language")]
    pub language: String,
}

/// Conversation pipeline tunables.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatConfig {
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval: usize,
    #[serde(default = "default_partial_threshold")]
    pub partial_transcript_threshold: usize,
    #[serde(default = "default_collaborator_timeout_secs")]
    pub collaborator_timeout_secs: u64,
    #[serde(default = "default_max_background_tasks")]
    pub max_background_tasks: usize,
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
}

fn default_port() -> u16 {
    5000
}

fn default_static_dir() -> PathBuf {
    PathBuf::from("static")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_tts_binary() -> PathBuf {
    PathBuf::from("edge-tts")
}

fn default_voice() -> String {
    converse_types::voice::DEFAULT_VOICE.to_string()
}

fn default_stt_binary() -> PathBuf {
    PathBuf::from("whisper-cli")
}

fn default_language() -> String {
    "zh".to_string()
}

fn default_refresh_interval() -> usize {
    converse_chat::store::DEFAULT_REFRESH_INTERVAL
}

fn default_partial_threshold() -> usize {
    converse_chat::voice_session::DEFAULT_PARTIAL_THRESHOLD
}

fn default_collaborator_timeout_secs() -> u64 {
    120
}

fn default_max_background_tasks() -> usize {
    converse_chat::tasks::DEFAULT_MAX_BACKGROUND_TASKS
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            static_dir: default_static_dir(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            tts_binary: default_tts_binary(),
            default_voice: default_voice(),
            stt_binary: default_stt_binary(),
            stt_model: PathBuf::new(),
            language: default_language(),
        }
    }
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            refresh_interval: default_refresh_interval(),
            partial_transcript_threshold: default_partial_threshold(),
            collaborator_timeout_secs: default_collaborator_timeout_secs(),
            max_background_tasks: default_max_background_tasks(),
        }
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Loads configuration from a TOML file, falling back to defaults.
///
/// Environment variable overrides:
/// - `CONVERSE_HOST` overrides `server.host`
/// - `CONVERSE_PORT` overrides `server.port`
/// - `CONVERSE_DATA_DIR` overrides `storage.data_dir`
/// - `CONVERSE_LOG_LEVEL` overrides `logging.level`
/// - `CONVERSE_LOG_JSON` overrides `logging.json` (set to "true" to enable)
/// - `CONVERSE_LLM_BASE_URL`, `CONVERSE_LLM_API_KEY`, `CONVERSE_LLM_MODEL`
///   override the `llm` section
/// - `CONVERSE_TTS_BINARY`, `CONVERSE_STT_BINARY`, `CONVERSE_STT_MODEL`
///   override the `voice` section
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    apply_overrides(&mut config, |key| std::env::var(key).ok());
    Ok(config)
}

/// Applies `CONVERSE_*` overrides read through `lookup`. Unparseable values
/// are ignored.
pub fn apply_overrides(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(host) = lookup("CONVERSE_HOST") {
        if let Ok(parsed) = host.parse() {
            config.server.host = parsed;
        }
    }
    if let Some(port) = lookup("CONVERSE_PORT") {
        if let Ok(parsed) = port.parse() {
            config.server.port = parsed;
        }
    }
    if let Some(data_dir) = lookup("CONVERSE_DATA_DIR") {
        config.storage.data_dir = data_dir.into();
    }
    if let Some(level) = lookup("CONVERSE_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Some(json) = lookup("CONVERSE_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }
    if let Some(base_url) = lookup("CONVERSE_LLM_BASE_URL") {
        config.llm.base_url = base_url;
    }
    if let Some(api_key) = lookup("CONVERSE_LLM_API_KEY") {
        config.llm.api_key = api_key;
    }
    if let Some(model) = lookup("CONVERSE_LLM_MODEL") {
        config.llm.model = model;
    }
    if let Some(binary) = lookup("CONVERSE_TTS_BINARY") {
        config.voice.tts_binary = binary.into();
    }
    if let Some(binary) = lookup("CONVERSE_STT_BINARY") {
        config.voice.stt_binary = binary.into();
    }
    if let Some(model) = lookup("CONVERSE_STT_MODEL") {
        config.voice.stt_model = model.into();
    }
}
