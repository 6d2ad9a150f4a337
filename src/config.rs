use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::bot::debounce::DebounceConfig;
use crate::bot::dispatcher::DispatchConfig;
use crate::bot::gateway::GatewayConfig;
use crate::bot::listener::ListenerConfig;
use crate::bot::recognition::RecognitionConfig;

/// Errors that can occur when loading configuration.
#[derive(Debug)]
pub enum ConfigError {
    /// Failed to read the config file or the prompt file it points to.
    ReadFile { path: PathBuf, source: std::io::Error },
    /// Failed to parse JSON.
    ParseJson { path: PathBuf, source: serde_json::Error },
    /// Validation error.
    Validation(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadFile { path, source } => {
                write!(f, "failed to read '{}': {}", path.display(), source)
            }
            Self::ParseJson { path, source } => {
                write!(f, "failed to parse config file '{}': {}", path.display(), source)
            }
            Self::Validation(msg) => write!(f, "config validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::ReadFile { source, .. } => Some(source),
            Self::ParseJson { source, .. } => Some(source),
            Self::Validation(_) => None,
        }
    }
}

#[derive(Deserialize)]
struct ConfigFile {
    api_key: String,
    #[serde(default = "default_base_url")]
    base_url: String,
    #[serde(default = "default_model")]
    model: String,
    #[serde(default)]
    image_model: String,
    #[serde(default = "default_temperature")]
    temperature: f32,
    #[serde(default = "default_max_tokens")]
    max_tokens: u32,
    /// Number of user/assistant pairs kept per conversation.
    #[serde(default = "default_max_groups")]
    max_groups: usize,
    /// The bot's own display name, used to detect @-mentions in groups.
    #[serde(default)]
    robot_name: String,
    listen_list: Vec<String>,
    #[serde(default = "default_prompt_file")]
    prompt_file: String,
    /// Directory for state files (logs, transcript database). Defaults to current directory.
    data_dir: Option<String>,
    #[serde(default = "default_emoji_dir")]
    emoji_dir: String,
    #[serde(default = "default_temp_image_dir")]
    temp_image_dir: String,
    #[serde(default = "default_voice_dir")]
    voice_dir: String,
    tts_api_url: Option<String>,
    #[serde(default = "default_bridge_url")]
    bridge_url: String,
    #[serde(default = "default_quiet_period_ms")]
    quiet_period_ms: u64,
    #[serde(default = "default_max_batch_messages")]
    max_batch_messages: usize,
    #[serde(default = "default_poll_interval_ms")]
    poll_interval_ms: u64,
    #[serde(default = "default_revalidate_interval_secs")]
    revalidate_interval_secs: u64,
    #[serde(default = "default_pacing_min_ms")]
    pacing_min_ms: u64,
    #[serde(default = "default_pacing_max_ms")]
    pacing_max_ms: u64,
    #[serde(default = "default_chat_timeout_secs")]
    chat_timeout_secs: u64,
    recognition: Option<RecognitionFile>,
}

#[derive(Deserialize)]
struct RecognitionFile {
    api_key: String,
    base_url: String,
    model: String,
    #[serde(default = "default_recognition_temperature")]
    temperature: f32,
}

fn default_base_url() -> String {
    "https://api.deepseek.com/v1".to_string()
}

fn default_model() -> String {
    "deepseek-chat".to_string()
}

fn default_temperature() -> f32 {
    1.0
}

fn default_max_tokens() -> u32 {
    2000
}

fn default_max_groups() -> usize {
    15
}

fn default_prompt_file() -> String {
    "prompts/default.md".to_string()
}

fn default_emoji_dir() -> String {
    "data/emojis".to_string()
}

fn default_temp_image_dir() -> String {
    "data/images/temp".to_string()
}

fn default_voice_dir() -> String {
    "data/voices".to_string()
}

fn default_bridge_url() -> String {
    "http://127.0.0.1:8765".to_string()
}

fn default_quiet_period_ms() -> u64 {
    5000
}

fn default_max_batch_messages() -> usize {
    5
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_revalidate_interval_secs() -> u64 {
    600
}

fn default_pacing_min_ms() -> u64 {
    3000
}

fn default_pacing_max_ms() -> u64 {
    5000
}

fn default_chat_timeout_secs() -> u64 {
    60
}

fn default_recognition_temperature() -> f32 {
    0.5
}

pub struct Config {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub image_model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub max_groups: usize,
    pub robot_name: String,
    pub listen_list: Vec<String>,
    /// Contents of the prompt file, sent as the system message on every call.
    pub system_prompt: String,
    /// Directory for state files (logs, transcript database).
    pub data_dir: PathBuf,
    pub emoji_dir: PathBuf,
    pub temp_image_dir: PathBuf,
    pub voice_dir: PathBuf,
    pub tts_api_url: Option<String>,
    pub bridge_url: String,
    pub quiet_period: Duration,
    pub max_batch_messages: usize,
    pub poll_interval: Duration,
    pub revalidate_interval: Duration,
    pub pacing: (Duration, Duration),
    pub chat_timeout: Duration,
    pub recognition: Option<RecognitionConfig>,
    /// Non-fatal problems found while loading, logged once tracing is up.
    pub warnings: Vec<String>,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config_path = path.as_ref().to_path_buf();
        let content = std::fs::read_to_string(&config_path)
            .map_err(|e| ConfigError::ReadFile { path: config_path.clone(), source: e })?;
        let file: ConfigFile = serde_json::from_str(&content)
            .map_err(|e| ConfigError::ParseJson { path: config_path.clone(), source: e })?;

        if file.api_key.trim().is_empty() {
            return Err(ConfigError::Validation("api_key is required".into()));
        }
        if file.listen_list.iter().all(|who| who.trim().is_empty()) {
            return Err(ConfigError::Validation(
                "listen_list must contain at least one conversation".into(),
            ));
        }
        if file.max_groups == 0 {
            return Err(ConfigError::Validation("max_groups must be at least 1".into()));
        }
        if file.max_batch_messages == 0 {
            return Err(ConfigError::Validation("max_batch_messages must be at least 1".into()));
        }
        if file.pacing_min_ms > file.pacing_max_ms {
            return Err(ConfigError::Validation(format!(
                "pacing_min_ms ({}) must not exceed pacing_max_ms ({})",
                file.pacing_min_ms, file.pacing_max_ms
            )));
        }

        // Relative prompt paths resolve against the config file's directory
        let prompt_path = match config_path.parent() {
            Some(dir) if Path::new(&file.prompt_file).is_relative() => dir.join(&file.prompt_file),
            _ => PathBuf::from(&file.prompt_file),
        };
        let system_prompt = std::fs::read_to_string(&prompt_path)
            .map_err(|e| ConfigError::ReadFile { path: prompt_path.clone(), source: e })?;

        let mut warnings = Vec::new();
        let recognition = file.recognition.map(|r| {
            let temperature = if (0.0..=1.0).contains(&r.temperature) {
                r.temperature
            } else {
                let clamped = r.temperature.clamp(0.0, 1.0);
                warnings.push(format!(
                    "Recognition temperature {} out of range, using {}",
                    r.temperature, clamped
                ));
                clamped
            };
            RecognitionConfig {
                api_key: r.api_key,
                base_url: r.base_url.trim_end_matches('/').to_string(),
                model: r.model,
                temperature,
            }
        });

        let data_dir = file
            .data_dir
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));

        Ok(Self {
            api_key: file.api_key,
            base_url: file.base_url.trim_end_matches('/').to_string(),
            model: file.model,
            image_model: file.image_model,
            temperature: file.temperature,
            max_tokens: file.max_tokens,
            max_groups: file.max_groups,
            robot_name: file.robot_name.trim().to_string(),
            listen_list: file
                .listen_list
                .into_iter()
                .map(|who| who.trim().to_string())
                .filter(|who| !who.is_empty())
                .collect(),
            system_prompt,
            data_dir,
            emoji_dir: PathBuf::from(file.emoji_dir),
            temp_image_dir: PathBuf::from(file.temp_image_dir),
            voice_dir: PathBuf::from(file.voice_dir),
            tts_api_url: file.tts_api_url.filter(|url| !url.trim().is_empty()),
            bridge_url: file.bridge_url.trim_end_matches('/').to_string(),
            quiet_period: Duration::from_millis(file.quiet_period_ms),
            max_batch_messages: file.max_batch_messages,
            poll_interval: Duration::from_millis(file.poll_interval_ms),
            revalidate_interval: Duration::from_secs(file.revalidate_interval_secs),
            pacing: (
                Duration::from_millis(file.pacing_min_ms),
                Duration::from_millis(file.pacing_max_ms),
            ),
            chat_timeout: Duration::from_secs(file.chat_timeout_secs),
            recognition,
            warnings,
        })
    }

    /// Path of the append-only transcript database.
    pub fn transcript_path(&self) -> PathBuf {
        self.data_dir.join("chat_history.db")
    }

    pub fn debounce(&self) -> DebounceConfig {
        DebounceConfig {
            quiet_period: self.quiet_period,
            max_batch_messages: self.max_batch_messages,
        }
    }

    pub fn gateway(&self) -> GatewayConfig {
        GatewayConfig {
            api_key: self.api_key.clone(),
            base_url: self.base_url.clone(),
            model: self.model.clone(),
            image_model: self.image_model.clone(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            max_groups: self.max_groups,
            system_prompt: self.system_prompt.clone(),
            temp_image_dir: self.temp_image_dir.clone(),
            voice_dir: self.voice_dir.clone(),
            tts_api_url: self.tts_api_url.clone(),
            timeout: self.chat_timeout,
        }
    }

    pub fn dispatch(&self) -> DispatchConfig {
        DispatchConfig {
            emoji_dir: self.emoji_dir.clone(),
            temp_image_dir: self.temp_image_dir.clone(),
            pacing_min: self.pacing.0,
            pacing_max: self.pacing.1,
        }
    }

    pub fn listener(&self) -> ListenerConfig {
        ListenerConfig {
            robot_name: self.robot_name.clone(),
            listen_list: self.listen_list.clone(),
            poll_interval: self.poll_interval,
            revalidate_interval: self.revalidate_interval,
        }
    }

    pub fn recognition(&self) -> Option<RecognitionConfig> {
        self.recognition.clone()
    }
}
