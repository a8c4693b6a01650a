use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    // Where the memory documents live
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    // LLM endpoint (Anthropic messages API shape)
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_diary_max_tokens")]
    pub diary_max_tokens: u32,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    // Autonomy loop
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
    #[serde(default = "default_min_silence_secs")]
    pub min_silence_secs: u64,
    #[serde(default = "default_diary_time")]
    pub diary_time: String,
    #[serde(default = "default_mood_step_up")]
    pub mood_step_up: f64,
    #[serde(default = "default_mood_step_down")]
    pub mood_step_down: f64,
    #[serde(default = "default_mood_floor")]
    pub mood_floor: f64,

    // Memory bounds
    #[serde(default = "default_history_cap")]
    pub history_cap: usize,
    #[serde(default = "default_context_messages")]
    pub context_messages: usize,

    // Prompts
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    #[serde(default = "default_diary_prompt")]
    pub diary_prompt: String,
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".hearth")
}

fn default_api_url() -> String {
    "https://api.anthropic.com".to_string()
}

fn default_model() -> String {
    "claude-sonnet-4-20250514".to_string()
}

fn default_temperature() -> f64 {
    1.0
}

fn default_max_tokens() -> u32 {
    2048
}

fn default_diary_max_tokens() -> u32 {
    500
}

fn default_request_timeout_secs() -> u64 {
    120
}

fn default_check_interval_secs() -> u64 {
    120
}

fn default_min_silence_secs() -> u64 {
    600
}

fn default_diary_time() -> String {
    "23:00".to_string()
}

fn default_mood_step_up() -> f64 {
    0.03
}

fn default_mood_step_down() -> f64 {
    0.15
}

fn default_mood_floor() -> f64 {
    0.1
}

fn default_history_cap() -> usize {
    200
}

fn default_context_messages() -> usize {
    20
}

fn default_system_prompt() -> String {
    "You are a warm, present companion. You remember your shared history, \
     speak naturally, and never pretend the conversation just started."
        .to_string()
}

fn default_diary_prompt() -> String {
    "It is the end of the day. Write a short diary entry in first person \
     about today: what happened, how you felt, what you are thinking about. \
     A few sentences, honest and unpolished."
        .to_string()
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            api_url: default_api_url(),
            model: default_model(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            diary_max_tokens: default_diary_max_tokens(),
            request_timeout_secs: default_request_timeout_secs(),
            check_interval_secs: default_check_interval_secs(),
            min_silence_secs: default_min_silence_secs(),
            diary_time: default_diary_time(),
            mood_step_up: default_mood_step_up(),
            mood_step_down: default_mood_step_down(),
            mood_floor: default_mood_floor(),
            history_cap: default_history_cap(),
            context_messages: default_context_messages(),
            system_prompt: default_system_prompt(),
            diary_prompt: default_diary_prompt(),
        }
    }
}

impl AgentConfig {
    /// Directory containing the executable
    fn get_base_dir() -> PathBuf {
        match std::env::current_exe() {
            Ok(exe_path) => exe_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".")),
            Err(_) => PathBuf::from("."),
        }
    }

    pub fn config_path() -> PathBuf {
        Self::get_base_dir().join("hearth_config.toml")
    }

    /// Load from hearth_config.toml next to the executable, falling back to
    /// defaults plus environment variables. The API key is deliberately not
    /// here; it lives in the data directory and is re-read at runtime.
    pub fn load() -> Self {
        let path = Self::config_path();

        if let Ok(contents) = fs::read_to_string(&path) {
            match toml::from_str::<AgentConfig>(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {:?}", path);
                    return config;
                }
                Err(e) => {
                    tracing::error!("Failed to parse {:?}: {}", path, e);
                }
            }
        }

        tracing::warn!("No config file found, using defaults + env vars");
        Self::from_env()
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path();

        let toml_string = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(&path, toml_string)
            .with_context(|| format!("Failed to write config to {:?}", path))?;

        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }

    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(dir) = env::var("HEARTH_DATA_DIR") {
            if !dir.trim().is_empty() {
                config.data_dir = PathBuf::from(dir);
            }
        }

        if let Ok(url) = env::var("HEARTH_API_URL") {
            config.api_url = url;
        }

        if let Ok(model) = env::var("HEARTH_MODEL") {
            config.model = model;
        }

        if let Ok(interval) = env::var("HEARTH_CHECK_INTERVAL") {
            if let Ok(seconds) = interval.parse() {
                config.check_interval_secs = seconds;
            }
        }

        if let Ok(interval) = env::var("HEARTH_MIN_SILENCE_SECS") {
            if let Ok(seconds) = interval.parse() {
                config.min_silence_secs = seconds;
            }
        }

        if let Ok(time) = env::var("HEARTH_DIARY_TIME") {
            if !time.trim().is_empty() {
                config.diary_time = time;
            }
        }

        config
    }
}
