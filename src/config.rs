use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::errors::{DeskPilotError, DeskPilotResult};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub input: InputConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// Falls back to the `GOOGLE_API_KEY` environment variable.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_modalities")]
    pub response_modalities: Vec<String>,
    /// Instruction prompt declared in the setup frame, if any.
    #[serde(default)]
    pub system_instruction: Option<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            model: default_model(),
            api_key: None,
            temperature: default_temperature(),
            response_modalities: default_modalities(),
            system_instruction: None,
        }
    }
}

impl ApiConfig {
    /// Full websocket URI of the bidirectional generate-content service.
    pub fn endpoint(&self) -> DeskPilotResult<String> {
        let key = match &self.api_key {
            Some(k) if !k.is_empty() => k.clone(),
            _ => std::env::var("GOOGLE_API_KEY").map_err(|_| {
                DeskPilotError::Config(
                    "GOOGLE_API_KEY not set and no api.api_key in config.toml".into(),
                )
            })?,
        };
        Ok(format!(
            "wss://{}/ws/google.ai.generativelanguage.v1alpha.GenerativeService.BidiGenerateContent?key={}",
            self.host, key
        ))
    }
}

fn default_host() -> String {
    "generativelanguage.googleapis.com".into()
}

fn default_model() -> String {
    "models/gemini-2.0-flash-exp".into()
}

fn default_temperature() -> f64 {
    0.7
}

fn default_modalities() -> Vec<String> {
    vec!["TEXT".into()]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_setup_timeout")]
    pub setup_timeout_ms: u64,
    #[serde(default = "default_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_backoff")]
    pub reconnect_backoff_ms: u64,
    /// Settle delay after every executed step, before the next capture.
    #[serde(default = "default_step_delay")]
    pub step_delay_ms: u64,
    /// 0 disables the periodic ticker; snapshots are then only sent on turn completion.
    #[serde(default)]
    pub snapshot_interval_secs: u64,
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
    /// How many recent history entries travel with outbound context.
    #[serde(default = "default_context_history")]
    pub context_history: usize,
    #[serde(default = "default_true")]
    pub journal: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            setup_timeout_ms: default_setup_timeout(),
            max_reconnect_attempts: default_reconnect_attempts(),
            reconnect_backoff_ms: default_backoff(),
            step_delay_ms: default_step_delay(),
            snapshot_interval_secs: 0,
            history_capacity: default_history_capacity(),
            context_history: default_context_history(),
            journal: true,
        }
    }
}

fn default_setup_timeout() -> u64 {
    10_000
}

fn default_reconnect_attempts() -> u32 {
    3
}

fn default_backoff() -> u64 {
    2_000
}

fn default_step_delay() -> u64 {
    500
}

fn default_history_capacity() -> usize {
    50
}

fn default_context_history() -> usize {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    #[serde(default = "default_browser")]
    pub browser: String,
    #[serde(default = "default_run_dialog_delay")]
    pub run_dialog_delay_ms: u64,
    /// Pause after launching an application so its window can take focus.
    #[serde(default = "default_launch_settle")]
    pub launch_settle_ms: u64,
    /// Upper bound on a single `wait` action.
    #[serde(default = "default_max_wait")]
    pub max_wait_ms: u64,
    /// Application names routed through the run dialog, mapped to the command typed there.
    #[serde(default = "default_launchable_apps")]
    pub launchable_apps: BTreeMap<String, String>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            browser: default_browser(),
            run_dialog_delay_ms: default_run_dialog_delay(),
            launch_settle_ms: default_launch_settle(),
            max_wait_ms: default_max_wait(),
            launchable_apps: default_launchable_apps(),
        }
    }
}

impl ExecutorConfig {
    /// Run-dialog command for a recognised application name (case-insensitive).
    pub fn launch_command(&self, name: &str) -> Option<&str> {
        self.launchable_apps
            .get(&name.trim().to_lowercase())
            .map(String::as_str)
    }
}

fn default_browser() -> String {
    "chrome".into()
}

fn default_run_dialog_delay() -> u64 {
    500
}

fn default_launch_settle() -> u64 {
    1_500
}

fn default_max_wait() -> u64 {
    30_000
}

fn default_launchable_apps() -> BTreeMap<String, String> {
    [
        ("spotify", "spotify"),
        ("explorer", "explorer"),
        ("edge", "msedge"),
        ("chrome", "chrome"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum InputMode {
    #[default]
    Text,
    Voice,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputConfig {
    #[serde(default)]
    pub mode: InputMode,
    /// Fraction of full scale (i16) above which a chunk counts as speech.
    #[serde(default = "default_silence_threshold")]
    pub silence_threshold: f64,
    #[serde(default = "default_min_speech_chunks")]
    pub min_speech_chunks: usize,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            mode: InputMode::Text,
            silence_threshold: default_silence_threshold(),
            min_speech_chunks: default_min_speech_chunks(),
        }
    }
}

fn default_silence_threshold() -> f64 {
    0.01
}

fn default_min_speech_chunks() -> usize {
    5
}

fn default_true() -> bool {
    true
}

fn resolve_config_path() -> DeskPilotResult<PathBuf> {
    if let Ok(exe) = std::env::current_exe() {
        if let Some(parent) = exe.parent() {
            let candidate = parent.join("config.toml");
            if candidate.exists() {
                tracing::debug!(path = %candidate.display(), "config found next to executable");
                return Ok(candidate);
            }
        }
    }

    let cwd = std::env::current_dir()?;
    let candidate = cwd.join("config.toml");
    if candidate.exists() {
        tracing::debug!(path = %candidate.display(), "config found in working directory");
        return Ok(candidate);
    }

    Err(DeskPilotError::Config(
        "config.toml not found next to executable or in working directory".into(),
    ))
}

pub fn parse_config(content: &str) -> DeskPilotResult<AppConfig> {
    Ok(toml::from_str(content)?)
}

pub fn load_config() -> DeskPilotResult<AppConfig> {
    let path = resolve_config_path()?;
    let content = std::fs::read_to_string(&path)?;
    let config = parse_config(&content)?;
    tracing::info!(path = %path.display(), model = %config.api.model, "config loaded");
    Ok(config)
}
