//! Typed view of the JSON application config.
//!
//! Unknown fields are ignored and missing fields fall back to the defaults
//! the builders have always used, so a partial config file stays valid.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub enable_vision: bool,
    pub enable_movement: bool,
    pub enable_ws: bool,
    pub enable_conversation: bool,
    pub vision: VisionConfig,
    pub ws: WsConfig,
    pub conversation: ConversationConfig,
    pub behavior: BehaviorConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            enable_vision: true,
            enable_movement: true,
            enable_ws: true,
            enable_conversation: false,
            vision: VisionConfig::default(),
            ws: WsConfig::default(),
            conversation: ConversationConfig::default(),
            behavior: BehaviorConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let cfg = serde_json::from_str(&text)
            .with_context(|| format!("parsing config {}", path.display()))?;
        Ok(cfg)
    }

    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }

    /// Whether conversation is requested by either flag spelling.
    pub fn conversation_requested(&self) -> bool {
        self.enable_conversation || self.conversation.enable
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VisionConfig {
    /// Period of the detection loop in seconds.
    pub interval_sec: f64,
    pub camera_fps: f64,
    /// Detection mode, `"object"` or `"face"`.
    pub mode: String,
    pub face: FaceConfig,
    /// Consecutive capture failures tolerated before the camera worker
    /// gives up.
    pub max_capture_failures: u32,
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            interval_sec: 1.0,
            camera_fps: 15.0,
            mode: "object".into(),
            face: FaceConfig::default(),
            max_capture_failures: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FaceConfig {
    pub profile: String,
}

impl Default for FaceConfig {
    fn default() -> Self {
        Self {
            profile: "face".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WsConfig {
    pub host: String,
    pub port: u16,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8765,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConversationConfig {
    pub enable: bool,
    pub llama_binary: PathBuf,
    pub model_path: PathBuf,
    pub port: u16,
    pub threads: Option<u32>,
    pub max_parallel_inference: Option<u32>,
    pub health_timeout: f64,
    pub health_check_interval: f64,
    pub health_check_max_retries: u32,
    pub health_check_backoff: f64,
    pub llm_base_url: String,
    pub llm_request_timeout: f64,
    /// Restart the llama server after an unexpected exit.
    pub auto_restart: bool,
    pub restart_delay: f64,
    pub shutdown_timeout: f64,
    pub stt_poll_interval: f64,
    pub llm_retry_max_attempts: u32,
    pub llm_retry_initial_delay: f64,
    pub llm_retry_backoff: f64,
    pub llm_retry_max_delay: Option<f64>,
    pub wake_words: Vec<String>,
    pub system_prompt: String,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            enable: false,
            llama_binary: PathBuf::new(),
            model_path: PathBuf::new(),
            port: 9090,
            threads: Some(2),
            max_parallel_inference: Some(1),
            health_timeout: 5.0,
            health_check_interval: 0.5,
            health_check_max_retries: 3,
            health_check_backoff: 2.0,
            llm_base_url: String::new(),
            llm_request_timeout: 30.0,
            auto_restart: false,
            restart_delay: 2.0,
            shutdown_timeout: 5.0,
            stt_poll_interval: 0.02,
            llm_retry_max_attempts: 3,
            llm_retry_initial_delay: 0.5,
            llm_retry_backoff: 2.0,
            llm_retry_max_delay: None,
            wake_words: default_wake_words(),
            system_prompt: default_system_prompt(),
        }
    }
}

fn default_wake_words() -> Vec<String> {
    ["humo", "lo humo", "alumno", "lune", "lomo"]
        .into_iter()
        .map(str::to_string)
        .collect()
}

fn default_system_prompt() -> String {
    "Tu nombre es Lumo. Eres un gato robot de compañía: cálido, juguetón y empático. \
     Responde en 1 o 2 frases naturales, sin párrafos largos."
        .into()
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BehaviorConfig {
    pub social_fsm: SocialFsmConfig,
    /// Coordinator poll period in seconds.
    pub poll_interval: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SocialFsmConfig {
    pub deadband_x: f32,
    pub lock_frames_needed: u32,
    pub miss_release: u32,
    pub interact_ms: u64,
    pub relax_timeout_s: f64,
    pub min_score: f32,
    pub cooldown_ms: u64,
    pub meow_cooldown_min_s: f64,
    pub meow_cooldown_max_s: f64,
}

impl Default for SocialFsmConfig {
    fn default() -> Self {
        Self {
            deadband_x: 0.12,
            lock_frames_needed: 3,
            miss_release: 5,
            interact_ms: 1500,
            relax_timeout_s: 30.0,
            min_score: 0.0,
            cooldown_ms: 0,
            meow_cooldown_min_s: 5.0,
            meow_cooldown_max_s: 15.0,
        }
    }
}
