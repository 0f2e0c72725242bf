//! Configuration schema definitions

use crate::session::Mode;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Root configuration for parley
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Conversation settings
    #[serde(default)]
    pub chat: ChatConfig,
    /// Generation service credentials and endpoint
    #[serde(default)]
    pub provider: ProviderConfig,
    /// Retry policy for transient service failures
    #[serde(default)]
    pub retry: RetryConfig,
    /// Session storage
    #[serde(default)]
    pub storage: StorageConfig,
    /// Local user identity
    #[serde(default)]
    pub user: UserConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Level for the console layer; the file layer uses `level`
    #[serde(default = "default_console_level")]
    pub console_level: String,
    /// Log format (text, json)
    #[serde(default = "default_log_format")]
    pub format: String,
    /// Directory for log files
    #[serde(default = "default_log_dir")]
    pub dir: String,
    /// Module-specific overrides
    #[serde(default)]
    pub overrides: HashMap<String, String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_console_level() -> String {
    "warn".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

fn default_log_dir() -> String {
    "~/.parley/logs".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            console_level: default_console_level(),
            format: default_log_format(),
            dir: default_log_dir(),
            overrides: HashMap::new(),
        }
    }
}

/// Conversation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    /// Model identifier sent with every request
    #[serde(default = "default_model")]
    pub model: String,
    /// Text of the message every new or cleared session starts with
    #[serde(default = "default_welcome_message")]
    pub welcome_message: String,
    /// Base system instruction
    #[serde(default = "default_system_instruction")]
    pub system_instruction: String,
    /// Extra instruction text per mode
    #[serde(default)]
    pub modes: ModePrompts,
    /// Mode for newly created sessions
    #[serde(default)]
    pub default_mode: Mode,
    /// Token budget for model thinking; omitted from requests when unset
    #[serde(default)]
    pub thinking_budget: Option<i32>,
}

fn default_model() -> String {
    "gemini-2.5-flash".to_string()
}

fn default_welcome_message() -> String {
    "Hello! How can I help you today?".to_string()
}

fn default_system_instruction() -> String {
    "You are a helpful, accurate assistant. Answer clearly and concisely.".to_string()
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            welcome_message: default_welcome_message(),
            system_instruction: default_system_instruction(),
            modes: ModePrompts::default(),
            default_mode: Mode::Default,
            thinking_budget: None,
        }
    }
}

/// Opaque prompt text appended to the system instruction for each mode
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModePrompts {
    #[serde(default)]
    pub default: String,
    #[serde(default = "default_research_prompt")]
    pub research: String,
}

fn default_research_prompt() -> String {
    "Search the web to ground your answer and prefer recent, authoritative sources.".to_string()
}

impl Default for ModePrompts {
    fn default() -> Self {
        Self {
            default: String::new(),
            research: default_research_prompt(),
        }
    }
}

impl ModePrompts {
    /// Prompt text for a mode
    pub fn for_mode(&self, mode: Mode) -> &str {
        match mode {
            Mode::Default => &self.default,
            Mode::Research => &self.research,
        }
    }
}

/// Generation service configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProviderConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub api_base: Option<String>,
    #[serde(default)]
    pub extra_headers: Option<HashMap<String, String>>,
}

/// Exponential backoff for transient failures
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Additional attempts after the first one
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay before the first retry, in milliseconds
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Multiplier applied to the delay after each retry
    #[serde(default = "default_backoff_factor")]
    pub factor: u32,
}

fn default_max_retries() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    1000
}
fn default_backoff_factor() -> u32 {
    2
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            factor: default_backoff_factor(),
        }
    }
}

/// Session storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory for sessions and user profiles
    #[serde(default = "default_storage_dir")]
    pub dir: String,
}

fn default_storage_dir() -> String {
    "~/.parley/data".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dir: default_storage_dir(),
        }
    }
}

/// Local user identity; the id is treated as an opaque owner key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserConfig {
    #[serde(default = "default_user_id")]
    pub id: String,
    #[serde(default = "default_display_name")]
    pub display_name: String,
    #[serde(default)]
    pub photo_ref: Option<String>,
}

fn default_user_id() -> String {
    "local".to_string()
}

fn default_display_name() -> String {
    "You".to_string()
}

impl Default for UserConfig {
    fn default() -> Self {
        Self {
            id: default_user_id(),
            display_name: default_display_name(),
            photo_ref: None,
        }
    }
}
