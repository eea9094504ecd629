use std::env;
use std::time::Duration;

use thiserror::Error;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com";
pub const DEFAULT_ENV_KEY: &str = "OPENAI_API_KEY";
pub const DEFAULT_MODEL: &str = "o4-mini";
pub const DEFAULT_TOOL_DAEMON_URL: &str = "http://127.0.0.1:9999";
pub const DEFAULT_TOOL_AGENT_ID: &str = "turnstile";
pub const DEFAULT_MAX_OUTPUT_TOKENS: u32 = 8000;
pub const DEFAULT_REASONING_EFFORT: &str = "low";
pub const DEFAULT_REASONING_SUMMARY: &str = "auto";

const ENV_API_KEY_NAME: &str = "TURNSTILE_API_KEY_ENV";
const ENV_BASE_URL: &str = "TURNSTILE_BASE_URL";
const ENV_MODEL: &str = "TURNSTILE_MODEL";
const ENV_TOOL_DAEMON_URL: &str = "TURNSTILE_TOOL_DAEMON_URL";
const ENV_TOOL_AGENT_ID: &str = "TURNSTILE_TOOL_AGENT_ID";
const ENV_DEVELOPER_PROMPT: &str = "TURNSTILE_DEVELOPER_PROMPT";
const ENV_MAX_OUTPUT_TOKENS: &str = "TURNSTILE_MAX_OUTPUT_TOKENS";
const ENV_REASONING: &str = "TURNSTILE_REASONING";
const ENV_MAX_TOOL_ROUNDS: &str = "TURNSTILE_MAX_TOOL_ROUNDS";
const ENV_STREAM_IDLE_TIMEOUT_MS: &str = "TURNSTILE_STREAM_IDLE_TIMEOUT_MS";
const ENV_STRICT_PROTOCOL: &str = "TURNSTILE_STRICT_PROTOCOL";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalModelConfig {
    pub base_url: String,
    pub env_key: String,
    pub api_key: String,
    pub model: String,
    pub tool_daemon_url: String,
    pub tool_agent_id: String,
    pub developer_prompt: Option<String>,
    pub max_output_tokens: u32,
    pub reasoning_effort: String,
    pub reasoning_summary: String,
}

/// Tool-loop knobs handed to the kernel runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopSettings {
    pub reasoning_enabled: bool,
    /// `None` leaves the tool loop's own round cap in place.
    pub max_tool_rounds: Option<usize>,
    pub stream_idle_timeout: Option<Duration>,
    pub strict_protocol: bool,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            reasoning_enabled: true,
            max_tool_rounds: None,
            stream_idle_timeout: None,
            strict_protocol: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LocalModelOverrides {
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub env_key: Option<String>,
    pub tool_daemon_url: Option<String>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("environment variable '{0}' is not set")]
    MissingEnvVar(String),
    #[error("environment variable '{key}' has invalid value '{value}': {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },
}

pub fn load_local_model_config() -> Result<LocalModelConfig, ConfigError> {
    load_local_model_config_with(LocalModelOverrides::default())
}

pub fn load_local_model_config_with(
    overrides: LocalModelOverrides,
) -> Result<LocalModelConfig, ConfigError> {
    model_config_from_lookup(overrides, |key| env::var(key).ok())
}

pub fn load_loop_settings() -> Result<LoopSettings, ConfigError> {
    loop_settings_from_lookup(|key| env::var(key).ok())
}

fn model_config_from_lookup(
    overrides: LocalModelOverrides,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<LocalModelConfig, ConfigError> {
    let env_key = overrides
        .env_key
        .or_else(|| non_empty(lookup(ENV_API_KEY_NAME)))
        .unwrap_or_else(|| DEFAULT_ENV_KEY.to_string());
    let api_key = non_empty(lookup(env_key.as_str()))
        .ok_or_else(|| ConfigError::MissingEnvVar(env_key.clone()))?;
    let max_output_tokens = match non_empty(lookup(ENV_MAX_OUTPUT_TOKENS)) {
        Some(raw) => parse_number::<u32>(ENV_MAX_OUTPUT_TOKENS, &raw)?,
        None => DEFAULT_MAX_OUTPUT_TOKENS,
    };

    Ok(LocalModelConfig {
        base_url: overrides
            .base_url
            .or_else(|| non_empty(lookup(ENV_BASE_URL)))
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
        env_key,
        api_key,
        model: overrides
            .model
            .or_else(|| non_empty(lookup(ENV_MODEL)))
            .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
        tool_daemon_url: overrides
            .tool_daemon_url
            .or_else(|| non_empty(lookup(ENV_TOOL_DAEMON_URL)))
            .unwrap_or_else(|| DEFAULT_TOOL_DAEMON_URL.to_string()),
        tool_agent_id: non_empty(lookup(ENV_TOOL_AGENT_ID))
            .unwrap_or_else(|| DEFAULT_TOOL_AGENT_ID.to_string()),
        developer_prompt: non_empty(lookup(ENV_DEVELOPER_PROMPT)),
        max_output_tokens,
        reasoning_effort: DEFAULT_REASONING_EFFORT.to_string(),
        reasoning_summary: DEFAULT_REASONING_SUMMARY.to_string(),
    })
}

fn loop_settings_from_lookup(
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<LoopSettings, ConfigError> {
    let defaults = LoopSettings::default();
    let reasoning_enabled = match non_empty(lookup(ENV_REASONING)) {
        Some(raw) => parse_flag(ENV_REASONING, &raw)?,
        None => defaults.reasoning_enabled,
    };
    let strict_protocol = match non_empty(lookup(ENV_STRICT_PROTOCOL)) {
        Some(raw) => parse_flag(ENV_STRICT_PROTOCOL, &raw)?,
        None => defaults.strict_protocol,
    };
    let max_tool_rounds = match non_empty(lookup(ENV_MAX_TOOL_ROUNDS)) {
        Some(raw) => Some(parse_number::<usize>(ENV_MAX_TOOL_ROUNDS, &raw)?),
        None => defaults.max_tool_rounds,
    };
    if max_tool_rounds == Some(0) {
        return Err(ConfigError::InvalidValue {
            key: ENV_MAX_TOOL_ROUNDS.to_string(),
            value: "0".to_string(),
            reason: "at least one round is required".to_string(),
        });
    }
    let stream_idle_timeout = non_empty(lookup(ENV_STREAM_IDLE_TIMEOUT_MS))
        .map(|raw| parse_number::<u64>(ENV_STREAM_IDLE_TIMEOUT_MS, &raw))
        .transpose()?
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis);

    Ok(LoopSettings {
        reasoning_enabled,
        max_tool_rounds,
        stream_idle_timeout,
        strict_protocol,
    })
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|raw| raw.trim().to_string())
        .filter(|raw| !raw.is_empty())
}

fn parse_flag(key: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: raw.to_string(),
            reason: "expected a boolean".to_string(),
        }),
    }
}

fn parse_number<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse::<T>().map_err(|err| ConfigError::InvalidValue {
        key: key.to_string(),
        value: raw.to_string(),
        reason: err.to_string(),
    })
}
