//! Populates [`EngineConfig`] from the environment variables of spec §6,
//! with the documented defaults. Kept separate from `lib.rs` so the parsing
//! logic can be unit-tested without touching the process environment (env
//! vars are global state shared by every test in the binary).

use std::time::Duration;

/// `ICD3_MODEL_ENDPOINT` default: a loopback TCP address so the eager
/// connection `init()` makes has somewhere to dial in tests and examples.
pub const DEFAULT_MODEL_ENDPOINT: &str = "127.0.0.1:8400";
pub const DEFAULT_SEND_TIMEOUT_MS: u64 = 2000;

/// Mirrors `ICD3_LOG_LEVEL ∈ {DEBUG, INFO, WARN, ERROR}` (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn parse(s: &str) -> Option<Self> {
        Some(match s.to_ascii_uppercase().as_str() {
            "DEBUG" => LogLevel::Debug,
            "INFO" => LogLevel::Info,
            "WARN" => LogLevel::Warn,
            "ERROR" => LogLevel::Error,
            _ => return None,
        })
    }

    pub(crate) fn as_filter_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Process-wide configuration, read once at [`crate::init`] / [`crate::init_with_config`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub model_endpoint: String,
    pub send_timeout: Duration,
    pub log_level: LogLevel,
}

impl EngineConfig {
    /// Reads `ICD3_MODEL_ENDPOINT`, `ICD3_SEND_TIMEOUT_MS`, `ICD3_LOG_LEVEL`,
    /// falling back to the defaults documented in spec §6 for any that are
    /// unset or unparseable.
    pub fn from_env() -> Self {
        Self::from_values(
            std::env::var("ICD3_MODEL_ENDPOINT").ok(),
            std::env::var("ICD3_SEND_TIMEOUT_MS").ok(),
            std::env::var("ICD3_LOG_LEVEL").ok(),
        )
    }

    fn from_values(
        endpoint: Option<String>,
        timeout_ms: Option<String>,
        log_level: Option<String>,
    ) -> Self {
        let model_endpoint = endpoint.unwrap_or_else(|| DEFAULT_MODEL_ENDPOINT.to_string());
        let send_timeout = timeout_ms
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or_else(|| Duration::from_millis(DEFAULT_SEND_TIMEOUT_MS));
        let log_level = log_level
            .and_then(|v| LogLevel::parse(&v))
            .unwrap_or(LogLevel::Info);
        EngineConfig {
            model_endpoint,
            send_timeout,
            log_level,
        }
    }
}
