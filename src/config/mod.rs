pub mod toml_config;

use crate::planner::{validate_date_window_days, QueryMode};
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    pub query: QueryConfig,
    pub rules: RulesConfig,
    pub backend: BackendConfig,
    pub retry: RetryConfig,
    pub ledger: LedgerConfig,
    pub logging: Option<LoggingConfig>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct QueryConfig {
    pub mode: QueryMode,
    pub date_window_days: i64,
    /// Retry failed accession rows by MRN and study date.
    pub use_fallback: bool,
    pub return_tags: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Default)]
#[serde(default)]
pub struct RulesConfig {
    pub path: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct BackendConfig {
    pub findscu_path: String,
    pub host: String,
    pub port: u16,
    pub calling_aet: String,
    pub called_aet: String,
    pub timeout_seconds: u64,
    pub dictionary_path: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    pub attempts: u32,
    /// Wait before each retry; the last entry repeats if attempts outnumber it.
    pub delays_seconds: Vec<u64>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct LedgerConfig {
    pub output_dir: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            query: QueryConfig::default(),
            rules: RulesConfig::default(),
            backend: BackendConfig::default(),
            retry: RetryConfig::default(),
            ledger: LedgerConfig::default(),
            logging: Some(LoggingConfig {
                level: "info".to_string(),
            }),
        }
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            mode: QueryMode::AccessionNumber,
            date_window_days: 0,
            use_fallback: true,
            return_tags: Vec::new(),
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            findscu_path: "findscu".to_string(),
            host: "127.0.0.1".to_string(),
            port: 104,
            calling_aet: "PACS_SELECT".to_string(),
            called_aet: "ANY-SCP".to_string(),
            timeout_seconds: 60,
            dictionary_path: None,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 4,
            delays_seconds: vec![4, 16, 32],
        }
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            output_dir: "runs".to_string(),
        }
    }
}

impl Config {
    /// Checks settings that would otherwise only fail once queries start.
    pub fn validate(&self) -> Result<()> {
        validate_date_window_days(self.query.date_window_days)?;
        if self.retry.attempts == 0 {
            bail!("retry.attempts must be at least 1");
        }
        if self.backend.host.trim().is_empty() {
            bail!("backend.host must not be empty");
        }
        Ok(())
    }

    pub fn log_level(&self) -> Option<&str> {
        self.logging.as_ref().map(|l| l.level.as_str())
    }
}
