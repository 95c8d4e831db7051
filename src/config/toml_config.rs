use super::Config;
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let content = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse TOML config: {}", path.as_ref().display()))?;

    config
        .validate()
        .with_context(|| format!("Invalid configuration in {}", path.as_ref().display()))?;

    Ok(config)
}

/// Loads `path` when it exists and falls back to defaults only when it does
/// not. A file that is present but unreadable or invalid is an error.
pub fn load_config_or_default<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    if !path.exists() {
        log::info!("No configuration at {}, using defaults", path.display());
        return Ok(Config::default());
    }
    let config = load_config(path)?;
    log::info!("Loaded configuration from: {}", path.display());
    Ok(config)
}

/// Default configuration rendered as TOML, for `--generate-config`.
pub fn default_config_toml() -> Result<String> {
    toml::to_string_pretty(&Config::default()).context("Failed to render default configuration")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::QueryMode;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_partial_config_fills_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[query]
mode = "mrn_date"
date_window_days = 3

[backend]
host = "pacs.example.org"
port = 11112
"#
        )
        .unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.query.mode, QueryMode::MrnDate);
        assert_eq!(config.query.date_window_days, 3);
        assert!(config.query.use_fallback);
        assert_eq!(config.backend.host, "pacs.example.org");
        assert_eq!(config.backend.port, 11112);
        assert_eq!(config.backend.findscu_path, "findscu");
        assert_eq!(config.retry.attempts, 4);
    }

    #[test]
    fn test_invalid_window_is_rejected() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[query]\ndate_window_days = 11").unwrap();
        assert!(load_config(file.path()).is_err());
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let config = load_config_or_default("/nonexistent/pacs-select.toml").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_present_invalid_file_is_an_error() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[query\nmode = ").unwrap();
        assert!(load_config_or_default(file.path()).is_err());

        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[query]\ndate_window_days = 11").unwrap();
        assert!(load_config_or_default(file.path()).is_err());
    }

    #[test]
    fn test_present_valid_file_is_loaded() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[query]\nmode = \"accession_number\"").unwrap();
        let config = load_config_or_default(file.path()).unwrap();
        assert_eq!(config.query.mode, QueryMode::AccessionNumber);
    }

    #[test]
    fn test_generated_config_loads_back() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", default_config_toml().unwrap()).unwrap();
        assert_eq!(load_config(file.path()).unwrap(), Config::default());
    }
}
