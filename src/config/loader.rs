//! Configuration loading from disk.

use std::fs;
use std::path::Path;

use thiserror::Error;

use crate::config::schema::GraceConfig;
use crate::config::validation::{validate_config, ValidationError};

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation failed: {}", join(.0))]
    Validation(Vec<ValidationError>),
}

fn join(errors: &[ValidationError]) -> String {
    errors.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
}

/// Parse and validate configuration text.
pub fn parse_config(content: &str) -> Result<GraceConfig, ConfigError> {
    let config: GraceConfig = toml::from_str(content)?;
    validate_config(&config).map_err(ConfigError::Validation)?;
    Ok(config)
}

/// Load and validate configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<GraceConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    parse_config(&content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::LogFormat;

    #[test]
    fn test_minimal_config() {
        let config = parse_config("").unwrap();
        assert_eq!(config.servers.len(), 1);
        assert_eq!(config.servers[0].name, "default");
        assert_eq!(config.servers[0].route_cache_capacity, 10_000);
        assert!(config.process.inherit_descriptors);
    }

    #[test]
    fn test_full_config() {
        let config = parse_config(
            r#"
            [[servers]]
            name = "api"
            addresses = ["127.0.0.1:8080", "127.0.0.1:8081"]
            route_cache_capacity = 0

            [[servers]]
            name = "admin"
            addresses = ["127.0.0.1:9000"]

            [process]
            graceful_timeout_secs = 5
            inherit_descriptors = false
            pid_file = "/tmp/gracehttp.pid"

            [observability]
            log_format = "json"
            "#,
        )
        .unwrap();
        assert_eq!(config.servers.len(), 2);
        assert_eq!(config.server("api").unwrap().addresses.len(), 2);
        assert_eq!(config.server("admin").unwrap().max_connections, 10_000);
        assert_eq!(config.process.graceful_timeout().as_secs(), 5);
        assert!(!config.process.inherit_descriptors);
        assert_eq!(config.observability.log_format, LogFormat::Json);
    }

    #[test]
    fn test_errors() {
        assert!(matches!(parse_config("servers = 3"), Err(ConfigError::Parse(_))));
        assert!(matches!(parse_config("servers = []"), Err(ConfigError::Validation(_))));

        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(load_config(&dir.path().join("missing.toml")), Err(ConfigError::Io(_))));
    }
}
