//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check server names are present and unique
//! - Check addresses parse and are not claimed twice
//! - Validate value ranges (timeouts > 0, connection limits > 0)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: GraceConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;
use std::net::SocketAddr;

use thiserror::Error;

use crate::config::schema::GraceConfig;

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("no servers configured")]
    NoServers,

    #[error("server #{0} has an empty name")]
    EmptyName(usize),

    #[error("server `{0}` is defined more than once")]
    DuplicateServer(String),

    #[error("server `{0}` has no listen addresses")]
    NoAddresses(String),

    #[error("server `{server}`: invalid address `{address}`")]
    InvalidAddress { server: String, address: String },

    #[error("address `{0}` is used by more than one listener")]
    DuplicateAddress(String),

    #[error("server `{0}` has https addresses but no tls section")]
    MissingTls(String),

    #[error("{0} must be greater than zero")]
    Zero(String),

    #[error("invalid log level `{0}`")]
    InvalidLogLevel(String),

    #[error("invalid metrics address `{0}`")]
    InvalidMetricsAddress(String),
}

/// `host:port` with a numeric port, or a literal socket address.
fn valid_address(address: &str) -> bool {
    if address.parse::<SocketAddr>().is_ok() {
        return true;
    }
    match address.rsplit_once(':') {
        Some((host, port)) => !host.is_empty() && !host.contains(['[', ']']) && port.parse::<u16>().is_ok(),
        None => false,
    }
}

pub fn validate_config(config: &GraceConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.servers.is_empty() {
        errors.push(ValidationError::NoServers);
    }

    let mut names = HashSet::new();
    let mut addresses = HashSet::new();
    for (index, server) in config.servers.iter().enumerate() {
        if server.name.trim().is_empty() {
            errors.push(ValidationError::EmptyName(index));
        } else if !names.insert(server.name.as_str()) {
            errors.push(ValidationError::DuplicateServer(server.name.clone()));
        }

        if server.addresses.is_empty() && server.https_addresses.is_empty() {
            errors.push(ValidationError::NoAddresses(server.name.clone()));
        }
        if !server.https_addresses.is_empty() && server.tls.is_none() {
            errors.push(ValidationError::MissingTls(server.name.clone()));
        }

        for address in server.addresses.iter().chain(&server.https_addresses) {
            if !valid_address(address) {
                errors.push(ValidationError::InvalidAddress {
                    server: server.name.clone(),
                    address: address.clone(),
                });
            } else if !addresses.insert(address.as_str()) {
                errors.push(ValidationError::DuplicateAddress(address.clone()));
            }
        }

        if server.max_connections == 0 {
            errors.push(ValidationError::Zero(format!("servers.{}.max_connections", server.name)));
        }
        if server.request_timeout_secs == 0 {
            errors.push(ValidationError::Zero(format!("servers.{}.request_timeout_secs", server.name)));
        }
    }

    if config.process.graceful_timeout_secs == 0 {
        errors.push(ValidationError::Zero("process.graceful_timeout_secs".into()));
    }
    if config.process.successor_ready_timeout_secs == 0 {
        errors.push(ValidationError::Zero("process.successor_ready_timeout_secs".into()));
    }

    let level = config.observability.log_level.to_ascii_lowercase();
    if !LOG_LEVELS.contains(&level.as_str()) {
        errors.push(ValidationError::InvalidLogLevel(config.observability.log_level.clone()));
    }
    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::InvalidMetricsAddress(
            config.observability.metrics_address.clone(),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::{ServerConfig, TlsConfig};

    #[test]
    fn test_default_config_is_valid() {
        assert!(validate_config(&GraceConfig::default()).is_ok());
    }

    #[test]
    fn test_collects_every_error() {
        let mut config = GraceConfig::default();
        config.servers.push(ServerConfig {
            name: "default".into(),
            addresses: vec!["nonsense".into(), "0.0.0.0:8080".into()],
            https_addresses: vec!["0.0.0.0:8443".into()],
            max_connections: 0,
            ..ServerConfig::default()
        });
        config.process.graceful_timeout_secs = 0;

        let errors = validate_config(&config).unwrap_err();
        assert!(errors.contains(&ValidationError::DuplicateServer("default".into())));
        assert!(errors.contains(&ValidationError::DuplicateAddress("0.0.0.0:8080".into())));
        assert!(errors.contains(&ValidationError::MissingTls("default".into())));
        assert!(errors.iter().any(|e| matches!(e, ValidationError::InvalidAddress { .. })));
        assert!(errors.contains(&ValidationError::Zero("process.graceful_timeout_secs".into())));
        assert_eq!(errors.len(), 6);
    }

    #[test]
    fn test_hostnames_and_tls() {
        let config = GraceConfig {
            servers: vec![ServerConfig {
                name: "api".into(),
                addresses: vec!["localhost:8080".into()],
                https_addresses: vec!["[::1]:8443".into()],
                tls: Some(TlsConfig {
                    cert_path: "cert.pem".into(),
                    key_path: "key.pem".into(),
                }),
                ..ServerConfig::default()
            }],
            ..GraceConfig::default()
        };
        assert!(validate_config(&config).is_ok());
    }
}
