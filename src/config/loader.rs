//! Configuration loading from disk and the process environment.

use std::fs;
use std::path::Path;

use thiserror::Error;

use crate::config::schema::{LogFormat, ProxyConfig, TlsConfig};
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
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Values supplied on the command line or through the environment.
///
/// Each populated field replaces the matching file value.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub http_port: Option<u16>,
    pub https_port: Option<u16>,
    pub request_secs: Option<u64>,
    pub default_backend: Option<String>,
    pub ssl_cert: Option<String>,
    pub log_level: Option<String>,
    pub dev: bool,
}

impl Overrides {
    pub fn apply(&self, config: &mut ProxyConfig) {
        if let Some(port) = self.http_port {
            config.listener.http_port = port;
        }
        if let Some(port) = self.https_port {
            config.listener.https_port = port;
        }
        if let Some(secs) = self.request_secs {
            config.timeouts.request_secs = secs;
        }
        if let Some(default) = self.default_backend.as_ref().filter(|d| !d.is_empty()) {
            config.discovery.default_backend = Some(default.clone());
        }
        if let Some(name) = self.ssl_cert.as_ref().filter(|n| !n.is_empty()) {
            match config.listener.tls.as_mut() {
                Some(tls) => tls.cert_name = name.clone(),
                None => {
                    config.listener.tls = Some(TlsConfig {
                        cert_dir: "/ssl".to_string(),
                        cert_name: name.clone(),
                    })
                }
            }
        }
        if self.dev {
            config.observability.log_format = LogFormat::Pretty;
        }
        if let Some(level) = &self.log_level {
            config.observability.log_level = level.clone();
        } else if self.dev {
            config.observability.log_level = "debug".to_string();
        }
    }
}

/// Parse and validate configuration from a TOML string.
pub fn parse_config(content: &str, overrides: &Overrides) -> Result<ProxyConfig, ConfigError> {
    let mut config: ProxyConfig = toml::from_str(content)?;
    overrides.apply(&mut config);
    validate_config(&config).map_err(ConfigError::Validation)?;
    Ok(config)
}

/// Load and validate configuration from a TOML file.
///
/// Without a path the built-in defaults are used.
pub fn load_config(path: Option<&Path>, overrides: &Overrides) -> Result<ProxyConfig, ConfigError> {
    let content = match path {
        Some(path) => fs::read_to_string(path)?,
        None => String::new(),
    };
    parse_config(&content, overrides)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_replace_file_values() {
        let overrides = Overrides {
            http_port: Some(8080),
            request_secs: Some(30),
            default_backend: Some("kubernetes".into()),
            ssl_cert: Some("wildcard".into()),
            dev: true,
            ..Overrides::default()
        };
        let config = parse_config("[listener]\nhttp_port = 81\n", &overrides).unwrap();

        assert_eq!(config.listener.http_port, 8080);
        assert_eq!(config.timeouts.request_secs, 30);
        assert_eq!(config.discovery.default_backend.as_deref(), Some("kubernetes"));
        assert_eq!(config.listener.tls.unwrap().cert_name, "wildcard");
        assert_eq!(config.observability.log_level, "debug");
    }

    #[test]
    fn empty_default_backend_is_ignored() {
        let overrides = Overrides {
            default_backend: Some(String::new()),
            ..Overrides::default()
        };
        let config = parse_config("", &overrides).unwrap();
        assert!(config.discovery.default_backend.is_none());
    }

    #[test]
    fn invalid_values_fail_validation() {
        let overrides = Overrides {
            request_secs: Some(1_000),
            ..Overrides::default()
        };
        let err = parse_config("", &overrides).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(ref e) if e.len() == 1));
        assert!(err.to_string().contains("request timeout"));
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        let err = parse_config("[listener\n", &Overrides::default()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = load_config(Some(Path::new("/nonexistent/proxy.toml")), &Overrides::default())
            .unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
