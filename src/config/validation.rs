//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts, ports, queue depth)
//! - Detect conflicting public ports
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ProxyConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use thiserror::Error;

use crate::config::schema::ProxyConfig;

/// Longest allowed request timeout.
pub const MAX_REQUEST_TIMEOUT_SECS: u64 = 900;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{0} must not be zero")]
    ZeroPort(&'static str),

    #[error("http_port and https_port are both {0}")]
    PortConflict(u16),

    #[error("request timeout {0}s is outside 1..={MAX_REQUEST_TIMEOUT_SECS}")]
    RequestTimeout(u64),

    #[error("request_queue_depth must be at least 1")]
    QueueDepth,

    #[error("management_service must not be empty")]
    ManagementService,

    #[error("tls.cert_name must not be empty")]
    CertName,
}

/// Check a parsed configuration for semantic problems.
pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();
    let listener = &config.listener;

    if listener.http_port == 0 {
        errors.push(ValidationError::ZeroPort("http_port"));
    }
    if listener.https_port == 0 {
        errors.push(ValidationError::ZeroPort("https_port"));
    }
    if listener.http_port != 0 && listener.http_port == listener.https_port {
        errors.push(ValidationError::PortConflict(listener.http_port));
    }
    if listener.request_queue_depth == 0 {
        errors.push(ValidationError::QueueDepth);
    }
    if listener
        .tls
        .as_ref()
        .is_some_and(|tls| tls.cert_name.trim().is_empty())
    {
        errors.push(ValidationError::CertName);
    }

    let request_secs = config.timeouts.request_secs;
    if request_secs == 0 || request_secs > MAX_REQUEST_TIMEOUT_SECS {
        errors.push(ValidationError::RequestTimeout(request_secs));
    }

    if config.discovery.management_service.trim().is_empty() {
        errors.push(ValidationError::ManagementService);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
