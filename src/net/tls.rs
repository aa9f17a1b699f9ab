//! TLS configuration and certificate loading.

use std::path::{Path, PathBuf};

use axum_server::tls_rustls::RustlsConfig;

use crate::config::TlsConfig;

/// Certificate and key paths for a named certificate in `cert_dir`.
pub fn cert_paths(config: &TlsConfig) -> (PathBuf, PathBuf) {
    let dir = Path::new(&config.cert_dir);
    (
        dir.join(format!("{}.crt", config.cert_name)),
        dir.join(format!("{}.key", config.cert_name)),
    )
}

/// Load the rustls server configuration for the secure listener.
pub async fn load_tls_config(config: &TlsConfig) -> Result<RustlsConfig, std::io::Error> {
    let (cert_path, key_path) = cert_paths(config);

    if !cert_path.exists() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Certificate file not found: {:?}", cert_path),
        ));
    }
    if !key_path.exists() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Private key file not found: {:?}", key_path),
        ));
    }

    tracing::info!(cert = ?cert_path, "Loading TLS certificate");
    RustlsConfig::from_pem_file(cert_path, key_path).await
}
