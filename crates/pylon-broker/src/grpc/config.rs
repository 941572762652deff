//! gRPC server configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Options applied to the broker's gRPC endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GrpcServerConfig {
    /// Address the server binds to.
    pub bind_address: String,
    /// Maximum size of a received message, in bytes.
    pub max_receive_message_size: usize,
    /// Maximum size of a sent message, in bytes.
    pub max_send_message_size: usize,
    /// Maximum concurrent HTTP/2 streams per connection.
    pub max_concurrent_streams: u32,
    /// Per-request timeout.
    pub request_timeout: Duration,
    /// Initial HTTP/2 stream flow-control window, in bytes.
    pub initial_stream_window_size: u32,
    /// Initial HTTP/2 connection flow-control window, in bytes.
    pub initial_connection_window_size: u32,
    /// Connections older than this are asked to reconnect, spreading
    /// subscribers across instances after a rollout.
    pub max_connection_age: Duration,
    /// Serve with TLS. Requires both file paths below.
    pub enable_tls: bool,
    /// PEM-encoded server certificate.
    pub tls_cert_file: Option<PathBuf>,
    /// PEM-encoded private key.
    pub tls_key_file: Option<PathBuf>,
}

impl Default for GrpcServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:8090".to_string(),
            max_receive_message_size: 4 * 1024 * 1024,
            max_send_message_size: 4 * 1024 * 1024,
            max_concurrent_streams: 100,
            request_timeout: Duration::from_secs(30),
            initial_stream_window_size: 1024 * 1024,
            initial_connection_window_size: 1024 * 1024,
            max_connection_age: Duration::from_secs(300),
            enable_tls: false,
            tls_cert_file: None,
            tls_key_file: None,
        }
    }
}

impl GrpcServerConfig {
    /// Validates the configuration before serving.
    ///
    /// # Errors
    ///
    /// TLS enabled without both a certificate and a key file is a fatal
    /// startup error.
    pub fn validate(&self) -> Result<()> {
        if self.enable_tls && (self.tls_cert_file.is_none() || self.tls_key_file.is_none()) {
            return Err(Error::Configuration {
                message: "TLS is enabled but tls_cert_file and tls_key_file are not both set"
                    .to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(GrpcServerConfig::default().validate().is_ok());
    }

    #[test]
    fn tls_without_key_material_is_fatal() {
        let config = GrpcServerConfig {
            enable_tls: true,
            ..GrpcServerConfig::default()
        };
        let err = config.validate().expect_err("should fail");
        assert!(matches!(err, Error::Configuration { .. }));

        let config = GrpcServerConfig {
            enable_tls: true,
            tls_cert_file: Some(PathBuf::from("/etc/pylon/tls.crt")),
            ..GrpcServerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn tls_with_both_files_validates() {
        let config = GrpcServerConfig {
            enable_tls: true,
            tls_cert_file: Some(PathBuf::from("/etc/pylon/tls.crt")),
            tls_key_file: Some(PathBuf::from("/etc/pylon/tls.key")),
            ..GrpcServerConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn config_roundtrips_through_serde() {
        let config = GrpcServerConfig::default();
        let json = serde_json::to_string(&config).expect("serialize");
        let back: GrpcServerConfig = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.bind_address, config.bind_address);
        assert_eq!(back.max_concurrent_streams, config.max_concurrent_streams);
    }
}
