//! gRPC server lifecycle.

use tokio::sync::watch;
use tonic::transport::{Identity, Server, ServerTlsConfig};
use tracing::info;

use pylon_proto::cloud_event_service_server::CloudEventServiceServer;

use super::config::GrpcServerConfig;
use super::service::GrpcBroker;
use crate::error::{Error, Result};

/// Serves the broker's gRPC endpoint until `shutdown` flips to true.
///
/// Shutdown is graceful: the server stops accepting new calls, drains
/// in-flight calls, and closes subscriber streams, which unregisters their
/// broadcaster subscribers.
///
/// # Errors
///
/// Fails fast on invalid configuration (including TLS enabled without key
/// material) and propagates transport failures.
pub async fn serve(
    broker: GrpcBroker,
    config: GrpcServerConfig,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    config.validate()?;

    let addr: std::net::SocketAddr =
        config.bind_address.parse().map_err(|err| Error::Configuration {
            message: format!("invalid bind address {}: {err}", config.bind_address),
        })?;

    let mut builder = Server::builder()
        .max_concurrent_streams(config.max_concurrent_streams)
        .initial_stream_window_size(config.initial_stream_window_size)
        .initial_connection_window_size(config.initial_connection_window_size)
        .max_connection_age(config.max_connection_age)
        .timeout(config.request_timeout);

    if config.enable_tls {
        // validate() guarantees both paths when TLS is on.
        let (Some(cert_path), Some(key_path)) = (&config.tls_cert_file, &config.tls_key_file)
        else {
            return Err(Error::Configuration {
                message: "TLS is enabled but tls_cert_file and tls_key_file are not both set"
                    .to_string(),
            });
        };

        let cert = tokio::fs::read(cert_path).await.map_err(|err| Error::Configuration {
            message: format!(
                "failed to read TLS certificate {}: {err}",
                cert_path.display()
            ),
        })?;
        let key = tokio::fs::read(key_path).await.map_err(|err| Error::Configuration {
            message: format!("failed to read TLS key {}: {err}", key_path.display()),
        })?;

        builder = builder
            .tls_config(ServerTlsConfig::new().identity(Identity::from_pem(cert, key)))
            .map_err(|err| Error::Configuration {
                message: format!("failed to apply TLS configuration: {err}"),
            })?;
        info!(address = %addr, "serving gRPC with TLS");
    } else {
        info!(address = %addr, "serving gRPC without TLS");
    }

    let service = CloudEventServiceServer::new(broker)
        .max_decoding_message_size(config.max_receive_message_size)
        .max_encoding_message_size(config.max_send_message_size);

    builder
        .add_service(service)
        .serve_with_shutdown(addr, async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
        .map_err(|err| Error::Transport {
            message: format!("gRPC server failed: {err}"),
        })
}
