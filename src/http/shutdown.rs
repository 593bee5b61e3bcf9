//! Graceful shutdown and signal handling.
//!
//! Handles:
//! - SIGTERM/SIGINT: cancel the root token, every task drains and stops
//! - SIGHUP: certificate reload (certificate file mode only)

use std::path::PathBuf;
use std::time::Duration;

use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use tokio_util::sync::CancellationToken;

use crate::config::SHUTDOWN_GRACE_SECS;

/// Cancel `shutdown` on the first SIGTERM or Ctrl+C.
pub fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to install Ctrl+C handler");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("Received Ctrl+C, initiating graceful shutdown");
            }
            _ = terminate => {
                tracing::info!("Received SIGTERM, initiating graceful shutdown");
            }
            _ = shutdown.cancelled() => return,
        }

        shutdown.cancel();
    });
}

/// Start draining `handle` once `shutdown` is cancelled.
pub fn drain_on_cancel(task: &'static str, handle: Handle, shutdown: CancellationToken) {
    tokio::spawn(async move {
        shutdown.cancelled().await;
        handle.graceful_shutdown(Some(Duration::from_secs(SHUTDOWN_GRACE_SECS)));
        tracing::info!(
            task,
            grace_secs = SHUTDOWN_GRACE_SECS,
            "Graceful shutdown initiated, waiting for connections to close"
        );
    });
}

/// Reload the certificate and key from disk on SIGHUP, until `shutdown`.
#[cfg(unix)]
pub fn setup_reload_handler(
    tls_config: RustlsConfig,
    cert_path: PathBuf,
    key_path: PathBuf,
    shutdown: CancellationToken,
) {
    tokio::spawn(async move {
        let mut sighup =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) {
                Ok(signal) => signal,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to install SIGHUP handler, certificate reload disabled");
                    return;
                }
            };

        loop {
            tokio::select! {
                _ = sighup.recv() => {}
                _ = shutdown.cancelled() => break,
            }
            tracing::info!("Received SIGHUP, reloading TLS certificates");

            match tls_config.reload_from_pem_file(&cert_path, &key_path).await {
                Ok(()) => {
                    tracing::info!(
                        cert = %cert_path.display(),
                        key = %key_path.display(),
                        "TLS certificates reloaded successfully"
                    );
                }
                Err(e) => {
                    tracing::error!(
                        error = %e,
                        cert = %cert_path.display(),
                        key = %key_path.display(),
                        "Failed to reload TLS certificates"
                    );
                }
            }
        }
    });
}

/// No-op reload handler for non-Unix platforms.
#[cfg(not(unix))]
pub fn setup_reload_handler(
    _tls_config: RustlsConfig,
    _cert_path: PathBuf,
    _key_path: PathBuf,
    _shutdown: CancellationToken,
) {
    tracing::warn!("Certificate hot-reload via SIGHUP not supported on this platform");
}
