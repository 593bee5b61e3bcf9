//! Error taxonomy for startup, agent authentication and supervised transports.

use std::io;
use std::net::SocketAddr;

pub use crate::config::ConfigError;

/// Authentication failure on a single agent channel call.
///
/// Always local to the call: the caller is rejected, the server keeps serving.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("missing token")]
    MissingToken,

    #[error("invalid token")]
    InvalidToken,

    #[error("token expired")]
    Expired,

    #[error("token manager misconfigured: {0}")]
    Configuration(String),
}

impl From<AuthError> for tonic::Status {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Configuration(_) => {
                tracing::error!(error = %err, "Agent token manager misconfigured");
                tonic::Status::internal("token manager unavailable")
            }
            _ => tonic::Status::unauthenticated(err.to_string()),
        }
    }
}

/// Error returned by a supervised task or by server startup.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("{0}")]
    Config(#[from] ConfigError),

    #[error("Failed to bind {task} listener on {addr}: {source}")]
    Bind {
        task: String,
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("Failed to load TLS configuration: {0}")]
    Tls(String),

    #[error("ACME certificate acquisition failed: {0}")]
    Acme(String),

    #[error("{task} server error: {message}")]
    Serve { task: String, message: String },

    /// The listener was closed on purpose; not a failure.
    #[error("server closed")]
    Closed,

    #[error("supervised task panicked: {0}")]
    Panicked(String),
}

impl ServerError {
    pub fn bind(task: &str, addr: SocketAddr, source: io::Error) -> Self {
        Self::Bind {
            task: task.to_string(),
            addr,
            source,
        }
    }

    pub fn serve(task: &str, err: impl std::fmt::Display) -> Self {
        Self::Serve {
            task: task.to_string(),
            message: err.to_string(),
        }
    }

    /// Whether this outcome is a planned shutdown rather than a failure.
    pub fn is_graceful(&self) -> bool {
        matches!(self, Self::Closed)
    }
}
