//! Runway - transport bootstrap for a CI server
//!
//! Stands up the authenticated gRPC channel used by build agents, the web/API
//! listener with selectable TLS termination, an optional metrics listener and
//! a recurring scheduler, and supervises them as one unit.

pub mod auth;
pub mod config;
pub mod error;
pub mod grpc;
pub mod http;
pub mod metrics;
pub mod middleware;
pub mod routes;
pub mod scheduler;
pub mod server;
pub mod supervisor;

pub use config::{AppConfig, ServerIdentity};
pub use error::{AuthError, ConfigError, ServerError};
pub use server::{BoundServer, Server};
