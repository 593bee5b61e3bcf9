//! Web listeners with TLS support.
//!
//! The TLS strategy picks one of three modes at startup:
//! - **Static**: operator-provided certificate and key files
//! - **ACME**: automatic certificates via Let's Encrypt (TLS-ALPN-01)
//! - **Plain**: HTTP only, for development or behind a terminating proxy
//!
//! The listeners include:
//! - HTTP to HTTPS redirect with HSTS (when TLS is enabled)
//! - Graceful drain when the shared cancellation token fires
//! - Certificate hot-reload via SIGHUP (certificate file mode)

pub mod redirect;
mod server;
pub mod shutdown;
pub mod tls;

pub use server::{bind, serve_listener};
pub use tls::{ListenerRole, ListenerSet, ListenerSpec, TlsMode};
