//! TLS termination strategy.
//!
//! Exactly one mode is active, chosen once at startup:
//!
//! | configured            | mode     | listeners                                  |
//! |-----------------------|----------|--------------------------------------------|
//! | cert + key            | `Static` | HTTPS on `tls_addr`, redirect on `addr`    |
//! | `lets_encrypt = true` | `Acme`   | HTTPS on `tls_addr`, optional redirect     |
//! | neither               | `Plain`  | HTTP on `addr`                             |
//!
//! Certificate files win over ACME when both are configured.

use std::net::SocketAddr;
use std::path::PathBuf;

use crate::config::ServerIdentity;

/// The active TLS termination mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TlsMode {
    /// Operator-provided PEM certificate and key
    Static { cert: PathBuf, key: PathBuf },
    /// Certificates obtained automatically for the public host name
    Acme {
        domain: String,
        email: Option<String>,
        cache_dir: PathBuf,
        production: bool,
    },
    /// No TLS
    Plain,
}

impl TlsMode {
    pub fn select(identity: &ServerIdentity) -> Self {
        let tls = &identity.tls;
        match (&tls.cert, &tls.key) {
            (Some(cert), Some(key)) => {
                if tls.acme {
                    tracing::warn!(
                        "Both certificate files and lets_encrypt are configured; using the certificate files"
                    );
                }
                TlsMode::Static {
                    cert: cert.clone(),
                    key: key.clone(),
                }
            }
            _ if tls.acme => TlsMode::Acme {
                domain: identity.public.hostname.clone(),
                email: tls.acme_email.clone(),
                cache_dir: tls.acme_cache_dir.clone(),
                production: tls.acme_production,
            },
            _ => TlsMode::Plain,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            TlsMode::Static { .. } => "static",
            TlsMode::Acme { .. } => "acme",
            TlsMode::Plain => "plain",
        }
    }

    pub fn is_tls(&self) -> bool {
        !matches!(self, TlsMode::Plain)
    }
}

/// What a listener serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerRole {
    /// The mounted web/API handler
    Web,
    /// HTTP->HTTPS redirect, no mounted handler
    Redirect,
}

/// One listener to launch: address, role and the TLS mode it terminates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerSpec {
    pub role: ListenerRole,
    pub addr: SocketAddr,
    pub mode: TlsMode,
}

impl ListenerSpec {
    /// Task name used in logs and errors.
    pub fn name(&self) -> &'static str {
        match (self.role, self.mode.is_tls()) {
            (ListenerRole::Redirect, _) => "redirect",
            (ListenerRole::Web, true) => "https",
            (ListenerRole::Web, false) => "http",
        }
    }
}

/// The web listener topology produced by the TLS strategy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerSet {
    mode: TlsMode,
    listeners: Vec<ListenerSpec>,
}

impl ListenerSet {
    pub fn plan(identity: &ServerIdentity) -> Self {
        let mode = TlsMode::select(identity);
        let web = ListenerSpec {
            role: ListenerRole::Web,
            addr: if mode.is_tls() {
                identity.tls_addr
            } else {
                identity.http_addr
            },
            mode: mode.clone(),
        };
        let redirect = ListenerSpec {
            role: ListenerRole::Redirect,
            addr: identity.http_addr,
            mode: TlsMode::Plain,
        };

        let listeners = match &mode {
            TlsMode::Static { .. } => vec![web, redirect],
            TlsMode::Acme { .. } if identity.tls.redirect_http => vec![web, redirect],
            TlsMode::Acme { .. } | TlsMode::Plain => vec![web],
        };

        Self { mode, listeners }
    }

    pub fn mode(&self) -> &TlsMode {
        &self.mode
    }

    pub fn listeners(&self) -> &[ListenerSpec] {
        &self.listeners
    }

    pub fn has_redirect(&self) -> bool {
        self.listeners
            .iter()
            .any(|listener| listener.role == ListenerRole::Redirect)
    }
}

impl IntoIterator for ListenerSet {
    type Item = ListenerSpec;
    type IntoIter = std::vec::IntoIter<ListenerSpec>;

    fn into_iter(self) -> Self::IntoIter {
        self.listeners.into_iter()
    }
}
