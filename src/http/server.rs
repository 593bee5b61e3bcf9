//! Web listener tasks.
//!
//! Each [`ListenerSpec`] becomes one task serving until its cancellation token
//! fires, then draining in-flight requests for up to [`SHUTDOWN_GRACE_SECS`].
//! Listeners are bound explicitly so a bind failure is reported as such, and
//! tests can hand in a listener bound to port 0.

use std::net::{SocketAddr, TcpListener};
use std::path::Path;
use std::sync::Arc;

use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use futures::StreamExt;
use rustls::ServerConfig;
use rustls_acme::caches::DirCache;
use rustls_acme::{AcmeConfig, EventOk};
use tokio_util::sync::CancellationToken;

use crate::config::{PublicUrl, TLS_ALPN_PROTOCOLS};
use crate::error::ServerError;

use super::redirect;
use super::shutdown;
use super::tls::{ListenerRole, ListenerSpec, TlsMode};

/// Bind a listening socket for `task`.
pub fn bind(task: &str, addr: SocketAddr) -> Result<TcpListener, ServerError> {
    let listener = TcpListener::bind(addr).map_err(|e| ServerError::bind(task, addr, e))?;
    listener
        .set_nonblocking(true)
        .map_err(|e| ServerError::bind(task, addr, e))?;
    Ok(listener)
}

/// Serve one listener of the planned topology on an already bound socket.
///
/// Redirect listeners ignore `app` and answer every request with a permanent
/// redirect to the HTTPS origin of `public`.
pub async fn serve_listener(
    listener: TcpListener,
    spec: &ListenerSpec,
    app: Router,
    public: &PublicUrl,
    shutdown: CancellationToken,
) -> Result<(), ServerError> {
    let task = spec.name();
    let addr = listener.local_addr().unwrap_or(spec.addr);
    let handle = Handle::new();
    shutdown::drain_on_cancel(task, handle.clone(), shutdown.clone());

    let result = match (spec.role, &spec.mode) {
        (ListenerRole::Redirect, _) => {
            tracing::info!(%addr, to = %public.authority, "Starting HTTP->HTTPS redirect server");
            serve_plain(listener, redirect::router(public), handle).await
        }
        (ListenerRole::Web, TlsMode::Plain) => {
            tracing::warn!(
                %addr,
                "TLS disabled - server running on plain HTTP (not recommended for production)"
            );
            serve_plain(listener, app, handle).await
        }
        (ListenerRole::Web, TlsMode::Static { cert, key }) => {
            serve_static_tls(listener, app, cert, key, handle, shutdown.clone()).await
        }
        (ListenerRole::Web, TlsMode::Acme {
            domain,
            email,
            cache_dir,
            production,
        }) => {
            let acme = AcmeOptions {
                domain,
                email: email.as_deref(),
                cache_dir,
                production: *production,
            };
            serve_acme(listener, app, acme, handle).await
        }
    }
    .map_err(|e| match e {
        ServeFailure::Setup(err) => err,
        ServeFailure::Io(err) => ServerError::serve(task, err),
    })?;

    if shutdown.is_cancelled() {
        tracing::info!(task, "Listener stopped");
        Ok(())
    } else {
        Err(ServerError::Closed)
    }
}

enum ServeFailure {
    Setup(ServerError),
    Io(std::io::Error),
}

impl From<std::io::Error> for ServeFailure {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<ServerError> for ServeFailure {
    fn from(err: ServerError) -> Self {
        Self::Setup(err)
    }
}

async fn serve_plain(listener: TcpListener, app: Router, handle: Handle) -> Result<(), ServeFailure> {
    axum_server::from_tcp(listener)
        .handle(handle)
        .serve(app.into_make_service())
        .await?;
    Ok(())
}

/// HTTPS with operator-provided certificate files, reloadable with SIGHUP.
async fn serve_static_tls(
    listener: TcpListener,
    app: Router,
    cert: &Path,
    key: &Path,
    handle: Handle,
    shutdown: CancellationToken,
) -> Result<(), ServeFailure> {
    tracing::info!(
        addr = ?listener.local_addr().ok(),
        cert = %cert.display(),
        key = %key.display(),
        "Starting HTTPS server (certificate files)"
    );

    let rustls_config = RustlsConfig::from_pem_file(cert, key)
        .await
        .map_err(|e| {
            ServerError::Tls(format!(
                "Failed to load certificates from {} and {}: {}",
                cert.display(),
                key.display(),
                e
            ))
        })?;

    shutdown::setup_reload_handler(
        rustls_config.clone(),
        cert.to_path_buf(),
        key.to_path_buf(),
        shutdown,
    );

    axum_server::from_tcp_rustls(listener, rustls_config)
        .handle(handle)
        .serve(app.into_make_service())
        .await?;
    Ok(())
}

struct AcmeOptions<'a> {
    domain: &'a str,
    email: Option<&'a str>,
    cache_dir: &'a Path,
    production: bool,
}

/// HTTPS with certificates obtained over TLS-ALPN-01.
///
/// A failure before the first certificate is deployed is fatal to the
/// listener. Renewal failures afterwards are logged and retried by the ACME
/// state machine.
async fn serve_acme(
    listener: TcpListener,
    app: Router,
    options: AcmeOptions<'_>,
    handle: Handle,
) -> Result<(), ServeFailure> {
    let environment = if options.production {
        "production"
    } else {
        "staging"
    };
    tracing::info!(
        addr = ?listener.local_addr().ok(),
        domain = %options.domain,
        email = ?options.email,
        cache = %options.cache_dir.display(),
        %environment,
        "Starting HTTPS server (ACME)"
    );

    if !options.production {
        tracing::warn!(
            "Using Let's Encrypt staging environment - certificates will NOT be trusted by browsers. \
             Set acme_production = true for production use."
        );
    }

    std::fs::create_dir_all(options.cache_dir).map_err(|e| {
        ServerError::Acme(format!(
            "Failed to create ACME cache directory '{}': {}",
            options.cache_dir.display(),
            e
        ))
    })?;

    let mut acme = AcmeConfig::new([options.domain.to_string()])
        .cache(DirCache::new(options.cache_dir.to_path_buf()))
        .directory_lets_encrypt(options.production);
    if let Some(email) = options.email {
        acme = acme.contact_push(format!("mailto:{}", email));
    }
    let mut acme_state = acme.state();

    let mut rustls_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(acme_state.resolver());
    rustls_config.alpn_protocols = TLS_ALPN_PROTOCOLS.iter().map(|p| p.to_vec()).collect();
    let acceptor = acme_state.axum_acceptor(Arc::new(rustls_config));

    let events = async move {
        let mut deployed = false;
        loop {
            match acme_state.next().await {
                Some(Ok(event)) => {
                    if matches!(event, EventOk::DeployedCachedCert | EventOk::DeployedNewCert) {
                        deployed = true;
                    }
                    tracing::info!(event = ?event, "ACME event");
                }
                Some(Err(err)) if !deployed => {
                    return ServerError::Acme(err.to_string());
                }
                Some(Err(err)) => {
                    tracing::error!(error = %err, "ACME renewal error");
                }
                None => {
                    tracing::debug!("ACME state stream ended");
                    return futures::future::pending::<ServerError>().await;
                }
            }
        }
    };

    let server = axum_server::from_tcp(listener)
        .handle(handle)
        .acceptor(acceptor)
        .serve(app.into_make_service());

    tokio::select! {
        result = server => result.map_err(ServeFailure::from),
        err = events => Err(ServeFailure::Setup(err)),
    }
}
