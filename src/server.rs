//! Process orchestration: validated identity in, supervised listeners out.
//!
//! Startup happens in two steps. [`Server::bind`] opens every socket of the
//! planned topology and fails on the first one that cannot be bound, before
//! anything is served. [`BoundServer::serve`] then runs one supervised task per
//! listener, plus the scheduler, until shutdown or the first fatal error.

use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;

use axum::Router;
use tokio_util::sync::CancellationToken;

use crate::auth::TokenManager;
use crate::config::ServerIdentity;
use crate::error::ServerError;
use crate::grpc::{AgentChannel, AgentControl};
use crate::http::{self, ListenerSet, ListenerSpec};
use crate::metrics::Metrics;
use crate::routes;
use crate::scheduler::{run_scheduler, ScheduledJob};
use crate::supervisor::Supervisor;

pub struct Server {
    identity: Arc<ServerIdentity>,
    app: Router,
    job: Option<Arc<dyn ScheduledJob>>,
    metrics: Metrics,
}

impl Server {
    /// Mount `app` on the web listener of `identity`.
    pub fn new(identity: ServerIdentity, app: Router) -> Result<Self, ServerError> {
        let metrics = Metrics::new().map_err(|e| ServerError::serve("metrics", e))?;
        Ok(Self {
            identity: Arc::new(identity),
            app,
            job: None,
            metrics,
        })
    }

    /// Job run by the scheduler when `[scheduler]` is enabled.
    pub fn with_job(mut self, job: Arc<dyn ScheduledJob>) -> Self {
        self.job = Some(job);
        self
    }

    pub fn identity(&self) -> &ServerIdentity {
        &self.identity
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Bind every listener of the topology.
    pub fn bind(self) -> Result<BoundServer, ServerError> {
        let topology = ListenerSet::plan(&self.identity);
        tracing::info!(
            host = %self.identity.public.url,
            tls = topology.mode().name(),
            listeners = topology.listeners().len(),
            "Planned listener topology"
        );

        let grpc = http::bind("grpc", self.identity.grpc.addr)?;

        let mut web = Vec::new();
        for spec in topology {
            let listener = http::bind(spec.name(), spec.addr)?;
            web.push((spec, listener));
        }

        let metrics = self
            .identity
            .metrics_addr
            .map(|addr| http::bind("metrics", addr))
            .transpose()?;

        Ok(BoundServer {
            server: self,
            grpc,
            web,
            metrics,
        })
    }

    /// Bind and serve until `shutdown` is cancelled or a task fails.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), ServerError> {
        self.bind()?.serve(shutdown).await
    }
}

/// A [`Server`] whose sockets are all open.
pub struct BoundServer {
    server: Server,
    grpc: TcpListener,
    web: Vec<(ListenerSpec, TcpListener)>,
    metrics: Option<TcpListener>,
}

impl BoundServer {
    pub fn grpc_addr(&self) -> Option<SocketAddr> {
        self.grpc.local_addr().ok()
    }

    /// Local address of the web (non-redirect) listener.
    pub fn web_addr(&self) -> Option<SocketAddr> {
        self.web
            .iter()
            .find(|(spec, _)| spec.role == http::ListenerRole::Web)
            .and_then(|(_, listener)| listener.local_addr().ok())
    }

    pub fn redirect_addr(&self) -> Option<SocketAddr> {
        self.web
            .iter()
            .find(|(spec, _)| spec.role == http::ListenerRole::Redirect)
            .and_then(|(_, listener)| listener.local_addr().ok())
    }

    pub fn metrics_addr(&self) -> Option<SocketAddr> {
        self.metrics
            .as_ref()
            .and_then(|listener| listener.local_addr().ok())
    }

    pub async fn serve(self, shutdown: CancellationToken) -> Result<(), ServerError> {
        let Server {
            identity,
            app,
            job,
            metrics,
        } = self.server;
        let mut supervisor = Supervisor::new(&shutdown, metrics.clone());

        let channel = AgentChannel {
            settings: identity.grpc.clone(),
            tokens: Arc::new(TokenManager::new(
                &identity.grpc.secret,
                identity.grpc.token_ttl,
            )),
            agent: AgentControl::new(supervisor.token()),
            metrics: metrics.clone(),
        };
        let grpc = self.grpc;
        supervisor.spawn("grpc", move |token| async move {
            let addr = grpc.local_addr().ok();
            let listener = tokio::net::TcpListener::from_std(grpc).map_err(|e| {
                ServerError::bind("grpc", addr.unwrap_or(channel.settings.addr), e)
            })?;
            channel.serve(listener, token).await
        });

        let app = routes::mount(app, &identity.root_path);
        for (spec, listener) in self.web {
            let app = app.clone();
            let public = identity.public.clone();
            supervisor.spawn(spec.name(), move |token| async move {
                http::serve_listener(listener, &spec, app, &public, token).await
            });
        }

        if let Some(listener) = self.metrics {
            let router = metrics.router();
            supervisor.spawn("metrics", move |token| serve_metrics(listener, router, token));
        }

        match (identity.scheduler, job) {
            (Some(interval), Some(job)) => {
                supervisor.spawn("scheduler", move |token| run_scheduler(job, interval, token));
            }
            (Some(_), None) => {
                tracing::info!("Scheduler enabled but no job registered, not starting it");
            }
            (None, _) => {}
        }

        tracing::info!(tasks = supervisor.len(), "Server started");
        let result = supervisor.wait().await;
        match &result {
            Ok(()) => tracing::info!("Server stopped"),
            Err(e) => tracing::error!(error = %e, "Server stopped after a fatal error"),
        }
        result
    }
}

async fn serve_metrics(
    listener: TcpListener,
    router: Router,
    shutdown: CancellationToken,
) -> Result<(), ServerError> {
    let addr = listener.local_addr().ok();
    let listener = tokio::net::TcpListener::from_std(listener).map_err(|e| {
        ServerError::bind("metrics", addr.unwrap_or(([0, 0, 0, 0], 0).into()), e)
    })?;
    tracing::info!(addr = ?addr, "Starting metrics server");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .map_err(|e| ServerError::serve("metrics", e))
}
