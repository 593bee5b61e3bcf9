//! Agent control channel.
//!
//! A tonic server hosting two services behind the [`ChannelAuthorizer`]:
//! - `AgentAuth`: exchanges the shared agent secret for an access token
//!   (allow-listed, reachable without a token)
//! - `Agent`: the control service consumed by authenticated agents

mod agent;
mod auth;

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;

use crate::auth::{ChannelAuthorizer, TokenManager};
use crate::config::{GrpcSettings, GRPC_MAX_CONCURRENT_STREAMS};
use crate::error::ServerError;
use crate::metrics::Metrics;

pub use agent::AgentControl;
pub use auth::AuthService;

/// Generated protobuf messages, clients and service traits.
pub mod proto {
    tonic::include_proto!("runway.agent.v1");
}

use proto::agent_auth_server::AgentAuthServer;
use proto::agent_server::{Agent, AgentServer};

/// Full path of the token issuance RPC, exempt from the token check
pub const AUTH_ROUTE: &str = "/runway.agent.v1.AgentAuth/Auth";

/// Everything the agent channel task needs, resolved before it starts.
pub struct AgentChannel<A> {
    pub settings: GrpcSettings,
    pub tokens: Arc<TokenManager>,
    pub agent: A,
    pub metrics: Metrics,
}

impl<A: Agent> AgentChannel<A> {
    /// Serve on an already bound listener until `shutdown` is cancelled.
    pub async fn serve(
        self,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<(), ServerError> {
        let keepalive = Some(self.settings.keepalive_interval).filter(|d| !d.is_zero());
        let authorizer = ChannelAuthorizer::new(self.tokens.clone(), self.metrics.clone())
            .allow_route(AUTH_ROUTE);
        let auth = AuthService::new(
            self.tokens,
            self.settings.agent_secret.clone(),
            self.metrics,
        );

        tracing::info!(
            addr = ?listener.local_addr().ok(),
            keepalive = ?keepalive.map(|d: Duration| d.as_secs()),
            "Starting agent channel"
        );

        tonic::transport::Server::builder()
            .http2_keepalive_interval(keepalive)
            .tcp_keepalive(keepalive)
            .max_concurrent_streams(GRPC_MAX_CONCURRENT_STREAMS)
            .layer(authorizer)
            .add_service(AgentAuthServer::new(auth))
            .add_service(AgentServer::new(self.agent))
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), shutdown.cancelled())
            .await
            .map_err(|e| ServerError::serve("grpc", e))?;

        tracing::info!("Agent channel stopped");
        Ok(())
    }
}
