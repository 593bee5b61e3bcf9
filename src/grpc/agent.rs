//! Default agent control service.
//!
//! Job dispatch belongs to the queue collaborator; this implementation covers
//! the transport-level calls every agent makes: version negotiation, health
//! reports and a watch stream used as a liveness channel.

use std::pin::Pin;
use std::time::Duration;

use futures::{Stream, StreamExt};
use tokio_stream::wrappers::IntervalStream;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};

use super::proto::agent_server::Agent;
use super::proto::{Empty, ReportHealthRequest, VersionResponse, WatchEvent, WatchRequest};
use crate::auth::AgentClaims;
use crate::config::GRPC_PROTOCOL_VERSION;

/// Watch interval used when the agent does not request one
const DEFAULT_WATCH_INTERVAL_SECS: u32 = 5;

pub struct AgentControl {
    shutdown: CancellationToken,
}

impl AgentControl {
    /// Streams opened on this service end when `shutdown` is cancelled.
    pub fn new(shutdown: CancellationToken) -> Self {
        Self { shutdown }
    }
}

/// Identity attached by the channel authorizer.
fn caller<T>(request: &Request<T>) -> Result<String, Status> {
    request
        .extensions()
        .get::<AgentClaims>()
        .map(|claims| claims.sub.clone())
        .ok_or_else(|| Status::unauthenticated("missing token"))
}

#[tonic::async_trait]
impl Agent for AgentControl {
    async fn version(&self, _request: Request<Empty>) -> Result<Response<VersionResponse>, Status> {
        Ok(Response::new(VersionResponse {
            grpc_version: GRPC_PROTOCOL_VERSION,
            server_version: env!("CARGO_PKG_VERSION").to_string(),
        }))
    }

    async fn report_health(
        &self,
        request: Request<ReportHealthRequest>,
    ) -> Result<Response<Empty>, Status> {
        let agent = caller(&request)?;
        let report = request.into_inner();
        tracing::info!(agent = %agent, status = %report.status, "Agent health report");
        Ok(Response::new(Empty {}))
    }

    type WatchStream = Pin<Box<dyn Stream<Item = Result<WatchEvent, Status>> + Send + 'static>>;

    async fn watch(
        &self,
        request: Request<WatchRequest>,
    ) -> Result<Response<Self::WatchStream>, Status> {
        let agent = caller(&request)?;
        let seconds = match request.into_inner().interval_seconds {
            0 => DEFAULT_WATCH_INTERVAL_SECS,
            n => n,
        };
        tracing::debug!(agent = %agent, interval_secs = seconds, "Agent opened watch stream");

        let ticks = IntervalStream::new(tokio::time::interval(Duration::from_secs(seconds.into())));
        let stream = ticks
            .enumerate()
            .map(move |(sequence, _)| {
                Ok(WatchEvent {
                    sequence: sequence as u64,
                    agent_id: agent.clone(),
                })
            })
            .take_until(self.shutdown.clone().cancelled_owned());

        Ok(Response::new(Box::pin(stream)))
    }
}
