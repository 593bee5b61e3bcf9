//! Token issuance for registering agents.

use std::sync::Arc;

use subtle::ConstantTimeEq;
use tonic::{Request, Response, Status};

use super::proto::agent_auth_server::AgentAuth;
use super::proto::{AuthRequest, AuthResponse};
use crate::auth::TokenManager;
use crate::metrics::Metrics;

/// Exchanges the shared agent secret for a signed access token.
pub struct AuthService {
    tokens: Arc<TokenManager>,
    agent_secret: String,
    metrics: Metrics,
}

impl AuthService {
    pub fn new(tokens: Arc<TokenManager>, agent_secret: String, metrics: Metrics) -> Self {
        Self {
            tokens,
            agent_secret,
            metrics,
        }
    }

    fn secret_matches(&self, presented: &str) -> bool {
        presented
            .as_bytes()
            .ct_eq(self.agent_secret.as_bytes())
            .into()
    }
}

#[tonic::async_trait]
impl AgentAuth for AuthService {
    async fn auth(&self, request: Request<AuthRequest>) -> Result<Response<AuthResponse>, Status> {
        let remote = request.remote_addr();
        let req = request.into_inner();

        if self.agent_secret.is_empty() || !self.secret_matches(&req.agent_token) {
            tracing::warn!(remote = ?remote, "Agent presented an invalid agent token");
            return Err(Status::unauthenticated("invalid agent token"));
        }

        let agent_id = req.agent_id.trim();
        if agent_id.is_empty() {
            return Err(Status::invalid_argument("agent_id is required"));
        }

        let access_token = self.tokens.sign(agent_id)?;
        self.metrics.record_token_issued();
        tracing::info!(
            agent = %agent_id,
            ttl_secs = self.tokens.ttl().as_secs(),
            "Issued agent access token"
        );

        Ok(Response::new(AuthResponse {
            status: "ok".to_string(),
            agent_id: agent_id.to_string(),
            access_token,
        }))
    }
}
