//! Token gate for every call on the agent channel.
//!
//! Runs as a tower layer in front of the gRPC router, so unary and streaming
//! calls pass through the same check exactly once, before the request reaches
//! a service. A stream is verified when it opens and never again per message.
//! Routes on the allow-list (token issuance) skip the check entirely.

use std::collections::HashSet;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::{self, Either, Ready};
use http::header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use http::HeaderMap;
use tonic::body::BoxBody;
use tower::{Layer, Service};

use crate::auth::token::{AgentClaims, TokenVerifier};
use crate::error::AuthError;
use crate::metrics::{CallOutcome, Metrics};

/// Legacy metadata key carrying a bare access token
pub const TOKEN_METADATA_KEY: &str = "token";

/// Checks call metadata against a [`TokenVerifier`].
#[derive(Clone)]
pub struct ChannelAuthorizer {
    verifier: Arc<dyn TokenVerifier>,
    public_routes: Arc<HashSet<String>>,
    metrics: Metrics,
}

impl ChannelAuthorizer {
    pub fn new(verifier: Arc<dyn TokenVerifier>, metrics: Metrics) -> Self {
        Self {
            verifier,
            public_routes: Arc::new(HashSet::new()),
            metrics,
        }
    }

    /// Exempt a full gRPC path (`/package.Service/Method`) from the token check.
    pub fn allow_route(mut self, path: impl Into<String>) -> Self {
        Arc::make_mut(&mut self.public_routes).insert(path.into());
        self
    }

    pub fn is_public_route(&self, path: &str) -> bool {
        self.public_routes.contains(path)
    }

    /// Verify the bearer token carried in call metadata.
    pub fn authorize(&self, metadata: &HeaderMap) -> Result<AgentClaims, AuthError> {
        let token = extract_token(metadata).ok_or(AuthError::MissingToken)?;
        self.verifier.verify(token)
    }
}

/// Find the access token: `authorization: Bearer <token>` first, then the bare
/// `token` key.
fn extract_token(metadata: &HeaderMap) -> Option<&str> {
    let bearer = metadata
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| {
            let (scheme, token) = value.split_once(' ')?;
            scheme.eq_ignore_ascii_case("bearer").then_some(token.trim())
        });

    bearer
        .or_else(|| {
            metadata
                .get(TOKEN_METADATA_KEY)
                .and_then(|value| value.to_str().ok())
                .map(str::trim)
        })
        .filter(|token| !token.is_empty())
}

/// Trailers-only gRPC response carrying the rejection status.
fn rejection(err: AuthError) -> http::Response<BoxBody> {
    let status = tonic::Status::from(err);
    let mut response = http::Response::new(tonic::body::empty_body());
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/grpc"));
    if let Err(e) = status.add_header(response.headers_mut()) {
        tracing::warn!(error = %e, "Failed to encode gRPC status headers");
    }
    response
}

impl<S> Layer<S> for ChannelAuthorizer {
    type Service = AuthorizedService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AuthorizedService {
            inner,
            authorizer: self.clone(),
        }
    }
}

/// Service produced by [`ChannelAuthorizer`].
#[derive(Clone)]
pub struct AuthorizedService<S> {
    inner: S,
    authorizer: ChannelAuthorizer,
}

impl<S, ReqBody> Service<http::Request<ReqBody>> for AuthorizedService<S>
where
    S: Service<http::Request<ReqBody>, Response = http::Response<BoxBody>>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = Either<Ready<Result<Self::Response, Self::Error>>, S::Future>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut request: http::Request<ReqBody>) -> Self::Future {
        if self.authorizer.is_public_route(request.uri().path()) {
            return Either::Right(self.inner.call(request));
        }

        match self.authorizer.authorize(request.headers()) {
            Ok(claims) => {
                tracing::debug!(agent = %claims.sub, path = %request.uri().path(), "Agent call authorized");
                self.authorizer.metrics.record_agent_call(CallOutcome::Authorized);
                request.extensions_mut().insert(claims);
                Either::Right(self.inner.call(request))
            }
            Err(err) => {
                tracing::debug!(error = %err, path = %request.uri().path(), "Agent call rejected");
                self.authorizer.metrics.record_agent_call(CallOutcome::Rejected);
                Either::Left(future::ready(Ok(rejection(err))))
            }
        }
    }
}
