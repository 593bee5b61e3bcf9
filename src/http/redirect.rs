//! HTTP to HTTPS redirect listener.
//!
//! Every request, whatever its method or path, is answered with a 301 to the
//! same path and query on the configured public host. The request's own Host
//! header is never trusted.

use std::sync::Arc;

use axum::extract::State;
use axum::http::header::{HeaderValue, LOCATION, STRICT_TRANSPORT_SECURITY as HSTS};
use axum::http::{StatusCode, Uri};
use axum::response::IntoResponse;
use axum::Router;
use tower_http::set_header::SetResponseHeaderLayer;

use crate::config::{PublicUrl, STRICT_TRANSPORT_SECURITY};

/// Router that redirects everything to `https://<public authority>`.
pub fn router(public: &PublicUrl) -> Router {
    let authority: Arc<str> = Arc::from(public.authority.as_str());
    Router::new()
        .fallback(redirect_to_https)
        .with_state(authority)
        .layer(SetResponseHeaderLayer::overriding(
            HSTS,
            HeaderValue::from_static(STRICT_TRANSPORT_SECURITY),
        ))
}

async fn redirect_to_https(State(authority): State<Arc<str>>, uri: Uri) -> impl IntoResponse {
    let location = https_location(&authority, &uri);
    tracing::debug!(from = %uri, to = %location, "Redirecting HTTP to HTTPS");
    (StatusCode::MOVED_PERMANENTLY, [(LOCATION, location)])
}

fn https_location(authority: &str, uri: &Uri) -> String {
    format!(
        "https://{}{}",
        authority,
        uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/")
    )
}
