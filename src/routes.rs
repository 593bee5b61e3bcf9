//! Default handler mounted on the web listener.
//!
//! The server mounts whatever [`Router`] it is given; this one only carries the
//! liveness and version endpoints, for deployments without a web frontend.

use axum::routing::get;
use axum::{middleware, Json, Router};
use serde::Serialize;

use crate::config::GRPC_PROTOCOL_VERSION;
use crate::middleware::request_id_layer;

/// Liveness probe: 200 OK whenever the process can answer HTTP.
pub async fn health() -> &'static str {
    "ok"
}

#[derive(Debug, Serialize)]
pub struct VersionInfo {
    pub version: &'static str,
    pub grpc_version: i32,
}

pub async fn version() -> Json<VersionInfo> {
    Json(VersionInfo {
        version: env!("CARGO_PKG_VERSION"),
        grpc_version: GRPC_PROTOCOL_VERSION,
    })
}

pub fn default_router() -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/version", get(version))
}

/// Mount `app` under `root_path` (empty means `/`) and wrap it in the
/// request-id span middleware.
pub fn mount(app: Router, root_path: &str) -> Router {
    let app = if root_path.is_empty() {
        app
    } else {
        Router::new().nest(root_path, app)
    };
    app.layer(middleware::from_fn(request_id_layer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    async fn get_status(app: Router, uri: &str) -> (StatusCode, String) {
        let response = app
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, String::from_utf8_lossy(&body).into_owned())
    }

    #[tokio::test]
    async fn test_health_at_root() {
        let (status, body) = get_status(mount(default_router(), ""), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ok");
    }

    #[tokio::test]
    async fn test_root_path_prefixes_routes() {
        let app = mount(default_router(), "/ci");

        let (status, _) = get_status(app.clone(), "/ci/health").await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = get_status(app, "/health").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_version_reports_protocol() {
        let (status, body) = get_status(mount(default_router(), ""), "/version").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains(&format!("\"grpc_version\":{}", GRPC_PROTOCOL_VERSION)));
    }
}
