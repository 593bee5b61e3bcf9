//! End-to-end tests against real listeners on 127.0.0.1:0.
//!
//! Run with: cargo test --test transport_tests

use std::net::SocketAddr;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tonic::metadata::{Ascii, MetadataValue};
use tonic::transport::Channel;

use runway::grpc::proto::agent_auth_client::AgentAuthClient;
use runway::grpc::proto::agent_client::AgentClient;
use runway::grpc::proto::{AuthRequest, Empty, ReportHealthRequest, WatchRequest};
use runway::http::{self, ListenerRole, ListenerSpec, TlsMode};
use runway::{AppConfig, BoundServer, ConfigError, Server, ServerError, ServerIdentity};

const AGENT_SECRET: &str = "agent-pool-secret";

fn identity(server_extra: &str, tls: &str) -> ServerIdentity {
    let toml = format!(
        r#"
        [server]
        host = "https://ci.example.com"
        addr = "127.0.0.1:0"
        tls_addr = "127.0.0.1:0"
        {server_extra}

        [tls]
        {tls}

        [grpc]
        addr = "127.0.0.1:0"
        secret = "signing-secret"
        agent_secret = "{AGENT_SECRET}"
        "#
    );
    AppConfig::parse(&toml).unwrap().identity().unwrap()
}

fn mounted_app() -> Router {
    Router::new().route("/", get(|| async { "mounted handler" }))
}

/// A started server, stopped when the test cancels `shutdown`.
struct Running {
    shutdown: CancellationToken,
    task: JoinHandle<Result<(), ServerError>>,
}

impl Running {
    fn start(bound: BoundServer) -> Self {
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(bound.serve(shutdown.clone()));
        Self { shutdown, task }
    }

    async fn stop(self) -> Result<(), ServerError> {
        self.shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(10), self.task)
            .await
            .expect("server did not stop")
            .expect("server task panicked")
    }
}

fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_plain_topology_serves_mounted_handler() {
    let bound = Server::new(identity("", ""), mounted_app())
        .unwrap()
        .bind()
        .unwrap();
    let web = bound.web_addr().unwrap();
    assert!(bound.redirect_addr().is_none());
    let running = Running::start(bound);

    let response = http_client()
        .get(format!("http://{}/", web))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert!(response.headers().contains_key("x-request-id"));
    assert!(!response.headers().contains_key("strict-transport-security"));
    assert_eq!(response.text().await.unwrap(), "mounted handler");

    running.stop().await.unwrap();
}

#[tokio::test]
async fn test_root_path_is_applied_to_mounted_handler() {
    let bound = Server::new(identity(r#"root_path = "/ci""#, ""), mounted_app())
        .unwrap()
        .bind()
        .unwrap();
    let web = bound.web_addr().unwrap();
    let running = Running::start(bound);

    let client = http_client();
    let response = client.get(format!("http://{}/ci", web)).send().await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);

    let response = client.get(format!("http://{}/", web)).send().await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);

    running.stop().await.unwrap();
}

#[tokio::test]
async fn test_redirect_listener_sends_permanent_https_redirect() {
    let identity = identity("", "");
    let listener = http::bind("redirect", "127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = listener.local_addr().unwrap();
    let spec = ListenerSpec {
        role: ListenerRole::Redirect,
        addr,
        mode: TlsMode::Plain,
    };
    let shutdown = CancellationToken::new();
    let task = {
        let shutdown = shutdown.clone();
        let public = identity.public.clone();
        tokio::spawn(async move {
            http::serve_listener(listener, &spec, Router::new(), &public, shutdown).await
        })
    };

    let response = http_client()
        .get(format!("http://{}/repos/7/builds?branch=main", addr))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::MOVED_PERMANENTLY);
    assert_eq!(
        response.headers()["location"],
        "https://ci.example.com/repos/7/builds?branch=main"
    );
    assert_eq!(
        response.headers()["strict-transport-security"],
        "max-age=31536000"
    );

    shutdown.cancel();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_tls_failure_stops_every_listener() {
    let dir = tempfile::tempdir().unwrap();
    let tls = format!(
        "cert = \"{}\"\nkey = \"{}\"",
        dir.path().join("cert.pem").display(),
        dir.path().join("key.pem").display()
    );
    let bound = Server::new(identity("", &tls), mounted_app())
        .unwrap()
        .bind()
        .unwrap();
    assert!(bound.redirect_addr().is_some());

    let result = tokio::time::timeout(
        Duration::from_secs(10),
        bound.serve(CancellationToken::new()),
    )
    .await
    .expect("server kept running after a TLS failure");

    assert!(matches!(result, Err(ServerError::Tls(_))), "{:?}", result);
}

#[tokio::test]
async fn test_static_tls_topology_serves_https_and_redirects() {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let cert = dir.path().join("cert.pem");
    let key = dir.path().join("key.pem");
    std::fs::write(&cert, certified.cert.pem()).unwrap();
    std::fs::write(&key, certified.key_pair.serialize_pem()).unwrap();

    let tls = format!("cert = \"{}\"\nkey = \"{}\"", cert.display(), key.display());
    let bound = Server::new(identity("", &tls), mounted_app())
        .unwrap()
        .bind()
        .unwrap();
    let web = bound.web_addr().unwrap();
    let redirect = bound.redirect_addr().unwrap();
    let running = Running::start(bound);

    let https = reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .resolve("localhost", web)
        .build()
        .unwrap();
    let response = https
        .get(format!("https://localhost:{}/", web.port()))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert!(response.headers().contains_key("x-request-id"));
    assert_eq!(response.text().await.unwrap(), "mounted handler");

    let response = http_client()
        .get(format!("http://{}/builds", redirect))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::MOVED_PERMANENTLY);
    assert_eq!(response.headers()["location"], "https://ci.example.com/builds");

    running.stop().await.unwrap();
}

#[test]
fn test_host_without_scheme_fails_before_binding() {
    let config = AppConfig::parse(
        r#"
        [server]
        host = "ci.example.com"

        [grpc]
        secret = "s"
        agent_secret = "a"
        "#,
    )
    .unwrap();

    assert!(matches!(config.identity(), Err(ConfigError::Validation(_))));
}

async fn channel(addr: SocketAddr) -> Channel {
    Channel::from_shared(format!("http://{}", addr))
        .unwrap()
        .connect()
        .await
        .unwrap()
}

#[tokio::test]
async fn test_agent_obtains_token_and_calls_channel() {
    let bound = Server::new(identity(r#"metrics_addr = "127.0.0.1:0""#, ""), mounted_app())
        .unwrap()
        .bind()
        .unwrap();
    let metrics = bound.metrics_addr().unwrap();
    let grpc = bound.grpc_addr().unwrap();
    let running = Running::start(bound);
    let channel = channel(grpc).await;
    let mut auth = AgentAuthClient::new(channel.clone());

    let issued = auth
        .auth(AuthRequest {
            agent_token: AGENT_SECRET.to_string(),
            agent_id: "agent-1".to_string(),
        })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(issued.agent_id, "agent-1");
    assert!(!issued.access_token.is_empty());

    let bearer: MetadataValue<Ascii> = format!("Bearer {}", issued.access_token).parse().unwrap();
    let mut agent = AgentClient::with_interceptor(channel, move |mut request: tonic::Request<()>| {
        request
            .metadata_mut()
            .insert("authorization", bearer.clone());
        Ok::<_, tonic::Status>(request)
    });

    let version = agent.version(Empty {}).await.unwrap().into_inner();
    assert_eq!(version.server_version, env!("CARGO_PKG_VERSION"));

    agent
        .report_health(ReportHealthRequest {
            status: "healthy".to_string(),
        })
        .await
        .unwrap();

    let mut events = agent
        .watch(WatchRequest { interval_seconds: 1 })
        .await
        .unwrap()
        .into_inner();
    let first = events.message().await.unwrap().unwrap();
    assert_eq!(first.agent_id, "agent-1");

    let text = http_client()
        .get(format!("http://{}/metrics", metrics))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(text.contains("runway_agent_tokens_issued_total 1"));
    assert!(text.contains(r#"runway_agent_calls_total{outcome="authorized"} 3"#));

    drop(events);
    running.stop().await.unwrap();
}

#[tokio::test]
async fn test_channel_rejects_missing_and_forged_tokens() {
    let bound = Server::new(identity("", ""), mounted_app())
        .unwrap()
        .bind()
        .unwrap();
    let grpc = bound.grpc_addr().unwrap();
    let running = Running::start(bound);
    let channel = channel(grpc).await;
    let mut auth = AgentAuthClient::new(channel.clone());

    let mut agent = AgentClient::new(channel.clone());
    let status = agent.version(Empty {}).await.unwrap_err();
    assert_eq!(status.code(), tonic::Code::Unauthenticated);
    assert_eq!(status.message(), "missing token");

    let status = agent
        .watch(WatchRequest { interval_seconds: 1 })
        .await
        .unwrap_err();
    assert_eq!(status.code(), tonic::Code::Unauthenticated);
    assert_eq!(status.message(), "missing token");

    let mut forged = AgentClient::with_interceptor(channel, |mut request: tonic::Request<()>| {
        request
            .metadata_mut()
            .insert("token", MetadataValue::from_static("not.a.token"));
        Ok::<_, tonic::Status>(request)
    });
    let status = forged.version(Empty {}).await.unwrap_err();
    assert_eq!(status.code(), tonic::Code::Unauthenticated);
    assert_eq!(status.message(), "invalid token");

    let status = auth
        .auth(AuthRequest {
            agent_token: "wrong".to_string(),
            agent_id: "agent-1".to_string(),
        })
        .await
        .unwrap_err();
    assert_eq!(status.code(), tonic::Code::Unauthenticated);

    running.stop().await.unwrap();
}
