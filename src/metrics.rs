//! Prometheus metrics and the standalone `/metrics` listener router.

use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

/// Outcome label for `runway_agent_calls_total`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Authorized,
    Rejected,
}

impl CallOutcome {
    fn as_str(self) -> &'static str {
        match self {
            CallOutcome::Authorized => "authorized",
            CallOutcome::Rejected => "rejected",
        }
    }
}

/// Server-wide metrics, cheap to clone (collectors are reference counted).
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    agent_calls: IntCounterVec,
    tokens_issued: IntCounter,
    supervised_tasks: IntGauge,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let agent_calls = IntCounterVec::new(
            Opts::new(
                "runway_agent_calls_total",
                "Agent channel calls by authorization outcome",
            ),
            &["outcome"],
        )?;
        let tokens_issued = IntCounter::new(
            "runway_agent_tokens_issued_total",
            "Access tokens issued to agents",
        )?;
        let supervised_tasks = IntGauge::new(
            "runway_supervised_tasks",
            "Supervised listener and background tasks currently running",
        )?;

        registry.register(Box::new(agent_calls.clone()))?;
        registry.register(Box::new(tokens_issued.clone()))?;
        registry.register(Box::new(supervised_tasks.clone()))?;

        Ok(Self {
            registry,
            agent_calls,
            tokens_issued,
            supervised_tasks,
        })
    }

    pub fn record_agent_call(&self, outcome: CallOutcome) {
        self.agent_calls.with_label_values(&[outcome.as_str()]).inc();
    }

    pub fn record_token_issued(&self) {
        self.tokens_issued.inc();
    }

    pub fn task_started(&self) {
        self.supervised_tasks.inc();
    }

    pub fn task_finished(&self) {
        self.supervised_tasks.dec();
    }

    /// Render all metrics in the Prometheus text exposition format.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }

    /// Router serving `GET /metrics`, mounted on its own listener.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/metrics", get(serve_metrics))
            .with_state(self.clone())
    }
}

async fn serve_metrics(State(metrics): State<Metrics>) -> Response {
    match metrics.render() {
        Ok(body) => ([(CONTENT_TYPE, TextEncoder::new().format_type().to_string())], body)
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
