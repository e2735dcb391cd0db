//! Prometheus metrics for leasehold.
//!
//! This module provides:
//! - Metrics registry with counters and gauges for managers and commands
//! - HTTP server to expose metrics at `/metrics` and liveness at `/health`

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{
    CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

/// Tick duration histogram buckets (in seconds).
const TICK_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0];

/// Prometheus metrics for state machine managers and command dispatch.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    /// Manager ticks.
    pub ticks_total: CounterVec,
    /// Tick duration by manager.
    pub tick_duration: HistogramVec,
    /// Entities advanced by manager and state.
    pub entities_processed_total: CounterVec,
    /// Failed entity transitions by manager and reason.
    pub processing_failures_total: CounterVec,
    /// Commands by type and outcome.
    pub commands_total: CounterVec,
    /// Current idle wait per manager, in seconds.
    pub wait_seconds: GaugeVec,
    /// Running managers (0 or 1 per manager).
    pub managers_running: GaugeVec,
}

impl Metrics {
    /// Creates a new Metrics instance with all metrics registered.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let ticks_total = CounterVec::new(
            Opts::new("leasehold_ticks_total", "Total manager ticks"),
            &["manager"],
        )?;
        registry.register(Box::new(ticks_total.clone()))?;

        let tick_duration = HistogramVec::new(
            HistogramOpts::new(
                "leasehold_tick_duration_seconds",
                "Tick duration in seconds by manager",
            )
            .buckets(TICK_BUCKETS.to_vec()),
            &["manager"],
        )?;
        registry.register(Box::new(tick_duration.clone()))?;

        let entities_processed_total = CounterVec::new(
            Opts::new(
                "leasehold_entities_processed_total",
                "Entities advanced by manager and state",
            ),
            &["manager", "state"],
        )?;
        registry.register(Box::new(entities_processed_total.clone()))?;

        let processing_failures_total = CounterVec::new(
            Opts::new(
                "leasehold_processing_failures_total",
                "Failed transitions by manager and reason",
            ),
            &["manager", "reason"],
        )?;
        registry.register(Box::new(processing_failures_total.clone()))?;

        let commands_total = CounterVec::new(
            Opts::new("leasehold_commands_total", "Commands by type and outcome"),
            &["command", "outcome"],
        )?;
        registry.register(Box::new(commands_total.clone()))?;

        let wait_seconds = GaugeVec::new(
            Opts::new(
                "leasehold_wait_seconds",
                "Current idle wait between ticks by manager",
            ),
            &["manager"],
        )?;
        registry.register(Box::new(wait_seconds.clone()))?;

        let managers_running = GaugeVec::new(
            Opts::new("leasehold_managers_running", "Whether a manager loop is running"),
            &["manager"],
        )?;
        registry.register(Box::new(managers_running.clone()))?;

        Ok(Self {
            registry,
            ticks_total,
            tick_duration,
            entities_processed_total,
            processing_failures_total,
            commands_total,
            wait_seconds,
            managers_running,
        })
    }

    /// Encodes all metrics in Prometheus text format.
    pub fn encode(&self) -> Result<Vec<u8>, prometheus::Error> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(buffer)
    }

    /// Returns a reference to the registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

/// Runs the HTTP metrics server until `shutdown` fires.
pub async fn run_metrics_server(
    addr: SocketAddr,
    metrics: Arc<Metrics>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("Metrics server listening on http://{}/metrics", addr);

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _)) => {
                        let metrics = metrics.clone();
                        tokio::spawn(async move {
                            let io = TokioIo::new(stream);
                            let service = service_fn(move |req| {
                                let metrics = metrics.clone();
                                async move { handle_request(req, metrics).await }
                            });
                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                tracing::debug!("Metrics connection error: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!("Metrics server accept error: {}", e);
                    }
                }
            }
            _ = shutdown.recv() => {
                tracing::info!("Metrics server shutting down");
                break;
            }
        }
    }

    Ok(())
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    Ok(route(req.uri().path(), &metrics))
}

fn route(path: &str, metrics: &Metrics) -> Response<Full<Bytes>> {
    match path {
        "/metrics" => match metrics.encode() {
            Ok(body) => {
                let mut response = text(StatusCode::OK, body);
                response.headers_mut().insert(
                    CONTENT_TYPE,
                    HeaderValue::from_static("text/plain; version=0.0.4; charset=utf-8"),
                );
                response
            }
            Err(e) => text(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        },
        "/health" | "/healthz" => text(StatusCode::OK, "OK"),
        _ => text(StatusCode::NOT_FOUND, "Not Found"),
    }
}

fn text(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
}
