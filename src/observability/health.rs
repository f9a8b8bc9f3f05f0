//! Health check HTTP server for container orchestration
//!
//! Readiness follows the relay's connection state; liveness only says the
//! process is serving requests.

use crate::observability::metrics::metrics;
use crate::transport::mqtt::ConnectionState;
use serde::Serialize;
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use warp::http::StatusCode;
use warp::Filter;

/// HTTP health check server
pub struct HealthServer {
    client_id: String,
    port: u16,
    state_rx: watch::Receiver<ConnectionState>,
}

impl HealthServer {
    pub fn new(client_id: String, port: u16, state_rx: watch::Receiver<ConnectionState>) -> Self {
        Self {
            client_id,
            port,
            state_rx,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// All endpoints as one warp filter
    pub fn routes(
        self: Arc<Self>,
    ) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
        let health_server = self.clone();
        let ready_server = self.clone();

        // GET /health - overall status with per-component checks
        let health_route = warp::path("health")
            .and(warp::path::end())
            .and(warp::get())
            .and_then(move || {
                let server = health_server.clone();
                async move {
                    let status = server.get_health_status();
                    let code = if status.status == "healthy" {
                        StatusCode::OK
                    } else {
                        StatusCode::SERVICE_UNAVAILABLE
                    };
                    Ok::<_, Infallible>(warp::reply::with_status(warp::reply::json(&status), code))
                }
            });

        // GET /metrics - metrics snapshot
        let metrics_route = warp::path("metrics")
            .and(warp::path::end())
            .and(warp::get())
            .map(|| warp::reply::json(&metrics().get_metrics()));

        // GET /ready - ready only while a session is established
        let ready_route = warp::path("ready")
            .and(warp::path::end())
            .and(warp::get())
            .map(move || {
                let state = ready_server.state_rx.borrow().clone();
                let ready = state == ConnectionState::Connected;
                let response = ReadinessResponse {
                    ready,
                    state: state.label(),
                    timestamp: chrono::Utc::now().to_rfc3339(),
                };
                let code = if ready {
                    StatusCode::OK
                } else {
                    StatusCode::SERVICE_UNAVAILABLE
                };
                warp::reply::with_status(warp::reply::json(&response), code)
            });

        // GET /live - liveness probe
        let live_route = warp::path("live")
            .and(warp::path::end())
            .and(warp::get())
            .map(|| {
                warp::reply::json(&LivenessResponse {
                    alive: true,
                    timestamp: chrono::Utc::now().to_rfc3339(),
                })
            });

        // GET / - endpoint listing
        let root_route = warp::path::end().and(warp::get()).map(|| {
            let endpoints: BTreeMap<&str, &str> = [
                ("/health", "Overall health status with detailed checks"),
                ("/metrics", "Relay and connection metrics"),
                ("/ready", "Readiness probe (connected to the broker)"),
                ("/live", "Liveness probe"),
            ]
            .into_iter()
            .collect();
            warp::reply::json(&endpoints)
        });

        health_route
            .or(metrics_route)
            .or(ready_route)
            .or(live_route)
            .or(root_route)
    }

    /// Bind the server; it runs until `shutdown` resolves
    pub fn bind(
        self: Arc<Self>,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> Result<(SocketAddr, impl Future<Output = ()>), warp::Error> {
        let addr: SocketAddr = ([0, 0, 0, 0], self.port).into();
        let routes = self.routes();
        let (bound, server) =
            warp::serve(routes).try_bind_with_graceful_shutdown(addr, shutdown)?;
        tracing::info!("Health server listening on {}", bound);
        Ok((bound, server))
    }

    fn get_health_status(&self) -> HealthStatus {
        let state = self.state_rx.borrow().clone();
        let snapshot = metrics().get_metrics();

        let mut checks = BTreeMap::new();
        checks.insert("mqtt", Self::check_connection(&state));
        checks.insert(
            "relay",
            HealthCheck {
                status: "healthy",
                message: Some(format!(
                    "{} received, {} published, {} decode failures, {} publish failures",
                    snapshot.relay.messages_received,
                    snapshot.relay.messages_published,
                    snapshot.relay.decode_failures,
                    snapshot.relay.publish_failures
                )),
            },
        );

        let status = if checks.values().all(|check| check.status == "healthy") {
            "healthy"
        } else {
            "degraded"
        };

        HealthStatus {
            status,
            client_id: self.client_id.clone(),
            state: state.to_string(),
            uptime_seconds: snapshot.lifecycle.uptime_seconds,
            timestamp: chrono::Utc::now().to_rfc3339(),
            checks,
        }
    }

    fn check_connection(state: &ConnectionState) -> HealthCheck {
        match state {
            ConnectionState::Connected => HealthCheck {
                status: "healthy",
                message: Some("MQTT session established".to_string()),
            },
            ConnectionState::PermanentlyDisconnected(reason) => HealthCheck {
                status: "unhealthy",
                message: Some(format!("Gave up reconnecting: {reason}")),
            },
            other => HealthCheck {
                status: "unhealthy",
                message: Some(format!("MQTT session not established: {other}")),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub status: &'static str,
    pub message: Option<String>,
}

#[derive(Debug, Serialize)]
struct HealthStatus {
    status: &'static str,
    client_id: String,
    state: String,
    uptime_seconds: u64,
    timestamp: String,
    checks: BTreeMap<&'static str, HealthCheck>,
}

#[derive(Debug, Serialize)]
struct ReadinessResponse {
    ready: bool,
    state: &'static str,
    timestamp: String,
}

#[derive(Debug, Serialize)]
struct LivenessResponse {
    alive: bool,
    timestamp: String,
}
