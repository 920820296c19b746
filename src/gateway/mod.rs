// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! HTTP / WebSocket front of the fanout service.
//!
//! # Routes
//!
//! | Route | Response |
//! |-------|----------|
//! | `GET /` | `200 Server running.` |
//! | `GET /health` | JSON snapshot of lifecycle state, hub and bridge |
//! | `GET /updates/ws/docId/{doc_id}/token/{token}` | authenticate, then upgrade |
//!
//! # Startup and shutdown order
//!
//! ```text
//! start:    connect log producer (unbounded retry)
//!           → ensure topic (warn on failure)
//!           → start bridge (or NoOpBridge)
//!           → spawn hub
//!           → bind + serve                               [Running]
//!
//! shutdown: hub.shutdown (close 1001 to every client)    [ShuttingDown]
//!           → stop accepting upgrades
//!           → stop bridge
//!           → drain producer within shutdown_grace       [Stopped]
//! ```

mod socket;

use crate::auth::{Authenticator, HttpAuthenticator};
use crate::bridge::{Bridge, BridgeInbound, NoOpBridge, RedisBridge};
use crate::broker::{connect_with_retry, ensure_topic};
use crate::config::{GatewayConfig, DEFAULT_GROUP};
use crate::envelope::InstanceId;
use crate::error::{FanoutError, Result};
use crate::hub::{Hub, HubHandle};
use crate::ingest::{EditLog, EditProducer};
use crate::lifecycle::{wait_for_shutdown, Lifecycle, ServiceState};
use crate::resilience::RetryConfig;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

/// Shared state of every route.
#[derive(Clone)]
pub struct AppState {
    pub hub: HubHandle,
    pub auth: Arc<dyn Authenticator>,
    pub edits: Arc<dyn EditLog>,
    pub bridge: Arc<dyn Bridge>,
    pub state_rx: watch::Receiver<ServiceState>,
}

/// Body of `GET /health`.
#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub state: String,
    pub instance_id: String,
    pub rooms: usize,
    pub connections: usize,
    pub bridge_connected: bool,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route(
            "/updates/ws/docId/{doc_id}/token/{token}",
            get(socket::upgrade),
        )
        .with_state(state)
}

async fn root() -> &'static str {
    "Server running."
}

async fn health(State(state): State<AppState>) -> Response {
    let service_state = *state.state_rx.borrow();
    match state.hub.stats().await {
        Ok(stats) => {
            let status = if service_state == ServiceState::Running {
                StatusCode::OK
            } else {
                StatusCode::SERVICE_UNAVAILABLE
            };
            let report = HealthReport {
                state: service_state.to_string(),
                instance_id: state.hub.instance_id().to_string(),
                rooms: stats.rooms,
                connections: stats.connections,
                bridge_connected: state.bridge.is_connected(),
            };
            (status, Json(report)).into_response()
        }
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "state": service_state.to_string(), "error": e.to_string() })),
        )
            .into_response(),
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// FanoutGateway
// ═══════════════════════════════════════════════════════════════════════════════

/// The gateway process: log producer, bridge, hub and HTTP server.
pub struct FanoutGateway {
    config: GatewayConfig,
    instance_id: InstanceId,
    lifecycle: Arc<Lifecycle>,
}

impl FanoutGateway {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            config,
            instance_id: InstanceId::generate(),
            lifecycle: Arc::new(Lifecycle::new("gateway")),
        }
    }

    pub fn instance_id(&self) -> InstanceId {
        self.instance_id
    }

    pub fn state(&self) -> ServiceState {
        self.lifecycle.state()
    }

    pub fn state_receiver(&self) -> watch::Receiver<ServiceState> {
        self.lifecycle.subscribe()
    }

    /// Run until `shutdown_rx` fires. `Ok(())` on a clean shutdown.
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) -> Result<()> {
        self.lifecycle.set(ServiceState::Connecting);
        info!(instance_id = %self.instance_id, "Starting fanout gateway");

        let log = &self.config.log;
        let connect_retry = RetryConfig::fixed(
            usize::MAX,
            log.connect_interval_duration(),
            RetryConfig::broker_connect().connection_timeout,
        );
        let conn = match connect_with_retry("producer", &log.redis_url, &connect_retry, &mut shutdown_rx).await {
            Ok(conn) => conn,
            Err(FanoutError::ShuttingDown) => {
                self.lifecycle.set(ServiceState::Stopped);
                return Ok(());
            }
            Err(e) => {
                self.lifecycle.set(ServiceState::Failed);
                return Err(e);
            }
        };

        let mut setup = conn.clone();
        if let Err(e) = ensure_topic(&mut setup, &log.topic, DEFAULT_GROUP, log.partitions).await {
            warn!(topic = %log.topic, error = %e, "Failed to ensure topic, continuing");
        }
        let producer = Arc::new(EditProducer::spawn(conn, log, RetryConfig::producer_send()));

        let (remote_tx, remote_rx) = mpsc::channel(self.config.hub.remote_queue_capacity.max(1));
        let (bridge, redis_bridge): (Arc<dyn Bridge>, Option<Arc<RedisBridge>>) = if self.config.bridge.enabled {
            let inbound = BridgeInbound::new(self.instance_id, remote_tx);
            match RedisBridge::start(self.config.bridge.clone(), inbound) {
                Ok(bridge) => {
                    let bridge = Arc::new(bridge);
                    (bridge.clone(), Some(bridge))
                }
                Err(e) => {
                    self.lifecycle.set(ServiceState::Failed);
                    return Err(e);
                }
            }
        } else {
            info!("Bridge disabled, running single-instance fanout");
            drop(remote_tx);
            (Arc::new(NoOpBridge), None)
        };

        let (hub, hub_task) = Hub::spawn(&self.config.hub, self.instance_id, bridge.clone(), remote_rx);

        let auth = match HttpAuthenticator::new(&self.config.auth) {
            Ok(auth) => Arc::new(auth),
            Err(e) => {
                self.lifecycle.set(ServiceState::Failed);
                return Err(e);
            }
        };

        let listener = match TcpListener::bind(&self.config.bind_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                error!(bind_addr = %self.config.bind_addr, error = %e, "Failed to bind");
                self.lifecycle.set(ServiceState::Failed);
                return Err(FanoutError::Config(format!(
                    "Cannot bind {}: {}",
                    self.config.bind_addr, e
                )));
            }
        };

        let state = AppState {
            hub: hub.clone(),
            auth,
            edits: producer.clone(),
            bridge,
            state_rx: self.lifecycle.subscribe(),
        };

        self.lifecycle.set(ServiceState::Running);
        info!(bind_addr = %self.config.bind_addr, "Gateway listening");

        let lifecycle = self.lifecycle.clone();
        let shutdown_hub = hub.clone();
        let signal = async move {
            wait_for_shutdown(&mut shutdown_rx).await;
            lifecycle.set(ServiceState::ShuttingDown);
            if let Err(e) = shutdown_hub.shutdown().await {
                warn!(error = %e, "Hub already stopped");
            }
        };
        let served = serve(listener, router(state), signal).await;

        let grace = self.config.shutdown_grace_duration();
        self.stop(hub, hub_task, redis_bridge, &producer, grace).await;

        match served {
            Ok(()) => {
                self.lifecycle.set(ServiceState::Stopped);
                Ok(())
            }
            Err(e) => {
                self.lifecycle.set(ServiceState::Failed);
                Err(e)
            }
        }
    }

    async fn stop(
        &self,
        hub: HubHandle,
        hub_task: tokio::task::JoinHandle<()>,
        bridge: Option<Arc<RedisBridge>>,
        producer: &EditProducer,
        grace: Duration,
    ) {
        // Idempotent; covers the case where serve returned on its own
        let _ = hub.shutdown().await;
        drop(hub);

        if let Some(bridge) = bridge {
            bridge.stop(grace).await;
        }
        producer.drain(grace).await;

        // The hub task exits once every handle is gone
        if tokio::time::timeout(grace, hub_task).await.is_err() {
            warn!("Hub did not stop within grace period");
        }
        info!(instance_id = %self.instance_id, "Fanout gateway stopped");
    }
}

/// Serve `app` on `listener` until `signal` resolves.
pub async fn serve<F>(listener: TcpListener, app: Router, signal: F) -> Result<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, app)
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| FanoutError::Internal(format!("Server error: {}", e)))
}
