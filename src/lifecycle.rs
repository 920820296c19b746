//! Service lifecycle shared by the gateway and the edit consumer.
//!
//! # State Transitions
//!
//! ```text
//!                  start()
//! Created ───────────────────→ Connecting
//!    │                              │
//!    │ (shutdown before start)      │ (broker reachable, group joined)
//!    ↓                              ↓
//! Stopped                       Running
//!    ↑                              │
//!    │                    shutdown()│
//!    │                              ↓
//!    └────────────────── ShuttingDown
//!
//! Connecting ── (subscribe ceiling / fatal startup error) ──→ Failed
//! ```
//!
//! - **Connecting**: blocked in the broker connect loop (unbounded) or the
//!   group join loop (bounded).
//! - **ShuttingDown**: no new registrations or polls; in-flight work draining.
//! - **Failed**: unrecoverable startup error; the process should exit non-zero.

use crate::metrics;
use tokio::sync::watch;
use tracing::info;

/// State of a long-running service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Created,
    Connecting,
    Running,
    ShuttingDown,
    Stopped,
    Failed,
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceState::Created => write!(f, "Created"),
            ServiceState::Connecting => write!(f, "Connecting"),
            ServiceState::Running => write!(f, "Running"),
            ServiceState::ShuttingDown => write!(f, "ShuttingDown"),
            ServiceState::Stopped => write!(f, "Stopped"),
            ServiceState::Failed => write!(f, "Failed"),
        }
    }
}

/// Broadcasts state changes and mirrors them to the state gauge.
#[derive(Debug)]
pub struct Lifecycle {
    component: &'static str,
    state_tx: watch::Sender<ServiceState>,
}

impl Lifecycle {
    pub fn new(component: &'static str) -> Self {
        let (state_tx, _) = watch::channel(ServiceState::Created);
        metrics::set_service_state(component, "Created");
        Self {
            component,
            state_tx,
        }
    }

    pub fn state(&self) -> ServiceState {
        *self.state_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ServiceState> {
        self.state_tx.subscribe()
    }

    pub fn set(&self, state: ServiceState) {
        self.state_tx.send_replace(state);
        metrics::set_service_state(self.component, &state.to_string());
        info!(component = self.component, state = %state, "Service state changed");
    }
}

/// Cooperative shutdown flag shared by every task of a process.
///
/// Tasks hold a `watch::Receiver<bool>` and stop once it reads `true`.
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: watch::Sender<bool>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Wait until `shutdown_rx` reads `true` (or its sender is gone).
pub async fn wait_for_shutdown(shutdown_rx: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown_rx.borrow_and_update() {
            return;
        }
        if shutdown_rx.changed().await.is_err() {
            return;
        }
    }
}

/// Resolve on SIGINT or SIGTERM.
pub async fn termination_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
