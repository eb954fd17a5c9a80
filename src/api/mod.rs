//! Public matchmaking API
//!
//! One endpoint, `GET /api/matchmaking/start`, answering with a
//! server-sent event stream that carries the pairing outcome.

pub mod handlers;

pub use handlers::{outcome_event, status_for, ApiState, USER_ID_HEADER};

use crate::pairing::PairingOrchestrator;
use anyhow::{Context, Result};
use axum::{routing::get, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Build the API router
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/matchmaking/start", get(handlers::start_matchmaking))
        .with_state(state)
}

/// Bound API listener, ready to serve
pub struct ApiServer {
    listener: TcpListener,
    state: ApiState,
}

impl ApiServer {
    /// Bind the API port. Requests in flight are cancelled through children
    /// of `shutdown`.
    pub async fn bind(
        addr: SocketAddr,
        orchestrator: Arc<PairingOrchestrator>,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind matchmaking API to {}", addr))?;

        Ok(Self {
            listener,
            state: ApiState {
                orchestrator,
                shutdown,
            },
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("Matchmaking API listener has no local address")
    }

    /// Serve until the shutdown token fires
    pub async fn serve(self) -> Result<()> {
        let addr = self.local_addr()?;
        let shutdown = self.state.shutdown.clone();
        info!("Matchmaking API listening on http://{}", addr);

        axum::serve(self.listener, router(self.state))
            .with_graceful_shutdown(async move {
                shutdown.cancelled().await;
                info!("Matchmaking API shutdown signal received");
            })
            .await
            .context("Matchmaking API server failed")?;

        info!("Matchmaking API stopped");
        Ok(())
    }
}
