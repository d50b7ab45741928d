//! Read-only HTTP status endpoint.
//!
//! Serves the coordinator's latest buffer snapshot as JSON. The coordinator
//! publishes on a `watch` channel after every event, so the handler never
//! touches the buffer itself.

use axum::{extract::State, routing::get, Json, Router};
use failmail_common::{internal, Signal};
use failmail_summary::BufferStats;
use thiserror::Error;
use tokio::{net::TcpListener, sync::broadcast, sync::watch};

#[derive(Debug, Error)]
pub enum StatusError {
    #[error("failed to bind status endpoint to {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("status server error: {0}")]
    Serve(#[from] std::io::Error),
}

pub struct StatusServer {
    listener: TcpListener,
    router: Router,
}

impl StatusServer {
    /// Bind the status endpoint. Fatal at startup when the address is taken.
    ///
    /// # Errors
    /// If binding fails.
    pub async fn bind(
        address: &str,
        stats: watch::Receiver<BufferStats>,
    ) -> Result<Self, StatusError> {
        let listener = TcpListener::bind(address)
            .await
            .map_err(|source| StatusError::Bind {
                address: address.to_string(),
                source,
            })?;

        let router = Router::new()
            .route("/", get(stats_handler))
            .with_state(stats);

        Ok(Self { listener, router })
    }

    /// Serve until a shutdown signal arrives.
    ///
    /// # Errors
    /// If the server fails while running.
    pub async fn serve(
        self,
        mut shutdown: broadcast::Receiver<Signal>,
    ) -> Result<(), StatusError> {
        internal!(
            "status endpoint on {}",
            self.listener
                .local_addr()
                .map_or_else(|_| "<unknown>".to_string(), |addr| addr.to_string())
        );

        axum::serve(self.listener, self.router)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
            })
            .await?;

        Ok(())
    }

    /// The bound address; useful when binding to port 0.
    ///
    /// # Errors
    /// If the socket is gone.
    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }
}

async fn stats_handler(State(stats): State<watch::Receiver<BufferStats>>) -> Json<BufferStats> {
    Json(stats.borrow().clone())
}
