//! HTTP server implementation.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tokio::net::TcpListener;
use tracing::{error, info};

use super::identity::IdentityPolicy;
use super::middleware::{admission_gate, Gate};
use crate::error::{Result, TurnstileError};
use crate::ratelimit::RateLimiterBackend;

/// Latency of the built-in downstream handler.
const DOWNSTREAM_DELAY: Duration = Duration::from_millis(10);

/// HTTP server placing the admission gate in front of a downstream router.
pub struct HttpServer<R: RateLimiterBackend + 'static> {
    /// Address to bind to
    addr: SocketAddr,
    /// Gate state shared by all requests
    gate: Gate<R>,
    /// Routes reached by admitted requests
    downstream: Router,
}

impl<R: RateLimiterBackend + 'static> HttpServer<R> {
    /// Create a server that forwards admitted requests to the built-in
    /// downstream handler.
    pub fn new(addr: SocketAddr, rate_limiter: Arc<R>, policy: IdentityPolicy) -> Self {
        Self {
            addr,
            gate: Gate::new(rate_limiter, policy),
            downstream: default_downstream(),
        }
    }

    /// Replace the downstream routes.
    pub fn with_downstream(mut self, downstream: Router) -> Self {
        self.downstream = downstream;
        self
    }

    /// The complete router: downstream routes behind the gate.
    pub fn router(&self) -> Router {
        gated(self.downstream.clone(), self.gate.clone())
    }

    /// Start the HTTP server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await?;
        let policy = self.gate.policy();

        info!(
            addr = %self.addr,
            address_only = policy.address_only,
            token_only = policy.token_only,
            "Starting HTTP server with graceful shutdown"
        );

        axum::serve(
            listener,
            self.router()
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "HTTP server failed");
            TurnstileError::Server(e.to_string())
        })
    }
}

/// Wrap every route of `downstream`, fallback included, in the gate.
pub fn gated<R: RateLimiterBackend + 'static>(downstream: Router, gate: Gate<R>) -> Router {
    downstream.layer(axum::middleware::from_fn_with_state(gate, admission_gate::<R>))
}

/// Catch-all downstream answering "OK" to any method and path.
pub fn default_downstream() -> Router {
    Router::new().fallback(downstream_ok)
}

async fn downstream_ok() -> &'static str {
    tokio::time::sleep(DOWNSTREAM_DELAY).await;
    "OK"
}
