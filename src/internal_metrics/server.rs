//! HTTP exposition of the Prometheus registry.
//!
//! `GET /metrics` renders the current snapshot of every series recorded
//! through the worker's [`Metrics`](super::Metrics) handle. The listener is
//! bound by [`MetricsBuilder`](super::MetricsBuilder) so a bind failure is
//! reported before any worker starts.

use axum::{routing::get, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use std::future::Future;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

pub struct MetricsServer {
    listener: TcpListener,
    router: Router,
    token: CancellationToken,
}

impl MetricsServer {
    /// Prepares the `/metrics` route on an already bound `listener`. Nothing
    /// is served until [`run`](Self::run) is awaited.
    pub fn new(listener: TcpListener, handle: PrometheusHandle, token: CancellationToken) -> Self {
        let router = Router::new().route("/metrics", get(move || std::future::ready(handle.render())));
        Self {
            listener,
            router,
            token,
        }
    }

    /// Serves scrapes until the token is cancelled.
    pub fn run(self) -> impl Future<Output = ()> {
        let Self {
            listener,
            router,
            token,
        } = self;

        async move {
            let shutdown = async move { token.cancelled().await };
            if let Err(e) = axum::serve(listener, router).with_graceful_shutdown(shutdown).await {
                error!(error = %e, "Metrics endpoint stopped with an error");
            }
            debug!("Metrics endpoint closed.");
        }
    }
}
