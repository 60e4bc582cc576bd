//! API server: HTTP routes plus the Prometheus exporter.

use crate::rest::{self, AppState};
use axum::routing::{get, post};
use axum::Router;
use funnel_core::config::AppConfig;
use std::future::Future;
use std::net::SocketAddr;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

pub struct ApiServer {
    config: AppConfig,
    state: AppState,
}

impl ApiServer {
    pub fn new(config: AppConfig, state: AppState) -> Self {
        Self { config, state }
    }

    /// Build the router with all routes and middleware attached.
    pub fn router(state: AppState) -> Router {
        Router::new()
            // Funnel endpoints
            .route("/v1/campaign/decide", post(rest::decide_campaign))
            .route("/v1/checkout", post(rest::checkout))
            .route("/v1/upsell/:n", post(rest::upsell))
            .route(
                "/v1/transactions/:id/steps/:step/actions",
                post(rest::dispatch_actions),
            )
            .route("/v1/transactions/:id", get(rest::get_transaction))
            .route("/v1/sites/:site_id/config-keys", get(rest::site_config_keys))
            // Operational endpoints
            .route("/health", get(rest::health_check))
            .route("/ready", get(rest::readiness))
            .route("/live", get(rest::liveness))
            // Middleware
            .layer(CompressionLayer::new())
            .layer(CorsLayer::permissive())
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Serve HTTP until `shutdown` resolves.
    pub async fn start_http<F>(&self, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let app = Self::router(self.state.clone());
        let addr = SocketAddr::new(self.config.api.host.parse()?, self.config.api.http_port);

        info!(addr = %addr, "Starting HTTP server");

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await?;

        info!("HTTP server stopped");
        Ok(())
    }

    /// Start the metrics server on a separate port.
    pub fn start_metrics(&self) -> anyhow::Result<()> {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(SocketAddr::new(
                self.config.api.host.parse()?,
                self.config.metrics.port,
            ))
            .install()?;

        info!(port = self.config.metrics.port, "Metrics exporter started");
        Ok(())
    }
}
