//! Server crate provides the HTTP API of the checkout backend.
//!
//! Routes:
//! - `POST /api/checkout` runs a full checkout
//! - `GET /api/delivery-fee?postcode=` quotes a delivery fee
//! - `POST /api/coupons/validate` previews a coupon without redeeming it
//! - `GET /api/orders/{payment_reference}` looks a paid order up, without
//!   the customer's contact details
//! - `GET /health` and `GET /metrics`

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{MatchedPath, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use model::{CheckoutRequest, OrderView};
use rust_decimal::Decimal;
use serde::Deserialize;
use service::CheckoutService;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::{error, info, warn};

mod error;
mod metrics;

pub use error::{ApiError, ErrorBody};
use metrics::Metrics;

/// Server represents the HTTP front of the checkout service.
pub struct Server {
    checkout: Arc<dyn CheckoutService>,
    port: u16,
    metrics: Arc<Metrics>,
}

/// Application state shared between request handlers
#[derive(Clone)]
struct AppState {
    checkout: Arc<dyn CheckoutService>,
    metrics: Arc<Metrics>,
}

#[derive(Debug, Deserialize)]
struct DeliveryFeeQuery {
    postcode: String,
}

#[derive(Debug, Deserialize)]
struct CouponPreviewRequest {
    code: String,
    subtotal: Decimal,
    email: String,
}

impl Server {
    /// Creates a new Server instance listening on `port`.
    pub fn new(port: u16, checkout: Arc<dyn CheckoutService>) -> Result<Self> {
        info!("Initializing HTTP server on port {}", port);

        Ok(Self {
            checkout,
            port,
            metrics: Arc::new(Metrics::new().context("Failed to register metrics")?),
        })
    }

    /// Serves until `shutdown` is notified, then drains in-flight requests.
    pub async fn start(&self, shutdown: Arc<Notify>) -> Result<()> {
        let app = self.router();

        let listener = TcpListener::bind(("0.0.0.0", self.port))
            .await
            .context("Failed to bind to port")?;

        info!("HTTP server listening on port {}", self.port);

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown.notified().await;
                info!("HTTP server received shutdown signal");
            })
            .await
            .context("Server error")?;

        info!("HTTP server shut down gracefully");
        Ok(())
    }

    fn router(&self) -> Router {
        let metrics = self.metrics.clone();

        Router::new()
            .route("/api/checkout", post(Self::handle_checkout))
            .route("/api/delivery-fee", get(Self::handle_delivery_fee))
            .route("/api/coupons/validate", post(Self::handle_validate_coupon))
            .route("/api/orders/{reference}", get(Self::handle_get_order))
            .route("/health", get(Self::handle_health))
            .route("/metrics", get(Self::handle_metrics))
            .layer(axum::middleware::from_fn_with_state(
                metrics.clone(),
                Self::metrics_middleware,
            ))
            .with_state(AppState {
                checkout: self.checkout.clone(),
                metrics,
            })
    }

    /// Middleware for collecting metrics on HTTP requests
    async fn metrics_middleware(
        State(metrics): State<Arc<Metrics>>,
        req: axum::extract::Request,
        next: axum::middleware::Next,
    ) -> Response {
        let method = req.method().to_string();
        // The route template keeps label cardinality bounded.
        let endpoint = req
            .extensions()
            .get::<MatchedPath>()
            .map(|p| p.as_str().to_string())
            .unwrap_or_else(|| "unmatched".to_string());

        let start = std::time::Instant::now();
        let response = next.run(req).await;
        let status = response.status().as_u16();

        metrics.record_request(&method, &endpoint, status, start.elapsed());
        if status >= 500 {
            metrics.record_error("http", &endpoint);
        }

        response
    }

    async fn handle_checkout(
        State(state): State<AppState>,
        Json(request): Json<CheckoutRequest>,
    ) -> Response {
        info!(
            idempotency_key = %request.idempotency_key,
            lines = request.cart_lines.len(),
            "Received checkout request"
        );

        match state.checkout.checkout(request).await {
            Ok(receipt) => {
                state.metrics.record_checkout("completed");
                (StatusCode::CREATED, Json(receipt)).into_response()
            }
            Err(e) => {
                let err = ApiError(e);
                state.metrics.record_checkout(err.outcome());
                warn!(outcome = err.outcome(), error = %err.0, "Checkout did not complete");
                err.into_response()
            }
        }
    }

    async fn handle_delivery_fee(
        State(state): State<AppState>,
        Query(query): Query<DeliveryFeeQuery>,
    ) -> Result<Response, ApiError> {
        let quote = state.checkout.quote_delivery(&query.postcode).await?;
        Ok(Json(quote).into_response())
    }

    async fn handle_validate_coupon(
        State(state): State<AppState>,
        Json(body): Json<CouponPreviewRequest>,
    ) -> Result<Response, ApiError> {
        let applied = state
            .checkout
            .preview_coupon(&body.code, body.subtotal, &body.email)
            .await?;
        Ok(Json(applied).into_response())
    }

    async fn handle_get_order(
        State(state): State<AppState>,
        Path(reference): Path<String>,
    ) -> Result<Response, ApiError> {
        match state.checkout.find_order(&reference).await? {
            Some(order) => Ok(Json(OrderView::from(&order)).into_response()),
            None => {
                warn!(payment_reference = %reference, "Order not found");
                Ok((StatusCode::NOT_FOUND, "order not found").into_response())
            }
        }
    }

    async fn handle_health() -> &'static str {
        "OK"
    }

    async fn handle_metrics(State(state): State<AppState>) -> Response {
        match state.metrics.render() {
            Ok(metrics_text) => (StatusCode::OK, metrics_text).into_response(),
            Err(e) => {
                error!("Failed to encode metrics: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics").into_response()
            }
        }
    }
}
