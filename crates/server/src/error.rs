//! Mapping from checkout errors to HTTP responses.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use rust_decimal::Decimal;
use serde::Serialize;
use service::{CheckoutError, CouponError};
use tracing::error;

/// JSON error body: a stable `code` for clients and a human `message`.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_reference: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount: Option<Decimal>,
    /// Echoed back when the client should retry with the same key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

impl ErrorBody {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            payment_reference: None,
            amount: None,
            idempotency_key: None,
        }
    }
}

/// Wrapper that turns a [`CheckoutError`] into a response.
#[derive(Debug)]
pub struct ApiError(pub CheckoutError);

impl From<CheckoutError> for ApiError {
    fn from(err: CheckoutError) -> Self {
        Self(err)
    }
}

impl ApiError {
    /// Label used for the checkout outcome counter.
    pub fn outcome(&self) -> &'static str {
        match &self.0 {
            CheckoutError::Validation(_) => "validation_error",
            CheckoutError::Coupon(_) => "coupon_rejected",
            CheckoutError::PaymentDeclined { .. } => "declined",
            CheckoutError::Gateway(_) => "gateway_error",
            CheckoutError::PaymentOutcomeUnknown { .. } => "payment_outcome_unknown",
            CheckoutError::PersistenceFailed { .. } => "persistence_failed",
            CheckoutError::Storage(_) => "storage_error",
            CheckoutError::Internal(_) => "internal_error",
        }
    }

    fn status_and_body(&self) -> (StatusCode, ErrorBody) {
        match &self.0 {
            CheckoutError::Validation(msg) => {
                (StatusCode::BAD_REQUEST, ErrorBody::new("validation_error", msg.clone()))
            }
            CheckoutError::Coupon(CouponError::Storage(e)) => {
                error!("Coupon lookup failed: {}", e);
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    ErrorBody::new("coupon_storage_error", "Coupons are temporarily unavailable"),
                )
            }
            CheckoutError::Coupon(e) => {
                let status = match e {
                    CouponError::GlobalLimitReached | CouponError::PerCustomerLimitReached => {
                        StatusCode::CONFLICT
                    }
                    _ => StatusCode::UNPROCESSABLE_ENTITY,
                };
                (status, ErrorBody::new(e.code(), e.to_string()))
            }
            CheckoutError::PaymentDeclined { reason } => (
                StatusCode::PAYMENT_REQUIRED,
                ErrorBody::new("payment_declined", reason.clone()),
            ),
            CheckoutError::Gateway(e) => {
                error!("Payment gateway error: {}", e);
                (
                    StatusCode::BAD_GATEWAY,
                    ErrorBody::new(
                        "payment_gateway_error",
                        "The payment provider could not process the request. You have not been charged by this attempt; please try again.",
                    ),
                )
            }
            CheckoutError::PaymentOutcomeUnknown { idempotency_key } => (
                StatusCode::GATEWAY_TIMEOUT,
                ErrorBody {
                    code: "payment_outcome_unknown",
                    message: "We could not confirm whether your payment went through. Retry this checkout as it is and you will not be charged twice, or wait for a confirmation email.".to_string(),
                    payment_reference: None,
                    amount: None,
                    idempotency_key: Some(idempotency_key.clone()),
                },
            ),
            CheckoutError::PersistenceFailed {
                payment_reference,
                amount,
            } => (
                StatusCode::ACCEPTED,
                ErrorBody {
                    code: "order_pending_confirmation",
                    message: "Payment received. We are confirming your order and will contact you shortly.".to_string(),
                    payment_reference: Some(payment_reference.clone()),
                    amount: Some(*amount),
                    idempotency_key: None,
                },
            ),
            CheckoutError::Storage(e) => {
                error!("Storage error: {}", e);
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    ErrorBody::new("storage_unavailable", "Service temporarily unavailable"),
                )
            }
            CheckoutError::Internal(msg) => {
                error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorBody::new("internal_error", "Unexpected error"),
                )
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = self.status_and_body();
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateway::GatewayError;
    use rust_decimal_macros::dec;

    fn status_of(err: CheckoutError) -> StatusCode {
        ApiError(err).into_response().status()
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            status_of(CheckoutError::Validation("cart is empty".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(CheckoutError::Coupon(CouponError::Expired)),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            status_of(CheckoutError::Coupon(CouponError::GlobalLimitReached)),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(CheckoutError::PaymentDeclined {
                reason: "Insufficient funds".into()
            }),
            StatusCode::PAYMENT_REQUIRED
        );
        assert_eq!(
            status_of(CheckoutError::Gateway(GatewayError::Unavailable("timeout".into()))),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn test_persistence_failure_is_never_a_plain_failure() {
        let err = ApiError(CheckoutError::PersistenceFailed {
            payment_reference: "pi_42".into(),
            amount: dec!(50.00),
        });
        assert_eq!(err.outcome(), "persistence_failed");
        let (status, body) = err.status_and_body();
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body.payment_reference.as_deref(), Some("pi_42"));
        assert_eq!(body.amount, Some(dec!(50.00)));
    }

    #[test]
    fn test_unknown_outcome_does_not_claim_no_charge() {
        let err = ApiError(CheckoutError::PaymentOutcomeUnknown {
            idempotency_key: "web-9".into(),
        });
        assert_eq!(err.outcome(), "payment_outcome_unknown");
        let (status, body) = err.status_and_body();
        assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(body.code, "payment_outcome_unknown");
        assert_eq!(body.idempotency_key.as_deref(), Some("web-9"));
        assert!(!body.message.contains("not been charged"));
    }
}
