use gateway::GatewayError;
use repository::RepositoryError;
use rust_decimal::Decimal;
use thiserror::Error;

/// Reasons a coupon cannot be applied, in validation order.
#[derive(Debug, Error)]
pub enum CouponError {
    #[error("Coupon code not found")]
    NotFound,
    #[error("Coupon has expired or is not active yet")]
    Expired,
    #[error("Coupon usage limit has been reached")]
    GlobalLimitReached,
    #[error("You have already used this coupon the maximum number of times")]
    PerCustomerLimitReached,
    #[error("Coupon storage error: {0}")]
    Storage(#[from] RepositoryError),
}

impl CouponError {
    /// Stable machine-readable code for API clients.
    pub fn code(&self) -> &'static str {
        match self {
            CouponError::NotFound => "coupon_not_found",
            CouponError::Expired => "coupon_expired",
            CouponError::GlobalLimitReached => "coupon_global_limit_reached",
            CouponError::PerCustomerLimitReached => "coupon_per_customer_limit_reached",
            CouponError::Storage(_) => "coupon_storage_error",
        }
    }
}

/// The order write could not be completed.
#[derive(Debug, Error)]
#[error("Order write failed after {attempts} attempts: {source}")]
pub struct LedgerError {
    pub attempts: u32,
    #[source]
    pub source: RepositoryError,
}

/// Notification channel failure. Never surfaces to the customer.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("Notification dispatch failed: {0}")]
    Dispatch(String),
    #[error("Notification encoding failed: {0}")]
    Encode(String),
}

/// The main error type of the checkout flow.
#[derive(Debug, Error)]
pub enum CheckoutError {
    /// The submission is malformed; nothing happened.
    #[error("Invalid checkout: {0}")]
    Validation(String),
    /// The supplied coupon cannot be used; nothing was charged.
    #[error(transparent)]
    Coupon(#[from] CouponError),
    /// The card was declined. `reason` is the provider's text, verbatim.
    #[error("Payment declined: {reason}")]
    PaymentDeclined { reason: String },
    /// The gateway failed in a way that is not a decline.
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    /// The gateway stopped answering after the card was presented. The
    /// charge may or may not have gone through; retrying with the same
    /// idempotency key settles it without a second charge.
    #[error("Payment outcome for checkout {idempotency_key} is unknown")]
    PaymentOutcomeUnknown { idempotency_key: String },
    /// Money has moved but the order could not be written.
    #[error("Payment {payment_reference} was captured but the order could not be recorded")]
    PersistenceFailed {
        payment_reference: String,
        amount: Decimal,
    },
    /// A read needed before payment failed.
    #[error(transparent)]
    Storage(#[from] RepositoryError),
    /// Unexpected or unhandled error.
    #[error("Unexpected error: {0}")]
    Internal(String),
}
