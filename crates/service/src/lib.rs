//! Business logic layer for checkout and payment orchestration.
//!
//! This crate sequences a checkout end to end: delivery fee lookup
//! ([`DeliveryFeeCalculator`]), coupon eligibility ([`CouponValidator`]),
//! payment through a [`gateway::PaymentGateway`], at-most-once order
//! persistence ([`OrderLedger`]), coupon bookkeeping ([`CouponUsageTracker`])
//! and a best-effort confirmation ([`NotificationDispatcher`]).
//!
//! [`CheckoutOrchestrator`] is the only type the HTTP layer talks to, through
//! the [`CheckoutService`] trait.

pub mod checkout;
pub mod coupon;
pub mod delivery;
pub mod error;
pub mod ledger;
pub mod notify;
pub mod retry;

pub use checkout::{
    CheckoutOrchestrator, CheckoutService, CheckoutSettings, CheckoutState, PaymentPath,
};
pub use coupon::{CouponUsageTracker, CouponValidator, discount_for};
pub use delivery::{DeliveryFeeCalculator, normalize_postcode, validate_postcode};
pub use error::{CheckoutError, CouponError, LedgerError, NotifyError};
pub use ledger::OrderLedger;
pub use notify::NotificationDispatcher;
