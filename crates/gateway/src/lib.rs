//! Card-payment gateway adapter.
//!
//! [`PaymentGateway`] is the seam between checkout and the external payment
//! provider. Two implementations ship with the crate:
//!
//! - [`HttpPaymentGateway`] talks to the provider's JSON API over HTTPS and
//!   forwards the checkout idempotency key as an `Idempotency-Key` header.
//! - [`SandboxGateway`] is a deterministic in-process gateway for local runs.
//!
//! Amounts cross this boundary in minor units (pence).

use std::collections::BTreeMap;

use async_trait::async_trait;
use model::{CardDetails, PaymentStatus};
use secrecy::SecretString;
use thiserror::Error;

pub mod http;
pub mod sandbox;

pub use http::HttpPaymentGateway;
pub use sandbox::SandboxGateway;

/// Errors raised by a gateway call that did not produce a payment outcome.
///
/// A card decline is *not* an error: it is a [`PaymentOutcome`] with
/// [`PaymentStatus::Failed`] and a reason.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Provider unreachable, timed out, or answered with a 5xx/429.
    #[error("Payment gateway unavailable: {0}")]
    Unavailable(String),
    /// Provider refused the request itself (bad parameters, auth).
    #[error("Payment gateway rejected the request: {0}")]
    Rejected(String),
    /// Provider answered with something we could not interpret.
    #[error("Unexpected payment gateway response: {0}")]
    Response(String),
}

impl GatewayError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, GatewayError::Unavailable(_))
    }
}

/// Request to create a chargeable intent (or a direct charge).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntentRequest {
    /// Amount in minor units.
    pub amount: i64,
    pub currency: String,
    pub metadata: BTreeMap<String, String>,
    /// Repeating a request with the same key yields the same reference.
    pub idempotency_key: String,
}

/// A created payment intent.
#[derive(Debug)]
pub struct PaymentIntent {
    pub client_secret: SecretString,
    pub reference: String,
}

/// Terminal result of confirming an intent or charging directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentOutcome {
    pub status: PaymentStatus,
    pub reference: String,
    /// Human-readable reason supplied by the provider when `status` is `Failed`.
    pub failure_reason: Option<String>,
}

impl PaymentOutcome {
    pub fn confirmed(reference: impl Into<String>) -> Self {
        Self {
            status: PaymentStatus::Confirmed,
            reference: reference.into(),
            failure_reason: None,
        }
    }

    pub fn failed(reference: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            status: PaymentStatus::Failed,
            reference: reference.into(),
            failure_reason: Some(reason.into()),
        }
    }

    pub fn is_confirmed(&self) -> bool {
        self.status == PaymentStatus::Confirmed
    }
}

/// Port to the external card-payment provider.
///
/// Implementations must be idempotent on `IntentRequest::idempotency_key`.
/// `confirm` and `charge_direct` move money: callers must never retry them
/// automatically.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Creates (or returns the existing) intent for this idempotency key.
    async fn create_intent(&self, request: &IntentRequest) -> Result<PaymentIntent, GatewayError>;

    /// Confirms an intent with the customer's card.
    async fn confirm(
        &self,
        intent: &PaymentIntent,
        card: &CardDetails,
    ) -> Result<PaymentOutcome, GatewayError>;

    /// Tokenizes the card and charges it in one call, bypassing intents.
    /// Used when intent creation is unavailable.
    async fn charge_direct(
        &self,
        request: &IntentRequest,
        card: &CardDetails,
    ) -> Result<PaymentOutcome, GatewayError>;
}
