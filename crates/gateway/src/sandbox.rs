//! Deterministic in-process gateway for local development.
//!
//! Card numbers ending in `0002` are declined; every other card is charged.
//! Intents and direct charges are idempotent on the request key.

use std::collections::HashMap;

use async_trait::async_trait;
use model::{CardDetails, PaymentAttempt, PaymentStatus};
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

use crate::{GatewayError, IntentRequest, PaymentGateway, PaymentIntent, PaymentOutcome};

const DECLINE_SUFFIX: &str = "0002";
const DECLINE_REASON: &str = "Your card was declined.";

#[derive(Debug, Default)]
struct Ledger {
    /// idempotency key -> reference
    keys: HashMap<String, String>,
    /// reference -> attempt
    attempts: HashMap<String, PaymentAttempt>,
    /// reference -> client secret
    secrets: HashMap<String, String>,
}

impl Ledger {
    fn open(&mut self, prefix: &str, key: &str, request: &IntentRequest) -> String {
        if let Some(reference) = self.keys.get(key) {
            return reference.clone();
        }
        let reference = format!("{prefix}_{}", Uuid::new_v4().simple());
        self.keys.insert(key.to_string(), reference.clone());
        self.attempts.insert(
            reference.clone(),
            PaymentAttempt {
                gateway_reference: reference.clone(),
                amount: request.amount,
                currency: request.currency.clone(),
                status: PaymentStatus::Created,
                metadata: request.metadata.clone(),
            },
        );
        reference
    }

    fn settle(&mut self, reference: &str, card: &CardDetails) -> Result<PaymentOutcome, GatewayError> {
        let attempt = self
            .attempts
            .get_mut(reference)
            .ok_or_else(|| GatewayError::Rejected(format!("no such payment: {reference}")))?;

        match attempt.status {
            PaymentStatus::Confirmed => return Ok(PaymentOutcome::confirmed(reference)),
            PaymentStatus::Failed | PaymentStatus::Created => {}
        }

        if card.number.expose_secret().trim().ends_with(DECLINE_SUFFIX) {
            attempt.status = PaymentStatus::Failed;
            return Ok(PaymentOutcome::failed(reference, DECLINE_REASON));
        }
        attempt.status = PaymentStatus::Confirmed;
        info!(reference, amount = attempt.amount, "Sandbox payment confirmed");
        Ok(PaymentOutcome::confirmed(reference))
    }
}

/// In-process payment gateway with an observable attempt ledger.
#[derive(Debug, Default)]
pub struct SandboxGateway {
    ledger: Mutex<Ledger>,
}

impl SandboxGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every attempt the sandbox has seen.
    pub async fn attempts(&self) -> Vec<PaymentAttempt> {
        self.ledger.lock().await.attempts.values().cloned().collect()
    }
}

#[async_trait]
impl PaymentGateway for SandboxGateway {
    async fn create_intent(&self, request: &IntentRequest) -> Result<PaymentIntent, GatewayError> {
        if request.amount <= 0 {
            return Err(GatewayError::Rejected("amount must be positive".to_string()));
        }
        let mut ledger = self.ledger.lock().await;
        let reference = ledger.open("pi", &request.idempotency_key, request);
        let secret = ledger
            .secrets
            .entry(reference.clone())
            .or_insert_with(|| format!("{reference}_secret_{}", Uuid::new_v4().simple()))
            .clone();
        Ok(PaymentIntent {
            client_secret: SecretString::from(secret),
            reference,
        })
    }

    async fn confirm(
        &self,
        intent: &PaymentIntent,
        card: &CardDetails,
    ) -> Result<PaymentOutcome, GatewayError> {
        let mut ledger = self.ledger.lock().await;
        let expected = ledger.secrets.get(&intent.reference);
        if expected.map(String::as_str) != Some(intent.client_secret.expose_secret()) {
            return Err(GatewayError::Rejected("client secret mismatch".to_string()));
        }
        ledger.settle(&intent.reference, card)
    }

    async fn charge_direct(
        &self,
        request: &IntentRequest,
        card: &CardDetails,
    ) -> Result<PaymentOutcome, GatewayError> {
        if request.amount <= 0 {
            return Err(GatewayError::Rejected("amount must be positive".to_string()));
        }
        let mut ledger = self.ledger.lock().await;
        let key = format!("{}:direct", request.idempotency_key);
        let reference = ledger.open("ch", &key, request);
        ledger.settle(&reference, card)
    }
}
