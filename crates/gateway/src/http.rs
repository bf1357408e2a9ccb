//! HTTP client for the card-payment provider's JSON API.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use model::CardDetails;
use reqwest::{Client, Response, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::{GatewayError, IntentRequest, PaymentGateway, PaymentIntent, PaymentOutcome};

/// Payment provider API client.
pub struct HttpPaymentGateway {
    client: Client,
    base_url: String,
    api_key: SecretString,
}

impl std::fmt::Debug for HttpPaymentGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpPaymentGateway")
            .field("base_url", &self.base_url)
            .field("api_key", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

#[derive(Serialize)]
struct IntentBody<'a> {
    amount: i64,
    currency: &'a str,
    metadata: &'a BTreeMap<String, String>,
}

#[derive(Serialize)]
struct CardBody<'a> {
    number: &'a str,
    exp_month: u8,
    exp_year: u16,
    cvc: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    holder_name: Option<&'a str>,
}

impl<'a> From<&'a CardDetails> for CardBody<'a> {
    fn from(card: &'a CardDetails) -> Self {
        Self {
            number: card.number.expose_secret(),
            exp_month: card.exp_month,
            exp_year: card.exp_year,
            cvc: card.cvc.expose_secret(),
            holder_name: card.holder_name.as_deref(),
        }
    }
}

#[derive(Serialize)]
struct ConfirmBody<'a> {
    client_secret: &'a str,
    card: CardBody<'a>,
}

#[derive(Serialize)]
struct ChargeBody<'a> {
    amount: i64,
    currency: &'a str,
    metadata: &'a BTreeMap<String, String>,
    card: CardBody<'a>,
}

#[derive(Deserialize)]
struct IntentResponse {
    id: String,
    client_secret: String,
}

#[derive(Deserialize)]
struct ChargeResponse {
    id: String,
    status: String,
    #[serde(default)]
    failure_message: Option<String>,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ApiError,
}

#[derive(Deserialize)]
struct ApiError {
    message: String,
    /// Reference of the declined charge, when the provider created one.
    #[serde(default)]
    charge: Option<String>,
}

fn transport_error(e: reqwest::Error) -> GatewayError {
    GatewayError::Unavailable(e.to_string())
}

/// Turns non-2xx responses into errors: 5xx/429 are `Unavailable`,
/// everything else is `Rejected`.
async fn check_status(response: Response) -> Result<Response, GatewayError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response
        .json::<ErrorEnvelope>()
        .await
        .map(|e| e.error.message)
        .unwrap_or_else(|_| status.to_string());
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        Err(GatewayError::Unavailable(message))
    } else {
        Err(GatewayError::Rejected(message))
    }
}

/// Reads a confirm/charge response. A 402 is a decline and yields a failed
/// outcome carrying the provider's message verbatim.
async fn read_outcome(response: Response, reference: &str) -> Result<PaymentOutcome, GatewayError> {
    if response.status() == StatusCode::PAYMENT_REQUIRED {
        let body: ErrorEnvelope = response
            .json()
            .await
            .map_err(|e| GatewayError::Response(e.to_string()))?;
        let reference = body.error.charge.unwrap_or_else(|| reference.to_string());
        return Ok(PaymentOutcome::failed(reference, body.error.message));
    }

    let body: ChargeResponse = check_status(response)
        .await?
        .json()
        .await
        .map_err(|e| GatewayError::Response(e.to_string()))?;

    Ok(match body.status.as_str() {
        "succeeded" => PaymentOutcome::confirmed(body.id),
        _ => {
            let reason = body
                .failure_message
                .unwrap_or_else(|| "The payment was not completed.".to_string());
            PaymentOutcome::failed(body.id, reason)
        }
    })
}

impl HttpPaymentGateway {
    /// Create a new gateway client.
    ///
    /// # Errors
    ///
    /// Returns error if the underlying HTTP client cannot be built.
    pub fn new(
        base_url: impl Into<String>,
        api_key: SecretString,
        timeout: Duration,
    ) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::Rejected(format!("invalid HTTP client config: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        })
    }
}

#[async_trait]
impl PaymentGateway for HttpPaymentGateway {
    #[instrument(skip(self, request), fields(amount = request.amount, currency = %request.currency))]
    async fn create_intent(&self, request: &IntentRequest) -> Result<PaymentIntent, GatewayError> {
        let response = self
            .client
            .post(format!("{}/payment_intents", self.base_url))
            .bearer_auth(self.api_key.expose_secret())
            .header("Idempotency-Key", &request.idempotency_key)
            .json(&IntentBody {
                amount: request.amount,
                currency: &request.currency,
                metadata: &request.metadata,
            })
            .send()
            .await
            .map_err(transport_error)?;

        let body: IntentResponse = check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| GatewayError::Response(e.to_string()))?;

        debug!(reference = %body.id, "Payment intent created");
        Ok(PaymentIntent {
            client_secret: SecretString::from(body.client_secret),
            reference: body.id,
        })
    }

    #[instrument(skip(self, intent, card), fields(reference = %intent.reference))]
    async fn confirm(
        &self,
        intent: &PaymentIntent,
        card: &CardDetails,
    ) -> Result<PaymentOutcome, GatewayError> {
        let response = self
            .client
            .post(format!(
                "{}/payment_intents/{}/confirm",
                self.base_url, intent.reference
            ))
            .bearer_auth(self.api_key.expose_secret())
            .json(&ConfirmBody {
                client_secret: intent.client_secret.expose_secret(),
                card: CardBody::from(card),
            })
            .send()
            .await
            .map_err(transport_error)?;

        let outcome = read_outcome(response, &intent.reference).await?;
        if !outcome.is_confirmed() {
            warn!(reference = %outcome.reference, "Payment intent confirmation declined");
        }
        Ok(outcome)
    }

    #[instrument(skip(self, request, card), fields(amount = request.amount, currency = %request.currency))]
    async fn charge_direct(
        &self,
        request: &IntentRequest,
        card: &CardDetails,
    ) -> Result<PaymentOutcome, GatewayError> {
        // Provider idempotency keys are account-wide, so the direct charge gets
        // its own namespace next to the intent created under the same key.
        let idempotency_key = format!("{}:direct", request.idempotency_key);
        let response = self
            .client
            .post(format!("{}/charges", self.base_url))
            .bearer_auth(self.api_key.expose_secret())
            .header("Idempotency-Key", &idempotency_key)
            .json(&ChargeBody {
                amount: request.amount,
                currency: &request.currency,
                metadata: &request.metadata,
                card: CardBody::from(card),
            })
            .send()
            .await
            .map_err(transport_error)?;

        read_outcome(response, &idempotency_key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use model::PaymentStatus;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn card(number: &str) -> CardDetails {
        CardDetails {
            number: SecretString::from(number.to_string()),
            exp_month: 12,
            exp_year: 2030,
            cvc: SecretString::from("123".to_string()),
            holder_name: None,
        }
    }

    fn request(key: &str) -> IntentRequest {
        IntentRequest {
            amount: 5000,
            currency: "GBP".to_string(),
            metadata: BTreeMap::from([("customer_email".to_string(), "a@x.com".to_string())]),
            idempotency_key: key.to_string(),
        }
    }

    fn gateway(server: &MockServer) -> HttpPaymentGateway {
        HttpPaymentGateway::new(
            server.uri(),
            SecretString::from("sk_test_123".to_string()),
            Duration::from_secs(2),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_create_intent_forwards_idempotency_key() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/payment_intents"))
            .and(header("Idempotency-Key", "order-key-1"))
            .and(header("Authorization", "Bearer sk_test_123"))
            .and(body_partial_json(json!({"amount": 5000, "currency": "GBP"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "pi_1",
                "client_secret": "pi_1_secret_abc",
                "status": "requires_confirmation"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let intent = gateway(&server).create_intent(&request("order-key-1")).await.unwrap();
        assert_eq!(intent.reference, "pi_1");
        assert_eq!(intent.client_secret.expose_secret(), "pi_1_secret_abc");
    }

    #[tokio::test]
    async fn test_server_error_is_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/payment_intents"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = gateway(&server).create_intent(&request("k")).await.unwrap_err();
        assert!(err.is_unavailable());
    }

    #[tokio::test]
    async fn test_bad_request_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/payment_intents"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": {"message": "Invalid currency"}
            })))
            .mount(&server)
            .await;

        let err = gateway(&server).create_intent(&request("k")).await.unwrap_err();
        assert!(matches!(err, GatewayError::Rejected(ref m) if m == "Invalid currency"));
    }

    #[tokio::test]
    async fn test_unreachable_provider_is_unavailable() {
        let gateway = HttpPaymentGateway::new(
            "http://127.0.0.1:9",
            SecretString::from("sk".to_string()),
            Duration::from_millis(500),
        )
        .unwrap();
        let err = gateway.create_intent(&request("k")).await.unwrap_err();
        assert!(err.is_unavailable());
    }

    #[tokio::test]
    async fn test_confirm_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/payment_intents/pi_1/confirm"))
            .and(body_partial_json(json!({"client_secret": "pi_1_secret_abc"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "pi_1",
                "status": "succeeded"
            })))
            .mount(&server)
            .await;

        let intent = PaymentIntent {
            client_secret: SecretString::from("pi_1_secret_abc".to_string()),
            reference: "pi_1".to_string(),
        };
        let outcome = gateway(&server)
            .confirm(&intent, &card("4242424242424242"))
            .await
            .unwrap();
        assert_eq!(outcome, PaymentOutcome::confirmed("pi_1"));
    }

    #[tokio::test]
    async fn test_confirm_decline_keeps_provider_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/payment_intents/pi_2/confirm"))
            .respond_with(ResponseTemplate::new(402).set_body_json(json!({
                "error": {"message": "Your card has insufficient funds.", "code": "card_declined"}
            })))
            .mount(&server)
            .await;

        let intent = PaymentIntent {
            client_secret: SecretString::from("pi_2_secret".to_string()),
            reference: "pi_2".to_string(),
        };
        let outcome = gateway(&server)
            .confirm(&intent, &card("4000000000009995"))
            .await
            .unwrap();
        assert_eq!(outcome.status, PaymentStatus::Failed);
        assert_eq!(outcome.reference, "pi_2");
        assert_eq!(
            outcome.failure_reason.as_deref(),
            Some("Your card has insufficient funds.")
        );
    }

    #[tokio::test]
    async fn test_charge_direct_uses_separate_idempotency_namespace() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/charges"))
            .and(header("Idempotency-Key", "order-key-1:direct"))
            .and(body_partial_json(json!({"amount": 5000, "card": {"exp_year": 2030}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "ch_1",
                "status": "succeeded"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let outcome = gateway(&server)
            .charge_direct(&request("order-key-1"), &card("4242424242424242"))
            .await
            .unwrap();
        assert_eq!(outcome, PaymentOutcome::confirmed("ch_1"));
    }

    #[tokio::test]
    async fn test_charge_direct_failed_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/charges"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "ch_2",
                "status": "failed",
                "failure_message": "Your card was declined."
            })))
            .mount(&server)
            .await;

        let outcome = gateway(&server)
            .charge_direct(&request("k"), &card("4000000000000002"))
            .await
            .unwrap();
        assert_eq!(outcome, PaymentOutcome::failed("ch_2", "Your card was declined."));
    }
}
