//! Order confirmation publishers.
//!
//! [`KafkaNotifier`] publishes `{recipient, order_summary}` JSON to a topic
//! consumed by the email worker. [`LogNotifier`] only writes a log line and is
//! used when no broker is configured.

use std::time::Duration;

use anyhow::{Context, Result};
use app_config::AppConfig;
use async_trait::async_trait;
use model::Notification;
use rdkafka::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord};
use service::{NotificationDispatcher, NotifyError};
use tracing::{error, info};

const SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Serializes a notification into its message key and JSON payload.
///
/// Keyed by order id so every message for one order lands on one partition.
pub fn encode(notification: &Notification) -> Result<(String, String), NotifyError> {
    let payload =
        serde_json::to_string(notification).map_err(|e| NotifyError::Encode(e.to_string()))?;
    Ok((notification.order_summary.order_id.to_string(), payload))
}

/// Kafka-backed [`NotificationDispatcher`].
pub struct KafkaNotifier {
    producer: FutureProducer,
    topic: String,
}

impl KafkaNotifier {
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        Self::new(&config.kafka_brokers, &config.notification_topic)
    }

    /// Creates the producer. No connection is made until the first send.
    pub fn new(brokers: &[String], topic: &str) -> Result<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers.join(","))
            .set("message.timeout.ms", "5000")
            .create()
            .context("Failed to create Kafka producer")?;

        info!(topic = %topic, "Kafka notifier initialized");

        Ok(Self {
            producer,
            topic: topic.to_string(),
        })
    }
}

#[async_trait]
impl NotificationDispatcher for KafkaNotifier {
    async fn dispatch(&self, notification: &Notification) -> Result<(), NotifyError> {
        let (key, payload) = encode(notification)?;
        let record = FutureRecord::to(&self.topic).key(&key).payload(&payload);

        match self.producer.send(record, SEND_TIMEOUT).await {
            Ok(_) => {
                info!(order_id = %key, topic = %self.topic, "Notification published");
                Ok(())
            }
            Err((kafka_err, _)) => {
                error!(order_id = %key, error = %kafka_err, "Failed to publish notification");
                Err(NotifyError::Dispatch(kafka_err.to_string()))
            }
        }
    }
}

/// Writes the notification to the log instead of sending it.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl NotificationDispatcher for LogNotifier {
    async fn dispatch(&self, notification: &Notification) -> Result<(), NotifyError> {
        let summary = &notification.order_summary;
        info!(
            recipient = %notification.recipient,
            order_id = %summary.order_id,
            payment_reference = %summary.payment_reference,
            total = %summary.total,
            "Order confirmation (not sent, no notification channel configured)"
        );
        Ok(())
    }
}
