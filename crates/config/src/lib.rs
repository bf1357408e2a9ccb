use anyhow::{Context, Result};
use rust_decimal::Decimal;
use secrecy::SecretString;
use serde::Deserialize;
use std::time::Duration;

/// `AppConfig` holds all configuration parameters required by the application.
///
/// The configuration is loaded from environment variables (optionally via a `.env` file)
/// or uses default values if the variable is not set. Fields cover the database,
/// HTTP server, checkout pricing, payment gateway, order ledger and notification
/// settings. This struct is deserializable via Serde.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    // --- Database settings ---
    /// Database hostname or service name (e.g. "postgres" in Docker Compose, "localhost" for local runs).
    pub db_host: String,
    /// Database port (default: 5432).
    pub db_port: u16,
    /// Database user.
    pub db_user: String,
    /// Database password.
    pub db_password: String,
    /// Database name.
    pub db_name: String,
    /// Maximum number of pooled connections.
    pub db_pool_size: usize,

    // --- HTTP server ---
    /// The port on which the HTTP server will listen.
    pub http_port: u16,

    // --- Shutdown timeout ---
    /// Graceful shutdown timeout (human-friendly format, e.g. "5s", "1m").
    #[serde(deserialize_with = "deserialize_duration")]
    pub shutdown_timeout: Duration,

    // --- Pricing ---
    /// ISO 4217 code of the single currency the shop trades in.
    pub currency: String,
    /// Fee charged when a postcode matches no delivery zone.
    #[serde(deserialize_with = "deserialize_decimal")]
    pub default_delivery_fee: Decimal,
    /// Area name reported for postcodes outside every zone.
    pub default_delivery_area: String,
    /// How often the delivery zone cache is reloaded from the database.
    #[serde(deserialize_with = "deserialize_duration")]
    pub zone_refresh_interval: Duration,

    // --- Payment gateway ---
    /// Base URL of the card-payment provider API.
    pub gateway_base_url: String,
    /// Secret API key. Empty means the local sandbox gateway is used.
    #[serde(deserialize_with = "deserialize_secret")]
    pub gateway_api_key: SecretString,
    /// Per-request timeout for gateway calls.
    #[serde(deserialize_with = "deserialize_duration")]
    pub gateway_timeout: Duration,
    /// Delay before the single retry of a failed intent creation.
    #[serde(deserialize_with = "deserialize_duration")]
    pub gateway_retry_backoff: Duration,

    // --- Order ledger ---
    /// How many times a confirmed order write is attempted before alerting.
    pub ledger_max_attempts: u32,
    /// Initial delay between order write attempts (doubles each time).
    #[serde(deserialize_with = "deserialize_duration")]
    pub ledger_retry_backoff: Duration,

    // --- Kafka settings ---
    /// List of Kafka brokers (comma-separated string in env, parsed to Vec<String>).
    pub kafka_brokers: Vec<String>,
    /// Topic the order notifications are published to.
    pub notification_topic: String,
}

/// Custom deserializer for durations.
/// Accepts human-readable formats like "5s", "1m", "250ms".
fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;
    let val = String::deserialize(deserializer)?;
    humantime::parse_duration(&val)
        .map_err(|e| D::Error::custom(format!("Invalid duration '{val}': {e}")))
}

fn deserialize_decimal<'de, D>(deserializer: D) -> Result<Decimal, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;
    let val = String::deserialize(deserializer)?;
    val.trim()
        .parse::<Decimal>()
        .map_err(|e| D::Error::custom(format!("Invalid amount '{val}': {e}")))
}

fn deserialize_secret<'de, D>(deserializer: D) -> Result<SecretString, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let val = String::deserialize(deserializer)?;
    Ok(SecretString::from(val))
}

impl AppConfig {
    /// Loads configuration from environment variables (and optionally from `.env` file).
    ///
    /// Fields not set via env will be filled with default values.
    ///
    /// # Errors
    /// Returns an error if environment variables are invalid or missing required values.
    pub fn load() -> Result<Self> {
        // Load from .env file (for Docker environment)
        dotenvy::dotenv().ok();

        let settings = config::Config::builder()
            // Database
            .set_default("db_host", "localhost")?
            .set_default("db_port", 5432)?
            .set_default("db_user", "catering_user")?
            .set_default("db_password", "securepassword")?
            .set_default("db_name", "catering_db")?
            .set_default("db_pool_size", 16)?
            // HTTP
            .set_default("http_port", 8081)?
            // Shutdown
            .set_default("shutdown_timeout", "5s")?
            // Pricing
            .set_default("currency", "GBP")?
            .set_default("default_delivery_fee", "7.50")?
            .set_default("default_delivery_area", "Outside known delivery area")?
            .set_default("zone_refresh_interval", "60s")?
            // Payment gateway
            .set_default("gateway_base_url", "https://api.payments.example.com/v1")?
            .set_default("gateway_api_key", "")?
            .set_default("gateway_timeout", "10s")?
            .set_default("gateway_retry_backoff", "500ms")?
            // Order ledger
            .set_default("ledger_max_attempts", 5)?
            .set_default("ledger_retry_backoff", "200ms")?
            // Kafka
            .set_default("kafka_brokers", vec!["localhost:9092"])?
            .set_default("notification_topic", "order-notifications")?
            .add_source(
                config::Environment::default()
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("kafka_brokers"),
            )
            .build()?;

        settings
            .try_deserialize()
            .context("Failed to load configuration")
    }

    /// Postgres connection string built from the database settings.
    pub fn database_dsn(&self) -> String {
        format!(
            "host={} port={} user={} password={} dbname={} sslmode=disable",
            self.db_host, self.db_port, self.db_user, self.db_password, self.db_name
        )
    }

    /// Whether a real gateway key has been configured.
    pub fn has_gateway_credentials(&self) -> bool {
        use secrecy::ExposeSecret;
        !self.gateway_api_key.expose_secret().trim().is_empty()
    }
}
