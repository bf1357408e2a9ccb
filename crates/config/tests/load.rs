use std::time::Duration;

use app_config::AppConfig;
use rust_decimal_macros::dec;

#[test]
fn test_load_default_config() {
    let cfg = AppConfig::load().unwrap();
    assert_eq!(cfg.db_port, 5432);
    assert_eq!(cfg.currency, "GBP");
    assert_eq!(cfg.default_delivery_fee, dec!(7.50));
    assert_eq!(cfg.gateway_retry_backoff, Duration::from_millis(500));
    assert_eq!(cfg.ledger_max_attempts, 5);
    // No key configured means the sandbox gateway is wired in.
    assert!(!cfg.has_gateway_credentials());
}

#[test]
fn test_dsn_contains_database_settings() {
    let cfg = AppConfig::load().unwrap();
    let dsn = cfg.database_dsn();
    assert!(dsn.contains(&format!("dbname={}", cfg.db_name)));
    assert!(dsn.contains(&format!("port={}", cfg.db_port)));
}
