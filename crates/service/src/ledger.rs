//! At-most-once order persistence.

use std::sync::Arc;
use std::time::Duration;

use model::{NewOrder, Order, PaymentClaim};
use repository::{Insertion, OrdersRepository, RepositoryError};
use tracing::{info, instrument, warn};

use crate::error::LedgerError;
use crate::retry::{RetryConfig, with_retry};

/// Writes paid orders. Every write is keyed by the payment reference and the
/// checkout idempotency key, so repeating it can never produce a second row.
pub struct OrderLedger<O: ?Sized> {
    orders: Arc<O>,
    retry: RetryConfig,
}

impl<O> OrderLedger<O>
where
    O: OrdersRepository + ?Sized,
{
    /// `max_attempts` bounds how long a confirmed payment waits for its row;
    /// the delay doubles from `backoff` between attempts.
    pub fn new(orders: Arc<O>, max_attempts: u32, backoff: Duration) -> Self {
        Self {
            orders,
            retry: RetryConfig {
                max_attempts: max_attempts.max(1),
                initial_delay: backoff,
                max_delay: backoff.saturating_mul(16),
                backoff_factor: 2.0,
            },
        }
    }

    /// Inserts the order, or returns the row an earlier attempt already wrote.
    ///
    /// Storage failures are retried with the same keys until the attempt
    /// budget runs out.
    #[instrument(skip(self, order), fields(payment_reference = %order.payment_reference))]
    pub async fn persist(&self, order: &NewOrder) -> Result<Insertion, LedgerError> {
        let result = with_retry(&self.retry, RepositoryError::is_transient, || {
            self.orders.insert_if_absent(order)
        })
        .await;

        match result {
            Ok(insertion) => {
                match &insertion {
                    Insertion::Inserted(o) => info!(order_id = %o.id, "Order persisted"),
                    Insertion::Existing(o) => {
                        warn!(order_id = %o.id, "Order already persisted for this payment")
                    }
                }
                Ok(insertion)
            }
            Err((source, attempts)) => Err(LedgerError { attempts, source }),
        }
    }

    pub async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Order>, RepositoryError> {
        self.orders.get_by_idempotency_key(key).await
    }

    pub async fn find_by_reference(&self, reference: &str) -> Result<Option<Order>, RepositoryError> {
        self.orders.get_by_payment_reference(reference).await
    }

    /// Fixes the payment method for a checkout, or returns the one an earlier
    /// attempt fixed.
    pub async fn claim_payment(&self, claim: &PaymentClaim) -> Result<PaymentClaim, RepositoryError> {
        self.orders.claim_payment(claim).await
    }

    pub async fn payment_claim(&self, key: &str) -> Result<Option<PaymentClaim>, RepositoryError> {
        self.orders.get_payment_claim(key).await
    }
}
