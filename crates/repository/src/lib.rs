//! # Data Repository Layer
//!
//! This module provides repository traits for delivery zones, coupons and
//! orders, with PostgreSQL implementations ([`postgres`]) and in-memory
//! implementations ([`memory`]) that honour the same atomicity contracts.

use async_trait::async_trait;
use deadpool_postgres::PoolError;
use model::{Coupon, CouponUsageRecord, DeliveryZone, NewOrder, Order, PaymentClaim};
use thiserror::Error;

pub mod memory;
pub mod postgres;

pub use memory::{MemoryCouponsRepository, MemoryOrdersRepository, MemoryZonesRepository};
pub use postgres::{PgCouponsRepository, PgOrdersRepository, PgZonesRepository};

/// # RepositoryError
///
/// Error types that can occur during repository operations.
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// Database-related errors, wrapping the underlying PostgreSQL error
    #[error("Database error: {0}")]
    Db(#[from] tokio_postgres::Error),
    /// Failed to obtain a connection from the pool.
    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),
    /// No result found.
    #[error("Not found")]
    NotFound,
    /// The storage backend refused or could not complete the operation.
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

impl RepositoryError {
    /// Whether repeating the same statement could succeed.
    ///
    /// Data exceptions (SQLSTATE class 22) and integrity violations (class 23)
    /// fail the same way every time.
    pub fn is_transient(&self) -> bool {
        match self {
            RepositoryError::NotFound => false,
            RepositoryError::Db(e) => !e
                .code()
                .is_some_and(|state| matches!(state.code().get(..2), Some("22" | "23"))),
            RepositoryError::Pool(_) | RepositoryError::Unavailable(_) => true,
        }
    }
}

/// # ZonesRepository
///
/// Read access to the admin-managed delivery zones.
#[async_trait]
pub trait ZonesRepository: Send + Sync {
    /// All zones flagged active.
    async fn list_active(&self) -> Result<Vec<DeliveryZone>, RepositoryError>;
}

/// Outcome of an attempted coupon redemption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Redemption {
    /// The counter moved and a usage row was written.
    Recorded { used_count: i32 },
    /// `used_count` had already reached `global_usage_limit`; nothing written.
    GlobalLimitReached,
    /// The customer already used the coupon `per_customer_limit` times; nothing written.
    PerCustomerLimitReached,
}

/// # CouponsRepository
///
/// Coupon lookups plus the single contended write of the checkout core:
/// [`CouponsRepository::redeem`] must increment `used_count` only while it is
/// below `global_usage_limit`, and must write the usage row in the same
/// atomic unit, so the counter never overshoots under concurrent callers.
#[async_trait]
pub trait CouponsRepository: Send + Sync {
    /// Looks a coupon up by code, ignoring case.
    async fn find_by_code(&self, code: &str) -> Result<Option<Coupon>, RepositoryError>;

    /// Number of usage rows recorded for `(coupon_id, customer_email)`.
    /// Emails compare case-insensitively.
    async fn count_customer_usages(
        &self,
        coupon_id: i64,
        customer_email: &str,
    ) -> Result<i64, RepositoryError>;

    /// Atomically increments `used_count` and inserts `usage`.
    ///
    /// Returns [`RepositoryError::NotFound`] if the coupon does not exist.
    async fn redeem(&self, usage: &CouponUsageRecord) -> Result<Redemption, RepositoryError>;
}

/// Outcome of an idempotent order insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Insertion {
    /// A new row was written.
    Inserted(Order),
    /// A row with the same payment reference or idempotency key already
    /// existed; it is returned unchanged.
    Existing(Order),
}

impl Insertion {
    pub fn order(&self) -> &Order {
        match self {
            Insertion::Inserted(order) | Insertion::Existing(order) => order,
        }
    }

    pub fn into_order(self) -> Order {
        match self {
            Insertion::Inserted(order) | Insertion::Existing(order) => order,
        }
    }
}

/// # OrdersRepository
///
/// Append-only order storage. Both `payment_reference` and
/// `idempotency_key` are unique; inserting a duplicate is a no-op that
/// returns the stored row.
///
/// Also holds the payment claim of each checkout: the first claim written for
/// an idempotency key wins and is never changed.
#[async_trait]
pub trait OrdersRepository: Send + Sync {
    /// Stores `claim` unless a claim for the same key exists, and returns
    /// whichever claim is stored afterwards.
    async fn claim_payment(&self, claim: &PaymentClaim) -> Result<PaymentClaim, RepositoryError>;
    async fn get_payment_claim(
        &self,
        idempotency_key: &str,
    ) -> Result<Option<PaymentClaim>, RepositoryError>;
    async fn insert_if_absent(&self, order: &NewOrder) -> Result<Insertion, RepositoryError>;
    async fn get_by_payment_reference(
        &self,
        payment_reference: &str,
    ) -> Result<Option<Order>, RepositoryError>;
    async fn get_by_idempotency_key(
        &self,
        idempotency_key: &str,
    ) -> Result<Option<Order>, RepositoryError>;
}
