//! In-memory implementations of the repository traits.
//!
//! They keep the same guarantees as the PostgreSQL versions (atomic
//! conditional redemption, idempotent order insert) by holding a single
//! lock across each check-and-write. Used by tests and for running the
//! service without a database.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use model::{Coupon, CouponUsageRecord, DeliveryZone, NewOrder, Order, PaymentClaim};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::{
    CouponsRepository, Insertion, OrdersRepository, Redemption, RepositoryError, ZonesRepository,
};

/// Thread-safe in-memory zone table.
#[derive(Debug, Default)]
pub struct MemoryZonesRepository {
    zones: RwLock<Vec<DeliveryZone>>,
}

impl MemoryZonesRepository {
    pub fn new(zones: Vec<DeliveryZone>) -> Self {
        Self {
            zones: RwLock::new(zones),
        }
    }

    /// Replace the zone table.
    pub async fn set(&self, zones: Vec<DeliveryZone>) {
        *self.zones.write().await = zones;
    }
}

#[async_trait]
impl ZonesRepository for MemoryZonesRepository {
    async fn list_active(&self) -> Result<Vec<DeliveryZone>, RepositoryError> {
        let zones = self.zones.read().await;
        Ok(zones.iter().filter(|z| z.active).cloned().collect())
    }
}

#[derive(Debug, Default)]
struct CouponTable {
    coupons: HashMap<i64, Coupon>,
    usages: Vec<CouponUsageRecord>,
}

impl CouponTable {
    fn customer_usages(&self, coupon_id: i64, customer_email: &str) -> i64 {
        let email = customer_email.trim();
        self.usages
            .iter()
            .filter(|u| u.coupon_id == coupon_id && u.customer_email.eq_ignore_ascii_case(email))
            .count() as i64
    }
}

/// Thread-safe in-memory coupon table with its usage ledger.
#[derive(Debug, Default)]
pub struct MemoryCouponsRepository {
    inner: Mutex<CouponTable>,
}

impl MemoryCouponsRepository {
    pub fn new(coupons: Vec<Coupon>) -> Self {
        let coupons = coupons.into_iter().map(|c| (c.id, c)).collect();
        Self {
            inner: Mutex::new(CouponTable {
                coupons,
                usages: Vec::new(),
            }),
        }
    }

    /// Current state of a coupon row.
    pub async fn get(&self, coupon_id: i64) -> Option<Coupon> {
        self.inner.lock().await.coupons.get(&coupon_id).cloned()
    }

    /// Insert or replace a coupon row, as the back-office would.
    pub async fn upsert(&self, coupon: Coupon) {
        self.inner.lock().await.coupons.insert(coupon.id, coupon);
    }

    /// Every usage row recorded for a coupon.
    pub async fn usages(&self, coupon_id: i64) -> Vec<CouponUsageRecord> {
        let table = self.inner.lock().await;
        table
            .usages
            .iter()
            .filter(|u| u.coupon_id == coupon_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl CouponsRepository for MemoryCouponsRepository {
    async fn find_by_code(&self, code: &str) -> Result<Option<Coupon>, RepositoryError> {
        let code = code.trim();
        let table = self.inner.lock().await;
        Ok(table
            .coupons
            .values()
            .find(|c| c.code.eq_ignore_ascii_case(code))
            .cloned())
    }

    async fn count_customer_usages(
        &self,
        coupon_id: i64,
        customer_email: &str,
    ) -> Result<i64, RepositoryError> {
        Ok(self.inner.lock().await.customer_usages(coupon_id, customer_email))
    }

    async fn redeem(&self, usage: &CouponUsageRecord) -> Result<Redemption, RepositoryError> {
        let mut table = self.inner.lock().await;
        let uses = table.customer_usages(usage.coupon_id, &usage.customer_email);

        let coupon = table
            .coupons
            .get_mut(&usage.coupon_id)
            .ok_or(RepositoryError::NotFound)?;
        if coupon.used_count >= coupon.global_usage_limit {
            return Ok(Redemption::GlobalLimitReached);
        }
        if coupon
            .per_customer_limit
            .is_some_and(|limit| uses >= i64::from(limit))
        {
            return Ok(Redemption::PerCustomerLimitReached);
        }

        coupon.used_count += 1;
        let used_count = coupon.used_count;
        table.usages.push(usage.clone());
        Ok(Redemption::Recorded { used_count })
    }
}

/// Thread-safe in-memory order table keyed by payment reference, plus the
/// payment claims keyed by idempotency key.
#[derive(Debug, Default)]
pub struct MemoryOrdersRepository {
    inner: RwLock<HashMap<String, Order>>,
    claims: Mutex<HashMap<String, PaymentClaim>>,
}

impl MemoryOrdersRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored orders.
    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }

    /// Snapshot of every stored order.
    pub async fn all(&self) -> Vec<Order> {
        self.inner.read().await.values().cloned().collect()
    }
}

#[async_trait]
impl OrdersRepository for MemoryOrdersRepository {
    async fn claim_payment(&self, claim: &PaymentClaim) -> Result<PaymentClaim, RepositoryError> {
        let mut claims = self.claims.lock().await;
        Ok(claims
            .entry(claim.idempotency_key.clone())
            .or_insert_with(|| claim.clone())
            .clone())
    }

    async fn get_payment_claim(
        &self,
        idempotency_key: &str,
    ) -> Result<Option<PaymentClaim>, RepositoryError> {
        Ok(self.claims.lock().await.get(idempotency_key).cloned())
    }

    async fn insert_if_absent(&self, order: &NewOrder) -> Result<Insertion, RepositoryError> {
        let mut map = self.inner.write().await;
        if let Some(existing) = map.get(&order.payment_reference).or_else(|| {
            map.values()
                .find(|o| o.idempotency_key == order.idempotency_key)
        }) {
            return Ok(Insertion::Existing(existing.clone()));
        }

        let stored = Order::from_new(order.clone(), Uuid::new_v4(), Utc::now());
        map.insert(stored.payment_reference.clone(), stored.clone());
        Ok(Insertion::Inserted(stored))
    }

    async fn get_by_payment_reference(
        &self,
        payment_reference: &str,
    ) -> Result<Option<Order>, RepositoryError> {
        Ok(self.inner.read().await.get(payment_reference).cloned())
    }

    async fn get_by_idempotency_key(
        &self,
        idempotency_key: &str,
    ) -> Result<Option<Order>, RepositoryError> {
        let map = self.inner.read().await;
        Ok(map
            .values()
            .find(|o| o.idempotency_key == idempotency_key)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use model::{CustomerInfo, PaymentMethod};
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    fn coupon(limit: i32, per_customer: Option<i32>) -> Coupon {
        Coupon {
            id: 1,
            code: "SAVE10".to_string(),
            discount_percentage: dec!(10),
            valid_from: Utc::now() - Duration::days(1),
            valid_until: Utc::now() + Duration::days(1),
            global_usage_limit: limit,
            used_count: 0,
            per_customer_limit: per_customer,
            active: true,
        }
    }

    fn usage(email: &str) -> CouponUsageRecord {
        CouponUsageRecord {
            coupon_id: 1,
            customer_email: email.to_string(),
            discount_amount: dec!(5.00),
            used_at: Utc::now(),
        }
    }

    fn new_order(key: &str, reference: &str) -> NewOrder {
        NewOrder {
            idempotency_key: key.to_string(),
            payment_reference: reference.to_string(),
            customer: CustomerInfo {
                name: "Test User".to_string(),
                email: "test@example.com".to_string(),
                phone: "+441234567890".to_string(),
                address: "Street".to_string(),
            },
            postcode: "HU1 2AB".to_string(),
            delivery_area: "Hull City Centre".to_string(),
            line_items: Vec::new(),
            subtotal: dec!(50.00),
            delivery_fee: dec!(5.00),
            discount_amount: dec!(0.00),
            coupon: None,
            total: dec!(55.00),
            currency: "GBP".to_string(),
        }
    }

    #[tokio::test]
    async fn test_find_by_code_ignores_case() {
        let repo = MemoryCouponsRepository::new(vec![coupon(5, None)]);
        assert!(repo.find_by_code(" save10 ").await.unwrap().is_some());
        assert!(repo.find_by_code("SAVE20").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_redeem_stops_at_global_limit() {
        let repo = MemoryCouponsRepository::new(vec![coupon(2, None)]);
        for email in ["a@x.com", "b@x.com"] {
            assert!(matches!(
                repo.redeem(&usage(email)).await.unwrap(),
                Redemption::Recorded { .. }
            ));
        }
        assert_eq!(
            repo.redeem(&usage("c@x.com")).await.unwrap(),
            Redemption::GlobalLimitReached
        );
        assert_eq!(repo.get(1).await.unwrap().used_count, 2);
        assert_eq!(repo.usages(1).await.len(), 2);
    }

    #[tokio::test]
    async fn test_redeem_enforces_per_customer_limit_case_insensitively() {
        let repo = MemoryCouponsRepository::new(vec![coupon(10, Some(1))]);
        repo.redeem(&usage("Alice@Example.com")).await.unwrap();
        assert_eq!(
            repo.redeem(&usage("alice@example.com")).await.unwrap(),
            Redemption::PerCustomerLimitReached
        );
        assert_eq!(repo.count_customer_usages(1, "ALICE@EXAMPLE.COM").await.unwrap(), 1);
        assert_eq!(repo.get(1).await.unwrap().used_count, 1);
    }

    #[tokio::test]
    async fn test_redeem_unknown_coupon_is_not_found() {
        let repo = MemoryCouponsRepository::default();
        assert!(matches!(
            repo.redeem(&usage("a@x.com")).await,
            Err(RepositoryError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_concurrent_redemptions_never_overshoot() {
        let repo = Arc::new(MemoryCouponsRepository::new(vec![coupon(25, None)]));
        let mut handles = Vec::new();
        for i in 0..100 {
            let repo = repo.clone();
            handles.push(tokio::spawn(async move {
                repo.redeem(&usage(&format!("c{i}@x.com"))).await.unwrap()
            }));
        }
        let mut recorded = 0;
        for handle in handles {
            if matches!(handle.await.unwrap(), Redemption::Recorded { .. }) {
                recorded += 1;
            }
        }
        assert_eq!(recorded, 25);
        assert_eq!(repo.get(1).await.unwrap().used_count, 25);
        assert_eq!(repo.usages(1).await.len(), 25);
    }

    #[tokio::test]
    async fn test_insert_if_absent_is_idempotent() {
        let repo = MemoryOrdersRepository::new();
        let first = repo.insert_if_absent(&new_order("k1", "pi_1")).await.unwrap();
        assert!(matches!(first, Insertion::Inserted(_)));

        let again = repo.insert_if_absent(&new_order("k1", "pi_1")).await.unwrap();
        assert!(matches!(again, Insertion::Existing(_)));
        assert_eq!(again.order().id, first.order().id);

        // Same idempotency key under a different reference still resolves to the stored row.
        let other_ref = repo.insert_if_absent(&new_order("k1", "pi_2")).await.unwrap();
        assert_eq!(other_ref.into_order().id, first.order().id);
        assert_eq!(repo.len().await, 1);
    }

    #[tokio::test]
    async fn test_lookups_by_reference_and_key() {
        let repo = MemoryOrdersRepository::new();
        repo.insert_if_absent(&new_order("k9", "pi_9")).await.unwrap();
        assert!(repo.get_by_payment_reference("pi_9").await.unwrap().is_some());
        assert!(repo.get_by_idempotency_key("k9").await.unwrap().is_some());
        assert!(repo.get_by_idempotency_key("k10").await.unwrap().is_none());
    }

    fn claim(key: &str, method: PaymentMethod) -> PaymentClaim {
        PaymentClaim {
            idempotency_key: key.to_string(),
            method,
            amount: 5500,
            currency: "GBP".to_string(),
        }
    }

    #[tokio::test]
    async fn test_first_payment_claim_wins() {
        let repo = MemoryOrdersRepository::new();
        assert!(repo.get_payment_claim("k1").await.unwrap().is_none());

        let first = repo.claim_payment(&claim("k1", PaymentMethod::Direct)).await.unwrap();
        assert_eq!(first.method, PaymentMethod::Direct);

        let second = repo.claim_payment(&claim("k1", PaymentMethod::Intent)).await.unwrap();
        assert_eq!(second.method, PaymentMethod::Direct);
        assert_eq!(
            repo.get_payment_claim("k1").await.unwrap().map(|c| c.method),
            Some(PaymentMethod::Direct)
        );
    }

    #[test]
    fn test_transient_error_classification() {
        assert!(!RepositoryError::NotFound.is_transient());
        assert!(RepositoryError::Unavailable("connection reset".to_string()).is_transient());
    }

    #[tokio::test]
    async fn test_zones_list_only_active() {
        let repo = MemoryZonesRepository::new(vec![
            DeliveryZone {
                id: 1,
                postcode_prefix: "HU".to_string(),
                area_name: "Hull".to_string(),
                fee: dec!(6.00),
                active: true,
            },
            DeliveryZone {
                id: 2,
                postcode_prefix: "YO".to_string(),
                area_name: "York".to_string(),
                fee: dec!(9.00),
                active: false,
            },
        ]);
        let zones = repo.list_active().await.unwrap();
        assert_eq!(zones.len(), 1);
        assert_eq!(zones[0].postcode_prefix, "HU");
    }
}
