//! PostgreSQL implementations of the repository traits.
//!
//! Each repository holds a deadpool [`Pool`] and checks a connection out
//! per call. Multi-statement writes run inside a single transaction.

use async_trait::async_trait;
use deadpool_postgres::Pool;
use model::{
    AppliedCoupon, Coupon, CouponUsageRecord, CustomerInfo, DeliveryZone, LineItem, NewOrder, Order,
    PaymentClaim, PaymentMethod,
};
use tokio_postgres::types::Json;
use tokio_postgres::Row;
use uuid::Uuid;

use crate::{
    CouponsRepository, Insertion, OrdersRepository, Redemption, RepositoryError, ZonesRepository,
};

/// PostgreSQL implementation of the ZonesRepository trait.
pub struct PgZonesRepository {
    pool: Pool,
}

impl PgZonesRepository {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ZonesRepository for PgZonesRepository {
    async fn list_active(&self) -> Result<Vec<DeliveryZone>, RepositoryError> {
        let query = r#"
            SELECT id, postcode_prefix, area_name, fee, active
            FROM delivery_zones WHERE active
        "#;
        let client = self.pool.get().await?;
        let rows = client.query(query, &[]).await?;
        let mut zones = Vec::with_capacity(rows.len());
        for row in rows {
            zones.push(DeliveryZone {
                id: row.try_get("id")?,
                postcode_prefix: row.try_get("postcode_prefix")?,
                area_name: row.try_get("area_name")?,
                fee: row.try_get("fee")?,
                active: row.try_get("active")?,
            });
        }
        Ok(zones)
    }
}

/// PostgreSQL implementation of the CouponsRepository trait.
///
/// `redeem` relies on a conditional `UPDATE ... WHERE used_count < global_usage_limit`:
/// the row lock it takes serialises concurrent redemptions of the same coupon,
/// and the per-customer re-count runs under that lock.
pub struct PgCouponsRepository {
    pool: Pool,
}

impl PgCouponsRepository {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

fn coupon_from_row(row: &Row) -> Result<Coupon, RepositoryError> {
    Ok(Coupon {
        id: row.try_get("id")?,
        code: row.try_get("code")?,
        discount_percentage: row.try_get("discount_percentage")?,
        valid_from: row.try_get("valid_from")?,
        valid_until: row.try_get("valid_until")?,
        global_usage_limit: row.try_get("global_usage_limit")?,
        used_count: row.try_get("used_count")?,
        per_customer_limit: row.try_get("per_customer_limit")?,
        active: row.try_get("active")?,
    })
}

#[async_trait]
impl CouponsRepository for PgCouponsRepository {
    async fn find_by_code(&self, code: &str) -> Result<Option<Coupon>, RepositoryError> {
        let query = r#"
            SELECT id, code, discount_percentage, valid_from, valid_until,
                   global_usage_limit, used_count, per_customer_limit, active
            FROM coupons WHERE upper(code) = upper($1)
        "#;
        let client = self.pool.get().await?;
        let row = client.query_opt(query, &[&code.trim()]).await?;
        row.as_ref().map(coupon_from_row).transpose()
    }

    async fn count_customer_usages(
        &self,
        coupon_id: i64,
        customer_email: &str,
    ) -> Result<i64, RepositoryError> {
        let query = r#"
            SELECT COUNT(*) AS uses FROM coupon_usages
            WHERE coupon_id = $1 AND lower(customer_email) = lower($2)
        "#;
        let client = self.pool.get().await?;
        let row = client.query_one(query, &[&coupon_id, &customer_email.trim()]).await?;
        Ok(row.try_get("uses")?)
    }

    async fn redeem(&self, usage: &CouponUsageRecord) -> Result<Redemption, RepositoryError> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;

        let bumped = tx
            .query_opt(
                r#"
                UPDATE coupons SET used_count = used_count + 1
                WHERE id = $1 AND used_count < global_usage_limit
                RETURNING used_count, per_customer_limit
                "#,
                &[&usage.coupon_id],
            )
            .await?;

        let Some(bumped) = bumped else {
            let exists = tx
                .query_opt("SELECT 1 FROM coupons WHERE id = $1", &[&usage.coupon_id])
                .await?;
            // Dropping the transaction rolls it back.
            return match exists {
                Some(_) => Ok(Redemption::GlobalLimitReached),
                None => Err(RepositoryError::NotFound),
            };
        };

        let used_count: i32 = bumped.try_get("used_count")?;
        let per_customer_limit: Option<i32> = bumped.try_get("per_customer_limit")?;

        if let Some(limit) = per_customer_limit {
            let row = tx
                .query_one(
                    r#"
                    SELECT COUNT(*) AS uses FROM coupon_usages
                    WHERE coupon_id = $1 AND lower(customer_email) = lower($2)
                    "#,
                    &[&usage.coupon_id, &usage.customer_email.trim()],
                )
                .await?;
            let uses: i64 = row.try_get("uses")?;
            if uses >= i64::from(limit) {
                return Ok(Redemption::PerCustomerLimitReached);
            }
        }

        tx.execute(
            r#"
            INSERT INTO coupon_usages (coupon_id, customer_email, discount_amount, used_at)
            VALUES ($1, $2, $3, $4)
            "#,
            &[
                &usage.coupon_id,
                &usage.customer_email.trim(),
                &usage.discount_amount,
                &usage.used_at,
            ],
        )
        .await?;

        tx.commit().await?;
        Ok(Redemption::Recorded { used_count })
    }
}

/// PostgreSQL implementation of the OrdersRepository trait.
///
/// Line items and the applied coupon are stored as JSONB snapshots.
pub struct PgOrdersRepository {
    pool: Pool,
}

impl PgOrdersRepository {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

const ORDER_COLUMNS: &str = r#"
    id, idempotency_key, payment_reference, customer_name, customer_email,
    customer_phone, customer_address, postcode, delivery_area, line_items,
    subtotal, delivery_fee, discount_amount, coupon, total, currency, status, created_at
"#;

fn order_from_row(row: &Row) -> Result<Order, RepositoryError> {
    let line_items: Json<Vec<LineItem>> = row.try_get("line_items")?;
    let coupon: Option<Json<AppliedCoupon>> = row.try_get("coupon")?;
    Ok(Order {
        id: row.try_get("id")?,
        idempotency_key: row.try_get("idempotency_key")?,
        payment_reference: row.try_get("payment_reference")?,
        customer: CustomerInfo {
            name: row.try_get("customer_name")?,
            email: row.try_get("customer_email")?,
            phone: row.try_get("customer_phone")?,
            address: row.try_get("customer_address")?,
        },
        postcode: row.try_get("postcode")?,
        delivery_area: row.try_get("delivery_area")?,
        line_items: line_items.0,
        subtotal: row.try_get("subtotal")?,
        delivery_fee: row.try_get("delivery_fee")?,
        discount_amount: row.try_get("discount_amount")?,
        coupon: coupon.map(|c| c.0),
        total: row.try_get("total")?,
        currency: row.try_get("currency")?,
        status: row.try_get("status")?,
        created_at: row.try_get("created_at")?,
    })
}

fn claim_from_row(row: &Row) -> Result<PaymentClaim, RepositoryError> {
    let method: String = row.try_get("method")?;
    Ok(PaymentClaim {
        idempotency_key: row.try_get("idempotency_key")?,
        method: method
            .parse::<PaymentMethod>()
            .map_err(RepositoryError::Unavailable)?,
        amount: row.try_get("amount_minor")?,
        currency: row.try_get("currency")?,
    })
}

const CLAIM_QUERY: &str = r#"
    SELECT idempotency_key, method, amount_minor, currency
    FROM payment_claims WHERE idempotency_key = $1
"#;

#[async_trait]
impl OrdersRepository for PgOrdersRepository {
    async fn claim_payment(&self, claim: &PaymentClaim) -> Result<PaymentClaim, RepositoryError> {
        let client = self.pool.get().await?;
        client
            .execute(
                r#"
                INSERT INTO payment_claims (idempotency_key, method, amount_minor, currency)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (idempotency_key) DO NOTHING
                "#,
                &[
                    &claim.idempotency_key,
                    &claim.method.as_str(),
                    &claim.amount,
                    &claim.currency,
                ],
            )
            .await?;
        // Claims are never updated, so the row read back is the winner.
        let row = client.query_one(CLAIM_QUERY, &[&claim.idempotency_key]).await?;
        claim_from_row(&row)
    }

    async fn get_payment_claim(
        &self,
        idempotency_key: &str,
    ) -> Result<Option<PaymentClaim>, RepositoryError> {
        let client = self.pool.get().await?;
        let row = client.query_opt(CLAIM_QUERY, &[&idempotency_key]).await?;
        row.as_ref().map(claim_from_row).transpose()
    }

    async fn insert_if_absent(&self, order: &NewOrder) -> Result<Insertion, RepositoryError> {
        let query = r#"
            INSERT INTO orders (
                id, idempotency_key, payment_reference, customer_name, customer_email,
                customer_phone, customer_address, postcode, delivery_area, line_items,
                subtotal, delivery_fee, discount_amount, coupon, total, currency
            ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16)
            ON CONFLICT DO NOTHING
            RETURNING created_at
        "#;
        let id = Uuid::new_v4();
        let client = self.pool.get().await?;
        let inserted = client
            .query_opt(
                query,
                &[
                    &id,
                    &order.idempotency_key,
                    &order.payment_reference,
                    &order.customer.name,
                    &order.customer.email,
                    &order.customer.phone,
                    &order.customer.address,
                    &order.postcode,
                    &order.delivery_area,
                    &Json(&order.line_items),
                    &order.subtotal,
                    &order.delivery_fee,
                    &order.discount_amount,
                    &order.coupon.as_ref().map(Json),
                    &order.total,
                    &order.currency,
                ],
            )
            .await?;

        if let Some(row) = inserted {
            let created_at = row.try_get("created_at")?;
            return Ok(Insertion::Inserted(Order::from_new(order.clone(), id, created_at)));
        }

        let existing = client
            .query_opt(
                &format!(
                    "SELECT {ORDER_COLUMNS} FROM orders
                     WHERE payment_reference = $1 OR idempotency_key = $2
                     LIMIT 1"
                ),
                &[&order.payment_reference, &order.idempotency_key],
            )
            .await?;
        match existing {
            Some(row) => Ok(Insertion::Existing(order_from_row(&row)?)),
            None => Err(RepositoryError::NotFound),
        }
    }

    async fn get_by_payment_reference(
        &self,
        payment_reference: &str,
    ) -> Result<Option<Order>, RepositoryError> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                &format!("SELECT {ORDER_COLUMNS} FROM orders WHERE payment_reference = $1"),
                &[&payment_reference],
            )
            .await?;
        row.as_ref().map(order_from_row).transpose()
    }

    async fn get_by_idempotency_key(
        &self,
        idempotency_key: &str,
    ) -> Result<Option<Order>, RepositoryError> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                &format!("SELECT {ORDER_COLUMNS} FROM orders WHERE idempotency_key = $1"),
                &[&idempotency_key],
            )
            .await?;
        row.as_ref().map(order_from_row).transpose()
    }
}
