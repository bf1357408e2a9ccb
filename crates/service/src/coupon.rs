//! Coupon eligibility checks and redemption bookkeeping.
//!
//! Validation never writes. The usage counter only moves in
//! [`CouponUsageTracker::commit`], after the order exists.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use model::{AppliedCoupon, Coupon, CouponUsageRecord, money};
use repository::{CouponsRepository, Redemption, RepositoryError};
use rust_decimal::Decimal;
use tracing::{info, instrument};

use crate::error::CouponError;

/// `subtotal * percentage / 100`, rounded to pence and capped at `subtotal`.
pub fn discount_for(subtotal: Decimal, percentage: Decimal) -> Decimal {
    let percentage = percentage.clamp(Decimal::ZERO, Decimal::ONE_HUNDRED);
    let raw = subtotal
        .checked_mul(percentage)
        .map_or(subtotal, |v| money(v / Decimal::ONE_HUNDRED));
    money(raw.min(subtotal).max(Decimal::ZERO))
}

/// Read-only coupon eligibility check.
pub struct CouponValidator<C: ?Sized> {
    coupons: Arc<C>,
}

impl<C> CouponValidator<C>
where
    C: CouponsRepository + ?Sized,
{
    pub fn new(coupons: Arc<C>) -> Self {
        Self { coupons }
    }

    /// Validates `code` for this customer at the current time.
    pub async fn validate(
        &self,
        code: &str,
        subtotal: Decimal,
        customer_email: &str,
    ) -> Result<AppliedCoupon, CouponError> {
        self.validate_at(code, subtotal, customer_email, Utc::now())
            .await
    }

    /// Checks run in a fixed order and the first failure wins:
    /// existence and activity, window, global cap, per-customer cap.
    #[instrument(skip(self, subtotal, now), fields(code = %code))]
    pub async fn validate_at(
        &self,
        code: &str,
        subtotal: Decimal,
        customer_email: &str,
        now: DateTime<Utc>,
    ) -> Result<AppliedCoupon, CouponError> {
        let coupon = self
            .coupons
            .find_by_code(code.trim())
            .await?
            .filter(|c| c.active)
            .ok_or(CouponError::NotFound)?;

        if now < coupon.valid_from || now > coupon.valid_until {
            return Err(CouponError::Expired);
        }

        if coupon.used_count >= coupon.global_usage_limit {
            return Err(CouponError::GlobalLimitReached);
        }

        if let Some(limit) = coupon.per_customer_limit {
            let used = self
                .coupons
                .count_customer_usages(coupon.id, customer_email)
                .await?;
            if used >= i64::from(limit) {
                return Err(CouponError::PerCustomerLimitReached);
            }
        }

        Ok(applied(&coupon, subtotal))
    }
}

fn applied(coupon: &Coupon, subtotal: Decimal) -> AppliedCoupon {
    AppliedCoupon {
        coupon_id: coupon.id,
        code: coupon.code.clone(),
        discount_percentage: coupon.discount_percentage,
        discount_amount: discount_for(subtotal, coupon.discount_percentage),
    }
}

/// Records a redemption once the order it belongs to is persisted.
pub struct CouponUsageTracker<C: ?Sized> {
    coupons: Arc<C>,
}

impl<C> CouponUsageTracker<C>
where
    C: CouponsRepository + ?Sized,
{
    pub fn new(coupons: Arc<C>) -> Self {
        Self { coupons }
    }

    /// Atomically bumps `used_count` and writes the usage row.
    ///
    /// A cap reached between validation and commit comes back as
    /// [`CouponError::GlobalLimitReached`] or
    /// [`CouponError::PerCustomerLimitReached`]; nothing is written then.
    #[instrument(skip(self, discount_amount))]
    pub async fn commit(
        &self,
        coupon_id: i64,
        customer_email: &str,
        discount_amount: Decimal,
    ) -> Result<(), CouponError> {
        let usage = CouponUsageRecord {
            coupon_id,
            customer_email: customer_email.to_string(),
            discount_amount: money(discount_amount),
            used_at: Utc::now(),
        };

        match self.coupons.redeem(&usage).await {
            Ok(Redemption::Recorded { used_count }) => {
                info!(used_count, "Coupon redemption recorded");
                Ok(())
            }
            Ok(Redemption::GlobalLimitReached) => Err(CouponError::GlobalLimitReached),
            Ok(Redemption::PerCustomerLimitReached) => Err(CouponError::PerCustomerLimitReached),
            Err(RepositoryError::NotFound) => Err(CouponError::NotFound),
            Err(e) => Err(CouponError::Storage(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use repository::MemoryCouponsRepository;
    use rust_decimal_macros::dec;

    fn coupon(code: &str, pct: Decimal, limit: i32, used: i32, per_customer: Option<i32>) -> Coupon {
        let now = Utc::now();
        Coupon {
            id: 1,
            code: code.to_string(),
            discount_percentage: pct,
            valid_from: now - Duration::days(1),
            valid_until: now + Duration::days(30),
            global_usage_limit: limit,
            used_count: used,
            per_customer_limit: per_customer,
            active: true,
        }
    }

    fn setup(c: Coupon) -> (Arc<MemoryCouponsRepository>, CouponValidator<MemoryCouponsRepository>) {
        let repo = Arc::new(MemoryCouponsRepository::new(vec![c]));
        (repo.clone(), CouponValidator::new(repo))
    }

    #[test]
    fn test_discount_is_capped_at_subtotal() {
        assert_eq!(discount_for(dec!(50), dec!(10)), dec!(5.00));
        assert_eq!(discount_for(dec!(19.99), dec!(15)), dec!(3.00));
        assert_eq!(discount_for(dec!(20), dec!(150)), dec!(20.00));
        assert_eq!(discount_for(dec!(20), dec!(-10)), dec!(0.00));
    }

    #[test]
    fn test_discount_on_extreme_subtotal_does_not_overflow() {
        assert_eq!(discount_for(Decimal::MAX, dec!(50)), money(Decimal::MAX));
    }

    #[tokio::test]
    async fn test_valid_coupon_yields_snapshot() {
        let (_, validator) = setup(coupon("SAVE10", dec!(10), 100, 0, None));
        let applied = validator
            .validate("save10", dec!(50), "a@example.com")
            .await
            .unwrap();
        assert_eq!(applied.code, "SAVE10");
        assert_eq!(applied.discount_amount.to_string(), "5.00");
    }

    #[tokio::test]
    async fn test_unknown_and_inactive_are_not_found() {
        let (repo, validator) = setup(coupon("SAVE10", dec!(10), 100, 0, None));
        assert!(matches!(
            validator.validate("NOPE", dec!(50), "a@example.com").await,
            Err(CouponError::NotFound)
        ));

        let mut inactive = coupon("SAVE10", dec!(10), 100, 0, None);
        inactive.active = false;
        repo.upsert(inactive).await;
        assert!(matches!(
            validator.validate("SAVE10", dec!(50), "a@example.com").await,
            Err(CouponError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_outside_window_is_expired() {
        let c = coupon("SAVE10", dec!(10), 100, 0, None);
        let later = c.valid_until + Duration::seconds(1);
        let earlier = c.valid_from - Duration::seconds(1);
        let (_, validator) = setup(c);
        for at in [later, earlier] {
            assert!(matches!(
                validator
                    .validate_at("SAVE10", dec!(50), "a@example.com", at)
                    .await,
                Err(CouponError::Expired)
            ));
        }
    }

    #[tokio::test]
    async fn test_expiry_is_checked_before_global_cap() {
        let c = coupon("SAVE10", dec!(10), 1, 1, None);
        let later = c.valid_until + Duration::days(1);
        let (_, validator) = setup(c);
        assert!(matches!(
            validator
                .validate_at("SAVE10", dec!(50), "a@example.com", later)
                .await,
            Err(CouponError::Expired)
        ));
    }

    #[tokio::test]
    async fn test_exhausted_global_cap() {
        let (_, validator) = setup(coupon("SAVE10", dec!(10), 100, 100, None));
        assert!(matches!(
            validator.validate("SAVE10", dec!(50), "a@example.com").await,
            Err(CouponError::GlobalLimitReached)
        ));
    }

    #[tokio::test]
    async fn test_per_customer_cap_counts_usage_rows() {
        let (repo, validator) = setup(coupon("ONCE", dec!(20), 100, 0, Some(1)));
        let tracker = CouponUsageTracker::new(repo.clone());

        validator
            .validate("ONCE", dec!(30), "a@example.com")
            .await
            .unwrap();
        tracker.commit(1, "a@example.com", dec!(6)).await.unwrap();

        assert!(matches!(
            validator.validate("ONCE", dec!(30), "A@Example.com").await,
            Err(CouponError::PerCustomerLimitReached)
        ));
        assert!(
            validator
                .validate("ONCE", dec!(30), "b@example.com")
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn test_validation_has_no_side_effects() {
        let (repo, validator) = setup(coupon("SAVE10", dec!(10), 100, 0, None));
        for _ in 0..3 {
            validator
                .validate("SAVE10", dec!(50), "a@example.com")
                .await
                .unwrap();
        }
        assert_eq!(repo.get(1).await.unwrap().used_count, 0);
        assert!(repo.usages(1).await.is_empty());
    }

    #[tokio::test]
    async fn test_commit_reports_late_global_limit() {
        let (repo, _) = setup(coupon("LAST", dec!(10), 1, 0, None));
        let tracker = CouponUsageTracker::new(repo.clone());
        tracker.commit(1, "a@example.com", dec!(1)).await.unwrap();
        assert!(matches!(
            tracker.commit(1, "b@example.com", dec!(1)).await,
            Err(CouponError::GlobalLimitReached)
        ));
        assert_eq!(repo.get(1).await.unwrap().used_count, 1);
        assert_eq!(repo.usages(1).await.len(), 1);
    }

    #[tokio::test]
    async fn test_commit_unknown_coupon() {
        let (repo, _) = setup(coupon("SAVE10", dec!(10), 100, 0, None));
        let tracker = CouponUsageTracker::new(repo);
        assert!(matches!(
            tracker.commit(42, "a@example.com", dec!(1)).await,
            Err(CouponError::NotFound)
        ));
    }
}
