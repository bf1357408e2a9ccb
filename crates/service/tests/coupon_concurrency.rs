use std::sync::Arc;

use chrono::Utc;
use model::Coupon;
use proptest::prelude::*;
use repository::MemoryCouponsRepository;
use rust_decimal_macros::dec;
use service::{CouponError, CouponUsageTracker};

fn coupon(limit: i32, per_customer: Option<i32>) -> Coupon {
    let now = Utc::now();
    Coupon {
        id: 7,
        code: "RUSH".to_string(),
        discount_percentage: dec!(15),
        valid_from: now - chrono::Duration::hours(1),
        valid_until: now + chrono::Duration::hours(1),
        global_usage_limit: limit,
        used_count: 0,
        per_customer_limit: per_customer,
        active: true,
    }
}

/// Fires `contenders` concurrent commits, customer `i % customers`.
fn race(
    limit: i32,
    per_customer: Option<i32>,
    contenders: usize,
    customers: usize,
) -> (Coupon, usize, usize) {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .unwrap();

    rt.block_on(async {
        let repo = Arc::new(MemoryCouponsRepository::new(vec![coupon(limit, per_customer)]));
        let tracker = Arc::new(CouponUsageTracker::new(repo.clone()));

        let handles: Vec<_> = (0..contenders)
            .map(|i| {
                let tracker = tracker.clone();
                let email = format!("c{}@example.com", i % customers);
                tokio::spawn(async move { tracker.commit(7, &email, dec!(1.50)).await })
            })
            .collect();

        let mut ok = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(()) => ok += 1,
                Err(CouponError::GlobalLimitReached | CouponError::PerCustomerLimitReached) => {}
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        let rows = repo.usages(7).await.len();
        (repo.get(7).await.unwrap(), ok, rows)
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn used_count_never_exceeds_global_limit(limit in 0i32..25, contenders in 0usize..80) {
        let (coupon, ok, rows) = race(limit, None, contenders, contenders.max(1));
        prop_assert!(coupon.used_count <= coupon.global_usage_limit);
        prop_assert_eq!(coupon.used_count as usize, ok);
        prop_assert_eq!(rows, ok);
        prop_assert_eq!(ok, contenders.min(limit as usize));
    }

    #[test]
    fn per_customer_limit_holds_under_contention(
        limit in 1i32..40,
        per_customer in 1i32..4,
        customers in 1usize..6,
        contenders in 0usize..60,
    ) {
        let (coupon, ok, rows) = race(limit, Some(per_customer), contenders, customers);
        prop_assert!(coupon.used_count <= coupon.global_usage_limit);
        prop_assert_eq!(rows, ok);
        let cap = customers * per_customer as usize;
        prop_assert!(ok <= cap);
        prop_assert_eq!(ok, contenders.min(cap).min(limit as usize));
    }
}
