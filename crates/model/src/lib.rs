//! Domain types shared by every layer of the checkout backend.
//!
//! Money is carried as [`Decimal`] with two fraction digits everywhere except
//! at the payment gateway boundary, where it is converted to minor units.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use postgres_types::{FromSql, ToSql};
use rust_decimal::{Decimal, RoundingStrategy};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Largest amount a money column can hold (`NUMERIC(10, 2)`): 99,999,999.99.
pub const MAX_ORDER_TOTAL: Decimal = Decimal::from_parts(0x540B_E3FF, 2, 0, false, 2);

/// Cart arithmetic left the representable range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("amount is out of range")]
pub struct AmountOutOfRange;

/// Rounds an amount to pence and pins the scale to two fraction digits,
/// so `50` is stored and rendered as `50.00`.
pub fn money(amount: Decimal) -> Decimal {
    let mut rounded = amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
    rounded.rescale(2);
    rounded
}

/// Converts a decimal amount into integer minor units (pence, cents).
///
/// Returns `None` for amounts that do not fit in an `i64`.
pub fn to_minor_units(amount: Decimal) -> Option<i64> {
    use rust_decimal::prelude::ToPrimitive;
    money(amount).checked_mul(Decimal::ONE_HUNDRED)?.to_i64()
}

/// CartLine - a single line of the client-side cart.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CartLine {
    #[serde(rename = "product_id")]
    pub product_id: i64,
    pub name: String,
    #[serde(rename = "unit_price")]
    pub unit_price: Decimal,
    pub quantity: u32,
    #[serde(rename = "spice_level", default)]
    pub spice_level: Option<String>,
    #[serde(default)]
    pub note: Option<String>,
}

impl CartLine {
    pub fn line_total(&self) -> Result<Decimal, AmountOutOfRange> {
        self.unit_price
            .checked_mul(Decimal::from(self.quantity))
            .ok_or(AmountOutOfRange)
    }
}

/// CustomerInfo - who the order is for and where it goes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CustomerInfo {
    pub name: String,
    pub email: String,
    pub phone: String,
    pub address: String,
}

/// LineItem - immutable snapshot of a cart line stored on the order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LineItem {
    #[serde(rename = "product_id")]
    pub product_id: i64,
    pub name: String,
    #[serde(rename = "unit_price")]
    pub unit_price: Decimal,
    pub quantity: u32,
    #[serde(rename = "spice_level")]
    pub spice_level: Option<String>,
    pub note: Option<String>,
    #[serde(rename = "line_total")]
    pub line_total: Decimal,
}

impl TryFrom<&CartLine> for LineItem {
    type Error = AmountOutOfRange;

    fn try_from(line: &CartLine) -> Result<Self, Self::Error> {
        Ok(Self {
            product_id: line.product_id,
            name: line.name.clone(),
            unit_price: money(line.unit_price),
            quantity: line.quantity,
            spice_level: line.spice_level.clone(),
            note: line.note.clone(),
            line_total: money(line.line_total()?),
        })
    }
}

/// DeliveryZone - a postcode-prefix-keyed delivery fee rule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeliveryZone {
    pub id: i64,
    #[serde(rename = "postcode_prefix")]
    pub postcode_prefix: String,
    #[serde(rename = "area_name")]
    pub area_name: String,
    pub fee: Decimal,
    pub active: bool,
}

/// DeliveryQuote - result of a postcode lookup.
///
/// `matched == false` means the postcode is outside every known zone and the
/// default fee was applied.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeliveryQuote {
    pub fee: Decimal,
    #[serde(rename = "zone_name")]
    pub zone_name: String,
    pub matched: bool,
}

/// Coupon - admin-managed discount code.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Coupon {
    pub id: i64,
    pub code: String,
    #[serde(rename = "discount_percentage")]
    pub discount_percentage: Decimal,
    #[serde(rename = "valid_from")]
    pub valid_from: DateTime<Utc>,
    #[serde(rename = "valid_until")]
    pub valid_until: DateTime<Utc>,
    #[serde(rename = "global_usage_limit")]
    pub global_usage_limit: i32,
    #[serde(rename = "used_count")]
    pub used_count: i32,
    /// `None` means unlimited uses per customer.
    #[serde(rename = "per_customer_limit")]
    pub per_customer_limit: Option<i32>,
    pub active: bool,
}

/// AppliedCoupon - snapshot of a validated coupon, copied onto the order.
///
/// Later edits to the coupon row never change an order that carries this.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppliedCoupon {
    #[serde(rename = "coupon_id")]
    pub coupon_id: i64,
    pub code: String,
    #[serde(rename = "discount_percentage")]
    pub discount_percentage: Decimal,
    #[serde(rename = "discount_amount")]
    pub discount_amount: Decimal,
}

/// CouponUsageRecord - one row per redemption.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CouponUsageRecord {
    #[serde(rename = "coupon_id")]
    pub coupon_id: i64,
    #[serde(rename = "customer_email")]
    pub customer_email: String,
    #[serde(rename = "discount_amount")]
    pub discount_amount: Decimal,
    #[serde(rename = "used_at")]
    pub used_at: DateTime<Utc>,
}

/// Terminal and intermediate states of a payment attempt.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Created,
    Confirmed,
    Failed,
}

/// How a checkout moves money at the gateway.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    /// Create an intent, then confirm it with the card.
    Intent,
    /// Tokenize and charge in one call.
    Direct,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Intent => "intent",
            PaymentMethod::Direct => "direct",
        }
    }
}

impl fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "intent" => Ok(PaymentMethod::Intent),
            "direct" => Ok(PaymentMethod::Direct),
            other => Err(format!("unknown payment method '{other}'")),
        }
    }
}

/// PaymentClaim - the payment method and amount fixed for an idempotency key
/// before any money moves. Every retry of the checkout reuses it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PaymentClaim {
    #[serde(rename = "idempotency_key")]
    pub idempotency_key: String,
    pub method: PaymentMethod,
    /// Amount in minor units.
    pub amount: i64,
    pub currency: String,
}

/// PaymentAttempt - the gateway's record of a chargeable attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PaymentAttempt {
    #[serde(rename = "gateway_reference")]
    pub gateway_reference: String,
    /// Amount in minor units.
    pub amount: i64,
    pub currency: String,
    pub status: PaymentStatus,
    pub metadata: BTreeMap<String, String>,
}

/// Lifecycle of a persisted order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, ToSql, FromSql)]
#[serde(rename_all = "snake_case")]
#[postgres(name = "order_status")]
pub enum OrderStatus {
    #[postgres(name = "processing")]
    Processing,
    #[postgres(name = "shipped")]
    Shipped,
    #[postgres(name = "delivered")]
    Delivered,
    #[postgres(name = "cancelled")]
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Processing => "processing",
            OrderStatus::Shipped => "shipped",
            OrderStatus::Delivered => "delivered",
            OrderStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "processing" => Ok(OrderStatus::Processing),
            "shipped" => Ok(OrderStatus::Shipped),
            "delivered" => Ok(OrderStatus::Delivered),
            "cancelled" => Ok(OrderStatus::Cancelled),
            other => Err(format!("unknown order status '{other}'")),
        }
    }
}

/// NewOrder - everything known about an order at the moment payment clears.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewOrder {
    #[serde(rename = "idempotency_key")]
    pub idempotency_key: String,
    #[serde(rename = "payment_reference")]
    pub payment_reference: String,
    pub customer: CustomerInfo,
    pub postcode: String,
    #[serde(rename = "delivery_area")]
    pub delivery_area: String,
    #[serde(rename = "line_items")]
    pub line_items: Vec<LineItem>,
    pub subtotal: Decimal,
    #[serde(rename = "delivery_fee")]
    pub delivery_fee: Decimal,
    #[serde(rename = "discount_amount")]
    pub discount_amount: Decimal,
    pub coupon: Option<AppliedCoupon>,
    pub total: Decimal,
    pub currency: String,
}

/// Order - the persisted, authoritative record of a paid checkout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Order {
    pub id: Uuid,
    #[serde(rename = "idempotency_key")]
    pub idempotency_key: String,
    #[serde(rename = "payment_reference")]
    pub payment_reference: String,
    pub customer: CustomerInfo,
    pub postcode: String,
    #[serde(rename = "delivery_area")]
    pub delivery_area: String,
    #[serde(rename = "line_items")]
    pub line_items: Vec<LineItem>,
    pub subtotal: Decimal,
    #[serde(rename = "delivery_fee")]
    pub delivery_fee: Decimal,
    #[serde(rename = "discount_amount")]
    pub discount_amount: Decimal,
    pub coupon: Option<AppliedCoupon>,
    pub total: Decimal,
    pub currency: String,
    pub status: OrderStatus,
    #[serde(rename = "created_at")]
    pub created_at: DateTime<Utc>,
}

impl Order {
    /// Materialises a freshly inserted order.
    pub fn from_new(new: NewOrder, id: Uuid, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            idempotency_key: new.idempotency_key,
            payment_reference: new.payment_reference,
            customer: new.customer,
            postcode: new.postcode,
            delivery_area: new.delivery_area,
            line_items: new.line_items,
            subtotal: new.subtotal,
            delivery_fee: new.delivery_fee,
            discount_amount: new.discount_amount,
            coupon: new.coupon,
            total: new.total,
            currency: new.currency,
            status: OrderStatus::Processing,
            created_at,
        }
    }
}

/// OrderView - what an order lookup exposes without authentication.
/// Carries no customer contact details.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OrderView {
    #[serde(rename = "order_id")]
    pub order_id: Uuid,
    #[serde(rename = "payment_reference")]
    pub payment_reference: String,
    pub status: OrderStatus,
    #[serde(rename = "delivery_area")]
    pub delivery_area: String,
    #[serde(rename = "line_items")]
    pub line_items: Vec<LineItem>,
    pub subtotal: Decimal,
    #[serde(rename = "delivery_fee")]
    pub delivery_fee: Decimal,
    #[serde(rename = "discount_amount")]
    pub discount_amount: Decimal,
    pub total: Decimal,
    pub currency: String,
    #[serde(rename = "created_at")]
    pub created_at: DateTime<Utc>,
}

impl From<&Order> for OrderView {
    fn from(order: &Order) -> Self {
        Self {
            order_id: order.id,
            payment_reference: order.payment_reference.clone(),
            status: order.status,
            delivery_area: order.delivery_area.clone(),
            line_items: order.line_items.clone(),
            subtotal: order.subtotal,
            delivery_fee: order.delivery_fee,
            discount_amount: order.discount_amount,
            total: order.total,
            currency: order.currency.clone(),
            created_at: order.created_at,
        }
    }
}

/// CardDetails - raw card input, only ever forwarded to the gateway.
#[derive(Debug, Deserialize)]
pub struct CardDetails {
    #[serde(deserialize_with = "deserialize_secret")]
    pub number: SecretString,
    #[serde(rename = "exp_month")]
    pub exp_month: u8,
    #[serde(rename = "exp_year")]
    pub exp_year: u16,
    #[serde(deserialize_with = "deserialize_secret")]
    pub cvc: SecretString,
    #[serde(rename = "holder_name", default)]
    pub holder_name: Option<String>,
}

impl CardDetails {
    /// Last four digits, safe for logs and receipts.
    pub fn last4(&self) -> String {
        let digits: Vec<char> = self
            .number
            .expose_secret()
            .chars()
            .filter(char::is_ascii_digit)
            .collect();
        let start = digits.len().saturating_sub(4);
        digits[start..].iter().collect()
    }
}

fn deserialize_secret<'de, D>(deserializer: D) -> Result<SecretString, D::Error>
where
    D: Deserializer<'de>,
{
    let val = String::deserialize(deserializer)?;
    Ok(SecretString::from(val))
}

/// CheckoutRequest - inbound checkout submission.
#[derive(Debug, Deserialize)]
pub struct CheckoutRequest {
    /// Client-generated token; retries of the same checkout reuse it.
    #[serde(rename = "idempotency_key")]
    pub idempotency_key: String,
    #[serde(rename = "cart_lines")]
    pub cart_lines: Vec<CartLine>,
    pub customer: CustomerInfo,
    pub postcode: String,
    #[serde(rename = "coupon_code", default)]
    pub coupon_code: Option<String>,
    pub card: CardDetails,
}

impl CheckoutRequest {
    /// Subtotal recomputed from the cart lines.
    pub fn subtotal(&self) -> Result<Decimal, AmountOutOfRange> {
        let sum = self.cart_lines.iter().try_fold(Decimal::ZERO, |acc, line| {
            acc.checked_add(line.line_total()?).ok_or(AmountOutOfRange)
        })?;
        Ok(money(sum))
    }
}

/// CheckoutReceipt - what the customer gets back after a successful checkout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckoutReceipt {
    #[serde(rename = "order_id")]
    pub order_id: Uuid,
    #[serde(rename = "payment_reference")]
    pub payment_reference: String,
    #[serde(rename = "final_total")]
    pub final_total: Decimal,
    pub currency: String,
}

impl From<&Order> for CheckoutReceipt {
    fn from(order: &Order) -> Self {
        Self {
            order_id: order.id,
            payment_reference: order.payment_reference.clone(),
            final_total: order.total,
            currency: order.currency.clone(),
        }
    }
}

/// OrderSummary - the payload handed to the notification channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OrderSummary {
    #[serde(rename = "order_id")]
    pub order_id: Uuid,
    #[serde(rename = "payment_reference")]
    pub payment_reference: String,
    #[serde(rename = "customer_name")]
    pub customer_name: String,
    pub items: Vec<LineItem>,
    pub subtotal: Decimal,
    #[serde(rename = "delivery_fee")]
    pub delivery_fee: Decimal,
    #[serde(rename = "discount_amount")]
    pub discount_amount: Decimal,
    pub total: Decimal,
    pub currency: String,
}

impl From<&Order> for OrderSummary {
    fn from(order: &Order) -> Self {
        Self {
            order_id: order.id,
            payment_reference: order.payment_reference.clone(),
            customer_name: order.customer.name.clone(),
            items: order.line_items.clone(),
            subtotal: order.subtotal,
            delivery_fee: order.delivery_fee,
            discount_amount: order.discount_amount,
            total: order.total,
            currency: order.currency.clone(),
        }
    }
}

/// Notification - `{recipient, orderSummary}` as sent to the dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Notification {
    pub recipient: String,
    #[serde(rename = "order_summary")]
    pub order_summary: OrderSummary,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_deserialize_checkout_request_from_json() {
        let json = r#"
        {
           "idempotency_key": "c0ffee-1",
           "cart_lines": [
              {
                 "product_id": 12,
                 "name": "Lamb Biryani",
                 "unit_price": "12.50",
                 "quantity": 2,
                 "spice_level": "hot",
                 "note": "no coriander"
              },
              {
                 "product_id": 31,
                 "name": "Garlic Naan",
                 "unit_price": "2.5",
                 "quantity": 10
              }
           ],
           "customer": {
              "name": "Test Testov",
              "phone": "+447700900000",
              "email": "test@example.com",
              "address": "1 Humber Street"
           },
           "postcode": "hu1 2ab",
           "coupon_code": "SAVE10",
           "card": {
              "number": "4242 4242 4242 4242",
              "exp_month": 12,
              "exp_year": 2030,
              "cvc": "123"
           }
        }
        "#;
        let req: CheckoutRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.cart_lines.len(), 2);
        assert_eq!(req.cart_lines[1].spice_level, None);
        assert_eq!(req.coupon_code.as_deref(), Some("SAVE10"));
        assert_eq!(req.subtotal(), Ok(dec!(50.00)));
        assert_eq!(req.card.last4(), "4242");
    }

    #[test]
    fn test_card_debug_is_redacted() {
        let json = r#"{"number":"4000000000000002","exp_month":1,"exp_year":2031,"cvc":"999"}"#;
        let card: CardDetails = serde_json::from_str(json).unwrap();
        let debug = format!("{card:?}");
        assert!(!debug.contains("4000000000000002"));
        assert!(!debug.contains("999"));
    }

    #[test]
    fn test_money_rounding_and_minor_units() {
        assert_eq!(money(dec!(50)).to_string(), "50.00");
        assert_eq!(money(dec!(4.995)), dec!(5.00));
        assert_eq!(to_minor_units(dec!(50.00)), Some(5000));
        assert_eq!(to_minor_units(dec!(0.10)), Some(10));
    }

    #[test]
    fn test_oversized_cart_is_out_of_range_not_a_panic() {
        let json = r#"
        {
           "idempotency_key": "big-1",
           "cart_lines": [
              {"product_id": 1, "name": "Feast", "unit_price": "79228162514264337593543950335", "quantity": 2}
           ],
           "customer": {"name": "A", "phone": "1", "email": "a@b.c", "address": "x"},
           "postcode": "HU1",
           "card": {"number": "4242424242424242", "exp_month": 1, "exp_year": 2031, "cvc": "1"}
        }
        "#;
        let req: CheckoutRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.subtotal(), Err(AmountOutOfRange));
        assert_eq!(LineItem::try_from(&req.cart_lines[0]), Err(AmountOutOfRange));
        assert_eq!(to_minor_units(Decimal::MAX), None);
    }

    #[test]
    fn test_max_order_total_matches_column_precision() {
        assert_eq!(MAX_ORDER_TOTAL, dec!(99999999.99));
        assert_eq!(to_minor_units(MAX_ORDER_TOTAL), Some(9_999_999_999));
    }

    #[test]
    fn test_payment_method_round_trip_through_str() {
        for method in [PaymentMethod::Intent, PaymentMethod::Direct] {
            assert_eq!(method.as_str().parse::<PaymentMethod>(), Ok(method));
        }
        assert!("cash".parse::<PaymentMethod>().is_err());
    }

    #[test]
    fn test_order_view_omits_customer_contact() {
        let order = Order::from_new(
            NewOrder {
                idempotency_key: "k".to_string(),
                payment_reference: "pi_1".to_string(),
                customer: CustomerInfo {
                    name: "Ann".to_string(),
                    email: "ann@example.com".to_string(),
                    phone: "07700900000".to_string(),
                    address: "1 High St".to_string(),
                },
                postcode: "HU1 2AB".to_string(),
                delivery_area: "Hull Centre".to_string(),
                line_items: vec![],
                subtotal: dec!(10.00),
                delivery_fee: dec!(5.00),
                discount_amount: dec!(0.00),
                coupon: None,
                total: dec!(15.00),
                currency: "GBP".to_string(),
            },
            Uuid::new_v4(),
            Utc::now(),
        );
        let json = serde_json::to_string(&OrderView::from(&order)).unwrap();
        assert!(json.contains("pi_1"));
        assert!(!json.contains("ann@example.com"));
        assert!(!json.contains("07700900000"));
        assert!(!json.contains("1 High St"));
    }

    #[test]
    fn test_order_status_round_trip_through_str() {
        for status in [
            OrderStatus::Processing,
            OrderStatus::Shipped,
            OrderStatus::Delivered,
            OrderStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<OrderStatus>(), Ok(status));
        }
        assert!("lost".parse::<OrderStatus>().is_err());
    }

    #[test]
    fn test_line_item_snapshot_from_cart_line() {
        let line = CartLine {
            product_id: 7,
            name: "Samosa".to_string(),
            unit_price: dec!(1.2),
            quantity: 3,
            spice_level: Some("mild".to_string()),
            note: None,
        };
        let item = LineItem::try_from(&line).unwrap();
        assert_eq!(item.unit_price.to_string(), "1.20");
        assert_eq!(item.line_total, dec!(3.60));
    }
}
