//! Checkout orchestration.
//!
//! A checkout moves through
//! `Draft -> FeeComputed -> CouponApplied? -> IntentCreated -> Confirmed -> Persisted -> NotificationAttempted`.
//! Everything before `IntentCreated` is side-effect free apart from the
//! payment claim, which fixes how a checkout key pays before any money moves.
//! From the moment the card is presented the remaining steps run on a tracked
//! task, so a caller that goes away mid-request cannot leave a charge without
//! an order, and shutdown can wait for those tasks to finish.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cache::ZoneCache;
use gateway::{GatewayError, IntentRequest, PaymentGateway, PaymentIntent};
use model::{
    AppliedCoupon, CardDetails, CheckoutReceipt, CheckoutRequest, CustomerInfo, DeliveryQuote,
    AmountOutOfRange, LineItem, MAX_ORDER_TOTAL, NewOrder, Notification, Order, OrderSummary,
    PaymentClaim, PaymentMethod, money, to_minor_units,
};
use repository::{CouponsRepository, Insertion, OrdersRepository};
use rust_decimal::Decimal;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

use crate::coupon::{CouponUsageTracker, CouponValidator};
use crate::delivery::{DeliveryFeeCalculator, validate_postcode};
use crate::error::CheckoutError;
use crate::ledger::OrderLedger;
use crate::notify::NotificationDispatcher;
use crate::retry::{RetryConfig, with_retry};

const MAX_IDEMPOTENCY_KEY_LEN: usize = 128;
const MAX_LINE_QUANTITY: u32 = 1_000;

/// Position of a checkout in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckoutState {
    Draft,
    FeeComputed,
    CouponApplied,
    IntentCreated,
    Confirmed,
    Persisted,
    NotificationAttempted,
    PaymentDeclined,
    PersistenceFailed,
}

impl CheckoutState {
    pub fn can_advance_to(self, next: CheckoutState) -> bool {
        use CheckoutState::*;
        matches!(
            (self, next),
            (Draft, FeeComputed)
                | (FeeComputed, CouponApplied)
                | (FeeComputed, IntentCreated)
                | (CouponApplied, IntentCreated)
                | (IntentCreated, Confirmed)
                | (IntentCreated, PaymentDeclined)
                | (Confirmed, Persisted)
                | (Confirmed, PersistenceFailed)
                | (Persisted, NotificationAttempted)
                | (PaymentDeclined, FeeComputed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CheckoutState::NotificationAttempted
                | CheckoutState::PaymentDeclined
                | CheckoutState::PersistenceFailed
        )
    }
}

#[derive(Debug)]
struct Progress {
    state: CheckoutState,
}

impl Progress {
    fn new() -> Self {
        Self {
            state: CheckoutState::Draft,
        }
    }

    fn advance(&mut self, next: CheckoutState) {
        if self.state.can_advance_to(next) {
            debug!(from = ?self.state, to = ?next, "Checkout state changed");
        } else {
            error!(from = ?self.state, to = ?next, "Unexpected checkout state change");
        }
        self.state = next;
    }
}

/// How the card will be charged.
#[derive(Debug)]
pub enum PaymentPath {
    /// Confirm a previously created intent.
    GatewayIntent(PaymentIntent),
    /// Intent creation was unavailable; tokenize and charge in one call.
    DirectCharge,
}

impl PaymentPath {
    fn method(&self) -> PaymentMethod {
        match self {
            PaymentPath::GatewayIntent(_) => PaymentMethod::Intent,
            PaymentPath::DirectCharge => PaymentMethod::Direct,
        }
    }
}

/// Tunables for [`CheckoutOrchestrator`].
#[derive(Debug, Clone)]
pub struct CheckoutSettings {
    pub currency: String,
    /// Delay before the single retry of an unavailable intent creation.
    pub intent_retry_backoff: Duration,
    pub ledger_max_attempts: u32,
    pub ledger_retry_backoff: Duration,
}

impl Default for CheckoutSettings {
    fn default() -> Self {
        Self {
            currency: "GBP".to_string(),
            intent_retry_backoff: Duration::from_millis(500),
            ledger_max_attempts: 5,
            ledger_retry_backoff: Duration::from_millis(200),
        }
    }
}

/// Customer-facing checkout operations.
#[async_trait]
pub trait CheckoutService: Send + Sync {
    /// Prices, charges and records one checkout.
    ///
    /// # Errors
    /// Validation and coupon problems are reported before any payment call.
    /// [`CheckoutError::PaymentDeclined`] carries the provider's reason.
    /// [`CheckoutError::PersistenceFailed`] means the customer was charged and
    /// the order needs manual reconciliation.
    async fn checkout(&self, request: CheckoutRequest) -> Result<CheckoutReceipt, CheckoutError>;

    /// Delivery fee for a postcode. Safe to call repeatedly.
    async fn quote_delivery(&self, postcode: &str) -> Result<DeliveryQuote, CheckoutError>;

    /// Checks a coupon without redeeming it.
    async fn preview_coupon(
        &self,
        code: &str,
        subtotal: Decimal,
        customer_email: &str,
    ) -> Result<AppliedCoupon, CheckoutError>;

    async fn find_order(&self, payment_reference: &str) -> Result<Option<Order>, CheckoutError>;
}

/// Everything known about a checkout once it has been priced.
#[derive(Debug)]
struct PricedCheckout {
    idempotency_key: String,
    customer: CustomerInfo,
    postcode: String,
    delivery_area: String,
    line_items: Vec<LineItem>,
    subtotal: Decimal,
    delivery_fee: Decimal,
    coupon: Option<AppliedCoupon>,
    total: Decimal,
    currency: String,
}

impl PricedCheckout {
    fn discount_amount(&self) -> Decimal {
        self.coupon
            .as_ref()
            .map_or(Decimal::ZERO, |c| c.discount_amount)
    }

    fn into_new_order(self, payment_reference: String) -> NewOrder {
        NewOrder {
            discount_amount: money(self.discount_amount()),
            idempotency_key: self.idempotency_key,
            payment_reference,
            customer: self.customer,
            postcode: self.postcode,
            delivery_area: self.delivery_area,
            line_items: self.line_items,
            subtotal: self.subtotal,
            delivery_fee: self.delivery_fee,
            coupon: self.coupon,
            total: self.total,
            currency: self.currency,
        }
    }
}

/// The post-payment half of a checkout. Shared with detached tasks.
struct Settlement<G: ?Sized, C: ?Sized, O: ?Sized, N: ?Sized> {
    gateway: Arc<G>,
    ledger: OrderLedger<O>,
    usage: CouponUsageTracker<C>,
    notifier: Arc<N>,
    tasks: TaskTracker,
}

impl<G, C, O, N> Settlement<G, C, O, N>
where
    G: PaymentGateway + ?Sized + 'static,
    C: CouponsRepository + ?Sized + 'static,
    O: OrdersRepository + ?Sized + 'static,
    N: NotificationDispatcher + ?Sized + 'static,
{
    #[instrument(skip_all, fields(idempotency_key = %priced.idempotency_key))]
    async fn settle(
        &self,
        mut progress: Progress,
        path: PaymentPath,
        request: IntentRequest,
        card: CardDetails,
        priced: PricedCheckout,
    ) -> Result<CheckoutReceipt, CheckoutError> {
        let charged = match &path {
            PaymentPath::GatewayIntent(intent) => self.gateway.confirm(intent, &card).await,
            PaymentPath::DirectCharge => self.gateway.charge_direct(&request, &card).await,
        };
        let outcome = match charged {
            Ok(outcome) => outcome,
            // The provider refused the call outright, so the card was not charged.
            Err(e @ GatewayError::Rejected(_)) => return Err(e.into()),
            Err(e) => {
                warn!(
                    alert = "payment_outcome_unknown",
                    method = %path.method(),
                    amount = request.amount,
                    error = %e,
                    "Gateway failed after the card was presented"
                );
                return Err(CheckoutError::PaymentOutcomeUnknown {
                    idempotency_key: priced.idempotency_key,
                });
            }
        };

        if !outcome.is_confirmed() {
            progress.advance(CheckoutState::PaymentDeclined);
            let reason = outcome
                .failure_reason
                .unwrap_or_else(|| "The payment was not completed.".to_string());
            info!(payment_reference = %outcome.reference, reason = %reason, "Payment declined");
            return Err(CheckoutError::PaymentDeclined { reason });
        }
        progress.advance(CheckoutState::Confirmed);
        info!(
            payment_reference = %outcome.reference,
            card_last4 = %card.last4(),
            total = %priced.total,
            "Payment confirmed"
        );

        let new_order = priced.into_new_order(outcome.reference);
        let insertion = match self.ledger.persist(&new_order).await {
            Ok(insertion) => insertion,
            Err(e) => {
                progress.advance(CheckoutState::PersistenceFailed);
                error!(
                    alert = "order_persistence_failed",
                    payment_reference = %new_order.payment_reference,
                    idempotency_key = %new_order.idempotency_key,
                    amount = %new_order.total,
                    currency = %new_order.currency,
                    customer_email = %new_order.customer.email,
                    attempts = e.attempts,
                    error = %e.source,
                    "Payment captured but order could not be persisted; manual reconciliation required"
                );
                return Err(CheckoutError::PersistenceFailed {
                    payment_reference: new_order.payment_reference,
                    amount: new_order.total,
                });
            }
        };
        progress.advance(CheckoutState::Persisted);

        let order = match insertion {
            Insertion::Inserted(order) => order,
            // A concurrent submission with the same key finished first.
            Insertion::Existing(order) => return Ok(CheckoutReceipt::from(&order)),
        };

        if let Some(coupon) = &order.coupon {
            self.record_coupon(&order, coupon).await;
        }

        self.notify(&order);
        progress.advance(CheckoutState::NotificationAttempted);

        Ok(CheckoutReceipt::from(&order))
    }

    async fn record_coupon(&self, order: &Order, coupon: &AppliedCoupon) {
        if let Err(e) = self
            .usage
            .commit(coupon.coupon_id, &order.customer.email, coupon.discount_amount)
            .await
        {
            error!(
                alert = "coupon_ledger_reconciliation",
                order_id = %order.id,
                payment_reference = %order.payment_reference,
                coupon_code = %coupon.code,
                discount_amount = %coupon.discount_amount,
                error = %e,
                "Coupon redemption not recorded for a persisted order"
            );
        }
    }

    fn notify(&self, order: &Order) {
        let notification = Notification {
            recipient: order.customer.email.clone(),
            order_summary: OrderSummary::from(order),
        };
        let notifier = Arc::clone(&self.notifier);
        self.tasks.spawn(async move {
            let order_id = notification.order_summary.order_id;
            match notifier.dispatch(&notification).await {
                Ok(()) => info!(%order_id, "Order notification dispatched"),
                Err(e) => warn!(%order_id, error = %e, "Order notification failed"),
            }
        });
    }
}

/// Sequences fee lookup, coupon validation, payment and persistence.
pub struct CheckoutOrchestrator<G: ?Sized, C: ?Sized, O: ?Sized, N: ?Sized> {
    zones: Arc<ZoneCache>,
    fees: DeliveryFeeCalculator,
    coupons: CouponValidator<C>,
    gateway: Arc<G>,
    intent_retry: RetryConfig,
    currency: String,
    settlement: Arc<Settlement<G, C, O, N>>,
}

impl<G, C, O, N> CheckoutOrchestrator<G, C, O, N>
where
    G: PaymentGateway + ?Sized + 'static,
    C: CouponsRepository + ?Sized + 'static,
    O: OrdersRepository + ?Sized + 'static,
    N: NotificationDispatcher + ?Sized + 'static,
{
    pub fn new(
        zones: Arc<ZoneCache>,
        fees: DeliveryFeeCalculator,
        gateway: Arc<G>,
        coupons: Arc<C>,
        orders: Arc<O>,
        notifier: Arc<N>,
        settings: CheckoutSettings,
    ) -> Self {
        let settlement = Settlement {
            gateway: Arc::clone(&gateway),
            ledger: OrderLedger::new(
                orders,
                settings.ledger_max_attempts,
                settings.ledger_retry_backoff,
            ),
            usage: CouponUsageTracker::new(Arc::clone(&coupons)),
            notifier,
            tasks: TaskTracker::new(),
        };
        Self {
            zones,
            fees,
            coupons: CouponValidator::new(coupons),
            gateway,
            intent_retry: RetryConfig::once(settings.intent_retry_backoff),
            currency: settings.currency,
            settlement: Arc::new(settlement),
        }
    }

    /// Settlement and notification tasks. Close and wait on the returned
    /// tracker to let in-flight payments finish before exiting.
    pub fn settlements(&self) -> TaskTracker {
        self.settlement.tasks.clone()
    }

    /// Decides how the card will be charged and records that decision before
    /// any money moves. Every later attempt with the same key follows the
    /// recorded method, so one checkout can never be charged on both paths.
    async fn open_payment(&self, request: &IntentRequest) -> Result<PaymentPath, CheckoutError> {
        let ledger = &self.settlement.ledger;
        if let Some(claim) = ledger.payment_claim(&request.idempotency_key).await? {
            ensure_same_order(&claim, request)?;
            debug!(method = %claim.method, "Following the payment method of an earlier attempt");
            return self.follow_claim(claim.method, request).await;
        }

        let path = self.create_intent_or_fall_back(request).await?;
        let claim = ledger
            .claim_payment(&PaymentClaim {
                idempotency_key: request.idempotency_key.clone(),
                method: path.method(),
                amount: request.amount,
                currency: request.currency.clone(),
            })
            .await?;
        ensure_same_order(&claim, request)?;
        if claim.method == path.method() {
            return Ok(path);
        }
        info!(method = %claim.method, "A concurrent attempt fixed the payment method first");
        self.follow_claim(claim.method, request).await
    }

    /// Creates an intent, retrying once when the provider is unavailable.
    /// If it stays unavailable the checkout degrades to a direct charge for
    /// the same server-computed amount.
    async fn create_intent_or_fall_back(
        &self,
        request: &IntentRequest,
    ) -> Result<PaymentPath, CheckoutError> {
        match self.create_intent(request).await {
            Ok(intent) => Ok(PaymentPath::GatewayIntent(intent)),
            Err((e, attempts)) if e.is_unavailable() => {
                warn!(attempts, error = %e, "Payment intents unavailable, falling back to direct charge");
                Ok(PaymentPath::DirectCharge)
            }
            Err((e, _)) => Err(CheckoutError::Gateway(e)),
        }
    }

    /// No fallback here: the key is bound to `method`.
    async fn follow_claim(
        &self,
        method: PaymentMethod,
        request: &IntentRequest,
    ) -> Result<PaymentPath, CheckoutError> {
        match method {
            PaymentMethod::Direct => Ok(PaymentPath::DirectCharge),
            PaymentMethod::Intent => match self.create_intent(request).await {
                Ok(intent) => Ok(PaymentPath::GatewayIntent(intent)),
                Err((e, attempts)) => {
                    warn!(attempts, error = %e, "Payment intent for an earlier attempt is unavailable");
                    Err(CheckoutError::Gateway(e))
                }
            },
        }
    }

    async fn create_intent(&self, request: &IntentRequest) -> Result<PaymentIntent, (GatewayError, u32)> {
        let intent = with_retry(&self.intent_retry, GatewayError::is_unavailable, || {
            self.gateway.create_intent(request)
        })
        .await?;
        debug!(payment_reference = %intent.reference, "Payment intent created");
        Ok(intent)
    }
}

fn ensure_same_order(claim: &PaymentClaim, request: &IntentRequest) -> Result<(), CheckoutError> {
    if claim.amount != request.amount || claim.currency != request.currency {
        return Err(CheckoutError::Validation(
            "idempotency_key was already used for a checkout with a different total".to_string(),
        ));
    }
    Ok(())
}

fn order_too_large(_: AmountOutOfRange) -> CheckoutError {
    CheckoutError::Validation(format!("order total must not exceed {MAX_ORDER_TOTAL}"))
}

#[async_trait]
impl<G, C, O, N> CheckoutService for CheckoutOrchestrator<G, C, O, N>
where
    G: PaymentGateway + ?Sized + 'static,
    C: CouponsRepository + ?Sized + 'static,
    O: OrdersRepository + ?Sized + 'static,
    N: NotificationDispatcher + ?Sized + 'static,
{
    #[instrument(skip(self, request), fields(idempotency_key = %request.idempotency_key))]
    async fn checkout(&self, request: CheckoutRequest) -> Result<CheckoutReceipt, CheckoutError> {
        let mut progress = Progress::new();
        validate_request(&request)?;

        let ledger = &self.settlement.ledger;
        if let Some(order) = ledger
            .find_by_idempotency_key(request.idempotency_key.trim())
            .await?
        {
            info!(order_id = %order.id, "Checkout already completed, returning stored order");
            return Ok(CheckoutReceipt::from(&order));
        }

        let subtotal = request.subtotal().map_err(order_too_large)?;
        let CheckoutRequest {
            idempotency_key,
            cart_lines,
            customer,
            postcode,
            coupon_code,
            card,
        } = request;
        let idempotency_key = idempotency_key.trim().to_string();

        let postcode = validate_postcode(&postcode)?;
        let quote = self.quote_delivery(&postcode).await?;
        progress.advance(CheckoutState::FeeComputed);

        let coupon = match coupon_code.as_deref().map(str::trim).filter(|c| !c.is_empty()) {
            Some(code) => {
                let applied = self.coupons.validate(code, subtotal, &customer.email).await?;
                progress.advance(CheckoutState::CouponApplied);
                Some(applied)
            }
            None => None,
        };

        let discount = coupon.as_ref().map_or(Decimal::ZERO, |c| c.discount_amount);
        let total = money(subtotal + quote.fee - discount);
        if total > MAX_ORDER_TOTAL {
            return Err(order_too_large(AmountOutOfRange));
        }
        let line_items = cart_lines
            .iter()
            .map(LineItem::try_from)
            .collect::<Result<Vec<_>, _>>()
            .map_err(order_too_large)?;
        let amount = to_minor_units(total)
            .filter(|minor| *minor > 0)
            .ok_or_else(|| CheckoutError::Validation("order total must be greater than zero".to_string()))?;

        let mut metadata = BTreeMap::from([
            ("idempotency_key".to_string(), idempotency_key.clone()),
            ("customer_email".to_string(), customer.email.clone()),
            ("postcode".to_string(), postcode.clone()),
            ("delivery_fee".to_string(), quote.fee.to_string()),
            ("discount_amount".to_string(), money(discount).to_string()),
        ]);
        if let Some(c) = &coupon {
            metadata.insert("coupon_code".to_string(), c.code.clone());
        }
        let intent_request = IntentRequest {
            amount,
            currency: self.currency.clone(),
            metadata,
            idempotency_key: idempotency_key.clone(),
        };

        let path = self.open_payment(&intent_request).await?;
        progress.advance(CheckoutState::IntentCreated);

        if let PaymentPath::GatewayIntent(intent) = &path {
            if let Some(order) = ledger.find_by_reference(&intent.reference).await? {
                info!(order_id = %order.id, "Payment already recorded, returning stored order");
                return Ok(CheckoutReceipt::from(&order));
            }
        }

        let priced = PricedCheckout {
            idempotency_key,
            customer,
            postcode,
            delivery_area: quote.zone_name,
            line_items,
            subtotal,
            delivery_fee: quote.fee,
            coupon,
            total,
            currency: self.currency.clone(),
        };

        let settlement = Arc::clone(&self.settlement);
        self.settlement.tasks.spawn(async move {
            settlement
                .settle(progress, path, intent_request, card, priced)
                .await
        })
        .await
        .map_err(|e| CheckoutError::Internal(format!("checkout task failed: {e}")))?
    }

    async fn quote_delivery(&self, postcode: &str) -> Result<DeliveryQuote, CheckoutError> {
        let postcode = validate_postcode(postcode)?;
        let zones = self.zones.snapshot().await;
        Ok(self.fees.compute_fee(&zones, &postcode))
    }

    async fn preview_coupon(
        &self,
        code: &str,
        subtotal: Decimal,
        customer_email: &str,
    ) -> Result<AppliedCoupon, CheckoutError> {
        if code.trim().is_empty() {
            return Err(CheckoutError::Validation("coupon code is required".to_string()));
        }
        if subtotal < Decimal::ZERO {
            return Err(CheckoutError::Validation("subtotal must not be negative".to_string()));
        }
        if subtotal > MAX_ORDER_TOTAL {
            return Err(order_too_large(AmountOutOfRange));
        }
        validate_email(customer_email)?;
        Ok(self
            .coupons
            .validate(code, money(subtotal), customer_email.trim())
            .await?)
    }

    async fn find_order(&self, payment_reference: &str) -> Result<Option<Order>, CheckoutError> {
        Ok(self
            .settlement
            .ledger
            .find_by_reference(payment_reference)
            .await?)
    }
}

fn validate_email(email: &str) -> Result<(), CheckoutError> {
    let email = email.trim();
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && !domain.is_empty() => Ok(()),
        _ => Err(CheckoutError::Validation(format!(
            "'{email}' is not a valid email address"
        ))),
    }
}

/// Structural checks on a submission. The subtotal is never taken from the
/// client; it is recomputed from these lines.
pub fn validate_request(request: &CheckoutRequest) -> Result<(), CheckoutError> {
    let key = request.idempotency_key.trim();
    if key.is_empty() || key.len() > MAX_IDEMPOTENCY_KEY_LEN {
        return Err(CheckoutError::Validation(format!(
            "idempotency_key must be between 1 and {MAX_IDEMPOTENCY_KEY_LEN} characters"
        )));
    }

    if request.cart_lines.is_empty() {
        return Err(CheckoutError::Validation("cart is empty".to_string()));
    }
    for line in &request.cart_lines {
        if line.name.trim().is_empty() {
            return Err(CheckoutError::Validation(format!(
                "cart line for product {} has no name",
                line.product_id
            )));
        }
        if line.quantity == 0 || line.quantity > MAX_LINE_QUANTITY {
            return Err(CheckoutError::Validation(format!(
                "quantity for '{}' must be between 1 and {MAX_LINE_QUANTITY}",
                line.name
            )));
        }
        if line.unit_price < Decimal::ZERO || line.unit_price > MAX_ORDER_TOTAL {
            return Err(CheckoutError::Validation(format!(
                "price for '{}' must be between 0 and {MAX_ORDER_TOTAL}",
                line.name
            )));
        }
    }
    match request.subtotal() {
        Ok(subtotal) if subtotal <= MAX_ORDER_TOTAL => {}
        Ok(_) => return Err(order_too_large(AmountOutOfRange)),
        Err(e) => return Err(order_too_large(e)),
    }

    let customer = &request.customer;
    for (field, value) in [
        ("name", &customer.name),
        ("phone", &customer.phone),
        ("address", &customer.address),
    ] {
        if value.trim().is_empty() {
            return Err(CheckoutError::Validation(format!("customer {field} is required")));
        }
    }
    validate_email(&customer.email)
}
