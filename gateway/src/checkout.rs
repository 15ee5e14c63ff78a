//! Checkout flow: order creation and capture
//!
//! Order creation talks to the processor first and only persists a
//! `Pending` payment once the processor has issued an order id, so
//! there is never a payment row without a corresponding order. Capture
//! goes the other way: the ledger settles only after the processor
//! reports the capture as completed.

use crate::{
    error::{GatewayError, Result},
    metrics::METRICS,
    paypal::CheckoutGateway,
};
use chrono::Utc;
use credit_ledger::{Currency, Error as LedgerError, Ledger, Payment, PaymentParams, SettleOutcome, UserId};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{info, warn};

/// Orchestrates processor calls and ledger persistence for checkout
pub struct CheckoutService {
    ledger: Arc<Ledger>,
    gateway: Arc<dyn CheckoutGateway>,
}

impl CheckoutService {
    pub fn new(ledger: Arc<Ledger>, gateway: Arc<dyn CheckoutGateway>) -> Self {
        Self { ledger, gateway }
    }

    /// Create a processor order and persist the pending payment.
    ///
    /// Validation runs before the processor call so malformed requests
    /// never leave the process.
    pub async fn create_order(
        &self,
        user: UserId,
        amount: Decimal,
        currency: Currency,
        params: PaymentParams,
    ) -> Result<Payment> {
        validate_order(amount, &params)?;

        let order_id = self
            .gateway
            .create_order(amount, currency, &user.to_string())
            .await?;

        let payment = Payment::pending(user, amount, currency, params, order_id);
        self.ledger.create_payment(payment.clone()).await?;

        METRICS.orders_created_total.inc();
        info!(
            payment_id = %payment.payment_id,
            order_id = %payment.order_id,
            user = %user,
            amount = %amount,
            payment_type = %payment.payment_type(),
            "Checkout order created"
        );

        Ok(payment)
    }

    /// Capture an approved order and settle the payment.
    ///
    /// A non-completed capture leaves the payment `Pending` and
    /// surfaces `CaptureDeclined`; the client may retry once the payer
    /// has approved the order.
    pub async fn capture_order(&self, order_id: &str) -> Result<SettleOutcome> {
        if self.ledger.find_payment_by_order(order_id)?.is_none() {
            return Err(GatewayError::Ledger(LedgerError::OrderNotFound(
                order_id.to_string(),
            )));
        }

        let capture = self.gateway.capture_order(order_id).await?;
        if !capture.is_completed() {
            METRICS.captures_total.with_label_values(&["declined"]).inc();
            warn!(
                order_id = %order_id,
                capture_id = %capture.capture_id,
                status = %capture.status,
                "Capture not completed, payment left pending"
            );
            return Err(GatewayError::CaptureDeclined(format!(
                "Capture {} for order {} returned {}",
                capture.capture_id, order_id, capture.status
            )));
        }

        let outcome = self
            .ledger
            .settle_payment(order_id, &capture.capture_id, Utc::now())
            .await?;
        METRICS.captures_total.with_label_values(&["completed"]).inc();

        Ok(outcome)
    }

    /// The ledger behind this service
    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }
}

fn validate_order(amount: Decimal, params: &PaymentParams) -> Result<()> {
    if amount <= Decimal::ZERO {
        return Err(GatewayError::Ledger(LedgerError::InvalidArgument(
            "Order amount must be positive".to_string(),
        )));
    }
    match params {
        PaymentParams::CreditPurchase { credit_amount, .. } if *credit_amount <= 0 => {
            Err(GatewayError::Ledger(LedgerError::InvalidArgument(
                "Credit amount must be positive".to_string(),
            )))
        }
        PaymentParams::Subscription { plan_id, .. } if plan_id.trim().is_empty() => {
            Err(GatewayError::Ledger(LedgerError::InvalidArgument(
                "Plan id must not be empty".to_string(),
            )))
        }
        PaymentParams::Subscription { plan_days, .. } if *plan_days == 0 => {
            Err(GatewayError::Ledger(LedgerError::InvalidArgument(
                "Plan period must be at least one day".to_string(),
            )))
        }
        _ => Ok(()),
    }
}

impl std::fmt::Debug for CheckoutService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckoutService").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paypal::GatewayCapture;
    use async_trait::async_trait;
    use credit_ledger::{Config, LedgerKind, PaymentStatus};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    /// Stub processor with scripted capture status
    struct StubGateway {
        capture_status: &'static str,
        orders_created: AtomicUsize,
    }

    impl StubGateway {
        fn new(capture_status: &'static str) -> Self {
            Self {
                capture_status,
                orders_created: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl CheckoutGateway for StubGateway {
        async fn create_order(
            &self,
            _amount: Decimal,
            _currency: Currency,
            _reference: &str,
        ) -> Result<String> {
            let n = self.orders_created.fetch_add(1, Ordering::SeqCst);
            Ok(format!("STUB-ORDER-{}", n))
        }

        async fn capture_order(&self, order_id: &str) -> Result<GatewayCapture> {
            Ok(GatewayCapture {
                order_id: order_id.to_string(),
                capture_id: format!("STUB-CAP-{}", order_id),
                status: self.capture_status.to_string(),
            })
        }
    }

    fn service_with(status: &'static str) -> (CheckoutService, tempfile::TempDir) {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        let ledger = Arc::new(Ledger::open(config).unwrap());
        let service = CheckoutService::new(ledger, Arc::new(StubGateway::new(status)));
        (service, temp_dir)
    }

    fn purchase_params() -> PaymentParams {
        PaymentParams::CreditPurchase {
            ledger: LedgerKind::Credits,
            credit_amount: 5000,
        }
    }

    #[tokio::test]
    async fn test_create_then_capture_credits_ledger() {
        let (service, _temp) = service_with("COMPLETED");
        let user = UserId::new(Uuid::new_v4());

        let payment = service
            .create_order(user, Decimal::new(10000, 2), Currency::USD, purchase_params())
            .await
            .unwrap();
        assert_eq!(payment.status, PaymentStatus::Pending);

        let outcome = service.capture_order(&payment.order_id).await.unwrap();
        assert!(matches!(outcome, SettleOutcome::Settled { .. }));

        let balance = service
            .ledger()
            .get_balance(user, LedgerKind::Credits)
            .unwrap();
        assert_eq!(balance.balance, 5000);
    }

    #[tokio::test]
    async fn test_declined_capture_leaves_payment_pending() {
        let (service, _temp) = service_with("DECLINED");
        let user = UserId::new(Uuid::new_v4());

        let payment = service
            .create_order(user, Decimal::new(10000, 2), Currency::USD, purchase_params())
            .await
            .unwrap();

        let err = service.capture_order(&payment.order_id).await.unwrap_err();
        assert!(matches!(err, GatewayError::CaptureDeclined(_)));

        // No ledger mutation: payment still pending, balance untouched
        let stored = service.ledger().get_payment(payment.payment_id).unwrap();
        assert_eq!(stored.status, PaymentStatus::Pending);
        let balance = service
            .ledger()
            .get_balance(user, LedgerKind::Credits)
            .unwrap();
        assert_eq!(balance.balance, 0);
    }

    #[tokio::test]
    async fn test_capture_unknown_order_is_not_found() {
        let (service, _temp) = service_with("COMPLETED");
        let err = service.capture_order("NO-SUCH-ORDER").await.unwrap_err();
        assert!(matches!(
            err,
            GatewayError::Ledger(LedgerError::OrderNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_order_rejected_before_processor() {
        let (service, _temp) = service_with("COMPLETED");
        let user = UserId::new(Uuid::new_v4());

        let err = service
            .create_order(user, Decimal::ZERO, Currency::USD, purchase_params())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            GatewayError::Ledger(LedgerError::InvalidArgument(_))
        ));

        let err = service
            .create_order(
                user,
                Decimal::new(2999, 2),
                Currency::USD,
                PaymentParams::Subscription {
                    site_id: Uuid::new_v4(),
                    plan_id: "  ".to_string(),
                    plan_days: 30,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            GatewayError::Ledger(LedgerError::InvalidArgument(_))
        ));
    }
}
