//! Webhook ingestion
//!
//! Processor webhooks are at-least-once: the same capture or refund
//! may be delivered repeatedly, and events may arrive for orders the
//! capture endpoint already settled. Anything that cannot change state
//! is acknowledged so the processor stops redelivering; only internal
//! failures propagate, which turn into a 5xx and trigger redelivery.

use credit_ledger::{Error, Ledger, RefundOutcome, Result, SettleOutcome};
use serde::Deserialize;
use tracing::{info, warn};

/// Event type settling a capture
pub const EVENT_CAPTURE_COMPLETED: &str = "PAYMENT.CAPTURE.COMPLETED";
/// Event type reversing a capture
pub const EVENT_CAPTURE_REFUNDED: &str = "PAYMENT.CAPTURE.REFUNDED";

/// Processor webhook envelope, as posted to `/webhooks/gateway`
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEvent {
    /// Processor event type
    pub event_type: String,
    /// Event payload
    pub resource: WebhookResource,
}

/// Webhook resource payload
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhookResource {
    /// Capture id for capture events
    #[serde(default)]
    pub id: String,
    /// Related ids attached by the processor
    #[serde(default)]
    pub supplementary_data: Option<SupplementaryData>,
}

/// Supplementary data block carrying related ids
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SupplementaryData {
    #[serde(default)]
    pub related_ids: Option<RelatedIds>,
}

/// Related resource ids
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RelatedIds {
    #[serde(default)]
    pub order_id: Option<String>,
}

/// What processing an event amounted to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookDisposition {
    /// First capture confirmation: payment settled
    Settled,
    /// First refund delivery: payment reversed
    Refunded,
    /// Nothing to do; acknowledged to stop redelivery
    Ignored(&'static str),
}

impl WebhookDisposition {
    /// Metrics label for this disposition
    pub fn label(&self) -> &'static str {
        match self {
            WebhookDisposition::Settled => "settled",
            WebhookDisposition::Refunded => "refunded",
            WebhookDisposition::Ignored(_) => "ignored",
        }
    }
}

/// Apply one webhook event to the ledger.
///
/// Returns `Ok` for everything the processor should not redeliver,
/// including unknown orders and duplicate deliveries. Errors are
/// internal failures only.
pub async fn process_event(ledger: &Ledger, event: &WebhookEvent) -> Result<WebhookDisposition> {
    match event.event_type.as_str() {
        EVENT_CAPTURE_COMPLETED => {
            let order_id = event
                .resource
                .supplementary_data
                .as_ref()
                .and_then(|data| data.related_ids.as_ref())
                .and_then(|ids| ids.order_id.as_deref());
            let Some(order_id) = order_id else {
                warn!("Capture-completed webhook without a related order id");
                return Ok(WebhookDisposition::Ignored("missing order id"));
            };

            match ledger
                .settle_payment(order_id, &event.resource.id, chrono::Utc::now())
                .await
            {
                Ok(SettleOutcome::Settled { payment, .. }) => {
                    info!(payment_id = %payment.payment_id, order_id, "Webhook settled payment");
                    Ok(WebhookDisposition::Settled)
                }
                Ok(SettleOutcome::AlreadySettled { .. }) => {
                    Ok(WebhookDisposition::Ignored("already settled"))
                }
                Err(Error::OrderNotFound(_)) => {
                    warn!(order_id, "Webhook for unknown order");
                    Ok(WebhookDisposition::Ignored("unknown order"))
                }
                Err(Error::InvalidTransition(_)) => {
                    // Terminal payment; redelivery cannot change that
                    Ok(WebhookDisposition::Ignored("terminal payment"))
                }
                Err(err) => Err(err),
            }
        }
        EVENT_CAPTURE_REFUNDED => {
            let capture_id = event.resource.id.as_str();
            if capture_id.is_empty() {
                warn!("Capture-refunded webhook without a capture id");
                return Ok(WebhookDisposition::Ignored("missing capture id"));
            }

            match ledger.refund_payment(capture_id).await {
                Ok(RefundOutcome::Refunded { payment, .. }) => {
                    info!(payment_id = %payment.payment_id, capture_id, "Webhook refunded payment");
                    Ok(WebhookDisposition::Refunded)
                }
                Ok(RefundOutcome::AlreadyRefunded { .. }) => {
                    Ok(WebhookDisposition::Ignored("already refunded"))
                }
                Err(Error::OrderNotFound(_)) => {
                    warn!(capture_id, "Refund webhook for unknown capture");
                    Ok(WebhookDisposition::Ignored("unknown capture"))
                }
                Err(Error::InvalidTransition(_)) => {
                    Ok(WebhookDisposition::Ignored("not refundable"))
                }
                Err(err) => Err(err),
            }
        }
        other => {
            tracing::debug!(event_type = other, "Ignoring unhandled webhook event type");
            Ok(WebhookDisposition::Ignored("unhandled event type"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use credit_ledger::{
        Config, Currency, LedgerKind, Payment, PaymentParams, PaymentStatus, UserId,
    };
    use rust_decimal::Decimal;
    use std::sync::Arc;
    use uuid::Uuid;

    fn test_ledger() -> (Arc<Ledger>, tempfile::TempDir) {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        (Arc::new(Ledger::open(config).unwrap()), temp_dir)
    }

    fn completed_event(order_id: &str, capture_id: &str) -> WebhookEvent {
        serde_json::from_value(serde_json::json!({
            "event_type": EVENT_CAPTURE_COMPLETED,
            "resource": {
                "id": capture_id,
                "supplementary_data": {
                    "related_ids": { "order_id": order_id },
                },
            },
        }))
        .unwrap()
    }

    fn refunded_event(capture_id: &str) -> WebhookEvent {
        serde_json::from_value(serde_json::json!({
            "event_type": EVENT_CAPTURE_REFUNDED,
            "resource": { "id": capture_id },
        }))
        .unwrap()
    }

    async fn seed_pending_payment(ledger: &Ledger, user: UserId, order_id: &str) {
        let payment = Payment::pending(
            user,
            Decimal::new(10000, 2),
            Currency::USD,
            PaymentParams::CreditPurchase {
                ledger: LedgerKind::Credits,
                credit_amount: 5000,
            },
            order_id,
        );
        ledger.create_payment(payment).await.unwrap();
    }

    #[tokio::test]
    async fn test_capture_completed_settles_once() {
        let (ledger, _temp) = test_ledger();
        let user = UserId::new(Uuid::new_v4());
        seed_pending_payment(&ledger, user, "ORDER-WH").await;

        let event = completed_event("ORDER-WH", "CAP-WH");
        let first = process_event(&ledger, &event).await.unwrap();
        assert_eq!(first, WebhookDisposition::Settled);

        let second = process_event(&ledger, &event).await.unwrap();
        assert_eq!(second, WebhookDisposition::Ignored("already settled"));

        let balance = ledger.get_balance(user, LedgerKind::Credits).unwrap();
        assert_eq!(balance.balance, 5000);
    }

    #[tokio::test]
    async fn test_refund_event_reverses_payment() {
        let (ledger, _temp) = test_ledger();
        let user = UserId::new(Uuid::new_v4());
        seed_pending_payment(&ledger, user, "ORDER-RF").await;

        process_event(&ledger, &completed_event("ORDER-RF", "CAP-RF"))
            .await
            .unwrap();

        let disposition = process_event(&ledger, &refunded_event("CAP-RF")).await.unwrap();
        assert_eq!(disposition, WebhookDisposition::Refunded);

        let payment = ledger.find_payment_by_capture("CAP-RF").unwrap().unwrap();
        assert_eq!(payment.status, PaymentStatus::Refunded);
        assert_eq!(ledger.get_balance(user, LedgerKind::Credits).unwrap().balance, 0);

        // Redelivered refund is acknowledged without effect
        let again = process_event(&ledger, &refunded_event("CAP-RF")).await.unwrap();
        assert_eq!(again, WebhookDisposition::Ignored("already refunded"));
    }

    #[tokio::test]
    async fn test_unknown_order_and_event_types_acknowledged() {
        let (ledger, _temp) = test_ledger();

        let disposition = process_event(&ledger, &completed_event("NEVER-ISSUED", "CAP-X"))
            .await
            .unwrap();
        assert_eq!(disposition, WebhookDisposition::Ignored("unknown order"));

        let event: WebhookEvent = serde_json::from_value(serde_json::json!({
            "event_type": "CHECKOUT.ORDER.APPROVED",
            "resource": { "id": "ORDER-Y" },
        }))
        .unwrap();
        let disposition = process_event(&ledger, &event).await.unwrap();
        assert_eq!(disposition, WebhookDisposition::Ignored("unhandled event type"));
    }

    #[tokio::test]
    async fn test_missing_order_id_acknowledged() {
        let (ledger, _temp) = test_ledger();
        let event: WebhookEvent = serde_json::from_value(serde_json::json!({
            "event_type": EVENT_CAPTURE_COMPLETED,
            "resource": { "id": "CAP-NO-ORDER" },
        }))
        .unwrap();

        let disposition = process_event(&ledger, &event).await.unwrap();
        assert_eq!(disposition, WebhookDisposition::Ignored("missing order id"));
    }
}
