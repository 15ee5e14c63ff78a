//! Public ledger facade
//!
//! Validates requests, dispatches mutations to the single-writer
//! actor, serves reads straight from storage, and emits metrics and
//! best-effort notifications for committed changes.

use crate::{
    actor::{LedgerActor, LedgerHandle},
    error::{Error, Result},
    metrics::LedgerMetrics,
    notify::{BalanceChange, Notifier},
    storage::{RefundOutcome, SettleOutcome, Storage},
    types::{
        AccountKey, Adjustment, Commission, LedgerKind, Payment, ReferralProfile, Subscription,
        Transaction, TransactionKind, UserId,
    },
    Config,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

/// Default page size for transaction listings
pub const DEFAULT_PAGE_SIZE: usize = 50;

/// Hard cap on transaction page size
pub const MAX_PAGE_SIZE: usize = 500;

/// Balance view returned to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct Balance {
    /// Current spendable balance
    pub balance: i64,
    /// Lifetime-earned total
    pub lifetime: i64,
}

/// The ledger service
pub struct Ledger {
    storage: Arc<Storage>,
    handle: LedgerHandle,
    metrics: LedgerMetrics,
    notifier: Option<Arc<dyn Notifier>>,
}

impl Ledger {
    /// Open storage and spawn the writer task.
    /// Must be called from within a tokio runtime.
    pub fn open(config: Config) -> Result<Self> {
        let storage = Arc::new(Storage::open(&config)?);
        let handle = LedgerActor::spawn(storage.clone(), config.retry.clone());
        let metrics = LedgerMetrics::new()
            .map_err(|e| Error::Config(format!("Failed to register metrics: {}", e)))?;

        Ok(Self {
            storage,
            handle,
            metrics,
            notifier: None,
        })
    }

    /// Attach a notifier for committed balance changes
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Metrics for this instance
    pub fn metrics(&self) -> &LedgerMetrics {
        &self.metrics
    }

    // Balance operations

    /// Apply one validated balance mutation
    pub async fn adjust(&self, adjustment: Adjustment) -> Result<(Balance, Transaction)> {
        if adjustment.amount == 0 {
            return Err(Error::InvalidArgument(
                "Adjustment amount must be nonzero".to_string(),
            ));
        }
        if adjustment.description.trim().is_empty() {
            return Err(Error::InvalidArgument(
                "Adjustment description must not be empty".to_string(),
            ));
        }

        let started = Instant::now();
        let result = self.handle.adjust(adjustment).await;
        self.metrics.record_operation(
            "adjust",
            outcome(&result),
            started.elapsed().as_secs_f64(),
        );

        let (account, transaction) = result?;
        self.metrics
            .record_credits(transaction.ledger.code(), transaction.amount);
        self.notify(&transaction).await;

        Ok((
            Balance {
                balance: account.balance,
                lifetime: account.lifetime,
            },
            transaction,
        ))
    }

    /// Current balance; zero for accounts never touched.
    /// Read-only, does not create the account row.
    pub fn get_balance(&self, user: UserId, ledger: LedgerKind) -> Result<Balance> {
        let key = AccountKey::new(user, ledger);
        let account = self.storage.fetch_account(&key)?;
        Ok(account.map_or(
            Balance {
                balance: 0,
                lifetime: 0,
            },
            |a| Balance {
                balance: a.balance,
                lifetime: a.lifetime,
            },
        ))
    }

    /// Create the account row if it does not exist yet
    pub async fn ensure_account(&self, user: UserId, ledger: LedgerKind) -> Result<Balance> {
        let account = self
            .handle
            .ensure_account(AccountKey::new(user, ledger))
            .await?;
        Ok(Balance {
            balance: account.balance,
            lifetime: account.lifetime,
        })
    }

    /// Transaction history, newest first
    pub fn list_transactions(
        &self,
        user: UserId,
        ledger: LedgerKind,
        limit: usize,
        offset: usize,
        filter: Option<TransactionKind>,
    ) -> Result<Vec<Transaction>> {
        let limit = if limit == 0 {
            DEFAULT_PAGE_SIZE
        } else {
            limit.min(MAX_PAGE_SIZE)
        };
        let key = AccountKey::new(user, ledger);
        self.storage.list_transactions(&key, limit, offset, filter)
    }

    // Payment operations

    /// Persist a pending payment created against the gateway
    pub async fn create_payment(&self, payment: Payment) -> Result<()> {
        if payment.amount <= Decimal::ZERO {
            return Err(Error::InvalidArgument(
                "Payment amount must be positive".to_string(),
            ));
        }
        if payment.order_id.trim().is_empty() {
            return Err(Error::InvalidArgument(
                "Gateway order id must not be empty".to_string(),
            ));
        }
        match &payment.params {
            crate::types::PaymentParams::CreditPurchase { credit_amount, .. } => {
                if *credit_amount <= 0 {
                    return Err(Error::InvalidArgument(
                        "Credit amount must be positive".to_string(),
                    ));
                }
            }
            crate::types::PaymentParams::Subscription {
                plan_id, plan_days, ..
            } => {
                if plan_id.trim().is_empty() {
                    return Err(Error::InvalidArgument(
                        "Plan id must not be empty".to_string(),
                    ));
                }
                if *plan_days == 0 {
                    return Err(Error::InvalidArgument(
                        "Plan period must be at least one day".to_string(),
                    ));
                }
            }
        }

        let started = Instant::now();
        let result = self.handle.create_payment(payment).await;
        self.metrics.record_operation(
            "create_payment",
            outcome(&result),
            started.elapsed().as_secs_f64(),
        );
        result
    }

    /// Confirm a payment by gateway order id, idempotently
    pub async fn settle_payment(
        &self,
        order_id: &str,
        capture_id: &str,
        paid_at: DateTime<Utc>,
    ) -> Result<SettleOutcome> {
        let started = Instant::now();
        let result = self
            .handle
            .settle_payment(order_id.to_string(), capture_id.to_string(), paid_at)
            .await;
        self.metrics.record_operation(
            "settle_payment",
            outcome(&result),
            started.elapsed().as_secs_f64(),
        );

        let outcome = result?;
        if let SettleOutcome::Settled {
            credited: Some(transaction),
            ..
        } = &outcome
        {
            self.metrics
                .record_credits(transaction.ledger.code(), transaction.amount);
            self.notify(transaction).await;
        }
        Ok(outcome)
    }

    /// Reverse a payment by gateway capture id, idempotently
    pub async fn refund_payment(&self, capture_id: &str) -> Result<RefundOutcome> {
        let started = Instant::now();
        let result = self.handle.refund_payment(capture_id.to_string()).await;
        self.metrics.record_operation(
            "refund_payment",
            outcome(&result),
            started.elapsed().as_secs_f64(),
        );

        let outcome = result?;
        if let RefundOutcome::Refunded {
            reversal: Some(transaction),
            ..
        } = &outcome
        {
            self.metrics
                .record_credits(transaction.ledger.code(), transaction.amount);
            self.notify(transaction).await;
        }
        Ok(outcome)
    }

    /// Mark a pending payment failed
    pub async fn fail_payment(&self, order_id: &str) -> Result<Payment> {
        let started = Instant::now();
        let result = self.handle.fail_payment(order_id.to_string()).await;
        self.metrics.record_operation(
            "fail_payment",
            outcome(&result),
            started.elapsed().as_secs_f64(),
        );
        result
    }

    /// Get payment by ID
    pub fn get_payment(&self, payment_id: Uuid) -> Result<Payment> {
        self.storage.get_payment(payment_id)
    }

    /// Find payment by gateway order id
    pub fn find_payment_by_order(&self, order_id: &str) -> Result<Option<Payment>> {
        self.storage.find_payment_by_order(order_id)
    }

    /// Find payment by gateway capture id
    pub fn find_payment_by_capture(&self, capture_id: &str) -> Result<Option<Payment>> {
        self.storage.find_payment_by_capture(capture_id)
    }

    // Referrals and commissions

    /// Upsert a user's referral profile
    pub async fn set_referral(&self, profile: ReferralProfile) -> Result<()> {
        if profile.commission_rate_pct < Decimal::ZERO
            || profile.commission_rate_pct > Decimal::ONE_HUNDRED
        {
            return Err(Error::InvalidArgument(
                "Commission rate must be between 0 and 100".to_string(),
            ));
        }
        if profile.referred_by == Some(profile.user) {
            return Err(Error::InvalidArgument(
                "A user cannot refer themselves".to_string(),
            ));
        }
        self.handle.set_profile(profile).await
    }

    /// Get a user's referral profile
    pub fn get_profile(&self, user: UserId) -> Result<Option<ReferralProfile>> {
        self.storage.get_profile(user)
    }

    /// Get commission by ID
    pub fn get_commission(&self, commission_id: Uuid) -> Result<Commission> {
        self.storage.get_commission(commission_id)
    }

    /// Find the commission created for a payment
    pub fn find_commission_by_payment(&self, payment_id: Uuid) -> Result<Option<Commission>> {
        self.storage.find_commission_by_payment(payment_id)
    }

    /// Cancel a pending commission
    pub async fn cancel_commission(&self, commission_id: Uuid, reason: &str) -> Result<Commission> {
        self.handle
            .cancel_commission(commission_id, reason.to_string())
            .await
    }

    // Subscriptions

    /// Get a site's subscription
    pub fn get_subscription(&self, site_id: Uuid) -> Result<Option<Subscription>> {
        self.storage.get_subscription(site_id)
    }

    /// Stop the writer task after the mailbox drains
    pub async fn shutdown(&self) {
        self.handle.shutdown().await;
    }

    /// Best-effort delivery of a committed change; failures are logged
    async fn notify(&self, transaction: &Transaction) {
        let Some(notifier) = &self.notifier else {
            return;
        };
        let change = BalanceChange {
            user: transaction.user,
            ledger: transaction.ledger,
            amount: transaction.amount,
            balance_after: transaction.balance_after,
            kind: transaction.kind,
            description: transaction.description.clone(),
        };
        if let Err(err) = notifier.balance_changed(&change).await {
            tracing::warn!(
                user = %transaction.user,
                error = %err,
                "Balance change notification failed"
            );
        }
    }
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger").finish_non_exhaustive()
    }
}

fn outcome<T>(result: &Result<T>) -> &'static str {
    match result {
        Ok(_) => "ok",
        Err(err) if err.is_transient() => "conflict",
        Err(_) => "error",
    }
}
