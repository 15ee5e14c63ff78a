//! Single-writer actor
//!
//! All mutations flow through one tokio task owning the storage write
//! path. Serializing writers makes every read-check-write atomic with
//! respect to other mutations: two concurrent debits of the same
//! account are applied one after the other against the committed
//! balance, so the non-negative invariant cannot be raced past.
//!
//! Reads do not pass through the mailbox; they go straight to storage.

use crate::{
    config::RetryConfig,
    error::{Error, Result},
    storage::{RefundOutcome, SettleOutcome, Storage},
    types::{
        Account, Adjustment, AccountKey, Commission, Payment, ReferralProfile, Transaction,
    },
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

/// Mailbox depth before senders start backpressuring
const MAILBOX_CAPACITY: usize = 1024;

/// Messages processed by the writer task
pub enum LedgerMessage {
    /// Apply one balance mutation
    Adjust {
        adjustment: Adjustment,
        reply: oneshot::Sender<Result<(Account, Transaction)>>,
    },
    /// Read-or-create an account row
    EnsureAccount {
        key: AccountKey,
        reply: oneshot::Sender<Result<Account>>,
    },
    /// Persist a freshly created pending payment
    CreatePayment {
        payment: Payment,
        reply: oneshot::Sender<Result<()>>,
    },
    /// Confirm a payment by gateway order id
    SettlePayment {
        order_id: String,
        capture_id: String,
        paid_at: DateTime<Utc>,
        reply: oneshot::Sender<Result<SettleOutcome>>,
    },
    /// Reverse a payment by gateway capture id
    RefundPayment {
        capture_id: String,
        reply: oneshot::Sender<Result<RefundOutcome>>,
    },
    /// Mark a pending payment failed
    FailPayment {
        order_id: String,
        reply: oneshot::Sender<Result<Payment>>,
    },
    /// Upsert a referral profile
    SetProfile {
        profile: ReferralProfile,
        reply: oneshot::Sender<Result<()>>,
    },
    /// Cancel a pending commission
    CancelCommission {
        commission_id: Uuid,
        reason: String,
        reply: oneshot::Sender<Result<Commission>>,
    },
    /// Drain and stop
    Shutdown { reply: oneshot::Sender<()> },
}

/// The writer task: owns the mutation path over shared storage
pub struct LedgerActor {
    storage: Arc<Storage>,
    retry: RetryConfig,
    mailbox: mpsc::Receiver<LedgerMessage>,
}

/// Cloneable handle for submitting mutations to the writer task
#[derive(Clone)]
pub struct LedgerHandle {
    sender: mpsc::Sender<LedgerMessage>,
}

impl std::fmt::Debug for LedgerActor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerActor").finish_non_exhaustive()
    }
}

impl std::fmt::Debug for LedgerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerHandle").finish_non_exhaustive()
    }
}

impl std::fmt::Debug for LedgerMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LedgerMessage::Adjust { .. } => "Adjust",
            LedgerMessage::EnsureAccount { .. } => "EnsureAccount",
            LedgerMessage::CreatePayment { .. } => "CreatePayment",
            LedgerMessage::SettlePayment { .. } => "SettlePayment",
            LedgerMessage::RefundPayment { .. } => "RefundPayment",
            LedgerMessage::FailPayment { .. } => "FailPayment",
            LedgerMessage::SetProfile { .. } => "SetProfile",
            LedgerMessage::CancelCommission { .. } => "CancelCommission",
            LedgerMessage::Shutdown { .. } => "Shutdown",
        };
        f.write_str(name)
    }
}

impl LedgerActor {
    /// Spawn the writer task, returning its handle
    pub fn spawn(storage: Arc<Storage>, retry: RetryConfig) -> LedgerHandle {
        let (sender, mailbox) = mpsc::channel(MAILBOX_CAPACITY);
        let actor = LedgerActor {
            storage,
            retry,
            mailbox,
        };

        tokio::spawn(actor.run());

        LedgerHandle { sender }
    }

    async fn run(mut self) {
        tracing::info!("Ledger writer task started");

        while let Some(message) = self.mailbox.recv().await {
            match message {
                LedgerMessage::Adjust { adjustment, reply } => {
                    let result = self
                        .with_retry(|| self.storage.apply_adjustment(&adjustment))
                        .await;
                    let _ = reply.send(result);
                }
                LedgerMessage::EnsureAccount { key, reply } => {
                    let result = self.with_retry(|| self.storage.ensure_account(&key)).await;
                    let _ = reply.send(result);
                }
                LedgerMessage::CreatePayment { payment, reply } => {
                    let result = self.with_retry(|| self.storage.insert_payment(&payment)).await;
                    let _ = reply.send(result);
                }
                LedgerMessage::SettlePayment {
                    order_id,
                    capture_id,
                    paid_at,
                    reply,
                } => {
                    let result = self
                        .with_retry(|| self.storage.settle_payment(&order_id, &capture_id, paid_at))
                        .await;
                    let _ = reply.send(result);
                }
                LedgerMessage::RefundPayment { capture_id, reply } => {
                    let result = self
                        .with_retry(|| self.storage.refund_payment(&capture_id))
                        .await;
                    let _ = reply.send(result);
                }
                LedgerMessage::FailPayment { order_id, reply } => {
                    let result = self.with_retry(|| self.storage.fail_payment(&order_id)).await;
                    let _ = reply.send(result);
                }
                LedgerMessage::SetProfile { profile, reply } => {
                    let result = self.with_retry(|| self.storage.put_profile(&profile)).await;
                    let _ = reply.send(result);
                }
                LedgerMessage::CancelCommission {
                    commission_id,
                    reason,
                    reply,
                } => {
                    let result = self
                        .with_retry(|| self.storage.cancel_commission(commission_id, &reason))
                        .await;
                    let _ = reply.send(result);
                }
                LedgerMessage::Shutdown { reply } => {
                    let _ = reply.send(());
                    break;
                }
            }
        }

        tracing::info!("Ledger writer task stopped");
    }

    /// Re-run the whole atomic unit on transient storage conflicts,
    /// up to the configured attempt bound. Each attempt re-reads the
    /// committed state, so retries never apply stale deltas.
    async fn with_retry<T>(&self, op: impl Fn() -> Result<T>) -> Result<T> {
        let mut attempt = 1u32;
        loop {
            match op() {
                Err(err) if err.is_transient() && attempt < self.retry.max_attempts => {
                    tracing::warn!(
                        attempt,
                        max_attempts = self.retry.max_attempts,
                        error = %err,
                        "Transient storage conflict, retrying"
                    );
                    attempt += 1;
                    tokio::time::sleep(Duration::from_millis(self.retry.backoff_ms)).await;
                }
                other => return other,
            }
        }
    }
}

impl LedgerHandle {
    async fn send<T>(
        &self,
        message: LedgerMessage,
        receiver: oneshot::Receiver<Result<T>>,
    ) -> Result<T> {
        self.sender
            .send(message)
            .await
            .map_err(|_| Error::Concurrency("Ledger writer task is gone".to_string()))?;
        receiver
            .await
            .map_err(|_| Error::Concurrency("Ledger writer dropped the reply".to_string()))?
    }

    /// Apply one balance mutation
    pub async fn adjust(&self, adjustment: Adjustment) -> Result<(Account, Transaction)> {
        let (reply, receiver) = oneshot::channel();
        self.send(LedgerMessage::Adjust { adjustment, reply }, receiver)
            .await
    }

    /// Read-or-create an account row
    pub async fn ensure_account(&self, key: AccountKey) -> Result<Account> {
        let (reply, receiver) = oneshot::channel();
        self.send(LedgerMessage::EnsureAccount { key, reply }, receiver)
            .await
    }

    /// Persist a pending payment
    pub async fn create_payment(&self, payment: Payment) -> Result<()> {
        let (reply, receiver) = oneshot::channel();
        self.send(LedgerMessage::CreatePayment { payment, reply }, receiver)
            .await
    }

    /// Confirm a payment by gateway order id
    pub async fn settle_payment(
        &self,
        order_id: String,
        capture_id: String,
        paid_at: DateTime<Utc>,
    ) -> Result<SettleOutcome> {
        let (reply, receiver) = oneshot::channel();
        self.send(
            LedgerMessage::SettlePayment {
                order_id,
                capture_id,
                paid_at,
                reply,
            },
            receiver,
        )
        .await
    }

    /// Reverse a payment by gateway capture id
    pub async fn refund_payment(&self, capture_id: String) -> Result<RefundOutcome> {
        let (reply, receiver) = oneshot::channel();
        self.send(LedgerMessage::RefundPayment { capture_id, reply }, receiver)
            .await
    }

    /// Mark a pending payment failed
    pub async fn fail_payment(&self, order_id: String) -> Result<Payment> {
        let (reply, receiver) = oneshot::channel();
        self.send(LedgerMessage::FailPayment { order_id, reply }, receiver)
            .await
    }

    /// Upsert a referral profile
    pub async fn set_profile(&self, profile: ReferralProfile) -> Result<()> {
        let (reply, receiver) = oneshot::channel();
        self.send(LedgerMessage::SetProfile { profile, reply }, receiver)
            .await
    }

    /// Cancel a pending commission
    pub async fn cancel_commission(&self, commission_id: Uuid, reason: String) -> Result<Commission> {
        let (reply, receiver) = oneshot::channel();
        self.send(
            LedgerMessage::CancelCommission {
                commission_id,
                reason,
                reply,
            },
            receiver,
        )
        .await
    }

    /// Stop the writer task after the mailbox drains
    pub async fn shutdown(&self) {
        let (reply, receiver) = oneshot::channel();
        if self
            .sender
            .send(LedgerMessage::Shutdown { reply })
            .await
            .is_ok()
        {
            let _ = receiver.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{LedgerKind, TransactionKind, UserId};
    use crate::Config;
    use tempfile::TempDir;

    fn spawn_test_actor() -> (LedgerHandle, Arc<Storage>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        let storage = Arc::new(Storage::open(&config).unwrap());
        let handle = LedgerActor::spawn(storage.clone(), config.retry);
        (handle, storage, temp_dir)
    }

    #[tokio::test]
    async fn test_adjust_through_actor() {
        let (handle, _storage, _temp) = spawn_test_actor();
        let user = UserId::new(Uuid::new_v4());

        let (account, transaction) = handle
            .adjust(Adjustment::new(
                user,
                LedgerKind::Credits,
                500,
                TransactionKind::Purchase,
                "test credit",
            ))
            .await
            .unwrap();

        assert_eq!(account.balance, 500);
        assert_eq!(transaction.balance_after, 500);
    }

    #[tokio::test]
    async fn test_concurrent_debits_cannot_overdraw() {
        let (handle, storage, _temp) = spawn_test_actor();
        let user = UserId::new(Uuid::new_v4());

        handle
            .adjust(Adjustment::new(
                user,
                LedgerKind::Credits,
                100,
                TransactionKind::Purchase,
                "seed",
            ))
            .await
            .unwrap();

        // Both debits would individually fit; together they overdraw.
        // The writer serializes them, so exactly one must fail.
        let mut tasks = Vec::new();
        for _ in 0..2 {
            let handle = handle.clone();
            tasks.push(tokio::spawn(async move {
                handle
                    .adjust(Adjustment::new(
                        user,
                        LedgerKind::Credits,
                        -80,
                        TransactionKind::Usage,
                        "spend",
                    ))
                    .await
            }));
        }

        let mut failures = 0;
        for task in tasks {
            if task.await.unwrap().is_err() {
                failures += 1;
            }
        }
        assert_eq!(failures, 1);

        let key = AccountKey::new(user, LedgerKind::Credits);
        let account = storage.fetch_account(&key).unwrap().unwrap();
        assert_eq!(account.balance, 20);
    }

    #[tokio::test]
    async fn test_writer_survives_out_of_range_amount() {
        let (handle, _storage, _temp) = spawn_test_actor();
        let user = UserId::new(Uuid::new_v4());

        let result = handle
            .adjust(Adjustment::new(
                user,
                LedgerKind::Credits,
                i64::MIN,
                TransactionKind::Usage,
                "drain",
            ))
            .await;
        assert!(matches!(result, Err(Error::InvalidArgument(_))));

        // The rejection stays a plain error; the writer keeps serving
        let (account, _) = handle
            .adjust(Adjustment::new(
                user,
                LedgerKind::Credits,
                500,
                TransactionKind::Purchase,
                "after rejection",
            ))
            .await
            .unwrap();
        assert_eq!(account.balance, 500);
    }

    #[tokio::test]
    async fn test_shutdown_stops_writer() {
        let (handle, _storage, _temp) = spawn_test_actor();
        handle.shutdown().await;

        let user = UserId::new(Uuid::new_v4());
        let result = handle
            .adjust(Adjustment::new(
                user,
                LedgerKind::Credits,
                10,
                TransactionKind::Purchase,
                "after shutdown",
            ))
            .await;
        assert!(matches!(result, Err(Error::Concurrency(_))));
    }
}
