//! Balance change notifications
//!
//! Notification is best-effort and strictly after commit: the ledger
//! never rolls back a committed mutation because a notifier failed,
//! and a slow notifier must not block the writer.

use crate::types::{LedgerKind, TransactionKind, UserId};
use async_trait::async_trait;

/// A committed balance change, as delivered to notifiers
#[derive(Debug, Clone)]
pub struct BalanceChange {
    /// Owning user
    pub user: UserId,
    /// Ledger kind
    pub ledger: LedgerKind,
    /// Signed amount applied
    pub amount: i64,
    /// Balance after the change
    pub balance_after: i64,
    /// Kind tag of the recorded transaction
    pub kind: TransactionKind,
    /// Human-readable reason
    pub description: String,
}

/// Downstream sink for committed balance changes
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver one committed change. Errors are logged by the caller
    /// and never affect the ledger operation that produced the change.
    async fn balance_changed(&self, change: &BalanceChange) -> anyhow::Result<()>;
}

/// Notifier that emits a structured log line per change
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn balance_changed(&self, change: &BalanceChange) -> anyhow::Result<()> {
        tracing::info!(
            user = %change.user,
            ledger = %change.ledger,
            amount = change.amount,
            balance = change.balance_after,
            kind = %change.kind,
            "Balance changed"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_log_notifier_never_fails() {
        let notifier = LogNotifier;
        let change = BalanceChange {
            user: UserId::new(Uuid::new_v4()),
            ledger: LedgerKind::Credits,
            amount: 100,
            balance_after: 100,
            kind: TransactionKind::Purchase,
            description: "test".to_string(),
        };
        assert!(notifier.balance_changed(&change).await.is_ok());
    }
}
