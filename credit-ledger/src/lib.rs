//! CreditRail Ledger
//!
//! Persisted credit balances, immutable transaction history, payment
//! lifecycle and affiliate commissions for the platform.
//!
//! # Architecture
//!
//! - **Single Writer**: every mutation is serialized through one actor
//!   task, so a balance check and its write are one linearized step
//! - **Atomic Units**: balance update + transaction record + payment
//!   side rows commit as a single RocksDB `WriteBatch`
//! - **Append-only audit**: transaction rows are created once and
//!   never modified or deleted
//!
//! # Invariants
//!
//! - `balance >= 0` for every account, at all times
//! - `lifetime` is non-decreasing, increased only by positive credits
//! - every transaction's `balance_after` equals the account balance
//!   immediately after that transaction was applied

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod actor;
pub mod commission;
pub mod config;
pub mod error;
pub mod ledger;
pub mod metrics;
pub mod notify;
pub mod storage;
pub mod types;

// Re-exports
pub use config::Config;
pub use error::{Error, Result};
pub use ledger::{Balance, Ledger};
pub use storage::{RefundOutcome, SettleOutcome, Storage};
pub use types::{
    Account, AccountKey, Adjustment, Commission, CommissionStatus, Currency, LedgerKind, Money,
    Payment, PaymentParams, PaymentStatus, PaymentType, ReferralProfile, Subscription,
    Transaction, TransactionKind, UserId,
};
