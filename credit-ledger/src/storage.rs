//! Storage layer using RocksDB
//!
//! # Column Families
//!
//! - `accounts` - Balance accounts (key: ledger tag || user uuid)
//! - `transactions` - Append-only audit rows (key: transaction uuid, v7)
//! - `payments` - Payment lifecycle rows (key: payment uuid)
//! - `commissions` - Referral commissions (key: commission uuid)
//! - `profiles` - Referral profiles (key: user uuid)
//! - `subscriptions` - Site subscriptions (key: site uuid)
//! - `indices` - Secondary indices for order/capture/payment lookups
//!
//! Every mutating operation commits as a single `WriteBatch`: balance
//! update, transaction row and any payment/commission side rows either
//! all land or none do. Callers must route mutations through the
//! single-writer actor so the read-check-write here is linearized.

use crate::{
    commission,
    error::{Error, Result},
    types::{
        Account, AccountKey, Adjustment, Commission, CommissionStatus, Money, Payment,
        PaymentParams, PaymentStatus, ReferralProfile, Subscription, Transaction,
        TransactionKind, UserId,
    },
    Config,
};
use chrono::{DateTime, Duration, Utc};
use rocksdb::{
    ColumnFamily, ColumnFamilyDescriptor, DBCompactionStyle, Direction, IteratorMode, Options,
    WriteBatch, DB,
};
use std::sync::Arc;
use uuid::Uuid;

/// Column family names
const CF_ACCOUNTS: &str = "accounts";
const CF_TRANSACTIONS: &str = "transactions";
const CF_PAYMENTS: &str = "payments";
const CF_COMMISSIONS: &str = "commissions";
const CF_PROFILES: &str = "profiles";
const CF_SUBSCRIPTIONS: &str = "subscriptions";
const CF_INDICES: &str = "indices";

/// Index key prefixes within `indices`
const IDX_TX: &[u8] = b"tx|";
const IDX_ORDER: &[u8] = b"order|";
const IDX_CAPTURE: &[u8] = b"capture|";
const IDX_COMMISSION: &[u8] = b"comm|";

/// Outcome of settling a payment by order id
#[derive(Debug)]
pub enum SettleOutcome {
    /// First confirmation: ledger effects were applied
    Settled {
        /// The payment after the transition
        payment: Payment,
        /// Credit transaction, for credit purchases
        credited: Option<Transaction>,
        /// Commission created for the referrer, if any
        commission: Option<Commission>,
        /// Subscription created or renewed, for subscription payments
        subscription: Option<Subscription>,
    },
    /// Duplicate confirmation: no further effect
    AlreadySettled {
        /// The already-succeeded payment
        payment: Payment,
    },
}

/// Outcome of refunding a payment by capture id
#[derive(Debug)]
pub enum RefundOutcome {
    /// First refund: reversal applied
    Refunded {
        /// The payment after the transition
        payment: Payment,
        /// Reversal transaction; absent when the balance was already zero
        reversal: Option<Transaction>,
        /// Commission cancelled alongside, if one was pending
        commission: Option<Commission>,
    },
    /// Duplicate refund delivery: no further effect
    AlreadyRefunded {
        /// The already-refunded payment
        payment: Payment,
    },
}

/// Storage wrapper for RocksDB
pub struct Storage {
    db: Arc<DB>,
}

impl Storage {
    /// Open or create database
    pub fn open(config: &Config) -> Result<Self> {
        let path = &config.data_dir;

        std::fs::create_dir_all(path)?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        // Tuning from config
        db_opts.set_write_buffer_size(config.rocksdb.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_write_buffer_number(config.rocksdb.max_write_buffer_number);
        db_opts.set_target_file_size_base(config.rocksdb.target_file_size_mb * 1024 * 1024);
        db_opts.set_max_background_jobs(config.rocksdb.max_background_jobs);
        db_opts.set_compaction_style(DBCompactionStyle::Universal);

        if config.rocksdb.enable_statistics {
            db_opts.enable_statistics();
        }

        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_ACCOUNTS, Self::cf_options_hot()),
            ColumnFamilyDescriptor::new(CF_TRANSACTIONS, Self::cf_options_cold()),
            ColumnFamilyDescriptor::new(CF_PAYMENTS, Self::cf_options_hot()),
            ColumnFamilyDescriptor::new(CF_COMMISSIONS, Self::cf_options_hot()),
            ColumnFamilyDescriptor::new(CF_PROFILES, Self::cf_options_hot()),
            ColumnFamilyDescriptor::new(CF_SUBSCRIPTIONS, Self::cf_options_hot()),
            ColumnFamilyDescriptor::new(CF_INDICES, Self::cf_options_indices()),
        ];

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

        tracing::info!(path = ?path, "Opened ledger RocksDB");

        Ok(Self { db: Arc::new(db) })
    }

    // Column family options

    fn cf_options_hot() -> Options {
        let mut opts = Options::default();
        // Frequently read rows, favor decode speed
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        opts
    }

    fn cf_options_cold() -> Options {
        let mut opts = Options::default();
        // Append-only history, favor size
        opts.set_compression_type(rocksdb::DBCompressionType::Zstd);
        opts.set_bottommost_compression_type(rocksdb::DBCompressionType::Zstd);
        opts
    }

    fn cf_options_indices() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        let mut block_opts = rocksdb::BlockBasedOptions::default();
        block_opts.set_bloom_filter(10.0, false);
        opts.set_block_based_table_factory(&block_opts);
        opts
    }

    fn cf_handle(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Storage(format!("Column family {} not found", name)))
    }

    // Index key helpers

    fn index_key_tx(account: &AccountKey, transaction_id: Uuid) -> Vec<u8> {
        let mut key = IDX_TX.to_vec();
        key.extend_from_slice(&account.encode());
        key.extend_from_slice(transaction_id.as_bytes());
        key
    }

    fn index_key_order(order_id: &str) -> Vec<u8> {
        let mut key = IDX_ORDER.to_vec();
        key.extend_from_slice(order_id.as_bytes());
        key
    }

    fn index_key_capture(capture_id: &str) -> Vec<u8> {
        let mut key = IDX_CAPTURE.to_vec();
        key.extend_from_slice(capture_id.as_bytes());
        key
    }

    fn index_key_commission(payment_id: Uuid) -> Vec<u8> {
        let mut key = IDX_COMMISSION.to_vec();
        key.extend_from_slice(payment_id.as_bytes());
        key
    }

    // Account operations

    /// Read an account, `None` if the pair was never touched
    pub fn fetch_account(&self, key: &AccountKey) -> Result<Option<Account>> {
        let cf = self.cf_handle(CF_ACCOUNTS)?;
        match self.db.get_cf(cf, key.encode())? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    /// Read-or-create: persists a zero-balance account on first touch
    pub fn ensure_account(&self, key: &AccountKey) -> Result<Account> {
        if let Some(account) = self.fetch_account(key)? {
            return Ok(account);
        }

        let account = Account::new(*key, Utc::now());
        let cf = self.cf_handle(CF_ACCOUNTS)?;
        self.db
            .put_cf(cf, key.encode(), bincode::serialize(&account)?)?;

        tracing::debug!(user = %key.user, ledger = %key.ledger, "Account created");
        Ok(account)
    }

    /// Stage one balance mutation into `batch` and return the rows it
    /// will write. Enforces the non-negative invariant against the
    /// committed balance; nothing is written until the batch commits.
    fn stage_adjustment(
        &self,
        batch: &mut WriteBatch,
        adj: &Adjustment,
        now: DateTime<Utc>,
    ) -> Result<(Account, Transaction)> {
        let key = AccountKey::new(adj.user, adj.ledger);
        let mut account = self
            .fetch_account(&key)?
            .unwrap_or_else(|| Account::new(key, now));

        // Checked arithmetic: i64::MIN has no negation and a balance
        // near i64::MAX must not wrap negative past the invariant.
        if adj.amount < 0 {
            let required = adj.amount.checked_neg().ok_or_else(|| {
                Error::InvalidArgument(format!("Adjustment amount out of range: {}", adj.amount))
            })?;
            if account.balance < required {
                return Err(Error::InsufficientBalance {
                    required,
                    available: account.balance,
                });
            }
        }

        account.balance = account.balance.checked_add(adj.amount).ok_or_else(|| {
            Error::InvalidArgument(format!(
                "Adjustment of {} overflows balance {}",
                adj.amount, account.balance
            ))
        })?;
        if adj.amount > 0 {
            account.lifetime = account.lifetime.checked_add(adj.amount).ok_or_else(|| {
                Error::InvalidArgument(format!(
                    "Adjustment of {} overflows lifetime {}",
                    adj.amount, account.lifetime
                ))
            })?;
        }
        account.updated_at = now;

        let transaction = Transaction {
            transaction_id: Uuid::now_v7(),
            user: adj.user,
            ledger: adj.ledger,
            amount: adj.amount,
            balance_after: account.balance,
            kind: adj.kind,
            description: adj.description.clone(),
            cost: adj.cost,
            payment_id: adj.payment_id,
            site_id: adj.site_id,
            created_at: now,
        };

        let cf_accounts = self.cf_handle(CF_ACCOUNTS)?;
        batch.put_cf(cf_accounts, key.encode(), bincode::serialize(&account)?);

        let cf_transactions = self.cf_handle(CF_TRANSACTIONS)?;
        batch.put_cf(
            cf_transactions,
            transaction.transaction_id.as_bytes(),
            bincode::serialize(&transaction)?,
        );

        let cf_indices = self.cf_handle(CF_INDICES)?;
        batch.put_cf(
            cf_indices,
            Self::index_key_tx(&key, transaction.transaction_id),
            [],
        );

        Ok((account, transaction))
    }

    /// Apply one balance mutation atomically
    pub fn apply_adjustment(&self, adj: &Adjustment) -> Result<(Account, Transaction)> {
        let mut batch = WriteBatch::default();
        let (account, transaction) = self.stage_adjustment(&mut batch, adj, Utc::now())?;
        self.db.write(batch)?;

        tracing::debug!(
            user = %adj.user,
            ledger = %adj.ledger,
            amount = adj.amount,
            balance = account.balance,
            kind = %adj.kind,
            "Balance adjusted"
        );

        Ok((account, transaction))
    }

    /// Get transaction by ID
    pub fn get_transaction(&self, transaction_id: Uuid) -> Result<Transaction> {
        let cf = self.cf_handle(CF_TRANSACTIONS)?;
        let value = self
            .db
            .get_cf(cf, transaction_id.as_bytes())?
            .ok_or_else(|| Error::Storage(format!("Transaction not found: {}", transaction_id)))?;
        Ok(bincode::deserialize(&value)?)
    }

    /// List transactions for an account, newest first.
    ///
    /// `filter` narrows by kind before `offset`/`limit` apply.
    pub fn list_transactions(
        &self,
        key: &AccountKey,
        limit: usize,
        offset: usize,
        filter: Option<TransactionKind>,
    ) -> Result<Vec<Transaction>> {
        let cf_indices = self.cf_handle(CF_INDICES)?;

        let mut prefix = IDX_TX.to_vec();
        prefix.extend_from_slice(&key.encode());

        // UUIDv7 index keys sort oldest-first. Seek to the largest
        // possible key under the prefix and walk backwards, stopping
        // once the page is full rather than loading the full history.
        let mut upper = prefix.clone();
        upper.extend_from_slice(&[0xff; 16]);
        let iter = self
            .db
            .iterator_cf(cf_indices, IteratorMode::From(&upper, Direction::Reverse));

        let mut out = Vec::new();
        let mut skipped = 0usize;
        for item in iter {
            let (index_key, _) = item?;
            if !index_key.starts_with(&prefix) {
                break;
            }
            let id_bytes: [u8; 16] = index_key[prefix.len()..]
                .try_into()
                .map_err(|_| Error::Storage("Malformed transaction index key".to_string()))?;
            let transaction = self.get_transaction(Uuid::from_bytes(id_bytes))?;
            if let Some(kind) = filter {
                if transaction.kind != kind {
                    continue;
                }
            }
            if skipped < offset {
                skipped += 1;
                continue;
            }
            out.push(transaction);
            if out.len() >= limit {
                break;
            }
        }

        Ok(out)
    }

    // Payment operations

    /// Persist a freshly created pending payment and index its order id
    pub fn insert_payment(&self, payment: &Payment) -> Result<()> {
        let cf_indices = self.cf_handle(CF_INDICES)?;
        let order_key = Self::index_key_order(&payment.order_id);
        if self.db.get_cf(cf_indices, &order_key)?.is_some() {
            return Err(Error::InvalidArgument(format!(
                "Duplicate gateway order id: {}",
                payment.order_id
            )));
        }

        let mut batch = WriteBatch::default();
        let cf_payments = self.cf_handle(CF_PAYMENTS)?;
        batch.put_cf(
            cf_payments,
            payment.payment_id.as_bytes(),
            bincode::serialize(payment)?,
        );
        batch.put_cf(cf_indices, order_key, payment.payment_id.as_bytes());
        self.db.write(batch)?;

        tracing::debug!(
            payment_id = %payment.payment_id,
            order_id = %payment.order_id,
            user = %payment.user,
            "Payment created"
        );

        Ok(())
    }

    /// Get payment by ID
    pub fn get_payment(&self, payment_id: Uuid) -> Result<Payment> {
        let cf = self.cf_handle(CF_PAYMENTS)?;
        let value = self
            .db
            .get_cf(cf, payment_id.as_bytes())?
            .ok_or_else(|| Error::PaymentNotFound(payment_id.to_string()))?;
        Ok(bincode::deserialize(&value)?)
    }

    fn find_payment_by_index(&self, index_key: &[u8]) -> Result<Option<Payment>> {
        let cf_indices = self.cf_handle(CF_INDICES)?;
        match self.db.get_cf(cf_indices, index_key)? {
            Some(value) => {
                let id_bytes: [u8; 16] = value
                    .as_slice()
                    .try_into()
                    .map_err(|_| Error::Storage("Malformed payment index value".to_string()))?;
                Ok(Some(self.get_payment(Uuid::from_bytes(id_bytes))?))
            }
            None => Ok(None),
        }
    }

    /// Find payment by gateway order id
    pub fn find_payment_by_order(&self, order_id: &str) -> Result<Option<Payment>> {
        self.find_payment_by_index(&Self::index_key_order(order_id))
    }

    /// Find payment by gateway capture id
    pub fn find_payment_by_capture(&self, capture_id: &str) -> Result<Option<Payment>> {
        self.find_payment_by_index(&Self::index_key_capture(capture_id))
    }

    /// Confirm a payment: `Pending -> Succeeded`, exactly once.
    ///
    /// On first confirmation, atomically with the status change:
    /// credit purchases credit the target ledger (tagged `Purchase`,
    /// carrying the monetary cost), subscriptions create or renew the
    /// site's subscription, and a commission is created when the payer
    /// has a referrer. Duplicate confirmations are reported, not
    /// re-applied.
    pub fn settle_payment(
        &self,
        order_id: &str,
        capture_id: &str,
        paid_at: DateTime<Utc>,
    ) -> Result<SettleOutcome> {
        let mut payment = self
            .find_payment_by_order(order_id)?
            .ok_or_else(|| Error::OrderNotFound(order_id.to_string()))?;

        match payment.status {
            PaymentStatus::Pending => {}
            PaymentStatus::Succeeded => return Ok(SettleOutcome::AlreadySettled { payment }),
            status => {
                return Err(Error::InvalidTransition(format!(
                    "Payment {} is {}, cannot settle",
                    payment.payment_id, status
                )))
            }
        }

        payment.status = PaymentStatus::Succeeded;
        payment.capture_id = Some(capture_id.to_string());
        payment.paid_at = Some(paid_at);

        let mut batch = WriteBatch::default();
        let cf_payments = self.cf_handle(CF_PAYMENTS)?;
        batch.put_cf(
            cf_payments,
            payment.payment_id.as_bytes(),
            bincode::serialize(&payment)?,
        );
        let cf_indices = self.cf_handle(CF_INDICES)?;
        batch.put_cf(
            cf_indices,
            Self::index_key_capture(capture_id),
            payment.payment_id.as_bytes(),
        );

        let mut credited = None;
        let mut subscription = None;

        match payment.params.clone() {
            PaymentParams::CreditPurchase {
                ledger,
                credit_amount,
            } => {
                let adj = Adjustment {
                    user: payment.user,
                    ledger,
                    amount: credit_amount,
                    kind: TransactionKind::Purchase,
                    description: format!("Purchased {} {} credits", credit_amount, ledger),
                    cost: Some(Money {
                        amount: payment.amount,
                        currency: payment.currency,
                    }),
                    payment_id: Some(payment.payment_id),
                    site_id: None,
                };
                let (_, transaction) = self.stage_adjustment(&mut batch, &adj, paid_at)?;
                credited = Some(transaction);
            }
            PaymentParams::Subscription {
                site_id,
                plan_id,
                plan_days,
            } => {
                let sub = self.stage_subscription(
                    &mut batch,
                    payment.user,
                    site_id,
                    &plan_id,
                    plan_days,
                    paid_at,
                )?;
                subscription = Some(sub);
            }
        }

        let commission = self.stage_commission(&mut batch, &payment)?;

        self.db.write(batch)?;

        tracing::info!(
            payment_id = %payment.payment_id,
            order_id = %order_id,
            capture_id = %capture_id,
            payment_type = %payment.payment_type(),
            commission = commission.is_some(),
            "Payment settled"
        );

        Ok(SettleOutcome::Settled {
            payment,
            credited,
            commission,
            subscription,
        })
    }

    /// Create or renew the site's subscription as part of a settle batch
    fn stage_subscription(
        &self,
        batch: &mut WriteBatch,
        user: UserId,
        site_id: Uuid,
        plan_id: &str,
        plan_days: u32,
        now: DateTime<Utc>,
    ) -> Result<Subscription> {
        let period = Duration::days(i64::from(plan_days));
        let subscription = match self.get_subscription(site_id)? {
            Some(mut existing) => {
                // Renewal extends from the paid-through date, never shortens it
                let base = existing.expires_at.max(now);
                existing.plan_id = plan_id.to_string();
                existing.active = true;
                existing.renewed_at = now;
                existing.expires_at = base + period;
                existing
            }
            None => Subscription {
                site_id,
                user,
                plan_id: plan_id.to_string(),
                active: true,
                started_at: now,
                renewed_at: now,
                expires_at: now + period,
            },
        };

        let cf = self.cf_handle(CF_SUBSCRIPTIONS)?;
        batch.put_cf(cf, site_id.as_bytes(), bincode::serialize(&subscription)?);
        Ok(subscription)
    }

    /// Create the referral commission as part of a settle batch.
    /// No-op when the payer has no referrer, or when a commission for
    /// this payment already exists.
    fn stage_commission(&self, batch: &mut WriteBatch, payment: &Payment) -> Result<Option<Commission>> {
        let Some(profile) = self.get_profile(payment.user)? else {
            return Ok(None);
        };
        let Some(referrer) = profile.referred_by else {
            return Ok(None);
        };
        if self.find_commission_by_payment(payment.payment_id)?.is_some() {
            return Ok(None);
        }

        let Some(referrer_profile) = self.get_profile(referrer)? else {
            return Ok(None);
        };

        let commission =
            commission::build_commission(payment, referrer, referrer_profile.commission_rate_pct);

        let cf_commissions = self.cf_handle(CF_COMMISSIONS)?;
        batch.put_cf(
            cf_commissions,
            commission.commission_id.as_bytes(),
            bincode::serialize(&commission)?,
        );
        let cf_indices = self.cf_handle(CF_INDICES)?;
        batch.put_cf(
            cf_indices,
            Self::index_key_commission(payment.payment_id),
            commission.commission_id.as_bytes(),
        );

        Ok(Some(commission))
    }

    /// Reverse a payment: `Succeeded -> Refunded`, exactly once.
    ///
    /// For credit purchases the debit is clamped at zero: if credits
    /// were already spent, only what remains is reversed, and the
    /// reversal transaction records the actual amount debited and the
    /// shortfall. A pending commission for the same payment is
    /// cancelled; paid or cancelled commissions are left untouched.
    pub fn refund_payment(&self, capture_id: &str) -> Result<RefundOutcome> {
        let mut payment = self
            .find_payment_by_capture(capture_id)?
            .ok_or_else(|| Error::OrderNotFound(format!("capture {}", capture_id)))?;

        match payment.status {
            PaymentStatus::Succeeded => {}
            PaymentStatus::Refunded => return Ok(RefundOutcome::AlreadyRefunded { payment }),
            status => {
                return Err(Error::InvalidTransition(format!(
                    "Payment {} is {}, cannot refund",
                    payment.payment_id, status
                )))
            }
        }

        let now = Utc::now();
        payment.status = PaymentStatus::Refunded;

        let mut batch = WriteBatch::default();
        let cf_payments = self.cf_handle(CF_PAYMENTS)?;
        batch.put_cf(
            cf_payments,
            payment.payment_id.as_bytes(),
            bincode::serialize(&payment)?,
        );

        let mut reversal = None;
        if let PaymentParams::CreditPurchase {
            ledger,
            credit_amount,
        } = payment.params
        {
            let key = AccountKey::new(payment.user, ledger);
            let available = self.fetch_account(&key)?.map_or(0, |a| a.balance);
            let debit = credit_amount.min(available);

            if debit > 0 {
                let description = if debit < credit_amount {
                    format!(
                        "Refund of payment {} (clamped: reversed {} of {} credits)",
                        payment.payment_id, debit, credit_amount
                    )
                } else {
                    format!("Refund of payment {}", payment.payment_id)
                };
                let adj = Adjustment {
                    user: payment.user,
                    ledger,
                    amount: -debit,
                    kind: TransactionKind::Refund,
                    description,
                    cost: Some(Money {
                        amount: payment.amount,
                        currency: payment.currency,
                    }),
                    payment_id: Some(payment.payment_id),
                    site_id: None,
                };
                let (_, transaction) = self.stage_adjustment(&mut batch, &adj, now)?;
                reversal = Some(transaction);
            } else {
                tracing::warn!(
                    payment_id = %payment.payment_id,
                    credit_amount,
                    "Refund found nothing to reverse, credits already spent"
                );
            }
        }

        let commission = self.stage_commission_cancel(&mut batch, &payment, now)?;

        self.db.write(batch)?;

        tracing::info!(
            payment_id = %payment.payment_id,
            capture_id = %capture_id,
            reversed = reversal.as_ref().map_or(0, |t| -t.amount),
            commission_cancelled = commission.is_some(),
            "Payment refunded"
        );

        Ok(RefundOutcome::Refunded {
            payment,
            reversal,
            commission,
        })
    }

    /// Cancel the payment's pending commission as part of a refund batch
    fn stage_commission_cancel(
        &self,
        batch: &mut WriteBatch,
        payment: &Payment,
        now: DateTime<Utc>,
    ) -> Result<Option<Commission>> {
        let Some(mut commission) = self.find_commission_by_payment(payment.payment_id)? else {
            return Ok(None);
        };

        // Referential check: the indexed commission must belong to the
        // payment being refunded, and only pending ones are cancellable
        if commission.payment_id != payment.payment_id
            || commission.status != CommissionStatus::Pending
        {
            return Ok(None);
        }

        commission.status = CommissionStatus::Cancelled;
        commission.cancel_reason = Some(format!("Payment {} refunded", payment.payment_id));
        commission.updated_at = now;

        let cf = self.cf_handle(CF_COMMISSIONS)?;
        batch.put_cf(
            cf,
            commission.commission_id.as_bytes(),
            bincode::serialize(&commission)?,
        );

        Ok(Some(commission))
    }

    /// Mark a pending payment failed (gateway declined / order abandoned)
    pub fn fail_payment(&self, order_id: &str) -> Result<Payment> {
        let mut payment = self
            .find_payment_by_order(order_id)?
            .ok_or_else(|| Error::OrderNotFound(order_id.to_string()))?;

        match payment.status {
            PaymentStatus::Pending => {}
            PaymentStatus::Failed => return Ok(payment),
            status => {
                return Err(Error::InvalidTransition(format!(
                    "Payment {} is {}, cannot fail",
                    payment.payment_id, status
                )))
            }
        }

        payment.status = PaymentStatus::Failed;
        let cf = self.cf_handle(CF_PAYMENTS)?;
        self.db.put_cf(
            cf,
            payment.payment_id.as_bytes(),
            bincode::serialize(&payment)?,
        )?;

        tracing::info!(payment_id = %payment.payment_id, order_id = %order_id, "Payment failed");
        Ok(payment)
    }

    // Referral profiles

    /// Upsert a referral profile
    pub fn put_profile(&self, profile: &ReferralProfile) -> Result<()> {
        let cf = self.cf_handle(CF_PROFILES)?;
        self.db.put_cf(
            cf,
            profile.user.as_uuid().as_bytes(),
            bincode::serialize(profile)?,
        )?;
        Ok(())
    }

    /// Get a referral profile
    pub fn get_profile(&self, user: UserId) -> Result<Option<ReferralProfile>> {
        let cf = self.cf_handle(CF_PROFILES)?;
        match self.db.get_cf(cf, user.as_uuid().as_bytes())? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    // Subscriptions

    /// Get a site's subscription
    pub fn get_subscription(&self, site_id: Uuid) -> Result<Option<Subscription>> {
        let cf = self.cf_handle(CF_SUBSCRIPTIONS)?;
        match self.db.get_cf(cf, site_id.as_bytes())? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    // Commissions

    /// Get commission by ID
    pub fn get_commission(&self, commission_id: Uuid) -> Result<Commission> {
        let cf = self.cf_handle(CF_COMMISSIONS)?;
        let value = self
            .db
            .get_cf(cf, commission_id.as_bytes())?
            .ok_or_else(|| Error::CommissionNotFound(commission_id.to_string()))?;
        Ok(bincode::deserialize(&value)?)
    }

    /// Find the commission created for a payment, if any
    pub fn find_commission_by_payment(&self, payment_id: Uuid) -> Result<Option<Commission>> {
        let cf_indices = self.cf_handle(CF_INDICES)?;
        match self
            .db
            .get_cf(cf_indices, Self::index_key_commission(payment_id))?
        {
            Some(value) => {
                let id_bytes: [u8; 16] = value
                    .as_slice()
                    .try_into()
                    .map_err(|_| Error::Storage("Malformed commission index value".to_string()))?;
                Ok(Some(self.get_commission(Uuid::from_bytes(id_bytes))?))
            }
            None => Ok(None),
        }
    }

    /// Cancel a pending commission. Silently a no-op for paid or
    /// already-cancelled ones; cancellation is not retroactive once
    /// payout has occurred.
    pub fn cancel_commission(&self, commission_id: Uuid, reason: &str) -> Result<Commission> {
        let mut commission = self.get_commission(commission_id)?;

        if commission.status != CommissionStatus::Pending {
            return Ok(commission);
        }

        commission.status = CommissionStatus::Cancelled;
        commission.cancel_reason = Some(reason.to_string());
        commission.updated_at = Utc::now();

        let cf = self.cf_handle(CF_COMMISSIONS)?;
        self.db.put_cf(
            cf,
            commission.commission_id.as_bytes(),
            bincode::serialize(&commission)?,
        )?;

        tracing::info!(commission_id = %commission_id, reason = %reason, "Commission cancelled");
        Ok(commission)
    }
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::LedgerKind;
    use rust_decimal::Decimal;
    use tempfile::TempDir;

    fn test_storage() -> (Storage, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        (Storage::open(&config).unwrap(), temp_dir)
    }

    fn user() -> UserId {
        UserId::new(Uuid::new_v4())
    }

    fn credit_purchase(user: UserId, credits: i64, dollars: Decimal) -> Payment {
        Payment::pending(
            user,
            dollars,
            crate::types::Currency::USD,
            PaymentParams::CreditPurchase {
                ledger: LedgerKind::Credits,
                credit_amount: credits,
            },
            format!("ORDER-{}", Uuid::new_v4()),
        )
    }

    #[test]
    fn test_account_created_lazily() {
        let (storage, _temp) = test_storage();
        let key = AccountKey::new(user(), LedgerKind::Credits);

        assert!(storage.fetch_account(&key).unwrap().is_none());

        let account = storage.ensure_account(&key).unwrap();
        assert_eq!(account.balance, 0);
        assert_eq!(account.lifetime, 0);

        // Second touch reads the same row
        let again = storage.ensure_account(&key).unwrap();
        assert_eq!(again.created_at, account.created_at);
    }

    #[test]
    fn test_adjustment_updates_balance_and_records_transaction() {
        let (storage, _temp) = test_storage();
        let user = user();

        let adj = Adjustment::new(
            user,
            LedgerKind::Credits,
            1000,
            TransactionKind::Purchase,
            "Credit purchase",
        );
        let (account, transaction) = storage.apply_adjustment(&adj).unwrap();

        assert_eq!(account.balance, 1000);
        assert_eq!(account.lifetime, 1000);
        assert_eq!(transaction.amount, 1000);
        assert_eq!(transaction.balance_after, 1000);

        let adj = Adjustment::new(user, LedgerKind::Credits, -1000, TransactionKind::Usage, "Spent");
        let (account, transaction) = storage.apply_adjustment(&adj).unwrap();

        assert_eq!(account.balance, 0);
        assert_eq!(account.lifetime, 1000); // debits never touch lifetime
        assert_eq!(transaction.balance_after, 0);
    }

    #[test]
    fn test_insufficient_balance_writes_nothing() {
        let (storage, _temp) = test_storage();
        let user = user();
        let key = AccountKey::new(user, LedgerKind::Credits);

        let adj = Adjustment::new(user, LedgerKind::Credits, -50, TransactionKind::Usage, "Spend");
        let err = storage.apply_adjustment(&adj).unwrap_err();

        match err {
            Error::InsufficientBalance {
                required,
                available,
            } => {
                assert_eq!(required, 50);
                assert_eq!(available, 0);
            }
            other => panic!("expected InsufficientBalance, got {other}"),
        }

        // No account row, no transaction row
        assert!(storage.fetch_account(&key).unwrap().is_none());
        assert!(storage
            .list_transactions(&key, 10, 0, None)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_out_of_range_debit_rejected_without_writes() {
        let (storage, _temp) = test_storage();
        let user = user();
        let key = AccountKey::new(user, LedgerKind::Credits);

        // i64::MIN cannot be negated into a `required` amount
        let adj = Adjustment::new(
            user,
            LedgerKind::Credits,
            i64::MIN,
            TransactionKind::Usage,
            "drain",
        );
        let err = storage.apply_adjustment(&adj).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));

        assert!(storage.fetch_account(&key).unwrap().is_none());
        assert!(storage
            .list_transactions(&key, 10, 0, None)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_balance_overflow_rejected() {
        let (storage, _temp) = test_storage();
        let user = user();
        let key = AccountKey::new(user, LedgerKind::Credits);

        let adj = Adjustment::new(
            user,
            LedgerKind::Credits,
            i64::MAX,
            TransactionKind::AdminAdjust,
            "seed to the ceiling",
        );
        storage.apply_adjustment(&adj).unwrap();

        let adj = Adjustment::new(
            user,
            LedgerKind::Credits,
            1,
            TransactionKind::Purchase,
            "one past the ceiling",
        );
        let err = storage.apply_adjustment(&adj).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));

        let account = storage.fetch_account(&key).unwrap().unwrap();
        assert_eq!(account.balance, i64::MAX);
        assert_eq!(account.lifetime, i64::MAX);
    }

    #[test]
    fn test_payment_rows_round_trip_both_param_variants() {
        let (storage, _temp) = test_storage();
        let buyer = user();

        let purchase = credit_purchase(buyer, 5000, Decimal::new(100, 0));
        storage.insert_payment(&purchase).unwrap();

        let site_id = Uuid::new_v4();
        let subscription = Payment::pending(
            buyer,
            Decimal::new(20, 0),
            crate::types::Currency::USD,
            PaymentParams::Subscription {
                site_id,
                plan_id: "pro-monthly".to_string(),
                plan_days: 30,
            },
            format!("ORDER-{}", Uuid::new_v4()),
        );
        storage.insert_payment(&subscription).unwrap();

        let loaded = storage.get_payment(purchase.payment_id).unwrap();
        match loaded.params {
            PaymentParams::CreditPurchase {
                ledger,
                credit_amount,
            } => {
                assert_eq!(ledger, LedgerKind::Credits);
                assert_eq!(credit_amount, 5000);
            }
            other => panic!("expected CreditPurchase params, got {other:?}"),
        }

        let loaded = storage
            .find_payment_by_order(&subscription.order_id)
            .unwrap()
            .unwrap();
        match loaded.params {
            PaymentParams::Subscription {
                site_id: loaded_site,
                plan_id,
                plan_days,
            } => {
                assert_eq!(loaded_site, site_id);
                assert_eq!(plan_id, "pro-monthly");
                assert_eq!(plan_days, 30);
            }
            other => panic!("expected Subscription params, got {other:?}"),
        }
    }

    #[test]
    fn test_ledgers_are_separate_accounts() {
        let (storage, _temp) = test_storage();
        let user = user();

        let adj = Adjustment::new(user, LedgerKind::Credits, 100, TransactionKind::Purchase, "buy");
        storage.apply_adjustment(&adj).unwrap();

        let radium = AccountKey::new(user, LedgerKind::Radium);
        assert!(storage.fetch_account(&radium).unwrap().is_none());
    }

    #[test]
    fn test_list_transactions_newest_first_with_pagination() {
        let (storage, _temp) = test_storage();
        let user = user();
        let key = AccountKey::new(user, LedgerKind::Credits);

        for i in 1..=5 {
            let adj = Adjustment::new(
                user,
                LedgerKind::Credits,
                i * 10,
                TransactionKind::Purchase,
                format!("credit {}", i),
            );
            storage.apply_adjustment(&adj).unwrap();
        }

        let page = storage.list_transactions(&key, 2, 0, None).unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].amount, 50);
        assert_eq!(page[1].amount, 40);

        let page = storage.list_transactions(&key, 2, 2, None).unwrap();
        assert_eq!(page[0].amount, 30);
        assert_eq!(page[1].amount, 20);
    }

    #[test]
    fn test_list_transactions_filter_by_kind() {
        let (storage, _temp) = test_storage();
        let user = user();
        let key = AccountKey::new(user, LedgerKind::Credits);

        storage
            .apply_adjustment(&Adjustment::new(
                user,
                LedgerKind::Credits,
                100,
                TransactionKind::Purchase,
                "buy",
            ))
            .unwrap();
        storage
            .apply_adjustment(&Adjustment::new(
                user,
                LedgerKind::Credits,
                -40,
                TransactionKind::Usage,
                "spend",
            ))
            .unwrap();

        let only_usage = storage
            .list_transactions(&key, 10, 0, Some(TransactionKind::Usage))
            .unwrap();
        assert_eq!(only_usage.len(), 1);
        assert_eq!(only_usage[0].amount, -40);
    }

    #[test]
    fn test_settle_credit_purchase() {
        let (storage, _temp) = test_storage();
        let buyer = user();
        let payment = credit_purchase(buyer, 5000, Decimal::new(10000, 2));
        let order_id = payment.order_id.clone();
        storage.insert_payment(&payment).unwrap();

        let outcome = storage
            .settle_payment(&order_id, "CAP-1", Utc::now())
            .unwrap();

        match outcome {
            SettleOutcome::Settled {
                payment, credited, ..
            } => {
                assert_eq!(payment.status, PaymentStatus::Succeeded);
                assert_eq!(payment.capture_id.as_deref(), Some("CAP-1"));
                let transaction = credited.unwrap();
                assert_eq!(transaction.amount, 5000);
                assert_eq!(transaction.kind, TransactionKind::Purchase);
                assert_eq!(
                    transaction.cost.unwrap().amount,
                    Decimal::new(10000, 2)
                );
                assert_eq!(transaction.payment_id, Some(payment.payment_id));
            }
            other => panic!("expected Settled, got {other:?}"),
        }

        let key = AccountKey::new(buyer, LedgerKind::Credits);
        assert_eq!(storage.fetch_account(&key).unwrap().unwrap().balance, 5000);
    }

    #[test]
    fn test_settle_is_idempotent() {
        let (storage, _temp) = test_storage();
        let buyer = user();
        let payment = credit_purchase(buyer, 5000, Decimal::new(10000, 2));
        let order_id = payment.order_id.clone();
        storage.insert_payment(&payment).unwrap();

        storage
            .settle_payment(&order_id, "CAP-1", Utc::now())
            .unwrap();
        let second = storage
            .settle_payment(&order_id, "CAP-1", Utc::now())
            .unwrap();

        assert!(matches!(second, SettleOutcome::AlreadySettled { .. }));

        // No double credit
        let key = AccountKey::new(buyer, LedgerKind::Credits);
        assert_eq!(storage.fetch_account(&key).unwrap().unwrap().balance, 5000);
        assert_eq!(storage.list_transactions(&key, 10, 0, None).unwrap().len(), 1);
    }

    #[test]
    fn test_settle_unknown_order() {
        let (storage, _temp) = test_storage();
        let err = storage
            .settle_payment("NO-SUCH-ORDER", "CAP-1", Utc::now())
            .unwrap_err();
        assert!(matches!(err, Error::OrderNotFound(_)));
    }

    #[test]
    fn test_settle_creates_commission_for_referred_user() {
        let (storage, _temp) = test_storage();
        let referrer = user();
        let buyer = user();
        let now = Utc::now();

        storage
            .put_profile(&ReferralProfile {
                user: referrer,
                referred_by: None,
                commission_rate_pct: Decimal::from(10),
                updated_at: now,
            })
            .unwrap();
        storage
            .put_profile(&ReferralProfile {
                user: buyer,
                referred_by: Some(referrer),
                commission_rate_pct: Decimal::ZERO,
                updated_at: now,
            })
            .unwrap();

        let payment = credit_purchase(buyer, 5000, Decimal::new(10000, 2));
        let order_id = payment.order_id.clone();
        storage.insert_payment(&payment).unwrap();

        let outcome = storage.settle_payment(&order_id, "CAP-1", now).unwrap();
        let SettleOutcome::Settled { commission, .. } = outcome else {
            panic!("expected Settled");
        };

        let commission = commission.unwrap();
        assert_eq!(commission.referrer, referrer);
        assert_eq!(commission.referred, buyer);
        assert_eq!(commission.amount, Decimal::new(1000, 2)); // $10.00 at 10%
        assert_eq!(commission.rate_pct, Decimal::from(10));
        assert_eq!(commission.status, CommissionStatus::Pending);
    }

    #[test]
    fn test_settle_without_referrer_creates_no_commission() {
        let (storage, _temp) = test_storage();
        let buyer = user();
        let payment = credit_purchase(buyer, 5000, Decimal::new(10000, 2));
        let order_id = payment.order_id.clone();
        storage.insert_payment(&payment).unwrap();

        let outcome = storage.settle_payment(&order_id, "CAP-1", Utc::now()).unwrap();
        let SettleOutcome::Settled { commission, .. } = outcome else {
            panic!("expected Settled");
        };
        assert!(commission.is_none());
    }

    #[test]
    fn test_refund_debits_and_cancels_commission() {
        let (storage, _temp) = test_storage();
        let referrer = user();
        let buyer = user();
        let now = Utc::now();

        storage
            .put_profile(&ReferralProfile {
                user: referrer,
                referred_by: None,
                commission_rate_pct: Decimal::from(10),
                updated_at: now,
            })
            .unwrap();
        storage
            .put_profile(&ReferralProfile {
                user: buyer,
                referred_by: Some(referrer),
                commission_rate_pct: Decimal::ZERO,
                updated_at: now,
            })
            .unwrap();

        let payment = credit_purchase(buyer, 5000, Decimal::new(10000, 2));
        let order_id = payment.order_id.clone();
        storage.insert_payment(&payment).unwrap();
        storage.settle_payment(&order_id, "CAP-1", now).unwrap();

        let outcome = storage.refund_payment("CAP-1").unwrap();
        let RefundOutcome::Refunded {
            payment,
            reversal,
            commission,
        } = outcome
        else {
            panic!("expected Refunded");
        };

        assert_eq!(payment.status, PaymentStatus::Refunded);
        assert_eq!(reversal.unwrap().amount, -5000);
        assert_eq!(commission.unwrap().status, CommissionStatus::Cancelled);

        let key = AccountKey::new(buyer, LedgerKind::Credits);
        assert_eq!(storage.fetch_account(&key).unwrap().unwrap().balance, 0);
    }

    #[test]
    fn test_refund_clamps_when_credits_already_spent() {
        let (storage, _temp) = test_storage();
        let buyer = user();

        let payment = credit_purchase(buyer, 5000, Decimal::new(10000, 2));
        let order_id = payment.order_id.clone();
        storage.insert_payment(&payment).unwrap();
        storage.settle_payment(&order_id, "CAP-1", Utc::now()).unwrap();

        // Spend most of the credits before the refund lands
        storage
            .apply_adjustment(&Adjustment::new(
                buyer,
                LedgerKind::Credits,
                -4800,
                TransactionKind::Usage,
                "spent",
            ))
            .unwrap();

        let outcome = storage.refund_payment("CAP-1").unwrap();
        let RefundOutcome::Refunded { reversal, .. } = outcome else {
            panic!("expected Refunded");
        };

        let reversal = reversal.unwrap();
        assert_eq!(reversal.amount, -200);
        assert_eq!(reversal.balance_after, 0);
        assert!(reversal.description.contains("clamped"));
        assert!(reversal.description.contains("200"));
    }

    #[test]
    fn test_refund_is_idempotent() {
        let (storage, _temp) = test_storage();
        let buyer = user();

        let payment = credit_purchase(buyer, 5000, Decimal::new(10000, 2));
        let order_id = payment.order_id.clone();
        storage.insert_payment(&payment).unwrap();
        storage.settle_payment(&order_id, "CAP-1", Utc::now()).unwrap();

        storage.refund_payment("CAP-1").unwrap();
        let second = storage.refund_payment("CAP-1").unwrap();
        assert!(matches!(second, RefundOutcome::AlreadyRefunded { .. }));

        let key = AccountKey::new(buyer, LedgerKind::Credits);
        assert_eq!(storage.fetch_account(&key).unwrap().unwrap().balance, 0);
    }

    #[test]
    fn test_refund_of_pending_payment_rejected() {
        let (storage, _temp) = test_storage();
        let buyer = user();
        let payment = credit_purchase(buyer, 5000, Decimal::new(10000, 2));
        storage.insert_payment(&payment).unwrap();

        // No capture happened, so there is nothing under this capture id
        let err = storage.refund_payment("CAP-NEVER").unwrap_err();
        assert!(matches!(err, Error::OrderNotFound(_)));
    }

    #[test]
    fn test_subscription_created_and_renewed() {
        let (storage, _temp) = test_storage();
        let owner = user();
        let site_id = Uuid::new_v4();

        let first = Payment::pending(
            owner,
            Decimal::new(2999, 2),
            crate::types::Currency::USD,
            PaymentParams::Subscription {
                site_id,
                plan_id: "pro".to_string(),
                plan_days: 30,
            },
            "ORDER-SUB-1",
        );
        storage.insert_payment(&first).unwrap();
        storage.settle_payment("ORDER-SUB-1", "CAP-S1", Utc::now()).unwrap();

        let sub = storage.get_subscription(site_id).unwrap().unwrap();
        assert!(sub.active);
        let first_expiry = sub.expires_at;

        let second = Payment::pending(
            owner,
            Decimal::new(2999, 2),
            crate::types::Currency::USD,
            PaymentParams::Subscription {
                site_id,
                plan_id: "pro".to_string(),
                plan_days: 30,
            },
            "ORDER-SUB-2",
        );
        storage.insert_payment(&second).unwrap();
        storage.settle_payment("ORDER-SUB-2", "CAP-S2", Utc::now()).unwrap();

        let renewed = storage.get_subscription(site_id).unwrap().unwrap();
        assert!(renewed.expires_at > first_expiry);
        assert_eq!(renewed.started_at, sub.started_at);
    }

    #[test]
    fn test_fail_payment_transitions() {
        let (storage, _temp) = test_storage();
        let buyer = user();
        let payment = credit_purchase(buyer, 5000, Decimal::new(10000, 2));
        let order_id = payment.order_id.clone();
        storage.insert_payment(&payment).unwrap();

        let failed = storage.fail_payment(&order_id).unwrap();
        assert_eq!(failed.status, PaymentStatus::Failed);

        // Idempotent
        let again = storage.fail_payment(&order_id).unwrap();
        assert_eq!(again.status, PaymentStatus::Failed);

        // Terminal: no settle afterwards
        let err = storage
            .settle_payment(&order_id, "CAP-1", Utc::now())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTransition(_)));
    }

    #[test]
    fn test_cancel_commission_silent_noop_when_not_pending() {
        let (storage, _temp) = test_storage();
        let referrer = user();
        let buyer = user();
        let now = Utc::now();

        storage
            .put_profile(&ReferralProfile {
                user: referrer,
                referred_by: None,
                commission_rate_pct: Decimal::from(5),
                updated_at: now,
            })
            .unwrap();
        storage
            .put_profile(&ReferralProfile {
                user: buyer,
                referred_by: Some(referrer),
                commission_rate_pct: Decimal::ZERO,
                updated_at: now,
            })
            .unwrap();

        let payment = credit_purchase(buyer, 1000, Decimal::new(2000, 2));
        let order_id = payment.order_id.clone();
        storage.insert_payment(&payment).unwrap();
        let SettleOutcome::Settled { commission, .. } =
            storage.settle_payment(&order_id, "CAP-1", now).unwrap()
        else {
            panic!("expected Settled");
        };
        let commission = commission.unwrap();

        let cancelled = storage
            .cancel_commission(commission.commission_id, "operator request")
            .unwrap();
        assert_eq!(cancelled.status, CommissionStatus::Cancelled);

        // Cancelling again leaves the original reason in place
        let again = storage
            .cancel_commission(commission.commission_id, "different reason")
            .unwrap();
        assert_eq!(again.cancel_reason.as_deref(), Some("operator request"));
    }

    #[test]
    fn test_duplicate_order_id_rejected() {
        let (storage, _temp) = test_storage();
        let buyer = user();
        let mut first = credit_purchase(buyer, 100, Decimal::new(500, 2));
        first.order_id = "ORDER-DUP".to_string();
        storage.insert_payment(&first).unwrap();

        let mut second = credit_purchase(buyer, 100, Decimal::new(500, 2));
        second.order_id = "ORDER-DUP".to_string();
        let err = storage.insert_payment(&second).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }
}
