//! Core types for the ledger
//!
//! All types are designed for:
//! - Deterministic serialization (bincode for storage, serde_json at the boundary)
//! - Exact arithmetic (integer credits, Decimal for money)
//! - Time-ordered row ids (UUIDv7)

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// User identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(Uuid);

impl UserId {
    /// Create from a UUID
    pub fn new(id: Uuid) -> Self {
        Self(id)
    }

    /// Get the inner UUID
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for UserId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

/// Discriminator between the two structurally identical credit ledgers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum LedgerKind {
    /// General-purpose credit balance
    Credits = 0,
    /// Secondary "Radium" credit balance
    Radium = 1,
}

impl LedgerKind {
    /// Stable code for keys and URLs
    pub fn code(&self) -> &'static str {
        match self {
            LedgerKind::Credits => "credits",
            LedgerKind::Radium => "radium",
        }
    }

    /// Parse from string
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "credits" => Some(LedgerKind::Credits),
            "radium" => Some(LedgerKind::Radium),
            _ => None,
        }
    }
}

impl fmt::Display for LedgerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// ISO 4217 currency code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub enum Currency {
    /// US Dollar
    USD,
    /// Euro
    EUR,
    /// British Pound
    GBP,
}

impl Currency {
    /// ISO 4217 code
    pub fn code(&self) -> &'static str {
        match self {
            Currency::USD => "USD",
            Currency::EUR => "EUR",
            Currency::GBP => "GBP",
        }
    }

    /// Parse from string
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "USD" => Some(Currency::USD),
            "EUR" => Some(Currency::EUR),
            "GBP" => Some(Currency::GBP),
            _ => None,
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Monetary amount with its currency
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Money {
    /// Exact decimal amount
    pub amount: Decimal,
    /// Currency
    pub currency: Currency,
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.amount, self.currency)
    }
}

/// Key of a balance account: one account per (user, ledger kind)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccountKey {
    /// Owning user
    pub user: UserId,
    /// Which of the two credit ledgers
    pub ledger: LedgerKind,
}

impl AccountKey {
    /// Create a key
    pub fn new(user: UserId, ledger: LedgerKind) -> Self {
        Self { user, ledger }
    }

    /// Encode as storage key bytes: ledger tag || user uuid
    pub fn encode(&self) -> [u8; 17] {
        let mut key = [0u8; 17];
        key[0] = self.ledger as u8;
        key[1..].copy_from_slice(self.user.as_uuid().as_bytes());
        key
    }
}

/// Per-user, per-ledger-kind balance record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    /// Owning user
    pub user: UserId,

    /// Ledger kind
    pub ledger: LedgerKind,

    /// Current balance, never negative
    pub balance: i64,

    /// Lifetime-earned total, increased only by positive credits
    pub lifetime: i64,

    /// Created timestamp
    pub created_at: DateTime<Utc>,

    /// Last mutation timestamp
    pub updated_at: DateTime<Utc>,
}

impl Account {
    /// Fresh zero-balance account, created lazily on first touch
    pub fn new(key: AccountKey, now: DateTime<Utc>) -> Self {
        Self {
            user: key.user,
            ledger: key.ledger,
            balance: 0,
            lifetime: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Storage key
    pub fn key(&self) -> AccountKey {
        AccountKey::new(self.user, self.ledger)
    }
}

/// Transaction kind tags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum TransactionKind {
    /// Credits bought for money
    Purchase = 1,
    /// Credits spent on the platform
    Usage = 2,
    /// Reversal of a purchase after a gateway refund
    Refund = 3,
    /// Manual admin adjustment
    AdminAdjust = 4,
    /// Direct exchange between ledgers
    Exchange = 5,
}

impl TransactionKind {
    /// Stable code for filters and display
    pub fn code(&self) -> &'static str {
        match self {
            TransactionKind::Purchase => "purchase",
            TransactionKind::Usage => "usage",
            TransactionKind::Refund => "refund",
            TransactionKind::AdminAdjust => "admin_adjust",
            TransactionKind::Exchange => "exchange",
        }
    }

    /// Parse from string
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "purchase" => Some(TransactionKind::Purchase),
            "usage" => Some(TransactionKind::Usage),
            "refund" => Some(TransactionKind::Refund),
            "admin_adjust" => Some(TransactionKind::AdminAdjust),
            "exchange" => Some(TransactionKind::Exchange),
            _ => None,
        }
    }
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Immutable audit row recording one balance change
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    /// Unique transaction ID (UUIDv7 for time-ordering)
    pub transaction_id: Uuid,

    /// Owning user
    pub user: UserId,

    /// Ledger kind
    pub ledger: LedgerKind,

    /// Signed amount: positive = credit, negative = debit
    pub amount: i64,

    /// Balance snapshot immediately after this transaction was applied
    pub balance_after: i64,

    /// Kind tag
    pub kind: TransactionKind,

    /// Human-readable reason
    pub description: String,

    /// Monetary cost, when the change resulted from a purchase
    pub cost: Option<Money>,

    /// Originating payment, if any
    pub payment_id: Option<Uuid>,

    /// Related site, if any
    pub site_id: Option<Uuid>,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

/// A requested balance mutation, validated before it reaches storage
#[derive(Debug, Clone)]
pub struct Adjustment {
    /// Owning user
    pub user: UserId,
    /// Ledger kind
    pub ledger: LedgerKind,
    /// Signed amount, nonzero
    pub amount: i64,
    /// Kind tag
    pub kind: TransactionKind,
    /// Human-readable reason, non-empty
    pub description: String,
    /// Monetary cost for purchases
    pub cost: Option<Money>,
    /// Originating payment, if any
    pub payment_id: Option<Uuid>,
    /// Related site, if any
    pub site_id: Option<Uuid>,
}

impl Adjustment {
    /// Plain adjustment with no payment linkage
    pub fn new(
        user: UserId,
        ledger: LedgerKind,
        amount: i64,
        kind: TransactionKind,
        description: impl Into<String>,
    ) -> Self {
        Self {
            user,
            ledger,
            amount,
            kind,
            description: description.into(),
            cost: None,
            payment_id: None,
            site_id: None,
        }
    }
}

/// Payment status
///
/// `Pending -> Succeeded -> Refunded`, or `Pending -> Failed`.
/// `Refunded` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum PaymentStatus {
    /// Checkout order created, waiting for gateway confirmation
    Pending = 1,
    /// Captured at the gateway, ledger effects applied
    Succeeded = 2,
    /// Reversed after a gateway refund (terminal)
    Refunded = 3,
    /// Gateway declined or order abandoned (terminal)
    Failed = 4,
}

impl PaymentStatus {
    /// No transition is allowed out of a terminal status
    pub fn is_terminal(&self) -> bool {
        matches!(self, PaymentStatus::Refunded | PaymentStatus::Failed)
    }

    /// Stable code for display and filters
    pub fn code(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Succeeded => "succeeded",
            PaymentStatus::Refunded => "refunded",
            PaymentStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// What a payment buys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentType {
    /// Site subscription (create or renew)
    Subscription,
    /// Credit purchase into one of the ledgers
    CreditPurchase,
}

impl fmt::Display for PaymentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PaymentType::Subscription => write!(f, "subscription"),
            PaymentType::CreditPurchase => write!(f, "credit_purchase"),
        }
    }
}

/// Type-specific checkout parameters, captured at order creation.
///
/// Persisted inside `Payment` rows with bincode, which cannot decode
/// tagged enum representations; keep the default external tagging
/// here and let the HTTP boundary define its own wire shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PaymentParams {
    /// Credits bought into a ledger
    CreditPurchase {
        /// Target ledger
        ledger: LedgerKind,
        /// Credits to grant on capture, positive
        credit_amount: i64,
    },
    /// Site subscription
    Subscription {
        /// Site being subscribed
        site_id: Uuid,
        /// Plan identifier
        plan_id: String,
        /// Subscription period granted per payment
        plan_days: u32,
    },
}

impl PaymentParams {
    /// Payment type tag for this parameter set
    pub fn payment_type(&self) -> PaymentType {
        match self {
            PaymentParams::CreditPurchase { .. } => PaymentType::CreditPurchase,
            PaymentParams::Subscription { .. } => PaymentType::Subscription,
        }
    }
}

/// One external payment-processor transaction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payment {
    /// Unique payment ID
    pub payment_id: Uuid,

    /// Owning user
    pub user: UserId,

    /// Monetary amount
    pub amount: Decimal,

    /// Currency
    pub currency: Currency,

    /// Lifecycle status
    pub status: PaymentStatus,

    /// Type-specific parameters
    pub params: PaymentParams,

    /// Gateway order id, assigned at order creation
    pub order_id: String,

    /// Gateway capture id, assigned when captured
    pub capture_id: Option<String>,

    /// Free-form gateway metadata (payer ids, links, ...)
    #[serde(default)]
    pub metadata: HashMap<String, String>,

    /// Created timestamp
    pub created_at: DateTime<Utc>,

    /// When the gateway confirmed the capture
    pub paid_at: Option<DateTime<Utc>>,
}

impl Payment {
    /// New pending payment for a freshly created gateway order
    pub fn pending(
        user: UserId,
        amount: Decimal,
        currency: Currency,
        params: PaymentParams,
        order_id: impl Into<String>,
    ) -> Self {
        Self {
            payment_id: Uuid::now_v7(),
            user,
            amount,
            currency,
            status: PaymentStatus::Pending,
            params,
            order_id: order_id.into(),
            capture_id: None,
            metadata: HashMap::new(),
            created_at: Utc::now(),
            paid_at: None,
        }
    }

    /// Payment type tag
    pub fn payment_type(&self) -> PaymentType {
        self.params.payment_type()
    }

    /// Monetary amount with currency
    pub fn money(&self) -> Money {
        Money {
            amount: self.amount,
            currency: self.currency,
        }
    }
}

/// Commission status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum CommissionStatus {
    /// Owed, not yet paid out
    Pending = 1,
    /// Paid out to the referrer
    Paid = 2,
    /// Reversed because the originating payment was refunded
    Cancelled = 3,
}

impl CommissionStatus {
    /// Stable code for display
    pub fn code(&self) -> &'static str {
        match self {
            CommissionStatus::Pending => "pending",
            CommissionStatus::Paid => "paid",
            CommissionStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for CommissionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Referral payout owed for a referred user's payment
///
/// Created at most once per payment; never deleted, cancellation is a
/// status transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Commission {
    /// Unique commission ID
    pub commission_id: Uuid,

    /// Originating payment
    pub payment_id: Uuid,

    /// User receiving the commission
    pub referrer: UserId,

    /// User whose payment generated it
    pub referred: UserId,

    /// Commission amount, rounded to the currency's minor unit
    pub amount: Decimal,

    /// Currency (same as the payment's)
    pub currency: Currency,

    /// Rate percentage snapshotted from the referrer at creation time
    pub rate_pct: Decimal,

    /// Lifecycle status
    pub status: CommissionStatus,

    /// Why it was cancelled, if it was
    pub cancel_reason: Option<String>,

    /// Created timestamp
    pub created_at: DateTime<Utc>,

    /// Last status change
    pub updated_at: DateTime<Utc>,
}

/// Per-user referral settings, set administratively
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferralProfile {
    /// The user this profile belongs to
    pub user: UserId,

    /// Who referred this user, if anyone
    pub referred_by: Option<UserId>,

    /// Commission rate percentage (0-100) this user earns as a referrer
    pub commission_rate_pct: Decimal,

    /// Last update
    pub updated_at: DateTime<Utc>,
}

/// Per-site subscription record, created or renewed on capture
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    /// The subscribed site
    pub site_id: Uuid,

    /// Owning user
    pub user: UserId,

    /// Plan identifier
    pub plan_id: String,

    /// Whether the site is currently active
    pub active: bool,

    /// When the subscription started
    pub started_at: DateTime<Utc>,

    /// Last renewal
    pub renewed_at: DateTime<Utc>,

    /// Paid-through date
    pub expires_at: DateTime<Utc>,
}
