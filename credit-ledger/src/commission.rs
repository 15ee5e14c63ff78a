//! Commission derivation
//!
//! A referred user's successful payment earns the referrer a commission
//! of `payment_amount * rate / 100`, rounded half-up to the currency's
//! minor unit. The rate is snapshotted at creation time and never
//! recomputed.

use crate::types::{Commission, CommissionStatus, Payment, UserId};
use chrono::Utc;
use rust_decimal::{Decimal, RoundingStrategy};
use uuid::Uuid;

/// Minor-unit precision applied to commission amounts
const MINOR_UNIT_DP: u32 = 2;

/// Commission amount for a payment at the given rate percentage.
///
/// Deterministic: the same inputs always round the same way
/// (midpoint away from zero, two decimal places).
pub fn commission_amount(payment_amount: Decimal, rate_pct: Decimal) -> Decimal {
    (payment_amount * rate_pct / Decimal::ONE_HUNDRED)
        .round_dp_with_strategy(MINOR_UNIT_DP, RoundingStrategy::MidpointAwayFromZero)
}

/// Build a pending commission for a captured payment.
///
/// The caller is responsible for ensuring this runs at most once per
/// payment; the payment state machine enters `Succeeded` exactly once.
pub fn build_commission(payment: &Payment, referrer: UserId, rate_pct: Decimal) -> Commission {
    let now = Utc::now();
    Commission {
        commission_id: Uuid::now_v7(),
        payment_id: payment.payment_id,
        referrer,
        referred: payment.user,
        amount: commission_amount(payment.amount, rate_pct),
        currency: payment.currency,
        rate_pct,
        status: CommissionStatus::Pending,
        cancel_reason: None,
        created_at: now,
        updated_at: now,
    }
}
