//! HTTP API
//!
//! Thin typed boundary over `CheckoutService` and the ledger: parse
//! the request into domain types, call through, map errors via
//! `GatewayError`'s `IntoResponse`.

use crate::{
    checkout::CheckoutService,
    error::{GatewayError, Result},
    metrics::METRICS,
    webhook::{self, WebhookEvent},
};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post, put},
    Json, Router,
};
use chrono::{DateTime, Utc};
use credit_ledger::{
    Adjustment, Currency, Error as LedgerError, Ledger, LedgerKind, PaymentParams, ReferralProfile,
    SettleOutcome, Transaction, TransactionKind, UserId,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use uuid::Uuid;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub ledger: Arc<Ledger>,
    pub checkout: Arc<CheckoutService>,
}

/// Build the service router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_handler))
        .route("/users/:user/balance/:kind", get(get_balance))
        .route("/users/:user/transactions/:kind", get(list_transactions))
        .route("/users/:user/balance/adjust", post(adjust_balance))
        .route("/users/:user/referral", put(set_referral))
        .route("/checkout/orders", post(create_order))
        .route("/checkout/orders/:order_id/capture", post(capture_order))
        .route("/webhooks/gateway", post(handle_webhook))
        .route("/payments/:payment_id", get(get_payment))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    version: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        service: "payment-gateway",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn metrics_handler() -> Result<String> {
    METRICS
        .export()
        .map_err(|e| GatewayError::Gateway(format!("Failed to export metrics: {}", e)))
}

fn parse_kind(kind: &str) -> Result<LedgerKind> {
    LedgerKind::parse(kind).ok_or_else(|| {
        GatewayError::Ledger(LedgerError::InvalidArgument(format!(
            "Unknown ledger kind: {}",
            kind
        )))
    })
}

fn parse_currency(code: &str) -> Result<Currency> {
    Currency::parse(code).ok_or_else(|| {
        GatewayError::Ledger(LedgerError::InvalidArgument(format!(
            "Unsupported currency: {}",
            code
        )))
    })
}

#[derive(Debug, Serialize)]
struct BalanceResponse {
    user: Uuid,
    ledger: &'static str,
    balance: i64,
    lifetime: i64,
}

async fn get_balance(
    State(state): State<AppState>,
    Path((user, kind)): Path<(Uuid, String)>,
) -> Result<Json<BalanceResponse>> {
    METRICS.http_requests_total.inc();
    let kind = parse_kind(&kind)?;

    // Get-or-create: first touch materializes the zero-balance row
    let balance = state
        .ledger
        .ensure_account(UserId::new(user), kind)
        .await?;

    Ok(Json(BalanceResponse {
        user,
        ledger: kind.code(),
        balance: balance.balance,
        lifetime: balance.lifetime,
    }))
}

#[derive(Debug, Deserialize)]
struct ListParams {
    limit: Option<usize>,
    offset: Option<usize>,
    /// Optional kind filter, e.g. `usage`
    filter: Option<String>,
}

async fn list_transactions(
    State(state): State<AppState>,
    Path((user, kind)): Path<(Uuid, String)>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<Transaction>>> {
    METRICS.http_requests_total.inc();
    let kind = parse_kind(&kind)?;

    let filter = match params.filter.as_deref() {
        Some(raw) => Some(TransactionKind::parse(raw).ok_or_else(|| {
            GatewayError::Ledger(LedgerError::InvalidArgument(format!(
                "Unknown transaction kind: {}",
                raw
            )))
        })?),
        None => None,
    };

    let transactions = state.ledger.list_transactions(
        UserId::new(user),
        kind,
        params.limit.unwrap_or(0),
        params.offset.unwrap_or(0),
        filter,
    )?;

    Ok(Json(transactions))
}

#[derive(Debug, Deserialize)]
struct AdjustRequest {
    ledger: String,
    amount: i64,
    kind: String,
    description: String,
}

#[derive(Debug, Serialize)]
struct AdjustResponse {
    transaction_id: Uuid,
    balance: i64,
    lifetime: i64,
}

async fn adjust_balance(
    State(state): State<AppState>,
    Path(user): Path<Uuid>,
    Json(request): Json<AdjustRequest>,
) -> Result<Json<AdjustResponse>> {
    METRICS.http_requests_total.inc();

    let ledger = parse_kind(&request.ledger)?;
    let kind = TransactionKind::parse(&request.kind).ok_or_else(|| {
        GatewayError::Ledger(LedgerError::InvalidArgument(format!(
            "Unknown transaction kind: {}",
            request.kind
        )))
    })?;

    let (balance, transaction) = state
        .ledger
        .adjust(Adjustment::new(
            UserId::new(user),
            ledger,
            request.amount,
            kind,
            request.description,
        ))
        .await?;

    Ok(Json(AdjustResponse {
        transaction_id: transaction.transaction_id,
        balance: balance.balance,
        lifetime: balance.lifetime,
    }))
}

#[derive(Debug, Deserialize)]
struct ReferralRequest {
    referred_by: Option<Uuid>,
    commission_rate_pct: Decimal,
}

async fn set_referral(
    State(state): State<AppState>,
    Path(user): Path<Uuid>,
    Json(request): Json<ReferralRequest>,
) -> Result<StatusCode> {
    METRICS.http_requests_total.inc();

    state
        .ledger
        .set_referral(ReferralProfile {
            user: UserId::new(user),
            referred_by: request.referred_by.map(UserId::new),
            commission_rate_pct: request.commission_rate_pct,
            updated_at: Utc::now(),
        })
        .await?;

    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct CreateOrderRequest {
    user: Uuid,
    amount: Decimal,
    currency: String,
    #[serde(flatten)]
    purchase: PurchaseSpec,
}

/// What the order buys, mirroring `PaymentParams` on the wire
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum PurchaseSpec {
    CreditPurchase {
        ledger: String,
        credit_amount: i64,
    },
    Subscription {
        site_id: Uuid,
        plan_id: String,
        plan_days: u32,
    },
}

#[derive(Debug, Serialize)]
struct CreateOrderResponse {
    payment_id: Uuid,
    order_id: String,
    status: &'static str,
}

async fn create_order(
    State(state): State<AppState>,
    Json(request): Json<CreateOrderRequest>,
) -> Result<Json<CreateOrderResponse>> {
    METRICS.http_requests_total.inc();

    let currency = parse_currency(&request.currency)?;
    let params = match request.purchase {
        PurchaseSpec::CreditPurchase {
            ledger,
            credit_amount,
        } => PaymentParams::CreditPurchase {
            ledger: parse_kind(&ledger)?,
            credit_amount,
        },
        PurchaseSpec::Subscription {
            site_id,
            plan_id,
            plan_days,
        } => PaymentParams::Subscription {
            site_id,
            plan_id,
            plan_days,
        },
    };

    let payment = state
        .checkout
        .create_order(UserId::new(request.user), request.amount, currency, params)
        .await?;

    Ok(Json(CreateOrderResponse {
        payment_id: payment.payment_id,
        order_id: payment.order_id,
        status: "pending",
    }))
}

#[derive(Debug, Serialize)]
struct CaptureResponse {
    payment_id: Uuid,
    status: &'static str,
    credited_transaction_id: Option<Uuid>,
}

async fn capture_order(
    State(state): State<AppState>,
    Path(order_id): Path<String>,
) -> Result<Json<CaptureResponse>> {
    METRICS.http_requests_total.inc();

    let response = match state.checkout.capture_order(&order_id).await? {
        SettleOutcome::Settled {
            payment, credited, ..
        } => CaptureResponse {
            payment_id: payment.payment_id,
            status: "succeeded",
            credited_transaction_id: credited.map(|t| t.transaction_id),
        },
        SettleOutcome::AlreadySettled { payment } => CaptureResponse {
            payment_id: payment.payment_id,
            status: "already_settled",
            credited_transaction_id: None,
        },
    };

    Ok(Json(response))
}

#[derive(Debug, Serialize)]
struct WebhookResponse {
    status: &'static str,
}

async fn handle_webhook(
    State(state): State<AppState>,
    Json(event): Json<WebhookEvent>,
) -> Result<Json<WebhookResponse>> {
    METRICS.http_requests_total.inc();

    let disposition = webhook::process_event(&state.ledger, &event).await?;
    METRICS
        .webhooks_total
        .with_label_values(&[disposition.label()])
        .inc();

    Ok(Json(WebhookResponse {
        status: disposition.label(),
    }))
}

#[derive(Debug, Serialize)]
struct PaymentView {
    payment_id: Uuid,
    user: Uuid,
    amount: Decimal,
    currency: &'static str,
    status: &'static str,
    order_id: String,
    capture_id: Option<String>,
    created_at: DateTime<Utc>,
    paid_at: Option<DateTime<Utc>>,
}

async fn get_payment(
    State(state): State<AppState>,
    Path(payment_id): Path<Uuid>,
) -> Result<Json<PaymentView>> {
    METRICS.http_requests_total.inc();

    let payment = state.ledger.get_payment(payment_id)?;
    Ok(Json(PaymentView {
        payment_id: payment.payment_id,
        user: payment.user.as_uuid(),
        amount: payment.amount,
        currency: payment.currency.code(),
        status: payment.status.code(),
        order_id: payment.order_id,
        capture_id: payment.capture_id,
        created_at: payment.created_at,
        paid_at: payment.paid_at,
    }))
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState").finish_non_exhaustive()
    }
}
