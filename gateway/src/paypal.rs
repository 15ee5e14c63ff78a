//! External processor client (PayPal-style orders API)
//!
//! The processor is behind the `CheckoutGateway` trait so the checkout
//! flow can be exercised against a stub in tests. `PayPalClient` is the
//! real implementation: OAuth client-credentials token with in-process
//! caching, then the v2 checkout orders API.

use crate::{
    config::PayPalConfig,
    error::{GatewayError, Result},
    metrics::METRICS,
};
use async_trait::async_trait;
use credit_ledger::Currency;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Safety margin subtracted from token lifetimes
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// Capture result reported by the processor
#[derive(Debug, Clone)]
pub struct GatewayCapture {
    /// The order the capture belongs to
    pub order_id: String,
    /// Processor-assigned capture id
    pub capture_id: String,
    /// Processor capture status, e.g. `COMPLETED` or `DECLINED`
    pub status: String,
}

impl GatewayCapture {
    /// Only completed captures may settle a payment
    pub fn is_completed(&self) -> bool {
        self.status == "COMPLETED"
    }
}

/// External checkout processor
#[async_trait]
pub trait CheckoutGateway: Send + Sync {
    /// Create an order for the given amount; returns the processor's order id
    async fn create_order(
        &self,
        amount: Decimal,
        currency: Currency,
        reference: &str,
    ) -> Result<String>;

    /// Capture an approved order
    async fn capture_order(&self, order_id: &str) -> Result<GatewayCapture>;
}

struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

/// PayPal REST client
pub struct PayPalClient {
    config: PayPalConfig,
    http: Client,
    token: Mutex<Option<CachedToken>>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Debug, Deserialize)]
struct OrderResponse {
    id: String,
    status: String,
}

#[derive(Debug, Deserialize)]
struct CaptureOrderResponse {
    id: String,
    status: String,
    #[serde(default)]
    purchase_units: Vec<CapturePurchaseUnit>,
}

#[derive(Debug, Deserialize)]
struct CapturePurchaseUnit {
    #[serde(default)]
    payments: Option<CapturePayments>,
}

#[derive(Debug, Deserialize)]
struct CapturePayments {
    #[serde(default)]
    captures: Vec<CaptureEntry>,
}

#[derive(Debug, Deserialize)]
struct CaptureEntry {
    id: String,
    status: String,
}

impl PayPalClient {
    /// Build a client with the configured per-call timeout
    pub fn new(config: PayPalConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| GatewayError::Gateway(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            config,
            http,
            token: Mutex::new(None),
        })
    }

    /// Current access token, fetching a fresh one when the cache is
    /// empty or about to expire
    async fn access_token(&self) -> Result<String> {
        let mut guard = self.token.lock().await;

        if let Some(cached) = guard.as_ref() {
            if cached.expires_at > Instant::now() {
                return Ok(cached.access_token.clone());
            }
        }

        debug!("Fetching processor access token");
        let response = self
            .http
            .post(format!("{}/v1/oauth2/token", self.config.base_url))
            .basic_auth(&self.config.client_id, Some(&self.config.client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(GatewayError::Gateway(format!(
                "Token request failed: {}",
                response.status()
            )));
        }

        let token: TokenResponse = response.json().await?;
        let lifetime = Duration::from_secs(token.expires_in);
        *guard = Some(CachedToken {
            access_token: token.access_token.clone(),
            expires_at: Instant::now() + lifetime.saturating_sub(TOKEN_EXPIRY_MARGIN),
        });

        Ok(token.access_token)
    }

    async fn timed<T>(
        operation: &str,
        call: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        let started = Instant::now();
        let result = call.await;
        METRICS
            .processor_call_duration_seconds
            .observe(started.elapsed().as_secs_f64());
        METRICS
            .processor_calls_total
            .with_label_values(&[operation, if result.is_ok() { "ok" } else { "error" }])
            .inc();
        result
    }
}

#[async_trait]
impl CheckoutGateway for PayPalClient {
    async fn create_order(
        &self,
        amount: Decimal,
        currency: Currency,
        reference: &str,
    ) -> Result<String> {
        let token = self.access_token().await?;

        let order = Self::timed("create_order", async {
            let response = self
                .http
                .post(format!("{}/v2/checkout/orders", self.config.base_url))
                .bearer_auth(&token)
                .json(&serde_json::json!({
                    "intent": "CAPTURE",
                    "purchase_units": [{
                        "reference_id": reference,
                        "amount": {
                            "currency_code": currency.code(),
                            "value": amount.to_string(),
                        },
                    }],
                }))
                .send()
                .await?;

            if !response.status().is_success() {
                return Err(GatewayError::Gateway(format!(
                    "Order creation failed: {}",
                    response.status()
                )));
            }

            Ok(response.json::<OrderResponse>().await?)
        })
        .await?;

        info!(order_id = %order.id, status = %order.status, "Processor order created");
        Ok(order.id)
    }

    async fn capture_order(&self, order_id: &str) -> Result<GatewayCapture> {
        let token = self.access_token().await?;

        let captured = Self::timed("capture_order", async {
            let response = self
                .http
                .post(format!(
                    "{}/v2/checkout/orders/{}/capture",
                    self.config.base_url, order_id
                ))
                .bearer_auth(&token)
                .header("Content-Type", "application/json")
                .send()
                .await?;

            if !response.status().is_success() {
                return Err(GatewayError::Gateway(format!(
                    "Capture failed: {}",
                    response.status()
                )));
            }

            Ok(response.json::<CaptureOrderResponse>().await?)
        })
        .await?;

        // The capture entry carries the authoritative status; the
        // order-level status can lag behind it
        let entry = captured
            .purchase_units
            .iter()
            .filter_map(|unit| unit.payments.as_ref())
            .flat_map(|payments| payments.captures.iter())
            .next();

        match entry {
            Some(capture) => Ok(GatewayCapture {
                order_id: captured.id,
                capture_id: capture.id.clone(),
                status: capture.status.clone(),
            }),
            None => {
                warn!(order_id = %captured.id, status = %captured.status, "Capture response carried no capture entry");
                Err(GatewayError::Gateway(format!(
                    "Capture response for order {} carried no capture entry",
                    captured.id
                )))
            }
        }
    }
}

impl std::fmt::Debug for PayPalClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PayPalClient")
            .field("base_url", &self.config.base_url)
            .finish_non_exhaustive()
    }
}
