//! CreditRail Payment Gateway
//!
//! HTTP boundary in front of the credit ledger: checkout order
//! creation and capture against an external PayPal-style processor,
//! webhook ingestion, and the user-facing balance/transaction API.
//!
//! The gateway never mutates balances itself; every ledger effect goes
//! through `credit_ledger::Ledger`, which serializes mutations behind
//! its single-writer actor.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, clippy::all)]

pub mod api;
pub mod checkout;
pub mod config;
pub mod error;
pub mod metrics;
pub mod paypal;
pub mod webhook;

pub use checkout::CheckoutService;
pub use config::{GatewayConfig, PayPalConfig};
pub use error::{GatewayError, Result};
pub use paypal::{CheckoutGateway, GatewayCapture, PayPalClient};
pub use webhook::{WebhookDisposition, WebhookEvent};
