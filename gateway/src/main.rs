//! Payment gateway service binary

use gateway::{
    api::{self, AppState},
    CheckoutService, GatewayConfig, PayPalClient,
};
use credit_ledger::{notify::LogNotifier, Ledger};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,payment_gateway=debug")),
        )
        .init();

    let config = match std::env::var("GATEWAY_CONFIG") {
        Ok(path) => GatewayConfig::from_file(path)?,
        Err(_) => GatewayConfig::from_env()?,
    };

    info!(
        bind_addr = %config.bind_addr,
        processor = %config.paypal.base_url,
        data_dir = ?config.ledger.data_dir,
        "Starting payment gateway"
    );

    let ledger = Arc::new(
        Ledger::open(config.ledger.clone())?.with_notifier(Arc::new(LogNotifier)),
    );
    let processor = Arc::new(PayPalClient::new(config.paypal.clone())?);
    let checkout = Arc::new(CheckoutService::new(ledger.clone(), processor));

    let app = api::router(AppState {
        ledger: ledger.clone(),
        checkout,
    });

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!(addr = %listener.local_addr()?, "Listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    ledger.shutdown().await;
    info!("Payment gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "Failed to listen for shutdown signal");
        return;
    }
    info!("Shutdown signal received");
}
