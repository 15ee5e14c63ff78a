//! Gateway service configuration

use serde::{Deserialize, Serialize};

/// Top-level gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Address the HTTP server binds to
    pub bind_addr: String,

    /// External processor settings
    pub paypal: PayPalConfig,

    /// Embedded ledger settings
    pub ledger: credit_ledger::Config,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            paypal: PayPalConfig::default(),
            ledger: credit_ledger::Config::default(),
        }
    }
}

/// PayPal-style processor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayPalConfig {
    /// API base URL
    pub base_url: String,

    /// OAuth client id
    pub client_id: String,

    /// OAuth client secret
    pub client_secret: String,

    /// Per-call timeout in seconds
    pub timeout_secs: u64,
}

impl Default for PayPalConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api-m.sandbox.paypal.com".to_string(),
            client_id: String::new(),
            client_secret: String::new(),
            timeout_secs: 10,
        }
    }
}

impl GatewayConfig {
    /// Load from a toml file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Load defaults and apply environment overrides
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = GatewayConfig::default();

        if let Ok(addr) = std::env::var("GATEWAY_BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Ok(url) = std::env::var("PAYPAL_BASE_URL") {
            config.paypal.base_url = url;
        }
        if let Ok(id) = std::env::var("PAYPAL_CLIENT_ID") {
            config.paypal.client_id = id;
        }
        if let Ok(secret) = std::env::var("PAYPAL_CLIENT_SECRET") {
            config.paypal.client_secret = secret;
        }
        if let Ok(data_dir) = std::env::var("LEDGER_DATA_DIR") {
            config.ledger.data_dir = data_dir.into();
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = GatewayConfig::default();
        assert_eq!(config.bind_addr, "0.0.0.0:8080");
        assert_eq!(config.paypal.timeout_secs, 10);
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = GatewayConfig::default();
        let text = toml::to_string(&config).unwrap();
        let parsed: GatewayConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.paypal.base_url, config.paypal.base_url);
        assert_eq!(parsed.ledger.retry.max_attempts, 3);
    }
}
