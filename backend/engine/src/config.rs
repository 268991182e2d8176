//! Application configuration loaded from environment variables.

use std::str::FromStr;

use crate::errors::{EngineError, Result};

#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite database URL (e.g. sqlite:./donations.db)
    pub database_url: String,
    /// Port for the REST API server
    pub api_port: u16,
    /// Provider name recorded on sessions and webhook ledger rows
    pub provider: String,
    /// Base URL of the payment provider REST API
    pub payment_api_url: String,
    /// Provider secret API key
    pub payment_secret_key: String,
    /// Shared secret for webhook HMAC signatures
    pub webhook_secret: Option<String>,
    /// Reject every webhook when no secret is configured
    pub webhook_require_signature: bool,
    /// Platform fee in basis points (500 = 5%), overridable at runtime
    pub platform_fee_bps: u32,
    /// Minimum gross donation in minor units, overridable at runtime
    pub minimum_donation: i64,
    /// Smallest net amount worth disbursing to a charity
    pub minimum_net_amount: i64,
    /// Hard per-transaction ceiling enforced by the gateway
    pub max_transaction_amount: i64,
    /// Frontend base URL used to build checkout redirect URLs
    pub app_base_url: String,
    /// Bearer token for admin routes; admin routes are disabled when unset
    pub admin_api_token: Option<String>,
    /// Advisory lifetime of a payment session
    pub session_ttl_secs: i64,
    /// Interval of the reconciliation sweep; zero disables it
    pub reconcile_interval_secs: u64,
    /// Timeout for outbound provider calls
    pub http_timeout_secs: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Config {
            database_url: env_var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite:./donations.db".to_string()),
            api_port: parse_or("API_PORT", 3001)?,
            provider: env_var("PAYMENT_PROVIDER").unwrap_or_else(|_| "paymongo".to_string()),
            payment_api_url: env_var("PAYMENT_API_URL")
                .unwrap_or_else(|_| "https://api.paymongo.com/v1".to_string()),
            payment_secret_key: env_var("PAYMENT_SECRET_KEY").map_err(|_| {
                EngineError::Config("PAYMENT_SECRET_KEY environment variable is required".to_string())
            })?,
            webhook_secret: env_var("WEBHOOK_SECRET").ok().filter(|s| !s.is_empty()),
            webhook_require_signature: parse_or("WEBHOOK_REQUIRE_SIGNATURE", false)?,
            platform_fee_bps: parse_or("PLATFORM_FEE_BPS", 500)?,
            minimum_donation: parse_or("MINIMUM_DONATION", 10_000)?,
            minimum_net_amount: parse_or("MINIMUM_NET_AMOUNT", 2_000)?,
            max_transaction_amount: parse_or("MAX_TRANSACTION_AMOUNT", 10_000_000)?,
            app_base_url: env_var("APP_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:3000".to_string())
                .trim_end_matches('/')
                .to_string(),
            admin_api_token: env_var("ADMIN_API_TOKEN").ok().filter(|s| !s.is_empty()),
            session_ttl_secs: parse_or("SESSION_TTL_SECS", 3_600)?,
            reconcile_interval_secs: parse_or("RECONCILE_INTERVAL_SECS", 0)?,
            http_timeout_secs: parse_or("HTTP_TIMEOUT_SECS", 30)?,
        })
    }

    /// Configuration used by unit and integration tests.
    pub fn for_tests() -> Self {
        Config {
            database_url: "sqlite::memory:".to_string(),
            api_port: 0,
            provider: "paymongo".to_string(),
            payment_api_url: "http://127.0.0.1:9".to_string(),
            payment_secret_key: "sk_test".to_string(),
            webhook_secret: Some("whsk_test".to_string()),
            webhook_require_signature: false,
            platform_fee_bps: 500,
            minimum_donation: 10_000,
            minimum_net_amount: 2_000,
            max_transaction_amount: 10_000_000,
            app_base_url: "http://localhost:3000".to_string(),
            admin_api_token: Some("admin-token".to_string()),
            session_ttl_secs: 3_600,
            reconcile_interval_secs: 0,
            http_timeout_secs: 5,
        }
    }
}

fn env_var(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| EngineError::Config(format!("Missing env var: {key}")))
}

fn parse_or<T: FromStr>(key: &str, default: T) -> Result<T> {
    match env_var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| EngineError::Config(format!("Invalid {key}"))),
        Err(_) => Ok(default),
    }
}
