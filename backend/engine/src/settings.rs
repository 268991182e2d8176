//! Runtime overrides for values that otherwise come from the environment.

use sqlx::SqlitePool;
use tracing::warn;

use crate::config::Config;
use crate::db::now;
use crate::errors::{Result, ValidationCode, ValidationError};

pub const PLATFORM_FEE_BPS: &str = "platform_fee_bps";
pub const MINIMUM_DONATION: &str = "minimum_donation";

/// Values in force for the next checkout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EffectiveSettings {
    pub platform_fee_bps: u32,
    pub minimum_donation: i64,
}

pub async fn effective(pool: &SqlitePool, config: &Config) -> Result<EffectiveSettings> {
    let rows: Vec<(String, String)> = sqlx::query_as(
        "SELECT key, value FROM platform_settings WHERE key IN (?1, ?2)",
    )
    .bind(PLATFORM_FEE_BPS)
    .bind(MINIMUM_DONATION)
    .fetch_all(pool)
    .await?;

    let mut settings = EffectiveSettings {
        platform_fee_bps: config.platform_fee_bps,
        minimum_donation: config.minimum_donation,
    };
    for (key, value) in rows {
        match key.as_str() {
            PLATFORM_FEE_BPS => match parse_fee_bps(&value) {
                Ok(bps) => settings.platform_fee_bps = bps,
                Err(_) => warn!(key = %key, value = %value, "Ignoring malformed platform setting"),
            },
            MINIMUM_DONATION => match parse_minimum(&value) {
                Ok(min) => settings.minimum_donation = min,
                Err(_) => warn!(key = %key, value = %value, "Ignoring malformed platform setting"),
            },
            _ => {}
        }
    }
    Ok(settings)
}

/// Validate and store an override.
pub async fn set(pool: &SqlitePool, key: &str, value: &str, updated_by: &str) -> Result<()> {
    match key {
        PLATFORM_FEE_BPS => {
            parse_fee_bps(value)?;
        }
        MINIMUM_DONATION => {
            parse_minimum(value)?;
        }
        other => {
            return Err(ValidationError::new(
                ValidationCode::InvalidRequest,
                format!("unknown setting '{other}'"),
            )
            .into())
        }
    }

    sqlx::query(
        r#"
        INSERT INTO platform_settings (key, value, updated_by, updated_at)
        VALUES (?1, ?2, ?3, ?4)
        ON CONFLICT (key) DO UPDATE SET
            value = excluded.value, updated_by = excluded.updated_by, updated_at = excluded.updated_at
        "#,
    )
    .bind(key)
    .bind(value.trim())
    .bind(updated_by)
    .bind(now())
    .execute(pool)
    .await?;
    Ok(())
}

fn parse_fee_bps(value: &str) -> std::result::Result<u32, ValidationError> {
    match value.trim().parse::<u32>() {
        // A rate at or above 100% would leave nothing for the charity.
        Ok(bps) if bps < 10_000 => Ok(bps),
        _ => Err(ValidationError::new(
            ValidationCode::InvalidRequest,
            "platform_fee_bps must be an integer between 0 and 9999",
        )),
    }
}

fn parse_minimum(value: &str) -> std::result::Result<i64, ValidationError> {
    match value.trim().parse::<i64>() {
        Ok(min) if min > 0 => Ok(min),
        _ => Err(ValidationError::new(
            ValidationCode::InvalidRequest,
            "minimum_donation must be a positive integer",
        )),
    }
}
