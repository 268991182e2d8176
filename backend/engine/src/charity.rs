//! Charity balances. Only milestone releases credit them here; withdrawals
//! live elsewhere.

use sqlx::{SqliteConnection, SqliteExecutor};

use crate::errors::{EngineError, Result};
use crate::models::CharityBalances;

/// Credit a released amount to `available_balance` and `total_received`.
///
/// Runs on the caller's connection so it commits or rolls back with the
/// rest of the release.
pub async fn credit_release(conn: &mut SqliteConnection, charity_id: &str, amount: i64) -> Result<()> {
    if amount <= 0 {
        return Err(EngineError::BusinessRule(format!(
            "release amount must be positive, got {amount}"
        )));
    }

    let result = sqlx::query(
        r#"
        UPDATE charities
        SET    available_balance = available_balance + ?1,
               total_received    = total_received + ?1
        WHERE  id = ?2
        "#,
    )
    .bind(amount)
    .bind(charity_id)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(EngineError::NotFound(format!("charity {charity_id}")));
    }
    Ok(())
}

pub async fn balances(executor: impl SqliteExecutor<'_>, charity_id: &str) -> Result<Option<CharityBalances>> {
    let row = sqlx::query_as::<_, CharityBalances>(
        "SELECT available_balance, total_received, total_withdrawn FROM charities WHERE id = ?1",
    )
    .bind(charity_id)
    .fetch_optional(executor)
    .await?;
    Ok(row)
}
