//! Database operations for the rule application history

use crate::error::{StoreError, StoreResult};
use capture_core::{OutcomeKind, RuleApplicationResult};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

fn from_row(row: &SqliteRow) -> StoreResult<RuleApplicationResult> {
    let seq: i64 = row.try_get("seq")?;
    let outcome: String = row.try_get("outcome")?;
    let outcome: OutcomeKind = outcome
        .parse()
        .map_err(|e| StoreError::corrupt("rule_applications", seq.to_string(), e))?;

    Ok(RuleApplicationResult {
        rule_id: row.try_get("rule_id")?,
        rule_name: row.try_get("rule_name")?,
        transaction_id: row.try_get("transaction_id")?,
        outcome,
        detail: row.try_get("detail")?,
        applied_at: row.try_get("applied_at")?,
    })
}

impl super::TransactionStore {
    pub async fn append_rule_application(&self, result: &RuleApplicationResult) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO rule_applications (rule_id, rule_name, transaction_id, outcome, detail, applied_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&result.rule_id)
        .bind(&result.rule_name)
        .bind(&result.transaction_id)
        .bind(result.outcome.as_str())
        .bind(&result.detail)
        .bind(result.applied_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Most recent applications first
    pub async fn recent_rule_applications(&self, limit: u32) -> StoreResult<Vec<RuleApplicationResult>> {
        let rows = sqlx::query(
            r#"
            SELECT seq, rule_id, rule_name, transaction_id, outcome, detail, applied_at
            FROM rule_applications
            ORDER BY seq DESC
            LIMIT ?
            "#,
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(from_row).collect()
    }

    /// Applications for one transaction, in the order they happened
    pub async fn rule_applications_for(&self, transaction_id: &str) -> StoreResult<Vec<RuleApplicationResult>> {
        let rows = sqlx::query(
            r#"
            SELECT seq, rule_id, rule_name, transaction_id, outcome, detail, applied_at
            FROM rule_applications
            WHERE transaction_id = ?
            ORDER BY seq ASC
            "#,
        )
        .bind(transaction_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(from_row).collect()
    }
}
