//! Database operations for interception rules
//!
//! Rules are stored as JSON payloads. `position` keeps the order in which
//! rules were first saved so equal priorities evaluate in a stable order.

use crate::error::{StoreError, StoreResult};
use capture_core::NetworkRule;
use sqlx::{Row, Sqlite, Transaction};
use tracing::info;

fn decode(id: &str, payload: &str) -> StoreResult<NetworkRule> {
    serde_json::from_str(payload).map_err(|e| StoreError::corrupt("network_rules", id, e))
}

async fn upsert_in(txn: &mut Transaction<'_, Sqlite>, rule: &NetworkRule) -> StoreResult<()> {
    let payload = serde_json::to_string(rule)?;
    sqlx::query(
        r#"
        INSERT INTO network_rules (id, position, enabled, last_modified, payload)
        VALUES (?, (SELECT COALESCE(MAX(position), -1) + 1 FROM network_rules), ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            enabled = excluded.enabled,
            last_modified = excluded.last_modified,
            payload = excluded.payload
        "#,
    )
    .bind(&rule.id)
    .bind(rule.enabled)
    .bind(rule.last_modified)
    .bind(payload)
    .execute(&mut **txn)
    .await?;
    Ok(())
}

impl super::TransactionStore {
    /// All rules in stored order
    pub async fn list_rules(&self) -> StoreResult<Vec<NetworkRule>> {
        let rows = sqlx::query("SELECT id, payload FROM network_rules ORDER BY position ASC")
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| {
                let id: String = row.try_get("id")?;
                let payload: String = row.try_get("payload")?;
                decode(&id, &payload)
            })
            .collect()
    }

    pub async fn get_rule(&self, id: &str) -> StoreResult<Option<NetworkRule>> {
        let payload: Option<String> =
            sqlx::query_scalar("SELECT payload FROM network_rules WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        payload.map(|payload| decode(id, &payload)).transpose()
    }

    /// Insert or update a rule. New rules go to the end of the stored order.
    pub async fn upsert_rule(&self, rule: &NetworkRule) -> StoreResult<()> {
        let mut txn = self.pool.begin().await?;
        upsert_in(&mut txn, rule).await?;
        txn.commit().await?;
        Ok(())
    }

    /// Upsert several rules atomically, in order
    pub async fn upsert_rules(&self, rules: &[NetworkRule]) -> StoreResult<()> {
        let mut txn = self.pool.begin().await?;
        for rule in rules {
            upsert_in(&mut txn, rule).await?;
        }
        txn.commit().await?;
        Ok(())
    }

    pub async fn delete_rule(&self, id: &str) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM network_rules WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Replace the whole rule list atomically
    pub async fn replace_rules(&self, rules: &[NetworkRule]) -> StoreResult<()> {
        let mut txn = self.pool.begin().await?;
        sqlx::query("DELETE FROM network_rules")
            .execute(&mut *txn)
            .await?;
        for rule in rules {
            upsert_in(&mut txn, rule).await?;
        }
        txn.commit().await?;

        info!("✓ Replaced stored rules ({} rules)", rules.len());
        Ok(())
    }
}
