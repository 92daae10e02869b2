//! Database operations for captured transactions

use crate::error::{StoreError, StoreResult};
use capture_core::{
    Headers, HttpMethod, NetworkRequest, NetworkResponse, NetworkTransaction, TransactionQuery,
    TransactionStatus,
};
use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite};
use std::collections::HashSet;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

const COLUMNS: &str = "id, url, method, request_headers, request_body, request_content_type, \
    request_body_size, request_timestamp, response_status_code, response_status_message, \
    response_headers, response_body, response_content_type, response_body_size, \
    response_timestamp, start_time, end_time, status, error";

const ORDER: &str = " ORDER BY start_time DESC, id ASC";

/// SQLite caps bound parameters per statement
const ID_CHUNK: usize = 500;

/// Transaction as stored in `network_transactions`
#[derive(Debug, Clone)]
pub struct TransactionRow {
    pub id: String,
    pub url: String,
    pub method: String,
    pub request_headers: String, // JSON
    pub request_body: Option<String>,
    pub request_content_type: Option<String>,
    pub request_body_size: i64,
    pub request_timestamp: i64,
    pub response_status_code: Option<i64>,
    pub response_status_message: Option<String>,
    pub response_headers: Option<String>, // JSON
    pub response_body: Option<String>,
    pub response_content_type: Option<String>,
    pub response_body_size: Option<i64>,
    pub response_timestamp: Option<i64>,
    pub start_time: i64,
    pub end_time: Option<i64>,
    pub status: String,
    pub error: Option<String>,
}

impl TransactionRow {
    pub fn from_transaction(tx: &NetworkTransaction) -> StoreResult<Self> {
        let request = tx.request();
        let response = tx.response();

        Ok(Self {
            id: tx.id().to_string(),
            url: request.url.clone(),
            method: request.method.to_string(),
            request_headers: serde_json::to_string(&request.headers)?,
            request_body: request.body.clone(),
            request_content_type: request.content_type.clone(),
            request_body_size: request.body_size as i64,
            request_timestamp: request.timestamp,
            response_status_code: response.map(|r| i64::from(r.status_code)),
            response_status_message: response.map(|r| r.status_message.clone()),
            response_headers: response
                .map(|r| serde_json::to_string(&r.headers))
                .transpose()?,
            response_body: response.and_then(|r| r.body.clone()),
            response_content_type: response.and_then(|r| r.content_type.clone()),
            response_body_size: response.map(|r| r.body_size as i64),
            response_timestamp: response.map(|r| r.timestamp),
            start_time: tx.start_time(),
            end_time: tx.end_time(),
            status: tx.status().to_string(),
            error: tx.error().map(str::to_string),
        })
    }

    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            url: row.try_get("url")?,
            method: row.try_get("method")?,
            request_headers: row.try_get("request_headers")?,
            request_body: row.try_get("request_body")?,
            request_content_type: row.try_get("request_content_type")?,
            request_body_size: row.try_get("request_body_size")?,
            request_timestamp: row.try_get("request_timestamp")?,
            response_status_code: row.try_get("response_status_code")?,
            response_status_message: row.try_get("response_status_message")?,
            response_headers: row.try_get("response_headers")?,
            response_body: row.try_get("response_body")?,
            response_content_type: row.try_get("response_content_type")?,
            response_body_size: row.try_get("response_body_size")?,
            response_timestamp: row.try_get("response_timestamp")?,
            start_time: row.try_get("start_time")?,
            end_time: row.try_get("end_time")?,
            status: row.try_get("status")?,
            error: row.try_get("error")?,
        })
    }

    pub fn into_transaction(self) -> StoreResult<NetworkTransaction> {
        const TABLE: &str = "network_transactions";

        let request_headers: Headers = serde_json::from_str(&self.request_headers)
            .map_err(|e| StoreError::corrupt(TABLE, &self.id, e))?;
        let status: TransactionStatus = self
            .status
            .parse()
            .map_err(|e| StoreError::corrupt(TABLE, &self.id, e))?;

        let request = NetworkRequest {
            url: self.url,
            method: HttpMethod::from(self.method),
            headers: request_headers,
            body: self.request_body,
            content_type: self.request_content_type,
            body_size: self.request_body_size.max(0) as u64,
            timestamp: self.request_timestamp,
        };

        let response = match self.response_status_code {
            Some(code) => {
                let status_code = u16::try_from(code)
                    .map_err(|e| StoreError::corrupt(TABLE, &self.id, e))?;
                let headers = match &self.response_headers {
                    Some(json) => serde_json::from_str(json)
                        .map_err(|e| StoreError::corrupt(TABLE, &self.id, e))?,
                    None => Headers::new(),
                };
                Some(NetworkResponse {
                    status_code,
                    status_message: self.response_status_message.unwrap_or_default(),
                    headers,
                    body: self.response_body,
                    content_type: self.response_content_type,
                    body_size: self.response_body_size.unwrap_or(0).max(0) as u64,
                    timestamp: self.response_timestamp.unwrap_or(self.start_time),
                })
            }
            None => None,
        };

        Ok(NetworkTransaction::from_parts(
            self.id,
            request,
            response,
            self.start_time,
            self.end_time,
            status,
            self.error,
        )?)
    }
}

/// Bind every column of `row` in `COLUMNS` order
fn bind_row<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    row: &'q TransactionRow,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    query
        .bind(&row.id)
        .bind(&row.url)
        .bind(&row.method)
        .bind(&row.request_headers)
        .bind(&row.request_body)
        .bind(&row.request_content_type)
        .bind(row.request_body_size)
        .bind(row.request_timestamp)
        .bind(row.response_status_code)
        .bind(&row.response_status_message)
        .bind(&row.response_headers)
        .bind(&row.response_body)
        .bind(&row.response_content_type)
        .bind(row.response_body_size)
        .bind(row.response_timestamp)
        .bind(row.start_time)
        .bind(row.end_time)
        .bind(&row.status)
        .bind(&row.error)
}

/// Escape LIKE wildcards so user input matches literally
fn like_pattern(needle: &str) -> String {
    let mut escaped = String::with_capacity(needle.len() + 2);
    escaped.push('%');
    for c in needle.chars() {
        if matches!(c, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('%');
    escaped
}

fn push_filter(builder: &mut QueryBuilder<'_, Sqlite>, query: &TransactionQuery) {
    match query {
        TransactionQuery::All | TransactionQuery::Paged { .. } => {}
        TransactionQuery::TimeRange { start, end } => {
            builder
                .push(" WHERE start_time >= ")
                .push_bind(*start)
                .push(" AND start_time <= ")
                .push_bind(*end);
        }
        TransactionQuery::Search(needle) => {
            // LIKE already ignores ASCII case
            let pattern = like_pattern(needle);
            builder
                .push(" WHERE (url LIKE ")
                .push_bind(pattern.clone())
                .push(" ESCAPE '\\' OR method LIKE ")
                .push_bind(pattern.clone())
                .push(" ESCAPE '\\' OR CAST(response_status_code AS TEXT) LIKE ")
                .push_bind(pattern)
                .push(" ESCAPE '\\')");
        }
        TransactionQuery::ByMethod(method) => {
            builder
                .push(" WHERE method = ")
                .push_bind(method.as_str().to_string());
        }
        TransactionQuery::ByStatus(status) => {
            builder.push(" WHERE status = ").push_bind(status.as_str());
        }
    }
}

impl super::TransactionStore {
    /// Insert a transaction, replacing any row with the same id
    pub async fn insert(&self, tx: &NetworkTransaction) -> StoreResult<()> {
        let row = TransactionRow::from_transaction(tx)?;
        let sql = format!(
            "INSERT INTO network_transactions ({COLUMNS}) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET \
                url = excluded.url, \
                method = excluded.method, \
                request_headers = excluded.request_headers, \
                request_body = excluded.request_body, \
                request_content_type = excluded.request_content_type, \
                request_body_size = excluded.request_body_size, \
                request_timestamp = excluded.request_timestamp, \
                response_status_code = excluded.response_status_code, \
                response_status_message = excluded.response_status_message, \
                response_headers = excluded.response_headers, \
                response_body = excluded.response_body, \
                response_content_type = excluded.response_content_type, \
                response_body_size = excluded.response_body_size, \
                response_timestamp = excluded.response_timestamp, \
                start_time = excluded.start_time, \
                end_time = excluded.end_time, \
                status = excluded.status, \
                error = excluded.error"
        );

        bind_row(sqlx::query(&sql), &row)
            .execute(&self.pool)
            .await?;

        debug!("Stored transaction {}", row.id);
        self.notify_changed();
        Ok(())
    }

    /// Overwrite an existing row. Returns false when the id is unknown.
    pub async fn update(&self, tx: &NetworkTransaction) -> StoreResult<bool> {
        let row = TransactionRow::from_transaction(tx)?;
        let result = bind_row(
            sqlx::query(
                r#"
                UPDATE network_transactions SET
                    id = ?, url = ?, method = ?, request_headers = ?, request_body = ?,
                    request_content_type = ?, request_body_size = ?, request_timestamp = ?,
                    response_status_code = ?, response_status_message = ?, response_headers = ?,
                    response_body = ?, response_content_type = ?, response_body_size = ?,
                    response_timestamp = ?, start_time = ?, end_time = ?, status = ?, error = ?
                WHERE id = ?
                "#,
            ),
            &row,
        )
        .bind(&row.id)
        .execute(&self.pool)
        .await?;

        let updated = result.rows_affected() > 0;
        if updated {
            self.notify_changed();
        }
        Ok(updated)
    }

    /// Mark a pending row COMPLETE. Rows that are already terminal are left alone.
    pub async fn finish_completed(
        &self,
        id: &str,
        response: &NetworkResponse,
        end_time: i64,
    ) -> StoreResult<bool> {
        let headers = serde_json::to_string(&response.headers)?;
        let result = sqlx::query(
            r#"
            UPDATE network_transactions SET
                response_status_code = ?,
                response_status_message = ?,
                response_headers = ?,
                response_body = ?,
                response_content_type = ?,
                response_body_size = ?,
                response_timestamp = ?,
                end_time = ?,
                status = 'COMPLETE'
            WHERE id = ? AND status = 'PENDING'
            "#,
        )
        .bind(i64::from(response.status_code))
        .bind(&response.status_message)
        .bind(headers)
        .bind(&response.body)
        .bind(&response.content_type)
        .bind(response.body_size as i64)
        .bind(response.timestamp)
        .bind(end_time)
        .bind(id)
        .execute(&self.pool)
        .await?;

        let updated = result.rows_affected() > 0;
        if updated {
            self.notify_changed();
        } else {
            debug!("No pending row for completed transaction {}", id);
        }
        Ok(updated)
    }

    /// Mark a pending row FAILED. Rows that are already terminal are left alone.
    pub async fn finish_failed(&self, id: &str, error: &str, end_time: i64) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE network_transactions SET
                error = ?,
                end_time = ?,
                status = 'FAILED'
            WHERE id = ? AND status = 'PENDING'
            "#,
        )
        .bind(error)
        .bind(end_time)
        .bind(id)
        .execute(&self.pool)
        .await?;

        let updated = result.rows_affected() > 0;
        if updated {
            self.notify_changed();
        } else {
            debug!("No pending row for failed transaction {}", id);
        }
        Ok(updated)
    }

    pub async fn delete(&self, id: &str) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM network_transactions WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        let deleted = result.rows_affected() > 0;
        if deleted {
            self.notify_changed();
        }
        Ok(deleted)
    }

    pub async fn delete_all(&self) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM network_transactions")
            .execute(&self.pool)
            .await?;

        self.notify_changed();
        Ok(result.rows_affected())
    }

    /// Delete every row that started strictly before `timestamp`
    pub async fn delete_older_than(&self, timestamp: i64) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM network_transactions WHERE start_time < ?")
            .bind(timestamp)
            .execute(&self.pool)
            .await?;

        let deleted = result.rows_affected();
        if deleted > 0 {
            self.notify_changed();
        }
        Ok(deleted)
    }

    pub async fn count(&self) -> StoreResult<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM network_transactions")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    pub async fn by_id(&self, id: &str) -> StoreResult<Option<NetworkTransaction>> {
        let sql = format!("SELECT {COLUMNS} FROM network_transactions WHERE id = ?");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| TransactionRow::from_row(&row)?.into_transaction())
            .transpose()
    }

    /// Rows matching `query`, newest first
    pub async fn query(&self, query: &TransactionQuery) -> StoreResult<Vec<NetworkTransaction>> {
        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {COLUMNS} FROM network_transactions"
        ));
        push_filter(&mut builder, query);
        builder.push(ORDER);

        if let TransactionQuery::Paged { limit, offset } = query {
            builder
                .push(" LIMIT ")
                .push_bind(i64::from(*limit))
                .push(" OFFSET ")
                .push_bind(i64::from(*offset));
        }

        let rows = builder.build().fetch_all(&self.pool).await?;

        rows.iter()
            .map(|row| TransactionRow::from_row(row)?.into_transaction())
            .collect()
    }

    pub async fn distinct_methods(&self) -> StoreResult<Vec<HttpMethod>> {
        let methods: Vec<String> =
            sqlx::query_scalar("SELECT DISTINCT method FROM network_transactions ORDER BY method")
                .fetch_all(&self.pool)
                .await?;
        Ok(methods.into_iter().map(HttpMethod::from).collect())
    }

    pub async fn distinct_statuses(&self) -> StoreResult<Vec<TransactionStatus>> {
        let statuses: Vec<String> =
            sqlx::query_scalar("SELECT DISTINCT status FROM network_transactions ORDER BY status")
                .fetch_all(&self.pool)
                .await?;

        statuses
            .into_iter()
            .map(|status| {
                status
                    .parse()
                    .map_err(|e| StoreError::corrupt("network_transactions", status.as_str(), e))
            })
            .collect()
    }

    /// Which of `ids` have a stored row
    pub async fn existing_ids(&self, ids: &[String]) -> StoreResult<HashSet<String>> {
        let mut found = HashSet::new();

        for chunk in ids.chunks(ID_CHUNK) {
            let mut builder =
                QueryBuilder::<Sqlite>::new("SELECT id FROM network_transactions WHERE id IN (");
            let mut separated = builder.separated(", ");
            for id in chunk {
                separated.push_bind(id.as_str());
            }
            separated.push_unseparated(")");

            let rows = builder.build().fetch_all(&self.pool).await?;
            for row in rows {
                found.insert(row.try_get::<String, _>("id")?);
            }
        }

        Ok(found)
    }

    /// Stored rows for `ids`, in no particular order
    pub async fn by_ids(&self, ids: &[String]) -> StoreResult<Vec<NetworkTransaction>> {
        let mut found = Vec::new();

        for chunk in ids.chunks(ID_CHUNK) {
            let mut builder = QueryBuilder::<Sqlite>::new(format!(
                "SELECT {COLUMNS} FROM network_transactions WHERE id IN ("
            ));
            let mut separated = builder.separated(", ");
            for id in chunk {
                separated.push_bind(id.as_str());
            }
            separated.push_unseparated(")");

            let rows = builder.build().fetch_all(&self.pool).await?;
            for row in &rows {
                found.push(TransactionRow::from_row(row)?.into_transaction()?);
            }
        }

        Ok(found)
    }

    /// Stream that yields the result of `query` now and again after every store mutation
    pub fn observe(
        &self,
        query: TransactionQuery,
    ) -> ReceiverStream<StoreResult<Vec<NetworkTransaction>>> {
        let (sender, receiver) = mpsc::channel(16);
        let store = self.clone();
        let mut changes = self.subscribe_changes();

        tokio::spawn(async move {
            loop {
                // Mark seen before querying so a concurrent write triggers another pass
                changes.borrow_and_update();
                let result = store.query(&query).await;
                if sender.send(result).await.is_err() {
                    break;
                }

                tokio::select! {
                    changed = changes.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = sender.closed() => break,
                }
            }
            debug!("Transaction observer stopped");
        });

        ReceiverStream::new(receiver)
    }
}
