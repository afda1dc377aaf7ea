//! Postgres-backed [`LedgerStore`]: JSONB documents keyed by natural keys

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::pool::PoolConnection;
use sqlx::postgres::PgQueryResult;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres};
use std::future::Future;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::warn;

use super::{LedgerStore, StoreBackend};
use crate::error::{ReconcileError, ReconcileResult};
use crate::models::{normalize_address, IndexerCursor, Lend, Loan, Notification, Payment, User};

/// Session advisory lock id for the reconciliation writer
const WRITER_LOCK_KEY: i64 = 0x6269_746d_6f72;

pub struct PgStore {
    pool: PgPool,
    timeout: Duration,
    // Session advisory locks belong to a connection, so the winning
    // connection is parked here for the life of the process
    writer_conn: Mutex<Option<PoolConnection<Postgres>>>,
}

impl PgStore {
    pub fn new(pool: PgPool, timeout: Duration) -> Self {
        Self {
            pool,
            timeout,
            writer_conn: Mutex::new(None),
        }
    }

    async fn bounded<T, F>(&self, fut: F) -> ReconcileResult<T>
    where
        F: Future<Output = Result<T, sqlx::Error>>,
    {
        Ok(tokio::time::timeout(self.timeout, fut).await??)
    }

    async fn fetch_doc<T>(&self, sql: &str, key: &str) -> ReconcileResult<Option<T>>
    where
        T: serde::de::DeserializeOwned + Send + Unpin + 'static,
    {
        let row: Option<(Json<T>,)> = self
            .bounded(sqlx::query_as(sql).bind(key).fetch_optional(&self.pool))
            .await?;
        Ok(row.map(|(Json(doc),)| doc))
    }

    async fn fetch_docs<T>(&self, sql: &str, key: Option<&str>) -> ReconcileResult<Vec<T>>
    where
        T: serde::de::DeserializeOwned + Send + Unpin + 'static,
    {
        let mut query = sqlx::query_as::<_, (Json<T>,)>(sql);
        if let Some(key) = key {
            query = query.bind(key.to_string());
        }
        let rows = self.bounded(query.fetch_all(&self.pool)).await?;
        Ok(rows.into_iter().map(|(Json(doc),)| doc).collect())
    }

    async fn execute_doc<T>(
        &self,
        sql: &str,
        key: &str,
        extra: Option<&str>,
        doc: &T,
    ) -> ReconcileResult<PgQueryResult>
    where
        T: Serialize + Sync,
    {
        let mut query = sqlx::query(sql).bind(key.to_string());
        if let Some(extra) = extra {
            query = query.bind(extra.to_string());
        }
        let payload = serde_json::to_value(doc)?;
        self.bounded(query.bind(Json(payload)).execute(&self.pool))
            .await
    }
}

fn expect_updated(result: PgQueryResult, entity: &'static str, key: &str) -> ReconcileResult<()> {
    if result.rows_affected() == 0 {
        return Err(ReconcileError::not_found(entity, key));
    }
    Ok(())
}

#[async_trait]
impl LedgerStore for PgStore {
    async fn find_user(&self, address: &str) -> ReconcileResult<Option<User>> {
        self.fetch_doc(
            "SELECT doc FROM users WHERE user_address = $1",
            &normalize_address(address),
        )
        .await
    }

    async fn create_user(&self, user: &User) -> ReconcileResult<bool> {
        let result = self
            .execute_doc(
                r#"
                INSERT INTO users (user_address, doc, updated_at)
                VALUES ($1, $2, NOW())
                ON CONFLICT (user_address) DO NOTHING
                "#,
                &normalize_address(&user.user_address),
                None,
                user,
            )
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn update_user(&self, user: &User) -> ReconcileResult<()> {
        let key = normalize_address(&user.user_address);
        let result = self
            .execute_doc(
                "UPDATE users SET doc = $2, updated_at = NOW() WHERE user_address = $1",
                &key,
                None,
                user,
            )
            .await?;
        expect_updated(result, "User", &key)
    }

    async fn find_lend(&self, lender: &str) -> ReconcileResult<Option<Lend>> {
        self.fetch_doc(
            "SELECT doc FROM lends WHERE user_address = $1",
            &normalize_address(lender),
        )
        .await
    }

    async fn create_lend(&self, lend: &Lend) -> ReconcileResult<bool> {
        let result = self
            .execute_doc(
                r#"
                INSERT INTO lends (user_address, doc, updated_at)
                VALUES ($1, $2, NOW())
                ON CONFLICT (user_address) DO NOTHING
                "#,
                &normalize_address(&lend.user_address),
                None,
                lend,
            )
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn update_lend(&self, lend: &Lend) -> ReconcileResult<()> {
        let key = normalize_address(&lend.user_address);
        let result = self
            .execute_doc(
                "UPDATE lends SET doc = $2, updated_at = NOW() WHERE user_address = $1",
                &key,
                None,
                lend,
            )
            .await?;
        expect_updated(result, "Lend", &key)
    }

    async fn list_lends(&self) -> ReconcileResult<Vec<Lend>> {
        self.fetch_docs("SELECT doc FROM lends ORDER BY user_address", None)
            .await
    }

    async fn find_loan(&self, loan_id: &str) -> ReconcileResult<Option<Loan>> {
        self.fetch_doc(
            "SELECT doc FROM loans WHERE loan_id = $1",
            &loan_id.to_lowercase(),
        )
        .await
    }

    async fn create_loan(&self, loan: &Loan) -> ReconcileResult<bool> {
        let result = self
            .execute_doc(
                r#"
                INSERT INTO loans (loan_id, borrower, doc, updated_at)
                VALUES ($1, $2, $3, NOW())
                ON CONFLICT (loan_id) DO NOTHING
                "#,
                &loan.loan_id.to_lowercase(),
                Some(&normalize_address(&loan.user_address)),
                loan,
            )
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn update_loan(&self, loan: &Loan) -> ReconcileResult<()> {
        let key = loan.loan_id.to_lowercase();
        let result = self
            .execute_doc(
                "UPDATE loans SET doc = $2, updated_at = NOW() WHERE loan_id = $1",
                &key,
                None,
                loan,
            )
            .await?;
        expect_updated(result, "Loan", &key)
    }

    async fn list_loans(&self) -> ReconcileResult<Vec<Loan>> {
        self.fetch_docs("SELECT doc FROM loans ORDER BY loan_id", None)
            .await
    }

    async fn loans_by_borrower(&self, borrower: &str) -> ReconcileResult<Vec<Loan>> {
        self.fetch_docs(
            "SELECT doc FROM loans WHERE borrower = $1 ORDER BY loan_id",
            Some(&normalize_address(borrower)),
        )
        .await
    }

    async fn find_payment(&self, payment_key: &str) -> ReconcileResult<Option<Payment>> {
        self.fetch_doc("SELECT doc FROM payments WHERE payment_key = $1", payment_key)
            .await
    }

    async fn create_payment(&self, payment: &Payment) -> ReconcileResult<bool> {
        let result = self
            .execute_doc(
                r#"
                INSERT INTO payments (payment_key, loan_id, doc, updated_at)
                VALUES ($1, $2, $3, NOW())
                ON CONFLICT (payment_key) DO NOTHING
                "#,
                &payment.payment_key,
                Some(&payment.loan_id.to_lowercase()),
                payment,
            )
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn update_payment(&self, payment: &Payment) -> ReconcileResult<()> {
        let result = self
            .execute_doc(
                "UPDATE payments SET doc = $2, updated_at = NOW() WHERE payment_key = $1",
                &payment.payment_key,
                None,
                payment,
            )
            .await?;
        expect_updated(result, "Payment", &payment.payment_key)
    }

    async fn payments_for_loan(&self, loan_id: &str) -> ReconcileResult<Vec<Payment>> {
        self.fetch_docs(
            "SELECT doc FROM payments WHERE loan_id = $1 ORDER BY doc->>'payment_time'",
            Some(&loan_id.to_lowercase()),
        )
        .await
    }

    async fn create_notification(&self, notification: &Notification) -> ReconcileResult<bool> {
        let result = self
            .execute_doc(
                r#"
                INSERT INTO notifications (notification_key, user_address, doc, created_at)
                VALUES ($1, $2, $3, NOW())
                ON CONFLICT (notification_key) DO NOTHING
                "#,
                &notification.key,
                Some(&normalize_address(&notification.user_address)),
                notification,
            )
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn list_notifications(&self) -> ReconcileResult<Vec<Notification>> {
        self.fetch_docs("SELECT doc FROM notifications ORDER BY created_at", None)
            .await
    }

    async fn load_cursor(&self, contract_address: &str) -> ReconcileResult<Option<IndexerCursor>> {
        let row: Option<(i64, DateTime<Utc>)> = self
            .bounded(
                sqlx::query_as(
                    "SELECT last_processed_block, updated_at FROM indexer_state WHERE contract_address = $1",
                )
                .bind(contract_address.to_lowercase())
                .fetch_optional(&self.pool),
            )
            .await?;

        row.map(|(block, updated_at)| {
            let last_processed_block = u64::try_from(block).map_err(|_| {
                ReconcileError::Decode(format!("negative cursor block {}", block))
            })?;
            Ok(IndexerCursor {
                contract_address: contract_address.to_lowercase(),
                last_processed_block,
                updated_at,
            })
        })
        .transpose()
    }

    async fn save_cursor(&self, cursor: &IndexerCursor) -> ReconcileResult<()> {
        let block = i64::try_from(cursor.last_processed_block).map_err(|_| {
            ReconcileError::Arithmetic(format!(
                "cursor block {} exceeds BIGINT",
                cursor.last_processed_block
            ))
        })?;

        self.bounded(
            sqlx::query(
                r#"
                INSERT INTO indexer_state (contract_address, last_processed_block, updated_at)
                VALUES ($1, $2, NOW())
                ON CONFLICT (contract_address)
                DO UPDATE SET last_processed_block = EXCLUDED.last_processed_block, updated_at = NOW()
                "#,
            )
            .bind(cursor.contract_address.to_lowercase())
            .bind(block)
            .execute(&self.pool),
        )
        .await?;
        Ok(())
    }

    async fn try_acquire_writer_lock(&self) -> ReconcileResult<bool> {
        let mut held = self.writer_conn.lock().await;
        if let Some(conn) = held.as_mut() {
            // Re-entrant take then release: true only while this session
            // still owns the lock, and the hold count stays at one
            let check: ReconcileResult<(bool,)> = self
                .bounded(
                    sqlx::query_as("SELECT pg_try_advisory_lock($1) AND pg_advisory_unlock($1)")
                        .bind(WRITER_LOCK_KEY)
                        .fetch_one(&mut **conn),
                )
                .await;

            match check {
                Ok((true,)) => return Ok(true),
                Ok((false,)) => {
                    warn!("Writer lock no longer held by this session, standing down");
                    if let Some(conn) = held.take() {
                        drop(conn.detach());
                    }
                    return Ok(false);
                }
                Err(e) => {
                    warn!(error = %e, "Writer lock session lost, standing down");
                    if let Some(conn) = held.take() {
                        drop(conn.detach());
                    }
                    return Err(e);
                }
            }
        }

        let mut conn = self.bounded(self.pool.acquire()).await?;
        let (acquired,): (bool,) = self
            .bounded(
                sqlx::query_as("SELECT pg_try_advisory_lock($1)")
                    .bind(WRITER_LOCK_KEY)
                    .fetch_one(&mut *conn),
            )
            .await?;

        if acquired {
            *held = Some(conn);
        }
        Ok(acquired)
    }

    async fn ping(&self) -> ReconcileResult<()> {
        self.bounded(sqlx::query("SELECT 1").execute(&self.pool))
            .await?;
        Ok(())
    }

    fn backend(&self) -> StoreBackend {
        StoreBackend::Postgres
    }
}
