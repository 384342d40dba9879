//! PostgreSQL store implementation.
//!
//! Three tables, mirroring the three record kinds:
//!
//! ```text
//! committed_states(tx_id BYTEA, output_index INT4, consuming_tx_id BYTEA,
//!                  PRIMARY KEY (tx_id, output_index))
//! committed_transactions(tx_id BYTEA PRIMARY KEY)
//! request_log(instance_id UUID, sequence BIGINT, tx_id BYTEA,
//!             caller TEXT, request_signature BYTEA,
//!             received_at TIMESTAMPTZ,
//!             PRIMARY KEY (instance_id, sequence))
//! ```
//!
//! Batch transactions run at SERIALIZABLE isolation. Serialization
//! failures (40001), deadlocks (40P01), and primary-key races with a
//! concurrent writer instance (23505) all map to the transient error
//! class, which the engine retries with backoff; after the retry re-reads,
//! a lost uniqueness race resurfaces as an ordinary conflict outcome.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::instrument;

use rsnotary_domain::{StateRef, TxId};

use crate::error::{StorageError, StorageResult};
use crate::traits::{BatchWrite, StoreTransaction, UniquenessStore};

/// Connection settings for [`PostgresStore`].
#[derive(Debug, Clone)]
pub struct PostgresConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub connect_timeout_secs: u64,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            max_connections: 10,
            connect_timeout_secs: 5,
        }
    }
}

/// PostgreSQL implementation of [`UniquenessStore`].
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connects a pool according to `config`.
    pub async fn from_config(config: &PostgresConfig) -> StorageResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .connect(&config.database_url)
            .await
            .map_err(|e| StorageError::Connection {
                message: format!("failed to connect to PostgreSQL: {e}"),
            })?;
        Ok(Self { pool })
    }

    /// Wraps an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Creates the schema if it does not exist.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> StorageResult<()> {
        const SCHEMA: &[&str] = &[
            r#"
            CREATE TABLE IF NOT EXISTS committed_states (
                tx_id           BYTEA  NOT NULL,
                output_index    INT4   NOT NULL,
                consuming_tx_id BYTEA  NOT NULL,
                PRIMARY KEY (tx_id, output_index)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS committed_transactions (
                tx_id BYTEA PRIMARY KEY
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS request_log (
                instance_id       UUID        NOT NULL,
                sequence          BIGINT      NOT NULL,
                tx_id             BYTEA       NOT NULL,
                caller            TEXT        NOT NULL,
                request_signature BYTEA       NOT NULL,
                received_at       TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (instance_id, sequence)
            )
            "#,
        ];

        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Query {
                    message: format!("failed to run migration: {e}"),
                })?;
        }
        Ok(())
    }
}

#[async_trait]
impl UniquenessStore for PostgresStore {
    #[instrument(skip(self))]
    async fn begin(&self) -> StorageResult<Box<dyn StoreTransaction>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StorageError::Transaction {
                message: format!("failed to begin transaction: {e}"),
            })?;

        // The conflict read and the commit write must not be separable by
        // a concurrent writer instance.
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await
            .map_err(|e| map_db_error(e, "failed to set isolation level"))?;

        Ok(Box::new(PostgresTransaction { tx }))
    }
}

struct PostgresTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl StoreTransaction for PostgresTransaction {
    async fn find_committed(
        &mut self,
        refs: &[StateRef],
    ) -> StorageResult<Vec<(StateRef, TxId)>> {
        if refs.is_empty() {
            return Ok(Vec::new());
        }

        let tx_ids: Vec<Vec<u8>> = refs.iter().map(|r| r.tx_id.as_bytes().to_vec()).collect();
        let output_indexes: Vec<i32> = refs.iter().map(|r| r.output_index as i32).collect();

        let rows = sqlx::query(
            r#"
            SELECT tx_id, output_index, consuming_tx_id
            FROM committed_states
            WHERE (tx_id, output_index) IN
                (SELECT * FROM UNNEST($1::bytea[], $2::int4[]))
            "#,
        )
        .bind(&tx_ids)
        .bind(&output_indexes)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| map_db_error(e, "failed to query committed states"))?;

        rows.into_iter()
            .map(|row| {
                let state_ref = StateRef::new(
                    decode_tx_id(row.try_get("tx_id")?)?,
                    row.try_get::<i32, _>("output_index")? as u32,
                );
                let consuming = decode_tx_id(row.try_get("consuming_tx_id")?)?;
                Ok((state_ref, consuming))
            })
            .collect()
    }

    async fn transaction_committed(&mut self, tx_id: &TxId) -> StorageResult<bool> {
        let row = sqlx::query(
            "SELECT EXISTS(SELECT 1 FROM committed_transactions WHERE tx_id = $1)",
        )
        .bind(tx_id.as_bytes().as_slice())
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| map_db_error(e, "failed to query committed transactions"))?;

        row.try_get::<bool, _>(0).map_err(StorageError::from)
    }

    async fn commit(mut self: Box<Self>, batch: BatchWrite) -> StorageResult<()> {
        if !batch.committed_states.is_empty() {
            let tx_ids: Vec<Vec<u8>> = batch
                .committed_states
                .iter()
                .map(|s| s.state_ref.tx_id.as_bytes().to_vec())
                .collect();
            let output_indexes: Vec<i32> = batch
                .committed_states
                .iter()
                .map(|s| s.state_ref.output_index as i32)
                .collect();
            let consuming: Vec<Vec<u8>> = batch
                .committed_states
                .iter()
                .map(|s| s.consuming_tx_id.as_bytes().to_vec())
                .collect();

            // No ON CONFLICT: a duplicate key here is either a bug
            // upstream or a race with another instance, and must abort
            // the whole batch.
            sqlx::query(
                r#"
                INSERT INTO committed_states (tx_id, output_index, consuming_tx_id)
                SELECT * FROM UNNEST($1::bytea[], $2::int4[], $3::bytea[])
                "#,
            )
            .bind(&tx_ids)
            .bind(&output_indexes)
            .bind(&consuming)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_db_error(e, "failed to insert committed states"))?;
        }

        if !batch.committed_transactions.is_empty() {
            let tx_ids: Vec<Vec<u8>> = batch
                .committed_transactions
                .iter()
                .map(|t| t.as_bytes().to_vec())
                .collect();

            sqlx::query(
                r#"
                INSERT INTO committed_transactions (tx_id)
                SELECT * FROM UNNEST($1::bytea[])
                "#,
            )
            .bind(&tx_ids)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_db_error(e, "failed to insert committed transactions"))?;
        }

        if !batch.request_log.is_empty() {
            let instance_ids: Vec<uuid::Uuid> =
                batch.request_log.iter().map(|e| e.instance_id).collect();
            let sequences: Vec<i64> = batch
                .request_log
                .iter()
                .map(|e| e.sequence as i64)
                .collect();
            let tx_ids: Vec<Vec<u8>> = batch
                .request_log
                .iter()
                .map(|e| e.tx_id.as_bytes().to_vec())
                .collect();
            let callers: Vec<&str> = batch
                .request_log
                .iter()
                .map(|e| e.caller.name())
                .collect();
            let signatures: Vec<Vec<u8>> = batch
                .request_log
                .iter()
                .map(|e| e.request_signature.clone())
                .collect();
            let received: Vec<chrono::DateTime<chrono::Utc>> =
                batch.request_log.iter().map(|e| e.received_at).collect();

            sqlx::query(
                r#"
                INSERT INTO request_log
                    (instance_id, sequence, tx_id, caller, request_signature, received_at)
                SELECT * FROM UNNEST
                    ($1::uuid[], $2::int8[], $3::bytea[], $4::text[], $5::bytea[], $6::timestamptz[])
                "#,
            )
            .bind(&instance_ids)
            .bind(&sequences)
            .bind(&tx_ids)
            .bind(&callers)
            .bind(&signatures)
            .bind(&received)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_db_error(e, "failed to insert request log entries"))?;
        }

        self.tx
            .commit()
            .await
            .map_err(|e| map_db_error(e, "failed to commit transaction"))
    }
}

/// Maps contention-class database errors to the transient class the
/// engine's retry loop consumes; everything else is a query error.
fn map_db_error(err: sqlx::Error, context: &str) -> StorageError {
    if let sqlx::Error::Database(db) = &err {
        if let Some(code) = db.code() {
            // serialization_failure, deadlock_detected, unique_violation
            if matches!(code.as_ref(), "40001" | "40P01" | "23505") {
                return StorageError::Serialization {
                    message: format!("{context}: {db}"),
                };
            }
        }
    }
    StorageError::Query {
        message: format!("{context}: {err}"),
    }
}

fn decode_tx_id(bytes: Vec<u8>) -> Result<TxId, sqlx::Error> {
    let bytes: [u8; 32] = bytes.try_into().map_err(|b: Vec<u8>| {
        sqlx::Error::Decode(
            format!("expected 32-byte transaction id, got {} bytes", b.len()).into(),
        )
    })?;
    Ok(TxId(bytes))
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        StorageError::Query {
            message: err.to_string(),
        }
    }
}
