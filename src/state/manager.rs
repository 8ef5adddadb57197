//! PostgreSQL state manager

use super::WorkflowStore;
use crate::config::DatabaseConfig;
use crate::error::{RelayerError, RelayerResult};
use crate::settlement::{PointDelta, SettlementSource};
use crate::workflow::{ContractInvokeRecord, InvokeStatus, SyncRecord, SyncStatus};

use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::time::Duration;
use tracing::{debug, info};

/// State manager for PostgreSQL persistence
pub struct StateManager {
    pool: PgPool,
}

impl StateManager {
    /// Create a new state manager
    pub async fn new(config: &DatabaseConfig) -> RelayerResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await?;

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> RelayerResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS contract_invoke_workflows (
                id TEXT PRIMARY KEY,
                chain_id TEXT NOT NULL,
                contract_address TEXT NOT NULL,
                contract_method TEXT NOT NULL,
                biz_type TEXT NOT NULL,
                param TEXT NOT NULL,
                sender TEXT,
                transaction_id TEXT,
                status VARCHAR(20) NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                message TEXT,
                block_height BIGINT,
                create_time TIMESTAMPTZ NOT NULL,
                update_time TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_contract_invoke_status
            ON contract_invoke_workflows (status)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS token_sync_workflows (
                id TEXT PRIMARY KEY,
                symbol TEXT,
                status VARCHAR(32) NOT NULL,
                validate_token_tx TEXT,
                validate_token_tx_id TEXT,
                validate_token_height BIGINT,
                main_chain_index_height BIGINT,
                cross_chain_create_token_tx_id TEXT,
                message TEXT,
                create_time TIMESTAMPTZ NOT NULL,
                update_time TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS pending_token_syncs (
                id TEXT PRIMARY KEY,
                added_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chain_checkpoints (
                name TEXT PRIMARY KEY,
                block_number BIGINT NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS job_leases (
                name TEXT PRIMARY KEY,
                holder TEXT NOT NULL,
                run_token TEXT NOT NULL DEFAULT '',
                expires_at TIMESTAMPTZ NOT NULL,
                completed_at TIMESTAMPTZ
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "ALTER TABLE job_leases ADD COLUMN IF NOT EXISTS run_token TEXT NOT NULL DEFAULT ''",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS point_daily_records (
                id BIGSERIAL PRIMARY KEY,
                chain_id TEXT NOT NULL,
                biz_date DATE NOT NULL,
                address TEXT NOT NULL,
                point_name TEXT NOT NULL,
                amount NUMERIC NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_point_daily_chain_date
            ON point_daily_records (chain_id, biz_date)
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Database migrations complete");
        Ok(())
    }
}

fn invoke_from_row(row: PgRow) -> RelayerResult<ContractInvokeRecord> {
    let status: String = row.get("status");
    Ok(ContractInvokeRecord {
        id: row.get("id"),
        chain_id: row.get("chain_id"),
        contract_address: row.get("contract_address"),
        contract_method: row.get("contract_method"),
        biz_type: row.get("biz_type"),
        param: row.get("param"),
        sender: row.get("sender"),
        transaction_id: row.get("transaction_id"),
        status: status.parse()?,
        retry_count: row.get::<i32, _>("retry_count") as u32,
        message: row.get("message"),
        block_height: row.get::<Option<i64>, _>("block_height").map(|h| h as u64),
        create_time: row.get("create_time"),
        update_time: row.get("update_time"),
    })
}

fn sync_from_row(row: PgRow) -> RelayerResult<SyncRecord> {
    let status: String = row.get("status");
    Ok(SyncRecord {
        id: row.get("id"),
        symbol: row.get("symbol"),
        status: status.parse()?,
        validate_token_tx: row.get("validate_token_tx"),
        validate_token_tx_id: row.get("validate_token_tx_id"),
        validate_token_height: row
            .get::<Option<i64>, _>("validate_token_height")
            .map(|h| h as u64),
        main_chain_index_height: row
            .get::<Option<i64>, _>("main_chain_index_height")
            .map(|h| h as u64),
        cross_chain_create_token_tx_id: row.get("cross_chain_create_token_tx_id"),
        message: row.get("message"),
        create_time: row.get("create_time"),
        update_time: row.get("update_time"),
    })
}

const INVOKE_COLUMNS: &str = "id, chain_id, contract_address, contract_method, biz_type, param, \
     sender, transaction_id, status, retry_count, message, block_height, create_time, update_time";

const SYNC_COLUMNS: &str = "id, symbol, status, validate_token_tx, validate_token_tx_id, \
     validate_token_height, main_chain_index_height, cross_chain_create_token_tx_id, message, \
     create_time, update_time";

#[async_trait]
impl WorkflowStore for StateManager {
    async fn get_invoke(&self, id: &str) -> RelayerResult<Option<ContractInvokeRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM contract_invoke_workflows WHERE id = $1",
            INVOKE_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(invoke_from_row).transpose()
    }

    async fn insert_invoke(&self, record: &ContractInvokeRecord) -> RelayerResult<bool> {
        let result = sqlx::query(&format!(
            r#"
            INSERT INTO contract_invoke_workflows ({})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (id) DO NOTHING
            "#,
            INVOKE_COLUMNS
        ))
        .bind(&record.id)
        .bind(&record.chain_id)
        .bind(&record.contract_address)
        .bind(&record.contract_method)
        .bind(&record.biz_type)
        .bind(&record.param)
        .bind(&record.sender)
        .bind(&record.transaction_id)
        .bind(record.status.as_str())
        .bind(record.retry_count as i32)
        .bind(&record.message)
        .bind(record.block_height.map(|h| h as i64))
        .bind(record.create_time)
        .bind(record.update_time)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn put_invoke(&self, record: &ContractInvokeRecord) -> RelayerResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE contract_invoke_workflows
            SET sender = $2, transaction_id = $3, status = $4, retry_count = $5,
                message = $6, block_height = $7, update_time = $8
            WHERE id = $1
            "#,
        )
        .bind(&record.id)
        .bind(&record.sender)
        .bind(&record.transaction_id)
        .bind(record.status.as_str())
        .bind(record.retry_count as i32)
        .bind(&record.message)
        .bind(record.block_height.map(|h| h as i64))
        .bind(record.update_time)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RelayerError::WorkflowNotFound {
                id: record.id.clone(),
            });
        }
        Ok(())
    }

    async fn unfinished_invoke_ids(
        &self,
        max_retry_count: Option<u32>,
    ) -> RelayerResult<Vec<String>> {
        let rows = sqlx::query(
            r#"
            SELECT id FROM contract_invoke_workflows
            WHERE status <> 'Success'
              AND NOT (status = 'Failed' AND $1::INTEGER IS NOT NULL AND retry_count >= $1)
            ORDER BY create_time
            "#,
        )
        .bind(max_retry_count.map(|m| m as i32))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.get("id")).collect())
    }

    async fn get_sync(&self, id: &str) -> RelayerResult<Option<SyncRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM token_sync_workflows WHERE id = $1",
            SYNC_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(sync_from_row).transpose()
    }

    async fn insert_sync(&self, record: &SyncRecord) -> RelayerResult<bool> {
        let result = sqlx::query(&format!(
            r#"
            INSERT INTO token_sync_workflows ({})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (id) DO NOTHING
            "#,
            SYNC_COLUMNS
        ))
        .bind(&record.id)
        .bind(&record.symbol)
        .bind(record.status.as_str())
        .bind(&record.validate_token_tx)
        .bind(&record.validate_token_tx_id)
        .bind(record.validate_token_height.map(|h| h as i64))
        .bind(record.main_chain_index_height.map(|h| h as i64))
        .bind(&record.cross_chain_create_token_tx_id)
        .bind(&record.message)
        .bind(record.create_time)
        .bind(record.update_time)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn put_sync(&self, record: &SyncRecord) -> RelayerResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE token_sync_workflows
            SET symbol = $2, status = $3, validate_token_tx = $4, validate_token_tx_id = $5,
                validate_token_height = $6, main_chain_index_height = $7,
                cross_chain_create_token_tx_id = $8, message = $9, update_time = $10
            WHERE id = $1
            "#,
        )
        .bind(&record.id)
        .bind(&record.symbol)
        .bind(record.status.as_str())
        .bind(&record.validate_token_tx)
        .bind(&record.validate_token_tx_id)
        .bind(record.validate_token_height.map(|h| h as i64))
        .bind(record.main_chain_index_height.map(|h| h as i64))
        .bind(&record.cross_chain_create_token_tx_id)
        .bind(&record.message)
        .bind(record.update_time)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RelayerError::WorkflowNotFound {
                id: record.id.clone(),
            });
        }
        Ok(())
    }

    async fn add_pending_syncs(&self, ids: &[String]) -> RelayerResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        sqlx::query(
            r#"
            INSERT INTO pending_token_syncs (id)
            SELECT UNNEST($1::TEXT[])
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(ids.to_vec())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn pending_sync_ids(&self) -> RelayerResult<Vec<String>> {
        let rows = sqlx::query("SELECT id FROM pending_token_syncs ORDER BY added_at")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|r| r.get("id")).collect())
    }

    async fn remove_pending_syncs(&self, ids: &[String]) -> RelayerResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        sqlx::query("DELETE FROM pending_token_syncs WHERE id = ANY($1)")
            .bind(ids.to_vec())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_checkpoint(&self, name: &str) -> RelayerResult<Option<u64>> {
        let row = sqlx::query("SELECT block_number FROM chain_checkpoints WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| r.get::<i64, _>("block_number") as u64))
    }

    async fn save_checkpoint(&self, name: &str, height: u64) -> RelayerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO chain_checkpoints (name, block_number, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (name)
            DO UPDATE SET block_number = $2, updated_at = NOW()
            "#,
        )
        .bind(name)
        .bind(height as i64)
        .execute(&self.pool)
        .await?;

        debug!("Saved checkpoint {}: block {}", name, height);
        Ok(())
    }

    async fn try_acquire_lease(
        &self,
        name: &str,
        holder: &str,
        ttl: Duration,
        run_token: &str,
    ) -> RelayerResult<Option<String>> {
        // Takeovers keep the run token of the first acquisition
        let row = sqlx::query(
            r#"
            INSERT INTO job_leases (name, holder, run_token, expires_at)
            VALUES ($1, $2, $4, NOW() + make_interval(secs => $3))
            ON CONFLICT (name) DO UPDATE
            SET holder = EXCLUDED.holder, expires_at = EXCLUDED.expires_at
            WHERE job_leases.completed_at IS NULL
              AND (job_leases.holder = EXCLUDED.holder OR job_leases.expires_at <= NOW())
            RETURNING run_token
            "#,
        )
        .bind(name)
        .bind(holder)
        .bind(ttl.as_secs_f64())
        .bind(run_token)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.get("run_token")))
    }

    async fn release_lease(&self, name: &str, holder: &str, completed: bool) -> RelayerResult<()> {
        sqlx::query(
            r#"
            UPDATE job_leases
            SET expires_at = NOW(),
                completed_at = CASE WHEN $3 THEN NOW() ELSE NULL END
            WHERE name = $1 AND holder = $2
            "#,
        )
        .bind(name)
        .bind(holder)
        .bind(completed)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn invoke_status_counts(&self) -> RelayerResult<Vec<(InvokeStatus, u64)>> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS count FROM contract_invoke_workflows GROUP BY status",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let status: String = row.get("status");
                Ok((status.parse()?, row.get::<i64, _>("count") as u64))
            })
            .collect()
    }

    async fn sync_status_counts(&self) -> RelayerResult<Vec<(SyncStatus, u64)>> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS count FROM token_sync_workflows GROUP BY status",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let status: String = row.get("status");
                Ok((status.parse()?, row.get::<i64, _>("count") as u64))
            })
            .collect()
    }

    /// Health check
    async fn health_check(&self) -> RelayerResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl SettlementSource for StateManager {
    async fn fetch_page(
        &self,
        chain_id: &str,
        biz_date: NaiveDate,
        skip: usize,
        limit: usize,
    ) -> RelayerResult<Vec<PointDelta>> {
        let rows = sqlx::query(
            r#"
            SELECT address, point_name, amount
            FROM point_daily_records
            WHERE chain_id = $1 AND biz_date = $2
            ORDER BY id
            OFFSET $3 LIMIT $4
            "#,
        )
        .bind(chain_id)
        .bind(biz_date)
        .bind(skip as i64)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| PointDelta {
                address: row.get("address"),
                point_name: row.get("point_name"),
                amount: row.get("amount"),
            })
            .collect())
    }
}
