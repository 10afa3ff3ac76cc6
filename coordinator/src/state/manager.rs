//! PostgreSQL swap store

use super::SwapStore;
use crate::config::DatabaseConfig;
use crate::error::{SwapError, SwapResult};
use crate::escrow::Secret;
use crate::swap::{SwapId, SwapInstance, SwapStatus};

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use tracing::{debug, info};

/// Swap store backed by PostgreSQL
pub struct PgSwapStore {
    pool: PgPool,
}

impl PgSwapStore {
    /// Connect to the configured database
    pub async fn new(config: &DatabaseConfig) -> SwapResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await?;

        Ok(Self { pool })
    }

    /// Create tables if they do not exist
    pub async fn run_migrations(&self) -> SwapResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chain_checkpoints (
                chain_id BIGINT PRIMARY KEY,
                block_number BIGINT NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS swaps (
                swap_id UUID PRIMARY KEY,
                trade_id TEXT NOT NULL,
                role VARCHAR(20) NOT NULL,
                status VARCHAR(20) NOT NULL,
                secret_hash BYTEA NOT NULL,
                side_a_state VARCHAR(20) NOT NULL,
                side_b_state VARCHAR(20) NOT NULL,
                side_a_expiry BIGINT NOT NULL,
                side_b_expiry BIGINT NOT NULL,
                record JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_swaps_status
            ON swaps (status)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS swap_preimages (
                swap_id UUID PRIMARY KEY,
                secret BYTEA NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Database migrations complete");
        Ok(())
    }

    fn decode(record: serde_json::Value) -> SwapResult<SwapInstance> {
        serde_json::from_value(record)
            .map_err(|e| SwapError::Internal(format!("corrupt swap record: {}", e)))
    }
}

#[async_trait]
impl SwapStore for PgSwapStore {
    async fn save_swap(&self, swap: &SwapInstance) -> SwapResult<()> {
        let record = serde_json::to_value(swap).map_err(|e| SwapError::Internal(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO swaps
                (swap_id, trade_id, role, status, secret_hash, side_a_state, side_b_state,
                 side_a_expiry, side_b_expiry, record, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (swap_id)
            DO UPDATE SET status = $4, side_a_state = $6, side_b_state = $7,
                          record = $10, updated_at = $12
            "#,
        )
        .bind(swap.swap_id)
        .bind(&swap.trade_id)
        .bind(swap.role.as_str())
        .bind(swap.status.as_str())
        .bind(&swap.secret_hash.as_bytes()[..])
        .bind(swap.side_a.lock_state().as_str())
        .bind(swap.side_b.lock_state().as_str())
        .bind(swap.side_a.expiry as i64)
        .bind(swap.side_b.expiry as i64)
        .bind(record)
        .bind(swap.created_at)
        .bind(swap.updated_at)
        .execute(&self.pool)
        .await?;

        debug!("Saved swap {} ({})", swap.swap_id, swap.status);
        Ok(())
    }

    async fn load_swap(&self, swap_id: SwapId) -> SwapResult<Option<SwapInstance>> {
        let row = sqlx::query("SELECT record FROM swaps WHERE swap_id = $1")
            .bind(swap_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| Self::decode(r.get("record"))).transpose()
    }

    async fn load_active(&self) -> SwapResult<Vec<SwapInstance>> {
        let terminal: Vec<&str> = SwapStatus::ALL
            .iter()
            .filter(|s| s.is_terminal())
            .map(|s| s.as_str())
            .collect();

        let rows = sqlx::query(
            r#"
            SELECT record FROM swaps
            WHERE status <> ALL($1)
            ORDER BY created_at
            "#,
        )
        .bind(terminal)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|r| Self::decode(r.get("record")))
            .collect()
    }

    async fn delete_swap(&self, swap_id: SwapId) -> SwapResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM swap_preimages WHERE swap_id = $1")
            .bind(swap_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM swaps WHERE swap_id = $1")
            .bind(swap_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn save_preimage(&self, swap_id: SwapId, secret: &Secret) -> SwapResult<()> {
        sqlx::query(
            r#"
            INSERT INTO swap_preimages (swap_id, secret)
            VALUES ($1, $2)
            ON CONFLICT (swap_id) DO NOTHING
            "#,
        )
        .bind(swap_id)
        .bind(&secret.as_bytes()[..])
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_preimage(&self, swap_id: SwapId) -> SwapResult<Option<Secret>> {
        let row = sqlx::query("SELECT secret FROM swap_preimages WHERE swap_id = $1")
            .bind(swap_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| {
            let bytes: Vec<u8> = r.get("secret");
            let bytes: [u8; 32] = bytes
                .try_into()
                .map_err(|_| SwapError::Internal(format!("corrupt pre-image for swap {}", swap_id)))?;
            Ok(Secret::from_bytes(bytes))
        })
        .transpose()
    }

    async fn save_checkpoint(&self, chain_id: u64, block_number: u64) -> SwapResult<()> {
        sqlx::query(
            r#"
            INSERT INTO chain_checkpoints (chain_id, block_number, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (chain_id)
            DO UPDATE SET block_number = $2, updated_at = NOW()
            "#,
        )
        .bind(chain_id as i64)
        .bind(block_number as i64)
        .execute(&self.pool)
        .await?;

        debug!("Saved checkpoint for chain {}: block {}", chain_id, block_number);
        Ok(())
    }

    async fn get_checkpoint(&self, chain_id: u64) -> SwapResult<Option<u64>> {
        let row = sqlx::query("SELECT block_number FROM chain_checkpoints WHERE chain_id = $1")
            .bind(chain_id as i64)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| r.get::<i64, _>("block_number") as u64))
    }

    async fn health_check(&self) -> SwapResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
