use super::{ClosedPositionRecord, ExecutorRecord, Recorder, RecorderError};
use crate::orchestrator::{HeldPosition, HeldSnapshot};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{de::DeserializeOwned, Serialize};
use sqlx::{postgres::PgPoolOptions, PgPool, Row};
use uuid::Uuid;

/// Postgres recorder, schema lives in `migrations/`
pub struct PostgresRecorder {
    pool: PgPool,
}

impl PostgresRecorder {
    /// Connect to Postgres and run pending migrations
    pub async fn new(database_url: &str) -> Result<Self, RecorderError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(std::time::Duration::from_secs(5))
            .connect(database_url)
            .await
            .map_err(|e| RecorderError::Connection(e.to_string()))?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        tracing::info!("Connected to Postgres");

        Ok(Self { pool })
    }
}

#[async_trait]
impl Recorder for PostgresRecorder {
    async fn save_executor(&self, record: &ExecutorRecord) -> Result<(), RecorderError> {
        sqlx::query(
            r#"
            INSERT INTO executor_records (
                executor_id, controller_id, instrument, status, revision, payload, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (executor_id) DO UPDATE SET
                status = EXCLUDED.status,
                revision = EXCLUDED.revision,
                payload = EXCLUDED.payload,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(record.executor_id)
        .bind(&record.controller_id)
        .bind(&record.instrument)
        .bind(record.status.as_str())
        .bind(record.revision as i64)
        .bind(&record.payload)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;

        tracing::debug!(
            executor_id = %record.executor_id,
            status = %record.status,
            "Saved executor record to Postgres"
        );
        Ok(())
    }

    async fn load_pending_executors(&self) -> Result<Vec<ExecutorRecord>, RecorderError> {
        let rows = sqlx::query(
            r#"
            SELECT executor_id, controller_id, instrument, status, revision, payload, updated_at
            FROM executor_records
            WHERE status <> 'TERMINATED'
            ORDER BY updated_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let status: String = row.try_get("status")?;
            let revision: i64 = row.try_get("revision")?;
            records.push(ExecutorRecord {
                executor_id: row.try_get::<Uuid, _>("executor_id")?,
                controller_id: row.try_get("controller_id")?,
                instrument: row.try_get("instrument")?,
                status: from_text(status)?,
                revision: revision.max(0) as u64,
                payload: row.try_get::<serde_json::Value, _>("payload")?,
                updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
            });
        }

        tracing::info!("Loaded {} pending executor records from Postgres", records.len());
        Ok(records)
    }

    async fn save_closed_position(&self, record: &ClosedPositionRecord) -> Result<(), RecorderError> {
        let close_type = record.close_type.as_ref().map(to_text).transpose()?;

        sqlx::query(
            r#"
            INSERT INTO closed_positions (
                executor_id, controller_id, instrument, side, close_type,
                filled_amount, entry_price, exit_price, realized_pnl, fees,
                volume_quote, opened_at, closed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (executor_id) DO NOTHING
            "#,
        )
        .bind(record.executor_id)
        .bind(&record.controller_id)
        .bind(&record.instrument)
        .bind(to_text(&record.side)?)
        .bind(close_type)
        .bind(record.filled_amount)
        .bind(record.entry_price)
        .bind(record.exit_price)
        .bind(record.realized_pnl)
        .bind(record.fees)
        .bind(record.volume_quote)
        .bind(record.opened_at)
        .bind(record.closed_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn load_closed_positions(&self) -> Result<Vec<ClosedPositionRecord>, RecorderError> {
        let rows = sqlx::query(
            r#"
            SELECT executor_id, controller_id, instrument, side, close_type,
                   filled_amount, entry_price, exit_price, realized_pnl, fees,
                   volume_quote, opened_at, closed_at
            FROM closed_positions
            ORDER BY closed_at ASC NULLS FIRST, opened_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let side: String = row.try_get("side")?;
            let close_type: Option<String> = row.try_get("close_type")?;
            records.push(ClosedPositionRecord {
                executor_id: row.try_get::<Uuid, _>("executor_id")?,
                controller_id: row.try_get("controller_id")?,
                instrument: row.try_get("instrument")?,
                side: from_text(side)?,
                close_type: close_type.map(from_text).transpose()?,
                filled_amount: row.try_get::<Decimal, _>("filled_amount")?,
                entry_price: row.try_get::<Option<Decimal>, _>("entry_price")?,
                exit_price: row.try_get::<Option<Decimal>, _>("exit_price")?,
                realized_pnl: row.try_get::<Decimal, _>("realized_pnl")?,
                fees: row.try_get::<Decimal, _>("fees")?,
                volume_quote: row.try_get::<Decimal, _>("volume_quote")?,
                opened_at: row.try_get::<DateTime<Utc>, _>("opened_at")?,
                closed_at: row.try_get::<Option<DateTime<Utc>>, _>("closed_at")?,
            });
        }

        tracing::info!("Loaded {} closed positions from Postgres", records.len());
        Ok(records)
    }

    async fn save_held_positions(&self, snapshot: &HeldSnapshot) -> Result<(), RecorderError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM held_positions")
            .execute(&mut *tx)
            .await?;

        for position in &snapshot.positions {
            sqlx::query(
                r#"
                INSERT INTO held_positions (
                    controller_id, instrument, side, amount, entry_price, fees, updated_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(&position.controller_id)
            .bind(&position.instrument)
            .bind(to_text(&position.side)?)
            .bind(position.amount)
            .bind(position.entry_price)
            .bind(position.fees)
            .bind(position.updated_at)
            .execute(&mut *tx)
            .await?;
        }

        for (controller_id, realized_pnl) in &snapshot.realized {
            sqlx::query(
                r#"
                INSERT INTO held_realized_pnl (controller_id, realized_pnl, updated_at)
                VALUES ($1, $2, NOW())
                ON CONFLICT (controller_id) DO UPDATE SET
                    realized_pnl = EXCLUDED.realized_pnl,
                    updated_at = EXCLUDED.updated_at
                "#,
            )
            .bind(controller_id)
            .bind(*realized_pnl)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn load_held_positions(&self) -> Result<HeldSnapshot, RecorderError> {
        let rows = sqlx::query(
            r#"
            SELECT controller_id, instrument, side, amount, entry_price, fees, updated_at
            FROM held_positions
            ORDER BY controller_id, instrument
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut snapshot = HeldSnapshot::default();
        for row in rows {
            let side: String = row.try_get("side")?;
            snapshot.positions.push(HeldPosition {
                controller_id: row.try_get("controller_id")?,
                instrument: row.try_get("instrument")?,
                side: from_text(side)?,
                amount: row.try_get::<Decimal, _>("amount")?,
                entry_price: row.try_get::<Decimal, _>("entry_price")?,
                fees: row.try_get::<Decimal, _>("fees")?,
                updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
            });
        }

        let rows = sqlx::query("SELECT controller_id, realized_pnl FROM held_realized_pnl")
            .fetch_all(&self.pool)
            .await?;
        for row in rows {
            snapshot.realized.insert(
                row.try_get("controller_id")?,
                row.try_get::<Decimal, _>("realized_pnl")?,
            );
        }

        tracing::info!("Loaded {} held positions from Postgres", snapshot.positions.len());
        Ok(snapshot)
    }
}

/// Enum to its serde name, for TEXT columns
fn to_text<T: Serialize>(value: &T) -> Result<String, RecorderError> {
    match serde_json::to_value(value)? {
        serde_json::Value::String(text) => Ok(text),
        other => Ok(other.to_string()),
    }
}

fn from_text<T: DeserializeOwned>(text: String) -> Result<T, RecorderError> {
    Ok(serde_json::from_value(serde_json::Value::String(text))?)
}
