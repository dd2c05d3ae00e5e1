use super::{ClosedPositionRecord, ExecutorRecord, Recorder, RecorderError};
use crate::orchestrator::HeldSnapshot;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use tokio::time::{timeout, Duration};

/// Redis recorder
///
/// Layout under `{namespace}`:
/// - `{ns}:executors` hash of executor id -> record JSON
/// - `{ns}:executors:pending` set of ids not stored yet
/// - `{ns}:closed_positions` sorted set of record JSON scored by close time
/// - `{ns}:held_positions` JSON of the current held book snapshot
pub struct RedisRecorder {
    conn: ConnectionManager,
    namespace: String,
}

impl RedisRecorder {
    /// Connect to Redis
    ///
    /// # Arguments
    /// * `redis_url` - Redis connection URL (e.g., "redis://127.0.0.1:6379")
    /// * `namespace` - Key prefix, lets several bots share one instance
    pub async fn new(redis_url: &str, namespace: &str) -> Result<Self, RecorderError> {
        let client = Client::open(redis_url).map_err(|e| RecorderError::Connection(e.to_string()))?;

        let conn = timeout(Duration::from_secs(5), ConnectionManager::new(client))
            .await
            .map_err(|_| RecorderError::Connection("Redis connection timeout after 5 seconds".to_string()))?
            .map_err(|e| RecorderError::Connection(e.to_string()))?;

        tracing::info!(namespace = %namespace, "Connected to Redis at {}", redis_url);

        Ok(Self {
            conn,
            namespace: namespace.to_string(),
        })
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}:{}", self.namespace, suffix)
    }
}

#[async_trait]
impl Recorder for RedisRecorder {
    async fn save_executor(&self, record: &ExecutorRecord) -> Result<(), RecorderError> {
        let mut conn = self.conn.clone();
        let value = serde_json::to_string(record)?;
        let id = record.executor_id.to_string();

        let mut pipe = redis::pipe();
        pipe.atomic().hset(self.key("executors"), &id, value).ignore();
        if record.is_pending() {
            pipe.sadd(self.key("executors:pending"), &id).ignore();
        } else {
            pipe.srem(self.key("executors:pending"), &id).ignore();
        }
        let _: () = pipe.query_async(&mut conn).await?;

        tracing::debug!(
            executor_id = %record.executor_id,
            status = %record.status,
            "Saved executor record to Redis"
        );
        Ok(())
    }

    async fn load_pending_executors(&self) -> Result<Vec<ExecutorRecord>, RecorderError> {
        let mut conn = self.conn.clone();
        let mut ids: Vec<String> = conn.smembers(self.key("executors:pending")).await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        ids.sort();

        let values: Vec<Option<String>> = conn.hget(self.key("executors"), &ids).await?;
        let mut records = Vec::with_capacity(values.len());
        for value in values.into_iter().flatten() {
            let record: ExecutorRecord = serde_json::from_str(&value)?;
            if record.is_pending() {
                records.push(record);
            }
        }

        tracing::info!("Loaded {} pending executor records from Redis", records.len());
        Ok(records)
    }

    async fn save_closed_position(&self, record: &ClosedPositionRecord) -> Result<(), RecorderError> {
        let mut conn = self.conn.clone();
        let value = serde_json::to_string(record)?;
        let score = record
            .closed_at
            .unwrap_or(record.opened_at)
            .timestamp_millis() as f64;

        conn.zadd::<_, _, _, ()>(self.key("closed_positions"), value, score)
            .await?;
        Ok(())
    }

    async fn load_closed_positions(&self) -> Result<Vec<ClosedPositionRecord>, RecorderError> {
        let mut conn = self.conn.clone();
        let values: Vec<String> = conn.zrange(self.key("closed_positions"), 0, -1).await?;
        let records = values
            .iter()
            .map(|value| serde_json::from_str(value))
            .collect::<Result<Vec<ClosedPositionRecord>, _>>()?;

        tracing::info!("Loaded {} closed positions from Redis", records.len());
        Ok(records)
    }

    async fn save_held_positions(&self, snapshot: &HeldSnapshot) -> Result<(), RecorderError> {
        let mut conn = self.conn.clone();
        let value = serde_json::to_string(snapshot)?;
        conn.set::<_, _, ()>(self.key("held_positions"), value).await?;
        Ok(())
    }

    async fn load_held_positions(&self) -> Result<HeldSnapshot, RecorderError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(self.key("held_positions")).await?;
        match value {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Ok(HeldSnapshot::default()),
        }
    }
}
