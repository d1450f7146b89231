//! Queue and registry client for the shared Redis store.
//!
//! The queue is one list the external autoscaler watches for depth; the
//! registry is one hash the worker side writes `job_id → address`
//! bindings into. Absence ("queue empty", "no binding yet") is a value
//! here, never an error: [`StoreError`] carries connectivity failures
//! only, so callers can tell "not ready yet" apart from "store is down".

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use thiserror::Error;
use tracing::debug;

/// Connectivity failure against the shared store.
#[derive(Error, Debug)]
#[error("store operation {op} failed: {source}")]
pub struct StoreError {
    /// The store operation that failed.
    pub op: &'static str,
    #[source]
    pub source: redis::RedisError,
}

impl StoreError {
    fn wrap(op: &'static str) -> impl FnOnce(redis::RedisError) -> Self {
        move |source| Self { op, source }
    }
}

/// Operations the coordinator needs from the shared queue and registry.
///
/// The registry invariant (at most one live binding per job id, written
/// once by the worker side) is the writer's obligation; [`binding`]
/// returns whatever single value the store holds.
///
/// [`binding`]: JobStore::binding
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Push a job token onto the queue.
    async fn enqueue(&self, job_id: &str) -> Result<(), StoreError>;

    /// Remove a specific token from the queue. Returns whether the token
    /// was still present (it will not be once a worker consumed it).
    async fn remove(&self, job_id: &str) -> Result<bool, StoreError>;

    /// Queue depth. The autoscaler consumes this server-side; the
    /// coordinator only surfaces it for operators.
    async fn pending(&self) -> Result<usize, StoreError>;

    /// Point-read of the registry binding for a job id.
    async fn binding(&self, job_id: &str) -> Result<Option<String>, StoreError>;

    /// Delete the registry binding for a job id. Deleting an absent
    /// binding is a no-op; the return value reports whether an entry
    /// existed.
    async fn clear_binding(&self, job_id: &str) -> Result<bool, StoreError>;

    /// All live bindings, for operator inspection.
    async fn bindings(&self) -> Result<Vec<(String, String)>, StoreError>;
}

/// [`JobStore`] backed by a multiplexed Redis connection.
#[derive(Clone)]
pub struct RedisJobStore {
    conn: ConnectionManager,
    queue_key: String,
    registry_key: String,
}

impl RedisJobStore {
    /// Connect to the store and verify it answers a PING.
    pub async fn connect(
        url: &str,
        queue_key: impl Into<String>,
        registry_key: impl Into<String>,
    ) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(StoreError::wrap("connect"))?;
        let mut conn = client
            .get_connection_manager()
            .await
            .map_err(StoreError::wrap("connect"))?;

        let _: () = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(StoreError::wrap("ping"))?;
        debug!(url = %url, "connected to shared store");

        Ok(Self {
            conn,
            queue_key: queue_key.into(),
            registry_key: registry_key.into(),
        })
    }
}

#[async_trait]
impl JobStore for RedisJobStore {
    async fn enqueue(&self, job_id: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.lpush::<_, _, ()>(&self.queue_key, job_id)
            .await
            .map_err(StoreError::wrap("lpush"))
    }

    async fn remove(&self, job_id: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn
            .lrem(&self.queue_key, 0, job_id)
            .await
            .map_err(StoreError::wrap("lrem"))?;
        Ok(removed > 0)
    }

    async fn pending(&self) -> Result<usize, StoreError> {
        let mut conn = self.conn.clone();
        let len: usize = conn
            .llen(&self.queue_key)
            .await
            .map_err(StoreError::wrap("llen"))?;
        Ok(len)
    }

    async fn binding(&self, job_id: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        conn.hget(&self.registry_key, job_id)
            .await
            .map_err(StoreError::wrap("hget"))
    }

    async fn clear_binding(&self, job_id: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn
            .hdel(&self.registry_key, job_id)
            .await
            .map_err(StoreError::wrap("hdel"))?;
        Ok(removed > 0)
    }

    async fn bindings(&self) -> Result<Vec<(String, String)>, StoreError> {
        let mut conn = self.conn.clone();
        conn.hgetall(&self.registry_key)
            .await
            .map_err(StoreError::wrap("hgetall"))
    }
}
