use std::time::Duration;

use futures::{Stream, StreamExt};
use kasho_position::Position;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::warn;

use crate::error::BufferError;

const DEFAULT_TTL: Duration = Duration::from_secs(24 * 3600);

/// Redis-backed ordered log: a sorted set of serialized changes keyed by
/// position score (`pg:changes`), with pub/sub fan-out on the same name and
/// plain key/value state persistence for the bootstrap coordinator.
pub struct BufferClient {
    client: redis::Client,
    manager: ConnectionManager,
    changes_key: String,
    changes_channel: String,
    ttl: Duration,
}

impl BufferClient {
    pub async fn connect(url: &str) -> Result<Self, BufferError> {
        Self::connect_with_ttl(url, DEFAULT_TTL).await
    }

    pub async fn connect_with_ttl(url: &str, ttl: Duration) -> Result<Self, BufferError> {
        let client = redis::Client::open(url)?;
        let manager = client.get_connection_manager().await?;
        Ok(Self {
            client,
            manager,
            changes_key: "pg:changes".to_string(),
            changes_channel: "pg:changes".to_string(),
            ttl,
        })
    }

    /// Inserts `payload` into the sorted set under `position`'s score
    /// (first write at a score wins), refreshes the set's TTL, and
    /// publishes the payload — issued as a single pipeline round trip.
    pub async fn add_change(&self, position: &Position, payload: &[u8]) -> Result<(), BufferError> {
        let score = position.checked_score()?;
        let mut conn = self.manager.clone();
        let _: () = redis::pipe()
            .atomic()
            .cmd("ZADD")
            .arg(&self.changes_key)
            .arg("NX")
            .arg(score)
            .arg(payload)
            .ignore()
            .cmd("EXPIRE")
            .arg(&self.changes_key)
            .arg(self.ttl.as_secs() as i64)
            .ignore()
            .cmd("PUBLISH")
            .arg(&self.changes_channel)
            .arg(payload)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    /// Up to `limit` serialized changes strictly after `after`'s score, in
    /// ascending order, skipping `offset` entries.
    pub async fn get_changes_after(
        &self,
        after: &Position,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Vec<u8>>, BufferError> {
        let score = after.checked_score()?;
        let min = format!("({score}");
        let mut conn = self.manager.clone();
        let values: Vec<Vec<u8>> = conn
            .zrangebyscore_limit(&self.changes_key, min, "+inf", offset as isize, limit as isize)
            .await?;
        Ok(values)
    }

    /// Newly-published changes in publication order, until dropped.
    pub async fn subscribe(&self) -> Result<impl Stream<Item = Vec<u8>>, BufferError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(&self.changes_channel).await?;
        Ok(async_stream::stream! {
            let mut messages = pubsub.into_on_message();
            while let Some(msg) = messages.next().await {
                match msg.get_payload::<Vec<u8>>() {
                    Ok(payload) => yield payload,
                    Err(err) => warn!(error = %err, "dropping malformed pub/sub payload"),
                }
            }
        })
    }

    pub async fn get_state(&self, key: &str) -> Result<Option<Vec<u8>>, BufferError> {
        let mut conn = self.manager.clone();
        let value: Option<Vec<u8>> = conn.get(key).await?;
        Ok(value)
    }

    pub async fn set_state(&self, key: &str, value: &[u8]) -> Result<(), BufferError> {
        let mut conn = self.manager.clone();
        let _: () = conn.set(key, value).await?;
        Ok(())
    }
}
