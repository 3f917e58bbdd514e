//! Durable change-event queue, one per `(database, index)` pair, living in
//! Redis under `queue:{database}_{index}`. The listener bulk-pushes parsed
//! notifications; the consumer bulk-pops them in arrival order. Push and
//! pop are pipelined atomically so concurrent producers cannot interleave
//! half a batch.

use anyhow::{Context, Result};
use redis::AsyncCommands;
use tracing::debug;

use crate::sync::event::ChangeEvent;

pub struct EventQueue {
    conn: redis::aio::MultiplexedConnection,
    key: String,
    read_chunk_size: usize,
}

impl EventQueue {
    pub async fn connect(url: &str, name: &str, read_chunk_size: usize) -> Result<Self> {
        let client = redis::Client::open(url).context("invalid redis url")?;
        let mut conn = client
            .get_multiplexed_async_connection()
            .await
            .context("redis server is not reachable")?;
        redis::cmd("PING").query_async::<_, ()>(&mut conn).await?;
        Ok(Self {
            conn,
            key: format!("queue:{name}"),
            read_chunk_size,
        })
    }

    /// Approximate queue depth.
    pub async fn len(&mut self) -> Result<usize> {
        let len: usize = self.conn.llen(&self.key).await?;
        Ok(len)
    }

    pub async fn is_empty(&mut self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    /// Append a batch of events in order.
    pub async fn bulk_push(&mut self, events: &[ChangeEvent]) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        let items = events
            .iter()
            .map(serde_json::to_string)
            .collect::<Result<Vec<_>, _>>()?;
        self.conn.rpush::<_, _, ()>(&self.key, items).await?;
        debug!(pushed = events.len(), key = %self.key, "bulk_push");
        Ok(())
    }

    /// Pop up to `read_chunk_size` events, oldest first.
    pub async fn bulk_pop(&mut self) -> Result<Vec<ChangeEvent>> {
        let (items,): (Vec<String>,) = redis::pipe()
            .atomic()
            .lrange(&self.key, 0, self.read_chunk_size as isize - 1)
            .ltrim(&self.key, self.read_chunk_size as isize, -1)
            .ignore()
            .query_async(&mut self.conn)
            .await?;
        if !items.is_empty() {
            debug!(popped = items.len(), key = %self.key, "bulk_pop");
        }
        items
            .iter()
            .map(|item| serde_json::from_str(item).context("malformed queue item"))
            .collect()
    }

    /// Drop the queue and its contents; teardown only.
    pub async fn delete(&mut self) -> Result<()> {
        self.conn.del::<_, ()>(&self.key).await?;
        Ok(())
    }
}
