//! Steady-state replication: long-lived cooperating tasks handing work off
//! through the durable queue.
//!
//! - listeners buffer NOTIFY payloads and bulk-push them to the queue;
//! - the consumer pops batches, translates them and writes the sink;
//! - the compactor drains the slot up to the checkpoint to bound WAL
//!   retention;
//! - the status task reports counters.
//!
//! Cancellation is cooperative: every task checks the shared stop flag at
//! its poll boundary, flushes what it holds and exits.

use anyhow::{Context, Result};
use sqlx::postgres::PgListener;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error, info, warn};

use super::{Sync, chunk_runs, insert_fast_path};
use crate::sync::event::ChangeEvent;

/// Run the full pipeline for one document until the stop flag is set or a
/// fatal error occurs: listeners first, then the one-shot pull, then the
/// consumer, compactor and status tasks.
pub async fn run(sync: Arc<Sync>, stop: Arc<AtomicBool>) -> Result<()> {
    let mut handles = Vec::new();
    for worker in 0..sync.settings.nthreads_polldb.max(1) {
        handles.push(tokio::spawn(supervised(
            format!("listener-{worker}"),
            listener(sync.clone(), stop.clone()),
            stop.clone(),
        )));
    }

    // catch up before consuming the steady-state stream
    if let Err(error) = sync.pull().await {
        stop.store(true, Ordering::Relaxed);
        for handle in handles {
            let _ = handle.await;
        }
        return Err(error);
    }

    handles.push(tokio::spawn(supervised(
        "consumer".to_string(),
        consumer(sync.clone(), stop.clone()),
        stop.clone(),
    )));
    handles.push(tokio::spawn(supervised(
        "compactor".to_string(),
        compactor(sync.clone(), stop.clone()),
        stop.clone(),
    )));
    handles.push(tokio::spawn(supervised(
        "status".to_string(),
        status(sync.clone(), stop.clone()),
        stop.clone(),
    )));

    let mut first_error = None;
    for handle in handles {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => {
                if first_error.is_none() {
                    first_error = Some(error);
                }
            }
            Err(join_error) => {
                if first_error.is_none() {
                    first_error = Some(join_error.into());
                }
            }
        }
    }

    info!(
        index = %sync.index,
        xlog = sync.counters.xlog.load(Ordering::Relaxed),
        db = sync.counters.db.load(Ordering::Relaxed),
        queue = sync.counters.queue.load(Ordering::Relaxed),
        docs = sync.search.doc_count(),
        "pipeline stopped"
    );

    match first_error {
        Some(error) => Err(error),
        None => Ok(()),
    }
}

/// A task failure stops the whole pipeline rather than limping along.
async fn supervised(
    name: String,
    task: impl Future<Output = Result<()>> + Send + 'static,
    stop: Arc<AtomicBool>,
) -> Result<()> {
    match task.await {
        Ok(()) => Ok(()),
        Err(err) => {
            error!(task = %name, error = %format!("{err:#}"), "task failed");
            stop.store(true, Ordering::Relaxed);
            Err(err)
        }
    }
}

/// Producer: LISTEN on the database-name channel, parse each notification
/// and bulk-push to the queue in chunks; flush partial buffers on poll
/// timeout.
async fn listener(sync: Arc<Sync>, stop: Arc<AtomicBool>) -> Result<()> {
    let url = sync.settings.postgres.url(&sync.database);
    let mut pg_listener = PgListener::connect(&url)
        .await
        .context("failed to open listener connection")?;
    pg_listener.listen(&sync.database).await?;
    debug!(channel = %sync.database, "listening for notifications");

    let mut queue = sync.queue().await?;
    let mut buffer: Vec<ChangeEvent> = Vec::new();

    loop {
        if stop.load(Ordering::Relaxed) {
            queue.bulk_push(&buffer).await?;
            break;
        }

        match tokio::time::timeout(sync.settings.poll_timeout, pg_listener.recv()).await {
            Ok(Ok(notification)) => {
                let event: ChangeEvent = match serde_json::from_str(notification.payload()) {
                    Ok(event) => event,
                    Err(error) => {
                        warn!(%error, payload = notification.payload(), "dropping malformed notification");
                        continue;
                    }
                };
                // other indices sharing this database see their own events
                if !event.indices.is_empty() && !event.indices.contains(&sync.index) {
                    continue;
                }
                sync.counters.db.fetch_add(1, Ordering::Relaxed);
                buffer.push(event);
                if buffer.len() >= sync.settings.redis.write_chunk_size {
                    queue.bulk_push(&buffer).await?;
                    buffer.clear();
                }
            }
            Ok(Err(error)) => return Err(error).context("listener connection lost"),
            Err(_) => {
                // poll timeout: hand over whatever accumulated
                if !buffer.is_empty() {
                    queue.bulk_push(&buffer).await?;
                    buffer.clear();
                }
            }
        }
    }
    Ok(())
}

/// Consumer: pop batches in arrival order, translate homogeneous runs and
/// advance the checkpoint after each successful flush.
async fn consumer(sync: Arc<Sync>, stop: Arc<AtomicBool>) -> Result<()> {
    let mut queue = sync.queue().await?;

    loop {
        let events = queue.bulk_pop().await?;
        if events.is_empty() {
            if stop.load(Ordering::Relaxed) {
                break;
            }
            tokio::time::sleep(sync.settings.redis.poll_interval).await;
            continue;
        }
        sync.counters.queue.fetch_add(events.len() as u64, Ordering::Relaxed);

        match insert_fast_path(&events) {
            // pure-INSERT batches regroup by table; order across tables
            // does not matter for inserts
            Some(groups) => {
                for group in groups {
                    sync.on_batch(&group).await?;
                }
            }
            None => {
                for run in chunk_runs(&events) {
                    sync.on_batch(run).await?;
                }
            }
        }

        sync.advance_checkpoint(&events).await?;

        if stop.load(Ordering::Relaxed) {
            // let the drained batch finish but start no new one
            break;
        }
    }
    Ok(())
}

/// Periodically drain the slot destructively up to the checkpoint so the
/// server does not retain WAL forever.
async fn compactor(sync: Arc<Sync>, stop: Arc<AtomicBool>) -> Result<()> {
    loop {
        if stop.load(Ordering::Relaxed) {
            break;
        }
        if sync.pulled.load(Ordering::Relaxed) {
            let checkpoint = sync.checkpoint.lock().await.get();
            if let Some(checkpoint) = checkpoint {
                let drained = crate::db::slot::consume_slot(
                    &sync.pool,
                    &sync.name,
                    None,
                    Some(checkpoint + 1),
                    None,
                )
                .await?;
                if drained > 0 {
                    debug!(drained, checkpoint, "truncated replication slot");
                }
            }
        }
        tokio::time::sleep(sync.settings.slot_cleanup_interval).await;
    }
    Ok(())
}

/// Emit periodic throughput counters.
async fn status(sync: Arc<Sync>, stop: Arc<AtomicBool>) -> Result<()> {
    let mut queue = sync.queue().await?;
    loop {
        if stop.load(Ordering::Relaxed) {
            break;
        }
        let pending = queue.len().await.unwrap_or(0);
        info!(
            database = %sync.database,
            xlog = sync.counters.xlog.load(Ordering::Relaxed),
            db = sync.counters.db.load(Ordering::Relaxed),
            queue = sync.counters.queue.load(Ordering::Relaxed),
            pending,
            docs = sync.search.doc_count(),
            "syncing"
        );
        tokio::time::sleep(sync.settings.log_interval).await;
    }
    Ok(())
}
