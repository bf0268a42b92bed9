//! Queue worker.
//!
//! Each worker pops one item at a time, resolves its context and runs the
//! analysis pipeline on a connection it keeps across items. A connection
//! that breaks is closed and replaced on the next item. Per-item failures
//! are logged and the item dropped; the loop itself only stops on shutdown.

use std::sync::Arc;
use std::time::Duration;

use apiscope_core::models::QueuedTrace;
use apiscope_core::ApiscopeError;
use sqlx::pool::PoolConnection;
use sqlx::Postgres;
use tokio::sync::broadcast;

use super::pipeline::{self, Disposition};
use crate::engine::Engine;
use crate::queue::WorkQueue;

pub struct Worker {
    id: usize,
    engine: Arc<Engine>,
    queue: Arc<dyn WorkQueue>,
    conn: Option<PoolConnection<Postgres>>,
}

impl Worker {
    pub fn new(id: usize, engine: Arc<Engine>, queue: Arc<dyn WorkQueue>) -> Self {
        Self {
            id,
            engine,
            queue,
            conn: None,
        }
    }

    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        let idle = Duration::from_millis(self.engine.config.worker.idle_sleep_ms);
        tracing::info!(worker = self.id, "Worker started");

        loop {
            match shutdown.try_recv() {
                Err(broadcast::error::TryRecvError::Empty) => {}
                _ => break,
            }

            let item = match self.queue.pop().await {
                Ok(item) => item,
                Err(e) => {
                    tracing::warn!(worker = self.id, error = %e, "Queue pop failed");
                    None
                }
            };

            match item {
                Some(item) => {
                    if let Err(e) = self.process_one(item).await {
                        tracing::error!(worker = self.id, error = %e, "Trace processing failed");
                    }
                }
                None => {
                    tokio::select! {
                        _ = tokio::time::sleep(idle) => {}
                        _ = shutdown.recv() => break,
                    }
                }
            }
        }

        tracing::info!(worker = self.id, "Worker shutting down");
    }

    /// Analyze one queued item.
    pub async fn process_one(&mut self, item: QueuedTrace) -> Result<Disposition, ApiscopeError> {
        let ctx = self.engine.context(&item.ctx)?;
        let mut conn = match self.conn.take() {
            Some(conn) => conn,
            None => self.engine.pool.acquire().await?,
        };

        let result = pipeline::process_trace(&self.engine, &mut conn, &ctx, item.trace).await;
        match &result {
            Err(e) if e.is_connection_lost() => {
                tracing::warn!(worker = self.id, error = %e, "Connection lost, replacing");
                conn.close_on_drop();
            }
            _ => self.conn = Some(conn),
        }
        result
    }
}

/// Spawn `worker.concurrency` workers.
pub fn spawn_workers(
    engine: Arc<Engine>,
    queue: Arc<dyn WorkQueue>,
    shutdown: &broadcast::Sender<()>,
) -> Vec<tokio::task::JoinHandle<()>> {
    let n = engine.config.worker.concurrency.max(1);
    tracing::info!(concurrency = n, "Spawning workers");
    (0..n)
        .map(|id| {
            let worker = Worker::new(id, Arc::clone(&engine), Arc::clone(&queue));
            tokio::spawn(worker.run(shutdown.subscribe()))
        })
        .collect()
}
