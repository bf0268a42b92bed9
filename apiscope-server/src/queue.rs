//! Work queue of captured traces awaiting analysis.
//!
//! Items are JSON `{ "trace": ..., "ctx": ... }` documents. `pop` never
//! blocks: an empty queue returns `None` and the caller decides how long to
//! idle.

use std::collections::VecDeque;

use apiscope_core::models::QueuedTrace;
use apiscope_core::ApiscopeError;
use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::PgPool;
use tokio::sync::Mutex;

#[async_trait]
pub trait WorkQueue: Send + Sync {
    async fn push(&self, item: &QueuedTrace) -> Result<(), ApiscopeError>;

    async fn pop(&self) -> Result<Option<QueuedTrace>, ApiscopeError>;

    async fn len(&self) -> Result<i64, ApiscopeError>;
}

/// `trace_queue` table in the public schema, shared by every tenant.
/// Concurrent poppers skip each other's locked rows.
pub struct PgQueue {
    pool: PgPool,
}

impl PgQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WorkQueue for PgQueue {
    async fn push(&self, item: &QueuedTrace) -> Result<(), ApiscopeError> {
        let payload = serde_json::to_value(item)?;
        sqlx::query("INSERT INTO public.trace_queue (payload) VALUES ($1)")
            .bind(Json(payload))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn pop(&self) -> Result<Option<QueuedTrace>, ApiscopeError> {
        let payload: Option<Json<serde_json::Value>> = sqlx::query_scalar(
            r#"
            DELETE FROM public.trace_queue
            WHERE id = (
                SELECT id FROM public.trace_queue
                ORDER BY id
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING payload
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;

        // A payload that does not decode is dropped with the row.
        match payload {
            Some(Json(value)) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    async fn len(&self) -> Result<i64, ApiscopeError> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM public.trace_queue")
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }
}

#[derive(Default)]
pub struct MemoryQueue {
    items: Mutex<VecDeque<QueuedTrace>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkQueue for MemoryQueue {
    async fn push(&self, item: &QueuedTrace) -> Result<(), ApiscopeError> {
        self.items.lock().await.push_back(item.clone());
        Ok(())
    }

    async fn pop(&self) -> Result<Option<QueuedTrace>, ApiscopeError> {
        Ok(self.items.lock().await.pop_front())
    }

    async fn len(&self) -> Result<i64, ApiscopeError> {
        Ok(self.items.lock().await.len() as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use apiscope_core::models::Trace;
    use apiscope_core::RequestContext;

    #[tokio::test]
    async fn memory_queue_is_fifo() {
        let queue = MemoryQueue::new();
        assert!(queue.pop().await.unwrap().is_none());

        for path in ["/a", "/b"] {
            let item = QueuedTrace {
                trace: Trace::new("h", "GET", path, 200),
                ctx: RequestContext::default(),
            };
            queue.push(&item).await.unwrap();
        }
        assert_eq!(queue.len().await.unwrap(), 2);
        assert_eq!(queue.pop().await.unwrap().unwrap().trace.path, "/a");
        assert_eq!(queue.pop().await.unwrap().unwrap().trace.path, "/b");
        assert!(queue.pop().await.unwrap().is_none());
    }

    #[test]
    fn queued_items_decode_from_wire_json() {
        let raw = serde_json::json!({
            "trace": {
                "host": "api.test",
                "path": "/users/1",
                "method": "get",
                "responseStatus": 200,
                "requestParameters": [{ "name": "q", "value": "x" }],
                "sessionMeta": { "authenticationProvided": false }
            },
            "ctx": { "schema": "tenant_a" }
        });
        let item: QueuedTrace = serde_json::from_value(raw).unwrap();
        assert_eq!(item.trace.request_parameters.0.len(), 1);
        assert_eq!(item.ctx.schema.as_deref(), Some("tenant_a"));
        assert_eq!(item.trace.session_meta.authentication_provided, Some(false));
    }
}
