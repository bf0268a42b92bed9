//! Endpoint persistence seam used by the resolver and the backfill job.
//!
//! - `PgEndpointStore` matches with Postgres' `~` operator and relies on the
//!   `(host, method, path)` unique constraint to arbitrate concurrent creates.
//! - `MemoryEndpointStore` gives the same guarantees in-process, for tests.

use std::sync::Mutex;

use apiscope_core::models::Endpoint;
use apiscope_core::{retry_transient, ApiscopeError, Context, PatternCache, RetryPolicy};
use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// Another writer already created `(host, method, path)`.
    Conflict,
}

#[async_trait]
pub trait EndpointStore: Send + Sync {
    /// Endpoint whose pattern matches `path`, fewest parameters first.
    async fn find_match(
        &self,
        ctx: &Context,
        host: &str,
        method: &str,
        path: &str,
    ) -> Result<Option<Endpoint>, ApiscopeError>;

    /// Endpoint with exactly this template.
    async fn find_exact(
        &self,
        ctx: &Context,
        host: &str,
        method: &str,
        template: &str,
    ) -> Result<Option<Endpoint>, ApiscopeError>;

    async fn find_by_id(&self, ctx: &Context, id: Uuid) -> Result<Option<Endpoint>, ApiscopeError>;

    async fn insert(&self, ctx: &Context, endpoint: &Endpoint) -> Result<InsertOutcome, ApiscopeError>;
}

/// Endpoint columns plus the linked spec's `is_auto_generated`, for a query
/// aliasing the endpoint table `e` and the spec table `s`.
pub const ENDPOINT_SELECT: &str = "e.id, e.host, e.method, e.path, e.path_regex, e.number_params, \
     e.first_detected, e.last_active, e.risk_score, e.openapi_spec_name, e.is_graphql, \
     e.is_authenticated_detected, s.is_auto_generated AS spec_auto_generated";

pub fn endpoint_from(ctx: &Context) -> String {
    format!(
        "{} e LEFT JOIN {} s ON e.openapi_spec_name = s.name",
        ctx.table("endpoint"),
        ctx.table("open_api_spec")
    )
}

pub struct PgEndpointStore {
    pool: PgPool,
    retry: RetryPolicy,
}

impl PgEndpointStore {
    pub fn new(pool: PgPool, retry: RetryPolicy) -> Self {
        Self { pool, retry }
    }
}

#[async_trait]
impl EndpointStore for PgEndpointStore {
    async fn find_match(
        &self,
        ctx: &Context,
        host: &str,
        method: &str,
        path: &str,
    ) -> Result<Option<Endpoint>, ApiscopeError> {
        let sql = format!(
            "SELECT {} FROM {} WHERE $1 ~ e.path_regex AND e.method = $2 AND e.host = $3 \
             ORDER BY e.number_params ASC LIMIT 1",
            ENDPOINT_SELECT,
            endpoint_from(ctx)
        );
        let endpoint = retry_transient(&self.retry, || {
            sqlx::query_as::<_, Endpoint>(&sql)
                .bind(path)
                .bind(method)
                .bind(host)
                .fetch_optional(&self.pool)
        })
        .await?;
        Ok(endpoint)
    }

    async fn find_exact(
        &self,
        ctx: &Context,
        host: &str,
        method: &str,
        template: &str,
    ) -> Result<Option<Endpoint>, ApiscopeError> {
        let sql = format!(
            "SELECT {} FROM {} WHERE e.host = $1 AND e.method = $2 AND e.path = $3",
            ENDPOINT_SELECT,
            endpoint_from(ctx)
        );
        let endpoint = retry_transient(&self.retry, || {
            sqlx::query_as::<_, Endpoint>(&sql)
                .bind(host)
                .bind(method)
                .bind(template)
                .fetch_optional(&self.pool)
        })
        .await?;
        Ok(endpoint)
    }

    async fn find_by_id(&self, ctx: &Context, id: Uuid) -> Result<Option<Endpoint>, ApiscopeError> {
        let sql = format!("SELECT {} FROM {} WHERE e.id = $1", ENDPOINT_SELECT, endpoint_from(ctx));
        let endpoint = retry_transient(&self.retry, || {
            sqlx::query_as::<_, Endpoint>(&sql).bind(id).fetch_optional(&self.pool)
        })
        .await?;
        Ok(endpoint)
    }

    async fn insert(&self, ctx: &Context, endpoint: &Endpoint) -> Result<InsertOutcome, ApiscopeError> {
        let sql = format!(
            "INSERT INTO {} (id, host, method, path, path_regex, number_params, first_detected, \
             last_active, risk_score, is_graphql) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
            ctx.table("endpoint")
        );
        let result = retry_transient(&self.retry, || {
            sqlx::query(&sql)
                .bind(endpoint.id)
                .bind(&endpoint.host)
                .bind(&endpoint.method)
                .bind(&endpoint.path)
                .bind(&endpoint.path_regex)
                .bind(endpoint.number_params)
                .bind(endpoint.first_detected)
                .bind(endpoint.last_active)
                .bind(endpoint.risk_score)
                .bind(endpoint.is_graphql)
                .execute(&self.pool)
        })
        .await;

        match result {
            Ok(_) => Ok(InsertOutcome::Inserted),
            Err(e) if apiscope_core::error::is_unique_violation(&e) => Ok(InsertOutcome::Conflict),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-process store keyed the same way as the `endpoint` table.
#[derive(Default)]
pub struct MemoryEndpointStore {
    endpoints: Mutex<Vec<Endpoint>>,
    patterns: PatternCache,
}

impl MemoryEndpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn all(&self) -> Vec<Endpoint> {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Endpoint>> {
        self.endpoints.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl EndpointStore for MemoryEndpointStore {
    async fn find_match(
        &self,
        _ctx: &Context,
        host: &str,
        method: &str,
        path: &str,
    ) -> Result<Option<Endpoint>, ApiscopeError> {
        let endpoints = self.lock();
        Ok(endpoints
            .iter()
            .filter(|e| e.host == host && e.method == method)
            .filter(|e| self.patterns.is_match(&e.path_regex, path))
            .min_by_key(|e| e.number_params)
            .cloned())
    }

    async fn find_exact(
        &self,
        _ctx: &Context,
        host: &str,
        method: &str,
        template: &str,
    ) -> Result<Option<Endpoint>, ApiscopeError> {
        Ok(self
            .lock()
            .iter()
            .find(|e| e.host == host && e.method == method && e.path == template)
            .cloned())
    }

    async fn find_by_id(&self, _ctx: &Context, id: Uuid) -> Result<Option<Endpoint>, ApiscopeError> {
        Ok(self.lock().iter().find(|e| e.id == id).cloned())
    }

    async fn insert(&self, _ctx: &Context, endpoint: &Endpoint) -> Result<InsertOutcome, ApiscopeError> {
        let mut endpoints = self.lock();
        let taken = endpoints
            .iter()
            .any(|e| e.host == endpoint.host && e.method == endpoint.method && e.path == endpoint.path);
        if taken {
            return Ok(InsertOutcome::Conflict);
        }
        endpoints.push(endpoint.clone());
        Ok(InsertOutcome::Inserted)
    }
}
