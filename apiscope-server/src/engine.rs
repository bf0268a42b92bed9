//! Shared analysis dependencies, built once from config and handed to the
//! worker, the batch jobs and the HTTP API behind an `Arc`.

use std::sync::Arc;
use std::time::Duration;

use apiscope_core::db;
use apiscope_core::policy::AutoGeneratedBypass;
use apiscope_core::{
    ApiscopeConfig, ApiscopeError, Context, MatchBypass, PathInferrer, PatternCache,
    PatternScanner, RequestContext, RetryPolicy, Scanner,
};
use sqlx::PgPool;

use crate::store::{EndpointStore, PgEndpointStore};
use crate::subsystems::reconcile::Reconciler;
use crate::subsystems::resolver::EndpointResolver;

pub struct Engine {
    pub pool: PgPool,
    pub config: ApiscopeConfig,
    pub store: Arc<dyn EndpointStore>,
    pub resolver: EndpointResolver,
    pub reconciler: Reconciler,
    pub inferrer: PathInferrer,
    pub bypass: Arc<dyn MatchBypass>,
    pub scanner: Arc<dyn Scanner>,
    pub patterns: Arc<PatternCache>,
    pub retry: RetryPolicy,
    /// Client for transport-security probes.
    pub http: reqwest::Client,
}

impl Engine {
    pub fn new(pool: PgPool, config: ApiscopeConfig) -> Result<Self, ApiscopeError> {
        let retry = RetryPolicy::from_config(&config.retry);
        let store: Arc<dyn EndpointStore> = Arc::new(PgEndpointStore::new(pool.clone(), retry.clone()));
        Self::with_store(pool, config, store)
    }

    /// Build with a caller-supplied endpoint store.
    pub fn with_store(
        pool: PgPool,
        config: ApiscopeConfig,
        store: Arc<dyn EndpointStore>,
    ) -> Result<Self, ApiscopeError> {
        let scanner: Arc<dyn Scanner> = Arc::new(PatternScanner::from_config(&config.scanner)?);
        let inferrer = PathInferrer::from_config(&config.policy);
        let bypass: Arc<dyn MatchBypass> = Arc::new(AutoGeneratedBypass::new(inferrer.predicate()));
        let retry = RetryPolicy::from_config(&config.retry);
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.jobs.probe_timeout_secs))
            .build()?;

        Ok(Self {
            resolver: EndpointResolver::new(Arc::clone(&store), inferrer.clone(), Arc::clone(&bypass)),
            reconciler: Reconciler::new(Arc::clone(&scanner)),
            pool,
            config,
            store,
            inferrer,
            bypass,
            scanner,
            patterns: Arc::new(PatternCache::default()),
            retry,
            http,
        })
    }

    /// Context for a queued item, falling back to the configured schema.
    pub fn context(&self, request: &RequestContext) -> Result<Context, ApiscopeError> {
        Context::from_request(request, &self.config.service.default_schema)
    }

    pub fn default_context(&self) -> Result<Context, ApiscopeError> {
        Context::new(self.config.service.default_schema.clone())
    }

    /// Every context a batch job should visit: the default one first, then
    /// each provisioned schema matching `jobs.schema_prefix`.
    pub async fn job_contexts(&self) -> Result<Vec<Context>, ApiscopeError> {
        let mut contexts = vec![self.default_context()?];
        for schema in db::analysis_schemas(&self.pool, &self.config.jobs.schema_prefix).await? {
            if contexts.iter().any(|c| c.schema() == schema) {
                continue;
            }
            match Context::new(schema) {
                Ok(ctx) => contexts.push(ctx),
                Err(e) => tracing::warn!(error = %e, "Skipping schema"),
            }
        }
        Ok(contexts)
    }
}
