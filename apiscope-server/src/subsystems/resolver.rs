//! Endpoint resolution: trace → stored endpoint.
//!
//! 1. Match the path against stored patterns for (host, method), fewest
//!    parameters first.
//! 2. The bypass policy may reject that match.
//! 3. Otherwise infer a template and insert a new endpoint.
//! 4. A unique conflict means another writer won the race: re-read by
//!    (host, method, template) and use theirs.
//!
//! 404 and 405 responses can be matched but never create endpoints.

use std::sync::Arc;

use apiscope_core::models::{Endpoint, Trace};
use apiscope_core::path::normalize_path;
use apiscope_core::{ApiscopeError, Context, MatchBypass, PathInferrer};

use crate::store::{EndpointStore, InsertOutcome};

#[derive(Debug, Clone)]
pub enum Resolution {
    Resolved { endpoint: Endpoint, is_new: bool },
    /// No endpoint can exist for this trace (empty path, or a 404/405 with
    /// no match).
    Unresolvable,
    /// Creation failed for a reason other than a lost race; the trace should
    /// be kept unlinked for a later backfill.
    Deferred,
}

pub struct EndpointResolver {
    store: Arc<dyn EndpointStore>,
    inferrer: PathInferrer,
    bypass: Arc<dyn MatchBypass>,
}

impl EndpointResolver {
    pub fn new(store: Arc<dyn EndpointStore>, inferrer: PathInferrer, bypass: Arc<dyn MatchBypass>) -> Self {
        Self {
            store,
            inferrer,
            bypass,
        }
    }

    /// Existing endpoint for this trace, honoring the bypass policy.
    pub async fn find(&self, ctx: &Context, host: &str, method: &str, path: &str) -> Result<Option<Endpoint>, ApiscopeError> {
        let found = self.store.find_match(ctx, host, method, path).await?;
        Ok(found.filter(|endpoint| {
            let skip = self.bypass.bypass(endpoint, path);
            if skip {
                tracing::debug!(endpoint_id = %endpoint.id, path, "Match bypassed");
            }
            !skip
        }))
    }

    pub async fn resolve(&self, ctx: &Context, trace: &Trace) -> Result<Resolution, ApiscopeError> {
        let path = normalize_path(&trace.path);
        if path.is_empty() {
            return Ok(Resolution::Unresolvable);
        }
        let method = trace.method.to_ascii_uppercase();

        if let Some(endpoint) = self.find(ctx, &trace.host, &method, &path).await? {
            return Ok(Resolution::Resolved {
                endpoint,
                is_new: false,
            });
        }

        if trace.is_not_found() {
            return Ok(Resolution::Unresolvable);
        }

        let Some(template) = self.inferrer.infer(&path) else {
            return Ok(Resolution::Unresolvable);
        };
        let endpoint = Endpoint::from_template(&trace.host, &method, &template);

        match self.store.insert(ctx, &endpoint).await {
            Ok(InsertOutcome::Inserted) => {
                tracing::info!(
                    endpoint_id = %endpoint.id,
                    host = %endpoint.host,
                    method = %endpoint.method,
                    path = %endpoint.path,
                    "New endpoint"
                );
                Ok(Resolution::Resolved {
                    endpoint,
                    is_new: true,
                })
            }
            Ok(InsertOutcome::Conflict) => {
                match self
                    .store
                    .find_exact(ctx, &trace.host, &method, &template.path)
                    .await?
                {
                    Some(existing) => Ok(Resolution::Resolved {
                        endpoint: existing,
                        is_new: false,
                    }),
                    None => {
                        tracing::warn!(
                            host = %trace.host,
                            path = %template.path,
                            "Endpoint conflict but no row on re-read"
                        );
                        Ok(Resolution::Deferred)
                    }
                }
            }
            Err(e) => {
                tracing::error!(trace_id = %trace.id, error = %e, "Error generating new endpoint");
                Ok(Resolution::Deferred)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryEndpointStore;
    use apiscope_core::config::PolicyConfig;
    use apiscope_core::NoBypass;

    fn resolver(store: Arc<MemoryEndpointStore>) -> EndpointResolver {
        EndpointResolver::new(
            store,
            PathInferrer::from_config(&PolicyConfig::default()),
            Arc::new(NoBypass),
        )
    }

    #[tokio::test]
    async fn second_trace_matches_the_first_endpoint() {
        let store = Arc::new(MemoryEndpointStore::new());
        let r = resolver(Arc::clone(&store));
        let ctx = Context::default();

        let first = r.resolve(&ctx, &Trace::new("h", "GET", "/users/1", 200)).await.unwrap();
        let second = r.resolve(&ctx, &Trace::new("h", "get", "/users/2/", 200)).await.unwrap();

        let (a, b) = match (first, second) {
            (
                Resolution::Resolved { endpoint: a, is_new: true },
                Resolution::Resolved { endpoint: b, is_new: false },
            ) => (a, b),
            other => panic!("unexpected resolutions: {:?}", other),
        };
        assert_eq!(a.id, b.id);
        assert_eq!(a.path, "/users/{param1}");
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn not_found_never_creates() {
        let store = Arc::new(MemoryEndpointStore::new());
        let r = resolver(Arc::clone(&store));
        let ctx = Context::default();

        for status in [404, 405] {
            let res = r.resolve(&ctx, &Trace::new("h", "GET", "/missing", status)).await.unwrap();
            assert!(matches!(res, Resolution::Unresolvable));
        }
        assert!(store.is_empty());

        r.resolve(&ctx, &Trace::new("h", "GET", "/missing", 200)).await.unwrap();
        let res = r.resolve(&ctx, &Trace::new("h", "GET", "/missing", 404)).await.unwrap();
        assert!(matches!(res, Resolution::Resolved { is_new: false, .. }));
    }

    #[tokio::test]
    async fn empty_path_is_unresolvable() {
        let r = resolver(Arc::new(MemoryEndpointStore::new()));
        let res = r.resolve(&Context::default(), &Trace::new("h", "GET", "", 200)).await.unwrap();
        assert!(matches!(res, Resolution::Unresolvable));
    }

    #[tokio::test]
    async fn fewest_parameters_wins() {
        let store = Arc::new(MemoryEndpointStore::new());
        let r = resolver(Arc::clone(&store));
        let ctx = Context::default();

        r.resolve(&ctx, &Trace::new("h", "GET", "/users/1", 200)).await.unwrap();
        let literal = PathInferrer::from_config(&PolicyConfig::default())
            .infer("/users/me")
            .unwrap();
        store
            .insert(&ctx, &Endpoint::from_template("h", "GET", &literal))
            .await
            .unwrap();

        match r.resolve(&ctx, &Trace::new("h", "GET", "/users/me", 200)).await.unwrap() {
            Resolution::Resolved { endpoint, .. } => assert_eq!(endpoint.path, "/users/me"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_resolutions_create_one_endpoint() {
        let store = Arc::new(MemoryEndpointStore::new());
        let r = Arc::new(resolver(Arc::clone(&store)));
        let barrier = Arc::new(tokio::sync::Barrier::new(16));

        let mut handles = Vec::new();
        for i in 0..16 {
            let r = Arc::clone(&r);
            let barrier = Arc::clone(&barrier);
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                let trace = Trace::new("h", "POST", format!("/orders/{}", 1000 + i), 201);
                r.resolve(&Context::default(), &trace).await.unwrap()
            }));
        }

        let mut ids = Vec::new();
        let mut created = 0;
        for h in handles {
            match h.await.unwrap() {
                Resolution::Resolved { endpoint, is_new } => {
                    if is_new {
                        created += 1;
                    }
                    ids.push(endpoint.id);
                }
                other => panic!("unexpected: {:?}", other),
            }
        }
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(created, 1);
        assert_eq!(store.len(), 1);
    }
}
