pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod models;
pub mod path;
pub mod policy;
pub mod retry;
pub mod scanner;
pub mod schema;
pub mod spec_diff;

pub use config::ApiscopeConfig;
pub use context::{Context, RequestContext};
pub use error::ApiscopeError;
pub use path::{PathInferrer, PathTemplate, PatternCache};
pub use policy::{AutoGeneratedBypass, HeuristicParamPredicate, MatchBypass, NoBypass, ParamPredicate};
pub use retry::{retry_step, retry_transient, RetryPolicy};
pub use scanner::{PatternScanner, Scanner};
pub use schema::{DataType, Schema};
pub use spec_diff::{SpecDiff, SpecDiffKind};
