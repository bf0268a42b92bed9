pub mod alerts;
pub mod backfill;
pub mod hsts;
pub mod openapi;
pub mod pipeline;
pub mod reconcile;
pub mod resolver;
pub mod rollup;
pub mod scheduler;
pub mod sweep;
pub mod worker;
