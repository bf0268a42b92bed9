//! Apiscope server: queue workers, batch jobs and the ops HTTP API over the
//! `apiscope-core` analysis primitives.

pub mod engine;
pub mod http;
pub mod queue;
pub mod store;
pub mod subsystems;

pub use engine::Engine;
