//! Streaming aggregation engine for tracing and metrics collectors.
//!
//! Records are routed by role to a pool of workers, merged in memory
//! per entity id, and periodically flushed to a storage backend as
//! batched inserts and updates.

pub mod catalog;
pub mod config;
pub mod context;
pub mod export;
pub mod model;
pub mod persistence;
pub mod remote;
pub mod storage;
pub mod worker;

pub use config::Config;
pub use context::EngineContext;
