//! Storage DAO contract and backends.
//!
//! The aggregation engine only ever talks to storage through
//! [`StorageDao`] (per schema) and [`BatchSink`] (per backend). Each
//! backend picks its own opaque request type; the engine moves requests
//! from the DAO to the sink without looking inside them.

pub mod document;
pub mod memory;
pub mod relational;
pub mod sharded;

use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use serde::Deserialize;

use crate::model::{AttributeSchema, Record};

/// Which kind of write a request performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteKind {
    Insert,
    Update,
}

impl WriteKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
        }
    }
}

/// Per-schema data access.
pub trait StorageDao: Send + Sync + 'static {
    type Request: Send + 'static;

    /// Point lookup of a previously persisted record.
    fn get(&self, id: &str) -> impl Future<Output = Result<Option<Record>>> + Send;

    /// Builds a request that creates `record`.
    fn prepare_batch_insert(&self, record: &Record) -> Result<Self::Request>;

    /// Builds a request that overwrites the stored record with `record`.
    fn prepare_batch_update(&self, record: &Record) -> Result<Self::Request>;
}

/// Backend-wide batch submission.
pub trait BatchSink: Send + Sync + 'static {
    type Request: Send + 'static;

    /// Executes all requests with best-effort atomicity.
    ///
    /// Partial application is possible; implementations log it and report
    /// an error only when nothing useful can be said about the batch.
    fn batch_persistence(
        &self,
        requests: Vec<Self::Request>,
    ) -> impl Future<Output = Result<()>> + Send;
}

/// A storage engine the aggregation engine can run against.
pub trait StorageBackend: BatchSink {
    type Dao: StorageDao<Request = Self::Request>;

    /// Backend name for logging.
    fn name(&self) -> &str;

    /// Verifies connectivity.
    fn start(&self) -> impl Future<Output = Result<()>> + Send;

    /// Creates the table or index backing `schema` if it does not exist.
    fn ensure_schema(&self, schema: &AttributeSchema) -> impl Future<Output = Result<()>> + Send;

    /// Returns the DAO for `schema`.
    fn dao(&self, schema: Arc<AttributeSchema>) -> Result<Self::Dao>;
}

/// Configured storage backend selector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    #[default]
    Memory,
    Document,
    Relational,
    Sharded,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Document => "document",
            Self::Relational => "relational",
            Self::Sharded => "sharded",
        }
    }
}
