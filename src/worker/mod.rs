//! Worker actors and their dispatch.
//!
//! Every role owns a fixed pool of [`aggregation::Worker`]s. Each worker
//! has one bounded inbound queue drained by a single consumer task, and
//! one double-buffered [`window::Window`] that the persistence timer
//! swaps out on every tick.

pub mod aggregation;
pub mod queue;
pub mod registry;
pub mod selector;
pub mod window;

use std::sync::Arc;

use serde::Deserialize;

use crate::model::AttributeSchema;

pub use aggregation::{BatchCollection, Worker};
pub use queue::{InboundQueue, OverflowPolicy, Pushed, QueueError};
pub use registry::{Delivery, Owner, TellError, WorkerRegistry};
pub use selector::{Selector, SelectorKind};
pub use window::{HeldBuffer, Window, WindowError};

/// How drained records reach storage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistenceStrategy {
    /// Read the stored record, merge, then insert or update.
    #[default]
    MergeOnWrite,
    /// Always insert; the stored state is never read.
    InsertOnly,
}

impl PersistenceStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MergeOnWrite => "merge_on_write",
            Self::InsertOnly => "insert_only",
        }
    }
}

/// A stream type handled by a worker pool.
#[derive(Debug, Clone)]
pub struct Role {
    pub name: String,
    pub schema: Arc<AttributeSchema>,
    pub persistence: PersistenceStrategy,
    pub selector: SelectorKind,
    pub pool_size: usize,
}

impl Role {
    pub fn new(
        name: impl Into<String>,
        schema: AttributeSchema,
        persistence: PersistenceStrategy,
        selector: SelectorKind,
        pool_size: usize,
    ) -> Self {
        Self {
            name: name.into(),
            schema: Arc::new(schema),
            persistence,
            selector,
            pool_size: pool_size.max(1),
        }
    }
}
