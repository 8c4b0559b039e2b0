//! In-process storage backend.
//!
//! Tables live in a shared [`DashMap`] keyed by schema name. Used for
//! development and as the reference backend in tests; counters expose how
//! the engine exercised the DAO contract.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use dashmap::DashMap;

use super::{BatchSink, StorageBackend, StorageDao, WriteKind};
use crate::model::{AttributeSchema, Record};

type Table = DashMap<String, Record>;

#[derive(Default)]
struct Shared {
    tables: DashMap<String, Arc<Table>>,
    get_calls: AtomicU64,
    inserts: AtomicU64,
    updates: AtomicU64,
    batches: AtomicU64,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl Shared {
    fn table(&self, name: &str) -> Arc<Table> {
        Arc::clone(
            self.tables
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(DashMap::new()))
                .value(),
        )
    }
}

/// One pending write.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryRequest {
    pub table: String,
    pub kind: WriteKind,
    pub record: Record,
}

/// Cheaply cloneable handle to an in-memory store.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    shared: Arc<Shared>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `record` directly, bypassing the batch path.
    pub fn seed(&self, table: &str, record: Record) {
        self.shared
            .table(table)
            .insert(record.id().to_string(), record);
    }

    /// Returns the persisted record, if any.
    pub fn record(&self, table: &str, id: &str) -> Option<Record> {
        self.shared
            .tables
            .get(table)
            .and_then(|t| t.get(id).map(|r| r.value().clone()))
    }

    /// Number of records persisted in `table`.
    pub fn len(&self, table: &str) -> usize {
        self.shared.tables.get(table).map_or(0, |t| t.len())
    }

    pub fn get_calls(&self) -> u64 {
        self.shared.get_calls.load(Ordering::Relaxed)
    }

    pub fn inserts(&self) -> u64 {
        self.shared.inserts.load(Ordering::Relaxed)
    }

    pub fn updates(&self) -> u64 {
        self.shared.updates.load(Ordering::Relaxed)
    }

    pub fn batches(&self) -> u64 {
        self.shared.batches.load(Ordering::Relaxed)
    }

    /// Makes every subsequent `get` fail until reset.
    pub fn fail_reads(&self, fail: bool) {
        self.shared.fail_reads.store(fail, Ordering::Relaxed);
    }

    /// Makes every subsequent batch fail until reset.
    pub fn fail_writes(&self, fail: bool) {
        self.shared.fail_writes.store(fail, Ordering::Relaxed);
    }
}

impl BatchSink for MemoryBackend {
    type Request = MemoryRequest;

    async fn batch_persistence(&self, requests: Vec<MemoryRequest>) -> Result<()> {
        if self.shared.fail_writes.load(Ordering::Relaxed) {
            bail!("memory backend rejecting writes");
        }

        self.shared.batches.fetch_add(1, Ordering::Relaxed);

        for request in requests {
            let counter = match request.kind {
                WriteKind::Insert => &self.shared.inserts,
                WriteKind::Update => &self.shared.updates,
            };
            counter.fetch_add(1, Ordering::Relaxed);

            self.shared
                .table(&request.table)
                .insert(request.record.id().to_string(), request.record);
        }

        Ok(())
    }
}

impl StorageBackend for MemoryBackend {
    type Dao = MemoryDao;

    fn name(&self) -> &str {
        "memory"
    }

    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn ensure_schema(&self, schema: &AttributeSchema) -> Result<()> {
        self.shared.table(schema.name());
        Ok(())
    }

    fn dao(&self, schema: Arc<AttributeSchema>) -> Result<MemoryDao> {
        Ok(MemoryDao {
            table: self.shared.table(schema.name()),
            name: schema.name().to_string(),
            shared: Arc::clone(&self.shared),
        })
    }
}

pub struct MemoryDao {
    table: Arc<Table>,
    name: String,
    shared: Arc<Shared>,
}

impl MemoryDao {
    fn request(&self, kind: WriteKind, record: &Record) -> MemoryRequest {
        MemoryRequest {
            table: self.name.clone(),
            kind,
            record: record.clone(),
        }
    }
}

impl StorageDao for MemoryDao {
    type Request = MemoryRequest;

    async fn get(&self, id: &str) -> Result<Option<Record>> {
        self.shared.get_calls.fetch_add(1, Ordering::Relaxed);
        if self.shared.fail_reads.load(Ordering::Relaxed) {
            bail!("memory backend rejecting reads");
        }
        Ok(self.table.get(id).map(|r| r.value().clone()))
    }

    fn prepare_batch_insert(&self, record: &Record) -> Result<MemoryRequest> {
        Ok(self.request(WriteKind::Insert, record))
    }

    fn prepare_batch_update(&self, record: &Record) -> Result<MemoryRequest> {
        Ok(self.request(WriteKind::Update, record))
    }
}
