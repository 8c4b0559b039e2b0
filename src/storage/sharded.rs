//! ClickHouse spread over several independent shards.
//!
//! A record lives on shard `crc32(id) mod N`, the same stable hash the
//! worker selector uses. Reads go to the owning shard only; a batch is
//! split per shard, then per table.

use std::sync::Arc;

use anyhow::{bail, Result};
use clickhouse_rs::Pool;

use super::relational::{connect, create_table, execute_rows, SqlRow, SqlTable};
use super::{BatchSink, StorageBackend, StorageDao, WriteKind};
use crate::config::{RelationalConfig, ShardedConfig};
use crate::export::health::HealthMetrics;
use crate::model::{AttributeSchema, Record};
use crate::worker::selector::shard_index;

struct Shard {
    pool: Pool,
    cfg: RelationalConfig,
}

/// A row tagged with the shard that owns it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardedRow {
    pub shard: usize,
    pub row: SqlRow,
}

pub struct ShardedBackend {
    shards: Vec<Shard>,
    health: Option<Arc<HealthMetrics>>,
}

impl ShardedBackend {
    pub fn new(cfg: ShardedConfig, health: Option<Arc<HealthMetrics>>) -> Result<Self> {
        if cfg.shards.is_empty() {
            bail!("sharded backend needs at least one shard");
        }

        let shards = cfg
            .shards
            .into_iter()
            .map(|cfg| Shard {
                pool: Pool::new(cfg.dsn()),
                cfg,
            })
            .collect();

        Ok(Self { shards, health })
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }
}

/// Splits requests into one row list per shard, keeping request order
/// within a shard.
fn partition(requests: Vec<ShardedRow>, shards: usize) -> Vec<Vec<SqlRow>> {
    let mut per_shard: Vec<Vec<SqlRow>> = (0..shards).map(|_| Vec::new()).collect();
    for request in requests {
        if let Some(rows) = per_shard.get_mut(request.shard) {
            rows.push(request.row);
        }
    }
    per_shard
}

impl BatchSink for ShardedBackend {
    type Request = ShardedRow;

    async fn batch_persistence(&self, requests: Vec<ShardedRow>) -> Result<()> {
        let per_shard = partition(requests, self.shards.len());

        let mut failed = 0usize;
        for (idx, (shard, rows)) in self.shards.iter().zip(per_shard).enumerate() {
            if rows.is_empty() {
                continue;
            }

            if let Err(e) =
                execute_rows(&shard.pool, &rows, "sharded", self.health.as_deref()).await
            {
                tracing::error!(
                    shard = idx,
                    endpoint = %shard.cfg.endpoint,
                    rows = rows.len(),
                    error = format!("{e:#}"),
                    "shard batch failed",
                );
                failed += 1;
            }
        }

        if failed > 0 {
            bail!("{failed} of {} shards failed", self.shards.len());
        }
        Ok(())
    }
}

impl StorageBackend for ShardedBackend {
    type Dao = ShardedDao;

    fn name(&self) -> &str {
        "sharded"
    }

    async fn start(&self) -> Result<()> {
        for (idx, shard) in self.shards.iter().enumerate() {
            let result = connect(&shard.cfg).await;
            if let Some(health) = &self.health {
                health
                    .storage_connected
                    .with_label_values(&[&format!("sharded-{idx}")])
                    .set(if result.is_ok() { 1.0 } else { 0.0 });
            }
            result?;
        }

        tracing::info!(shards = self.shards.len(), "ClickHouse shards connected");
        Ok(())
    }

    async fn ensure_schema(&self, schema: &AttributeSchema) -> Result<()> {
        let schema = Arc::new(schema.clone());
        for shard in &self.shards {
            let table = SqlTable::new(&shard.cfg, Arc::clone(&schema));
            create_table(&shard.pool, &table).await?;
        }
        Ok(())
    }

    fn dao(&self, schema: Arc<AttributeSchema>) -> Result<ShardedDao> {
        let shards = self
            .shards
            .iter()
            .map(|shard| {
                (
                    shard.pool.clone(),
                    SqlTable::new(&shard.cfg, Arc::clone(&schema)),
                )
            })
            .collect();

        Ok(ShardedDao { shards })
    }
}

pub struct ShardedDao {
    shards: Vec<(Pool, SqlTable)>,
}

impl ShardedDao {
    /// Index of the shard that owns `id`.
    pub fn shard_of(&self, id: &str) -> usize {
        shard_index(id, self.shards.len())
    }

    fn row(&self, kind: WriteKind, record: &Record) -> Result<ShardedRow> {
        let shard = self.shard_of(record.id());
        let (_, table) = &self.shards[shard];
        Ok(ShardedRow {
            shard,
            row: table.row(kind, record)?,
        })
    }
}

impl StorageDao for ShardedDao {
    type Request = ShardedRow;

    async fn get(&self, id: &str) -> Result<Option<Record>> {
        let (pool, table) = &self.shards[self.shard_of(id)];
        table.fetch(pool, id).await
    }

    fn prepare_batch_insert(&self, record: &Record) -> Result<ShardedRow> {
        self.row(WriteKind::Insert, record)
    }

    fn prepare_batch_update(&self, record: &Record) -> Result<ShardedRow> {
        self.row(WriteKind::Update, record)
    }
}
