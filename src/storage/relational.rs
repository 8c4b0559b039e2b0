//! ClickHouse storage over the native protocol.
//!
//! Every schema maps to a `ReplacingMergeTree(update_time)` table ordered
//! by `id`. Inserts and updates are both plain rows: the row with the
//! newest `update_time` supersedes older versions, and reads use `FINAL`
//! to see only that row.

use std::collections::BTreeMap;
use std::fmt::Write;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use clickhouse_rs::Pool;

use super::{BatchSink, StorageBackend, StorageDao, WriteKind};
use crate::config::RelationalConfig;
use crate::export::health::HealthMetrics;
use crate::model::{AttributeSchema, AttributeType, Record, Value};

/// Column mapping of one schema onto one table.
#[derive(Debug)]
pub struct SqlTable {
    table: String,
    schema: Arc<AttributeSchema>,
    columns: Arc<str>,
}

impl SqlTable {
    pub fn new(cfg: &RelationalConfig, schema: Arc<AttributeSchema>) -> Self {
        let table = format!("{}.{}{}", cfg.database, cfg.table_prefix, schema.name());

        let mut columns = String::from("id");
        for attr in schema.attributes() {
            let _ = write!(columns, ", `{}`", attr.name);
        }
        columns.push_str(", update_time");

        Self {
            table,
            schema,
            columns: Arc::from(columns),
        }
    }

    pub fn name(&self) -> &str {
        &self.table
    }

    pub fn create_sql(&self) -> String {
        let mut sql = format!("CREATE TABLE IF NOT EXISTS {} (id String", self.table);
        for attr in self.schema.attributes() {
            let _ = write!(sql, ", `{}` {}", attr.name, column_type(attr.ty));
        }
        sql.push_str(
            ", update_time DateTime64(3)) ENGINE = ReplacingMergeTree(update_time) ORDER BY id",
        );
        sql
    }

    pub fn select_sql(&self, id: &str) -> String {
        format!(
            "SELECT {} FROM {} FINAL WHERE id = '{}' LIMIT 1",
            self.columns,
            self.table,
            escape_sql(id)
        )
    }

    /// Renders one `(..)` tuple of the VALUES clause.
    pub fn render_row(&self, record: &Record, update_time: DateTime<Utc>) -> Result<String> {
        self.schema
            .check(record)
            .with_context(|| format!("rendering row {} for {}", record.id(), self.table))?;

        let mut row = String::with_capacity(64 + record.values().len() * 16);
        let _ = write!(row, "('{}'", escape_sql(record.id()));
        for value in record.values() {
            row.push_str(", ");
            match value {
                Value::String(s) => {
                    let _ = write!(row, "'{}'", escape_sql(s));
                }
                Value::Int32(v) => {
                    let _ = write!(row, "{v}");
                }
                Value::Int64(v) => {
                    let _ = write!(row, "{v}");
                }
                Value::Bool(v) => row.push(if *v { '1' } else { '0' }),
                Value::Bytes(b) => {
                    let _ = write!(row, "'{}'", BASE64.encode(b));
                }
            }
        }
        let _ = write!(row, ", {})", format_datetime(update_time));
        Ok(row)
    }

    pub(crate) fn row(&self, kind: WriteKind, record: &Record) -> Result<SqlRow> {
        Ok(SqlRow {
            table: Arc::from(self.table.as_str()),
            columns: Arc::clone(&self.columns),
            kind,
            values: self.render_row(record, Utc::now())?,
        })
    }

    /// Point read of the newest version of `id`.
    pub async fn fetch(&self, pool: &Pool, id: &str) -> Result<Option<Record>> {
        let mut handle = pool
            .get_handle()
            .await
            .with_context(|| format!("getting handle for {}", self.table))?;

        let block = handle
            .query(self.select_sql(id).as_str())
            .fetch_all()
            .await
            .with_context(|| format!("querying {} for {id}", self.table))?;

        let Some(row) = block.rows().next() else {
            return Ok(None);
        };

        let mut values = Vec::with_capacity(self.schema.attribute_count());
        for attr in self.schema.attributes() {
            let name = attr.name.as_str();
            let ctx = || format!("reading {}.{name} of {id}", self.table);
            let value = match attr.ty {
                AttributeType::String => Value::String(row.get(name).with_context(ctx)?),
                AttributeType::Int32 => Value::Int32(row.get(name).with_context(ctx)?),
                AttributeType::Int64 => Value::Int64(row.get(name).with_context(ctx)?),
                AttributeType::Bool => {
                    let flag: u8 = row.get(name).with_context(ctx)?;
                    Value::Bool(flag != 0)
                }
                AttributeType::Bytes => {
                    let encoded: String = row.get(name).with_context(ctx)?;
                    Value::Bytes(BASE64.decode(encoded).with_context(ctx)?)
                }
            };
            values.push(value);
        }

        Ok(Some(Record::new(id, values)))
    }
}

/// One pending row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlRow {
    pub table: Arc<str>,
    pub columns: Arc<str>,
    pub kind: WriteKind,
    /// Rendered `(..)` tuple.
    pub values: String,
}

/// Groups rows per table into multi-row INSERT statements, ordered by
/// table name.
pub fn insert_statements(rows: &[SqlRow]) -> Vec<(Arc<str>, String)> {
    let mut grouped: BTreeMap<&str, (&str, Vec<&str>)> = BTreeMap::new();
    for row in rows {
        grouped
            .entry(&*row.table)
            .or_insert_with(|| (&*row.columns, Vec::new()))
            .1
            .push(row.values.as_str());
    }

    grouped
        .into_iter()
        .map(|(table, (columns, values))| {
            let len: usize = values.iter().map(|v| v.len() + 2).sum();
            let mut sql = String::with_capacity(32 + table.len() + columns.len() + len);
            let _ = write!(sql, "INSERT INTO {table} ({columns}) VALUES ");
            for (idx, v) in values.iter().enumerate() {
                if idx > 0 {
                    sql.push_str(", ");
                }
                sql.push_str(v);
            }
            (Arc::from(table), sql)
        })
        .collect()
}

/// Executes the INSERT statements for `rows` on one pool.
///
/// Every table is attempted; the error reports how many tables failed.
pub(crate) async fn execute_rows(
    pool: &Pool,
    rows: &[SqlRow],
    backend: &str,
    health: Option<&HealthMetrics>,
) -> Result<()> {
    let statements = insert_statements(rows);
    let total = statements.len();

    let mut handle = pool
        .get_handle()
        .await
        .context("getting handle for batch insert")?;

    let started = Instant::now();
    let mut failed = 0usize;
    for (table, sql) in statements {
        if let Err(e) = handle.execute(sql.as_str()).await {
            tracing::error!(backend, table = %table, error = %e, "inserting batch");
            if let Some(health) = health {
                health
                    .storage_batch_errors
                    .with_label_values(&[backend, &table])
                    .inc();
            }
            failed += 1;
        }
    }

    if let Some(health) = health {
        health
            .storage_duration
            .with_label_values(&[backend, "batch"])
            .observe(started.elapsed().as_secs_f64());
    }

    if failed > 0 {
        bail!("{failed} of {total} table inserts failed");
    }

    tracing::debug!(backend, rows = rows.len(), tables = total, "flushed batch");
    Ok(())
}

/// Opens a pool and verifies connectivity with a ping.
pub(crate) async fn connect(cfg: &RelationalConfig) -> Result<Pool> {
    let pool = Pool::new(cfg.dsn());

    let mut handle = pool
        .get_handle()
        .await
        .with_context(|| format!("opening ClickHouse connection to {}", cfg.endpoint))?;

    handle
        .ping()
        .await
        .with_context(|| format!("pinging ClickHouse at {}", cfg.endpoint))?;

    Ok(pool)
}

pub struct RelationalBackend {
    pool: Pool,
    cfg: RelationalConfig,
    health: Option<Arc<HealthMetrics>>,
}

impl RelationalBackend {
    /// Creates the backend. The pool connects lazily; [`StorageBackend::start`]
    /// verifies connectivity.
    pub fn new(cfg: RelationalConfig, health: Option<Arc<HealthMetrics>>) -> Self {
        Self {
            pool: Pool::new(cfg.dsn()),
            cfg,
            health,
        }
    }
}

impl BatchSink for RelationalBackend {
    type Request = SqlRow;

    async fn batch_persistence(&self, requests: Vec<SqlRow>) -> Result<()> {
        execute_rows(&self.pool, &requests, "relational", self.health.as_deref()).await
    }
}

impl StorageBackend for RelationalBackend {
    type Dao = RelationalDao;

    fn name(&self) -> &str {
        "relational"
    }

    async fn start(&self) -> Result<()> {
        let result = connect(&self.cfg).await;
        if let Some(health) = &self.health {
            health
                .storage_connected
                .with_label_values(&["relational"])
                .set(if result.is_ok() { 1.0 } else { 0.0 });
        }
        result?;

        tracing::info!(endpoint = %self.cfg.endpoint, "ClickHouse connected");
        Ok(())
    }

    async fn ensure_schema(&self, schema: &AttributeSchema) -> Result<()> {
        let table = SqlTable::new(&self.cfg, Arc::new(schema.clone()));
        create_table(&self.pool, &table).await
    }

    fn dao(&self, schema: Arc<AttributeSchema>) -> Result<RelationalDao> {
        Ok(RelationalDao {
            pool: self.pool.clone(),
            table: SqlTable::new(&self.cfg, schema),
        })
    }
}

pub(crate) async fn create_table(pool: &Pool, table: &SqlTable) -> Result<()> {
    let mut handle = pool
        .get_handle()
        .await
        .context("getting handle for table creation")?;

    handle
        .execute(table.create_sql().as_str())
        .await
        .with_context(|| format!("creating table {}", table.name()))?;

    tracing::info!(table = table.name(), "ensured table");
    Ok(())
}

pub struct RelationalDao {
    pool: Pool,
    table: SqlTable,
}

impl StorageDao for RelationalDao {
    type Request = SqlRow;

    async fn get(&self, id: &str) -> Result<Option<Record>> {
        self.table.fetch(&self.pool, id).await
    }

    fn prepare_batch_insert(&self, record: &Record) -> Result<SqlRow> {
        self.table.row(WriteKind::Insert, record)
    }

    fn prepare_batch_update(&self, record: &Record) -> Result<SqlRow> {
        self.table.row(WriteKind::Update, record)
    }
}

/// Formats a timestamp as a quoted DateTime64(3) literal.
fn format_datetime(t: DateTime<Utc>) -> String {
    format!("'{}'", t.format("%Y-%m-%d %H:%M:%S%.3f"))
}

/// Escapes a string value for SQL insertion (single-quote escaping).
fn escape_sql(s: &str) -> String {
    s.replace('\\', "\\\\").replace('\'', "\\'")
}

fn column_type(ty: AttributeType) -> &'static str {
    match ty {
        AttributeType::String | AttributeType::Bytes => "String",
        AttributeType::Int32 => "Int32",
        AttributeType::Int64 => "Int64",
        AttributeType::Bool => "UInt8",
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::model::{Attribute, MergeOperation};

    fn table() -> SqlTable {
        let schema = AttributeSchema::new(
            "instance",
            1,
            vec![
                Attribute::new("agent", AttributeType::String, MergeOperation::Non),
                Attribute::new("port", AttributeType::Int32, MergeOperation::Cover),
                Attribute::new("heartbeat", AttributeType::Int64, MergeOperation::Cover),
                Attribute::new("alive", AttributeType::Bool, MergeOperation::Cover),
                Attribute::new("blob", AttributeType::Bytes, MergeOperation::Cover),
            ],
        )
        .expect("schema");
        let cfg = RelationalConfig {
            database: "apm".to_string(),
            table_prefix: "sw_".to_string(),
            ..Default::default()
        };
        SqlTable::new(&cfg, Arc::new(schema))
    }

    fn record(id: &str) -> Record {
        Record::new(
            id,
            vec![
                Value::from("it's"),
                Value::Int32(8080),
                Value::Int64(-5),
                Value::Bool(true),
                Value::Bytes(vec![255]),
            ],
        )
    }

    #[test]
    fn test_create_sql() {
        assert_eq!(
            table().create_sql(),
            "CREATE TABLE IF NOT EXISTS apm.sw_instance (id String, `agent` String, \
             `port` Int32, `heartbeat` Int64, `alive` UInt8, `blob` String, \
             update_time DateTime64(3)) ENGINE = ReplacingMergeTree(update_time) ORDER BY id"
        );
    }

    #[test]
    fn test_select_sql_reads_final_and_escapes() {
        assert_eq!(
            table().select_sql("a'b"),
            "SELECT id, `agent`, `port`, `heartbeat`, `alive`, `blob`, update_time \
             FROM apm.sw_instance FINAL WHERE id = 'a\\'b' LIMIT 1"
        );
    }

    #[test]
    fn test_render_row() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 5, 17, 42, 0).unwrap();
        assert_eq!(
            table().render_row(&record("i-1"), ts).expect("row"),
            "('i-1', 'it\\'s', 8080, -5, 1, '/w==', '2024-03-05 17:42:00.000')"
        );
    }

    #[test]
    fn test_render_row_rejects_wrong_arity() {
        let ts = Utc::now();
        assert!(table()
            .render_row(&Record::new("x", vec![Value::from("a")]), ts)
            .is_err());
    }

    #[test]
    fn test_insert_statements_group_per_table() {
        let t = table();
        let rows = vec![
            t.row(WriteKind::Insert, &record("a")).expect("row"),
            SqlRow {
                table: Arc::from("apm.other"),
                columns: Arc::from("id, update_time"),
                kind: WriteKind::Insert,
                values: "('z', '2024-01-01 00:00:00.000')".to_string(),
            },
            t.row(WriteKind::Update, &record("b")).expect("row"),
        ];

        let statements = insert_statements(&rows);
        assert_eq!(statements.len(), 2);

        assert_eq!(&*statements[0].0, "apm.other");
        assert!(statements[0].1.starts_with("INSERT INTO apm.other (id, update_time) VALUES ('z'"));

        let (name, sql) = &statements[1];
        assert_eq!(&**name, "apm.sw_instance");
        assert!(sql.starts_with("INSERT INTO apm.sw_instance (id, `agent`"));
        assert!(sql.contains("('a', ") && sql.contains("), ('b', "));
    }
}
