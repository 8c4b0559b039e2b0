use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::catalog;
use crate::model::{Attribute, AttributeSchema};
use crate::storage::BackendKind;
use crate::worker::{OverflowPolicy, PersistenceStrategy, Role, SelectorKind};

/// Top-level configuration for the aggregation engine.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Persistence timer schedule.
    #[serde(default)]
    pub timer: TimerConfig,

    /// Defaults shared by every worker pool.
    #[serde(default)]
    pub workers: WorkersConfig,

    /// Roles handled by this node. Empty means the built-in catalog.
    #[serde(default)]
    pub roles: Vec<RoleConfig>,

    /// Storage backend configuration.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Static cluster layout.
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Persistence timer schedule.
#[derive(Debug, Clone, Deserialize)]
pub struct TimerConfig {
    /// Delay before the first tick. Default: 1s.
    #[serde(default = "default_initial_delay", with = "humantime_serde")]
    pub initial_delay: Duration,

    /// Interval between ticks. Default: 3s.
    #[serde(default = "default_period", with = "humantime_serde")]
    pub period: Duration,
}

/// Worker pool defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkersConfig {
    /// Inbound queue capacity per worker. Default: 10000.
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,

    /// What happens to records arriving at a full queue.
    #[serde(default)]
    pub overflow: OverflowPolicy,

    /// Longest a producer waits under the `block` policy. Default: 100ms.
    #[serde(default = "default_block_timeout", with = "humantime_serde")]
    pub block_timeout: Duration,

    /// Workers per role when a role sets no pool_size. Default: 2.
    #[serde(default = "default_pool_size")]
    pub default_pool_size: usize,
}

/// One configured role.
#[derive(Debug, Clone, Deserialize)]
pub struct RoleConfig {
    pub name: String,

    /// Workers in this role's pool. Default: workers.default_pool_size.
    #[serde(default)]
    pub pool_size: Option<usize>,

    #[serde(default)]
    pub persistence: PersistenceStrategy,

    /// Worker selection. Default: hash_code.
    #[serde(default)]
    pub selector: Option<SelectorKind>,

    pub schema: SchemaConfig,
}

/// Attribute schema of a role.
#[derive(Debug, Clone, Deserialize)]
pub struct SchemaConfig {
    /// Table or index name. Default: the role name.
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default = "default_schema_version")]
    pub version: u32,

    pub attributes: Vec<Attribute>,
}

/// Storage backend configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: BackendKind,

    /// Create missing tables/indices at startup.
    #[serde(default)]
    pub create_schema: bool,

    #[serde(default)]
    pub document: DocumentConfig,

    #[serde(default)]
    pub relational: RelationalConfig,

    #[serde(default)]
    pub sharded: ShardedConfig,
}

/// Elasticsearch-compatible document store.
#[derive(Debug, Clone, Deserialize)]
pub struct DocumentConfig {
    /// Base URL, e.g. "http://localhost:9200".
    #[serde(default)]
    pub endpoint: String,

    /// Prepended to every index name.
    #[serde(default)]
    pub index_prefix: String,

    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub password: String,

    /// Bulk body compression (none, gzip, zlib). Default: none.
    #[serde(default = "default_compression")]
    pub compression: String,

    /// Per-request timeout. Default: 10s.
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Extra headers sent with every request.
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

/// ClickHouse connection.
#[derive(Debug, Clone, Deserialize)]
pub struct RelationalConfig {
    /// Native protocol endpoint, e.g. "localhost:9000".
    #[serde(default)]
    pub endpoint: String,

    #[serde(default = "default_database")]
    pub database: String,

    /// Prepended to every table name.
    #[serde(default)]
    pub table_prefix: String,

    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub password: String,
}

/// Several ClickHouse shards addressed by id hash.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ShardedConfig {
    #[serde(default)]
    pub shards: Vec<RelationalConfig>,
}

/// Static cluster layout.
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    /// Address receiving forwarded records. Empty disables it.
    #[serde(default)]
    pub listen: String,

    /// Roles owned by other nodes: role name -> "host:port".
    #[serde(default)]
    pub remote_roles: HashMap<String, String>,

    /// Timeout for connecting to a peer. Default: 5s.
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Defaults ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_period() -> Duration {
    Duration::from_secs(3)
}

fn default_queue_size() -> usize {
    10_000
}

fn default_block_timeout() -> Duration {
    Duration::from_millis(100)
}

fn default_pool_size() -> usize {
    2
}

fn default_schema_version() -> u32 {
    1
}

fn default_compression() -> String {
    "none".to_string()
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_database() -> String {
    "default".to_string()
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            timer: TimerConfig::default(),
            workers: WorkersConfig::default(),
            roles: Vec::new(),
            storage: StorageConfig::default(),
            cluster: ClusterConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            initial_delay: default_initial_delay(),
            period: default_period(),
        }
    }
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            queue_size: default_queue_size(),
            overflow: OverflowPolicy::default(),
            block_timeout: default_block_timeout(),
            default_pool_size: default_pool_size(),
        }
    }
}

impl Default for DocumentConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            index_prefix: String::new(),
            username: String::new(),
            password: String::new(),
            compression: default_compression(),
            timeout: default_request_timeout(),
            headers: HashMap::new(),
        }
    }
}

impl Default for RelationalConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            database: default_database(),
            table_prefix: String::new(),
            username: String::new(),
            password: String::new(),
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            listen: String::new(),
            remote_roles: HashMap::new(),
            connect_timeout: default_connect_timeout(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        Self::from_yaml(&data).with_context(|| format!("loading config file {}", path.display()))
    }

    /// Parse and validate configuration from YAML text.
    pub fn from_yaml(data: &str) -> Result<Self> {
        let cfg: Config = serde_yaml::from_str(data).context("parsing config")?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.timer.period.is_zero() {
            bail!("timer.period must be positive");
        }

        if self.workers.queue_size == 0 {
            bail!("workers.queue_size must be positive");
        }

        if self.workers.default_pool_size == 0 {
            bail!("workers.default_pool_size must be positive");
        }

        if self.workers.overflow == OverflowPolicy::Block && self.workers.block_timeout.is_zero() {
            bail!("workers.block_timeout must be positive with the block overflow policy");
        }

        let roles = self.resolve_roles()?;
        let mut names = HashSet::new();
        let mut schemas = HashMap::new();
        for role in &roles {
            if !names.insert(role.name.as_str()) {
                bail!("duplicate role {}", role.name);
            }

            // Schema names key tables and indices, which may be case-folded.
            let schema = role.schema.name().to_lowercase();
            if let Some(other) = schemas.insert(schema, role.name.as_str()) {
                bail!(
                    "roles {other} and {} share schema name {}",
                    role.name,
                    role.schema.name()
                );
            }

            if role.persistence == PersistenceStrategy::MergeOnWrite
                && role.selector == SelectorKind::Rolling
                && role.pool_size > 1
            {
                bail!(
                    "role {}: merge_on_write roles with pool_size > 1 must use the hash_code selector",
                    role.name
                );
            }
        }

        for role in self.cluster.remote_roles.keys() {
            if !names.contains(role.as_str()) {
                bail!("cluster.remote_roles references unknown role {role}");
            }
        }

        self.validate_storage()?;

        Ok(())
    }

    fn validate_storage(&self) -> Result<()> {
        match self.storage.backend {
            BackendKind::Memory => {}
            BackendKind::Document => {
                let doc = &self.storage.document;
                if doc.endpoint.is_empty() {
                    bail!("storage.document.endpoint is required");
                }
                if !matches!(doc.compression.as_str(), "" | "none" | "gzip" | "zlib") {
                    bail!(
                        "storage.document.compression must be none, gzip or zlib, got {}",
                        doc.compression
                    );
                }
            }
            BackendKind::Relational => {
                if self.storage.relational.endpoint.is_empty() {
                    bail!("storage.relational.endpoint is required");
                }
            }
            BackendKind::Sharded => {
                if self.storage.sharded.shards.is_empty() {
                    bail!("storage.sharded.shards must not be empty");
                }
                for (idx, shard) in self.storage.sharded.shards.iter().enumerate() {
                    if shard.endpoint.is_empty() {
                        bail!("storage.sharded.shards[{idx}].endpoint is required");
                    }
                }
            }
        }

        Ok(())
    }

    /// Builds the role table, falling back to the built-in catalog.
    pub fn resolve_roles(&self) -> Result<Vec<Role>> {
        let configured = if self.roles.is_empty() {
            catalog::default_roles()
        } else {
            self.roles.clone()
        };

        configured
            .into_iter()
            .map(|role| role.build(self.workers.default_pool_size))
            .collect()
    }
}

impl RoleConfig {
    /// Validates the schema and fills in pool and selector defaults.
    pub fn build(self, default_pool_size: usize) -> Result<Role> {
        if self.name.is_empty() {
            bail!("role name must not be empty");
        }

        let pool_size = self.pool_size.unwrap_or(default_pool_size);
        if pool_size == 0 {
            bail!("role {}: pool_size must be positive", self.name);
        }

        let schema_name = self.schema.name.unwrap_or_else(|| self.name.clone());
        let schema = AttributeSchema::new(schema_name, self.schema.version, self.schema.attributes)
            .with_context(|| format!("role {}", self.name))?;

        Ok(Role {
            name: self.name,
            schema: Arc::new(schema),
            persistence: self.persistence,
            selector: self.selector.unwrap_or(SelectorKind::HashCode),
            pool_size,
        })
    }
}

impl RelationalConfig {
    /// Builds a clickhouse-rs compatible TCP DSN.
    ///
    /// Format: `tcp://[user[:pass]@]host:port/database?options`
    pub fn dsn(&self) -> String {
        let mut dsn = "tcp://".to_string();

        if !self.username.is_empty() {
            dsn.push_str(&self.username);
            if !self.password.is_empty() {
                dsn.push(':');
                dsn.push_str(&self.password);
            }
            dsn.push('@');
        }

        dsn.push_str(&self.endpoint);
        dsn.push('/');
        dsn.push_str(&self.database);
        dsn.push_str("?compression=lz4&pool_min=2&pool_max=5");

        dsn
    }
}
