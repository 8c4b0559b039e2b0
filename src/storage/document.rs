//! Elasticsearch-compatible document store over HTTP/JSON.
//!
//! One index per schema. Reads are point `GET /{index}/_doc/{id}`
//! lookups, writes are collected into a single NDJSON `_bulk` request per
//! tick. Byte attributes are stored as base64 strings.

use std::io::Write;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use reqwest::{Method, RequestBuilder, StatusCode, Url};
use serde::Deserialize;
use serde_json::{json, Map, Value as Json};

use super::{BatchSink, StorageBackend, StorageDao, WriteKind};
use crate::config::DocumentConfig;
use crate::export::health::HealthMetrics;
use crate::model::{AttributeSchema, AttributeType, Record, Value};

/// HTTP client plus endpoint settings shared by the backend and its DAOs.
struct Transport {
    client: reqwest::Client,
    base: Url,
    cfg: DocumentConfig,
    health: Option<Arc<HealthMetrics>>,
}

impl Transport {
    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|()| anyhow!("endpoint {} cannot be a base URL", self.base))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: Method, segments: &[&str]) -> Result<RequestBuilder> {
        let mut request = self.client.request(method, self.url(segments)?);

        if !self.cfg.username.is_empty() {
            request = request.basic_auth(&self.cfg.username, Some(&self.cfg.password));
        }

        for (k, v) in &self.cfg.headers {
            request = request.header(k.as_str(), v.as_str());
        }

        Ok(request)
    }

    fn index_name(&self, schema: &AttributeSchema) -> String {
        // Index names must be lower case.
        format!("{}{}", self.cfg.index_prefix, schema.name()).to_lowercase()
    }

    fn observe(&self, operation: &str, started: Instant) {
        if let Some(health) = &self.health {
            health
                .storage_duration
                .with_label_values(&["document", operation])
                .observe(started.elapsed().as_secs_f64());
        }
    }

    fn record_batch_error(&self, error_type: &str) {
        if let Some(health) = &self.health {
            health
                .storage_batch_errors
                .with_label_values(&["document", error_type])
                .inc();
        }
    }
}

/// One bulk action.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentRequest {
    pub index: String,
    pub id: String,
    pub kind: WriteKind,
    pub source: Map<String, Json>,
}

impl DocumentRequest {
    /// Appends the action and source lines to an NDJSON body.
    fn write_ndjson(&self, buf: &mut Vec<u8>) -> Result<()> {
        let meta = json!({ "_index": self.index, "_id": self.id });
        let action = match self.kind {
            WriteKind::Insert => json!({ "index": meta }),
            WriteKind::Update => json!({ "update": meta }),
        };

        serde_json::to_writer(&mut *buf, &action).context("serializing bulk action")?;
        buf.push(b'\n');

        match self.kind {
            WriteKind::Insert => serde_json::to_writer(&mut *buf, &self.source),
            WriteKind::Update => serde_json::to_writer(&mut *buf, &json!({ "doc": self.source })),
        }
        .context("serializing bulk source")?;
        buf.push(b'\n');

        Ok(())
    }
}

pub struct DocumentBackend {
    transport: Arc<Transport>,
}

impl DocumentBackend {
    pub fn new(cfg: DocumentConfig, health: Option<Arc<HealthMetrics>>) -> Result<Self> {
        let base = Url::parse(&cfg.endpoint)
            .with_context(|| format!("parsing document endpoint {}", cfg.endpoint))?;

        let client = reqwest::Client::builder()
            .timeout(cfg.timeout)
            .build()
            .context("building HTTP client")?;

        Ok(Self {
            transport: Arc::new(Transport {
                client,
                base,
                cfg,
                health,
            }),
        })
    }

    fn connected(&self, up: bool) {
        if let Some(health) = &self.transport.health {
            health
                .storage_connected
                .with_label_values(&["document"])
                .set(if up { 1.0 } else { 0.0 });
        }
    }
}

#[derive(Debug, Deserialize)]
struct BulkResponse {
    #[serde(default)]
    errors: bool,
    #[serde(default)]
    items: Vec<Map<String, Json>>,
}

impl BatchSink for DocumentBackend {
    type Request = DocumentRequest;

    async fn batch_persistence(&self, requests: Vec<DocumentRequest>) -> Result<()> {
        if requests.is_empty() {
            return Ok(());
        }

        let t = &self.transport;
        let started = Instant::now();

        let mut buf = Vec::with_capacity(requests.len() * 256);
        for request in &requests {
            request.write_ndjson(&mut buf)?;
        }
        let raw_len = buf.len();

        let compressed = compress(&buf, &t.cfg.compression).context("compressing bulk body")?;

        let mut request = t
            .request(Method::POST, &["_bulk"])?
            .header("Content-Type", "application/x-ndjson")
            .body(compressed);

        if let Some(encoding) = content_encoding(&t.cfg.compression) {
            request = request.header("Content-Encoding", encoding);
        }

        let resp = match request.send().await {
            Ok(resp) => resp,
            Err(e) => {
                t.record_batch_error("request");
                return Err(e).context("sending bulk request");
            }
        };

        let status = resp.status();
        if !status.is_success() {
            // Drain body for connection reuse.
            let _ = resp.bytes().await;
            t.record_batch_error("status");
            bail!("bulk request unexpected status: {status}");
        }

        let body: BulkResponse = resp.json().await.context("decoding bulk response")?;
        t.observe("bulk", started);

        if body.errors {
            let failed: Vec<&Json> = body
                .items
                .iter()
                .filter_map(|item| item.values().next())
                .filter_map(|result| result.get("error"))
                .collect();

            t.record_batch_error("item");
            tracing::warn!(
                requests = requests.len(),
                failed = failed.len(),
                first_error = ?failed.first(),
                "bulk request partially applied",
            );
        } else {
            tracing::debug!(
                requests = requests.len(),
                bytes = raw_len,
                "bulk request applied",
            );
        }

        Ok(())
    }
}

impl StorageBackend for DocumentBackend {
    type Dao = DocumentDao;

    fn name(&self) -> &str {
        "document"
    }

    async fn start(&self) -> Result<()> {
        let resp = self
            .transport
            .request(Method::GET, &[])?
            .send()
            .await
            .context("connecting to document store");

        let up = matches!(&resp, Ok(r) if r.status().is_success());
        self.connected(up);

        let resp = resp?;
        let status = resp.status();
        if !status.is_success() {
            bail!("document store unexpected status: {status}");
        }

        tracing::info!(endpoint = %self.transport.base, "document store connected");
        Ok(())
    }

    async fn ensure_schema(&self, schema: &AttributeSchema) -> Result<()> {
        let t = &self.transport;
        let index = t.index_name(schema);

        let exists = t
            .request(Method::HEAD, &[&index])?
            .send()
            .await
            .with_context(|| format!("checking index {index}"))?;

        match exists.status() {
            s if s.is_success() => return Ok(()),
            StatusCode::NOT_FOUND => {}
            s => bail!("checking index {index}: unexpected status {s}"),
        }

        let resp = t
            .request(Method::PUT, &[&index])?
            .json(&index_mapping(schema))
            .send()
            .await
            .with_context(|| format!("creating index {index}"))?;

        let status = resp.status();
        let _ = resp.bytes().await;
        if !status.is_success() {
            bail!("creating index {index}: unexpected status {status}");
        }

        tracing::info!(index = %index, "created index");
        Ok(())
    }

    fn dao(&self, schema: Arc<AttributeSchema>) -> Result<DocumentDao> {
        Ok(DocumentDao {
            index: self.transport.index_name(&schema),
            schema,
            transport: Arc::clone(&self.transport),
        })
    }
}

pub struct DocumentDao {
    index: String,
    schema: Arc<AttributeSchema>,
    transport: Arc<Transport>,
}

#[derive(Debug, Deserialize)]
struct GetResponse {
    #[serde(default)]
    found: bool,
    #[serde(rename = "_source")]
    source: Option<Map<String, Json>>,
}

impl DocumentDao {
    fn request(&self, kind: WriteKind, record: &Record) -> Result<DocumentRequest> {
        Ok(DocumentRequest {
            index: self.index.clone(),
            id: record.id().to_string(),
            kind,
            source: to_source(&self.schema, record)?,
        })
    }
}

impl StorageDao for DocumentDao {
    type Request = DocumentRequest;

    async fn get(&self, id: &str) -> Result<Option<Record>> {
        let t = &self.transport;
        let started = Instant::now();

        let resp = t
            .request(Method::GET, &[&self.index, "_doc", id])?
            .send()
            .await
            .with_context(|| format!("fetching {}/{id}", self.index))?;

        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            let _ = resp.bytes().await;
            t.observe("get", started);
            return Ok(None);
        }
        if !status.is_success() {
            let _ = resp.bytes().await;
            bail!("fetching {}/{id}: unexpected status {status}", self.index);
        }

        let doc: GetResponse = resp
            .json()
            .await
            .with_context(|| format!("decoding {}/{id}", self.index))?;
        t.observe("get", started);

        match (doc.found, doc.source) {
            (true, Some(source)) => from_source(&self.schema, id, &source).map(Some),
            _ => Ok(None),
        }
    }

    fn prepare_batch_insert(&self, record: &Record) -> Result<DocumentRequest> {
        self.request(WriteKind::Insert, record)
    }

    fn prepare_batch_update(&self, record: &Record) -> Result<DocumentRequest> {
        self.request(WriteKind::Update, record)
    }
}

// --- JSON mapping ---

fn to_source(schema: &AttributeSchema, record: &Record) -> Result<Map<String, Json>> {
    schema
        .check(record)
        .with_context(|| format!("converting record {}", record.id()))?;

    let mut source = Map::with_capacity(schema.attribute_count());
    for (attr, value) in schema.attributes().iter().zip(record.values()) {
        let json = match value {
            Value::String(s) => Json::from(s.as_str()),
            Value::Int32(v) => Json::from(*v),
            Value::Int64(v) => Json::from(*v),
            Value::Bool(v) => Json::from(*v),
            Value::Bytes(b) => Json::from(BASE64.encode(b)),
        };
        source.insert(attr.name.clone(), json);
    }
    Ok(source)
}

/// Rebuilds a record from a stored document. Attributes missing from the
/// document take their type's default value.
fn from_source(schema: &AttributeSchema, id: &str, source: &Map<String, Json>) -> Result<Record> {
    let mut values = Vec::with_capacity(schema.attribute_count());

    for attr in schema.attributes() {
        let Some(json) = source.get(&attr.name).filter(|v| !v.is_null()) else {
            values.push(attr.ty.default_value());
            continue;
        };

        let value = match attr.ty {
            AttributeType::String => json.as_str().map(|s| Value::String(s.to_string())),
            AttributeType::Int32 => json
                .as_i64()
                .and_then(|v| i32::try_from(v).ok())
                .map(Value::Int32),
            AttributeType::Int64 => json.as_i64().map(Value::Int64),
            AttributeType::Bool => json.as_bool().map(Value::Bool),
            AttributeType::Bytes => match json.as_str() {
                Some(s) => Some(Value::Bytes(BASE64.decode(s).with_context(|| {
                    format!("decoding base64 attribute {} of {id}", attr.name)
                })?)),
                None => None,
            },
        };

        let Some(value) = value else {
            bail!(
                "document {id}: attribute {} is not a valid {}",
                attr.name,
                attr.ty.as_str()
            );
        };
        values.push(value);
    }

    Ok(Record::new(id, values))
}

fn index_mapping(schema: &AttributeSchema) -> Json {
    let properties: Map<String, Json> = schema
        .attributes()
        .iter()
        .map(|attr| {
            let ty = match attr.ty {
                AttributeType::String => "keyword",
                AttributeType::Int32 => "integer",
                AttributeType::Int64 => "long",
                AttributeType::Bool => "boolean",
                AttributeType::Bytes => "binary",
            };
            (attr.name.clone(), json!({ "type": ty }))
        })
        .collect();

    json!({ "mappings": { "properties": properties } })
}

// --- Compression ---

/// Compresses data using the specified algorithm.
fn compress(data: &[u8], algorithm: &str) -> Result<Vec<u8>> {
    match algorithm {
        "none" | "" => Ok(data.to_vec()),
        "gzip" => compress_gzip(data),
        "zlib" => compress_zlib(data),
        other => bail!("unsupported compression: {other}"),
    }
}

/// Returns the Content-Encoding header value for the algorithm.
fn content_encoding(algorithm: &str) -> Option<&'static str> {
    match algorithm {
        "gzip" => Some("gzip"),
        "zlib" => Some("deflate"),
        _ => None,
    }
}

fn compress_gzip(data: &[u8]) -> Result<Vec<u8>> {
    use flate2::write::GzEncoder;
    use flate2::Compression;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).context("gzip write")?;
    encoder.finish().context("gzip finish")
}

fn compress_zlib(data: &[u8]) -> Result<Vec<u8>> {
    use flate2::write::ZlibEncoder;
    use flate2::Compression;

    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).context("zlib write")?;
    encoder.finish().context("zlib finish")
}
