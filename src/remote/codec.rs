//! Positional wire format for forwarding records between nodes.
//!
//! A record is flattened into four typed arrays by visiting the schema's
//! attributes in ordinal order: strings go to `strings`, int32 and bool
//! (as 0/1) go to `ints`, int64 goes to `longs`, bytes go to `bytes`.
//! Decoding walks the schema again with one cursor per array, so both
//! sides must agree on the schema version.
//!
//! Frame layout (all integers little-endian):
//!
//! ```text
//! str role | u32 version | str id
//! u32 n | n x str          strings
//! u32 n | n x i32          ints
//! u32 n | n x i64          longs
//! u32 n | n x (u32 len | bytes)
//! ```
//!
//! where `str` is `u32 len | utf-8 bytes`.

use thiserror::Error;

use crate::model::{AttributeSchema, AttributeType, Record, Value};

/// Upper bound for a single frame on the transport.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("frame truncated: needed {needed} bytes at offset {offset}")]
    Truncated { offset: usize, needed: usize },

    #[error("invalid utf-8 in {field}")]
    InvalidUtf8 { field: &'static str },

    #[error("{trailing} trailing bytes after frame")]
    TrailingBytes { trailing: usize },

    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    TooLarge { len: usize, max: usize },

    #[error("schema {schema} version mismatch: local {local}, remote {remote}")]
    VersionMismatch {
        schema: String,
        local: u32,
        remote: u32,
    },

    #[error("schema {schema} expects {expected} {array} values, frame has {actual}")]
    Arity {
        schema: String,
        array: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("attribute {attribute} of schema {schema} expects {expected}, got {actual}")]
    ValueType {
        schema: String,
        attribute: String,
        expected: &'static str,
        actual: &'static str,
    },
}

/// Attribute values of one record in four parallel arrays.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteData {
    pub strings: Vec<String>,
    pub ints: Vec<i32>,
    pub longs: Vec<i64>,
    pub bytes: Vec<Vec<u8>>,
}

/// Array lengths a schema produces.
#[derive(Debug, Default, PartialEq, Eq)]
struct Shape {
    strings: usize,
    ints: usize,
    longs: usize,
    bytes: usize,
}

impl Shape {
    fn of(schema: &AttributeSchema) -> Self {
        let mut shape = Self::default();
        for attr in schema.attributes() {
            match attr.ty {
                AttributeType::String => shape.strings += 1,
                AttributeType::Int32 | AttributeType::Bool => shape.ints += 1,
                AttributeType::Int64 => shape.longs += 1,
                AttributeType::Bytes => shape.bytes += 1,
            }
        }
        shape
    }
}

impl RemoteData {
    /// Flattens `record` in attribute order.
    pub fn from_record(schema: &AttributeSchema, record: &Record) -> Result<Self, WireError> {
        if record.values().len() != schema.attribute_count() {
            return Err(WireError::Arity {
                schema: schema.name().to_string(),
                array: "attribute",
                expected: schema.attribute_count(),
                actual: record.values().len(),
            });
        }

        let shape = Shape::of(schema);
        let mut data = Self {
            strings: Vec::with_capacity(shape.strings),
            ints: Vec::with_capacity(shape.ints),
            longs: Vec::with_capacity(shape.longs),
            bytes: Vec::with_capacity(shape.bytes),
        };

        for (attr, value) in schema.attributes().iter().zip(record.values()) {
            match (attr.ty, value) {
                (AttributeType::String, Value::String(s)) => data.strings.push(s.clone()),
                (AttributeType::Int32, Value::Int32(v)) => data.ints.push(*v),
                (AttributeType::Bool, Value::Bool(v)) => data.ints.push(i32::from(*v)),
                (AttributeType::Int64, Value::Int64(v)) => data.longs.push(*v),
                (AttributeType::Bytes, Value::Bytes(v)) => data.bytes.push(v.clone()),
                (expected, actual) => {
                    return Err(WireError::ValueType {
                        schema: schema.name().to_string(),
                        attribute: attr.name.clone(),
                        expected: expected.as_str(),
                        actual: actual.value_type().as_str(),
                    })
                }
            }
        }

        Ok(data)
    }

    /// Rebuilds a record by walking `schema` with one cursor per array.
    pub fn into_record(self, schema: &AttributeSchema, id: String) -> Result<Record, WireError> {
        let shape = Shape::of(schema);
        let arity = |array, expected, actual| {
            if expected == actual {
                Ok(())
            } else {
                Err(WireError::Arity {
                    schema: schema.name().to_string(),
                    array,
                    expected,
                    actual,
                })
            }
        };
        arity("string", shape.strings, self.strings.len())?;
        arity("int", shape.ints, self.ints.len())?;
        arity("long", shape.longs, self.longs.len())?;
        arity("bytes", shape.bytes, self.bytes.len())?;

        let mut strings = self.strings.into_iter();
        let mut ints = self.ints.into_iter();
        let mut longs = self.longs.into_iter();
        let mut bytes = self.bytes.into_iter();

        let mut values = Vec::with_capacity(schema.attribute_count());
        for attr in schema.attributes() {
            // Lengths were checked above, so every cursor has a next value.
            let value = match attr.ty {
                AttributeType::String => strings.next().map(Value::String),
                AttributeType::Int32 => ints.next().map(Value::Int32),
                AttributeType::Bool => ints.next().map(|v| Value::Bool(v != 0)),
                AttributeType::Int64 => longs.next().map(Value::Int64),
                AttributeType::Bytes => bytes.next().map(Value::Bytes),
            };
            values.push(value.unwrap_or_else(|| attr.ty.default_value()));
        }

        Ok(Record::new(id, values))
    }
}

/// One forwarded record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteMessage {
    pub role: String,
    pub version: u32,
    pub id: String,
    pub data: RemoteData,
}

impl RemoteMessage {
    pub fn from_record(
        role: &str,
        schema: &AttributeSchema,
        record: &Record,
    ) -> Result<Self, WireError> {
        Ok(Self {
            role: role.to_string(),
            version: schema.version(),
            id: record.id().to_string(),
            data: RemoteData::from_record(schema, record)?,
        })
    }

    /// Rebuilds the record, rejecting frames built for another schema
    /// version.
    pub fn into_record(self, schema: &AttributeSchema) -> Result<Record, WireError> {
        if self.version != schema.version() {
            return Err(WireError::VersionMismatch {
                schema: schema.name().to_string(),
                local: schema.version(),
                remote: self.version,
            });
        }
        self.data.into_record(schema, self.id)
    }

    /// Serializes the frame body (without the transport length prefix).
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len_hint());
        put_str(&mut buf, &self.role);
        buf.extend_from_slice(&self.version.to_le_bytes());
        put_str(&mut buf, &self.id);

        put_len(&mut buf, self.data.strings.len());
        for s in &self.data.strings {
            put_str(&mut buf, s);
        }

        put_len(&mut buf, self.data.ints.len());
        for v in &self.data.ints {
            buf.extend_from_slice(&v.to_le_bytes());
        }

        put_len(&mut buf, self.data.longs.len());
        for v in &self.data.longs {
            buf.extend_from_slice(&v.to_le_bytes());
        }

        put_len(&mut buf, self.data.bytes.len());
        for b in &self.data.bytes {
            put_len(&mut buf, b.len());
            buf.extend_from_slice(b);
        }

        buf
    }

    pub fn decode(frame: &[u8]) -> Result<Self, WireError> {
        if frame.len() > MAX_FRAME_LEN {
            return Err(WireError::TooLarge {
                len: frame.len(),
                max: MAX_FRAME_LEN,
            });
        }

        let mut r = Reader::new(frame);
        let role = r.string("role")?;
        let version = r.u32()?;
        let id = r.string("id")?;

        let n = r.count(4)?;
        let mut strings = Vec::with_capacity(n);
        for _ in 0..n {
            strings.push(r.string("strings")?);
        }

        let n = r.count(4)?;
        let mut ints = Vec::with_capacity(n);
        for _ in 0..n {
            ints.push(r.i32()?);
        }

        let n = r.count(8)?;
        let mut longs = Vec::with_capacity(n);
        for _ in 0..n {
            longs.push(r.i64()?);
        }

        let n = r.count(4)?;
        let mut bytes = Vec::with_capacity(n);
        for _ in 0..n {
            let len = r.u32()? as usize;
            bytes.push(r.take(len)?.to_vec());
        }

        r.finish()?;

        Ok(Self {
            role,
            version,
            id,
            data: RemoteData {
                strings,
                ints,
                longs,
                bytes,
            },
        })
    }

    fn encoded_len_hint(&self) -> usize {
        let strings: usize = self.data.strings.iter().map(|s| 4 + s.len()).sum();
        let bytes: usize = self.data.bytes.iter().map(|b| 4 + b.len()).sum();
        28 + self.role.len()
            + self.id.len()
            + strings
            + self.data.ints.len() * 4
            + self.data.longs.len() * 8
            + bytes
    }
}

fn put_len(buf: &mut Vec<u8>, len: usize) {
    buf.extend_from_slice(&(len as u32).to_le_bytes());
}

fn put_str(buf: &mut Vec<u8>, s: &str) {
    put_len(buf, s.len());
    buf.extend_from_slice(s.as_bytes());
}

/// Bounds-checked little-endian reader.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or(WireError::Truncated {
                offset: self.pos,
                needed: n,
            })?;
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], WireError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u32(&mut self) -> Result<u32, WireError> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn i32(&mut self) -> Result<i32, WireError> {
        Ok(i32::from_le_bytes(self.array()?))
    }

    fn i64(&mut self) -> Result<i64, WireError> {
        Ok(i64::from_le_bytes(self.array()?))
    }

    /// Reads an element count, rejecting counts the remaining bytes
    /// cannot possibly hold.
    fn count(&mut self, min_element_size: usize) -> Result<usize, WireError> {
        let n = self.u32()? as usize;
        let remaining = self.buf.len() - self.pos;
        if n.saturating_mul(min_element_size) > remaining {
            return Err(WireError::Truncated {
                offset: self.pos,
                needed: n.saturating_mul(min_element_size),
            });
        }
        Ok(n)
    }

    fn string(&mut self, field: &'static str) -> Result<String, WireError> {
        let len = self.u32()? as usize;
        let raw = self.take(len)?;
        std::str::from_utf8(raw)
            .map(str::to_string)
            .map_err(|_| WireError::InvalidUtf8 { field })
    }

    fn finish(self) -> Result<(), WireError> {
        match self.buf.len() - self.pos {
            0 => Ok(()),
            trailing => Err(WireError::TrailingBytes { trailing }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Attribute, MergeOperation};

    fn mixed_schema(version: u32) -> AttributeSchema {
        AttributeSchema::new(
            "instance",
            version,
            vec![
                Attribute::new("service", AttributeType::String, MergeOperation::Non),
                Attribute::new("heartbeat", AttributeType::Int64, MergeOperation::Cover),
                Attribute::new("port", AttributeType::Int32, MergeOperation::Cover),
                Attribute::new("alive", AttributeType::Bool, MergeOperation::Cover),
                Attribute::new("host", AttributeType::String, MergeOperation::Cover),
                Attribute::new("payload", AttributeType::Bytes, MergeOperation::Cover),
            ],
        )
        .expect("schema")
    }

    fn mixed_record() -> Record {
        Record::new(
            "202403051742_svc",
            vec![
                Value::from("svc"),
                Value::Int64(1_709_660_520_000),
                Value::Int32(8080),
                Value::Bool(true),
                Value::from("host-1"),
                Value::Bytes(vec![0, 1, 2, 255]),
            ],
        )
    }

    #[test]
    fn test_positional_layout() {
        let data = RemoteData::from_record(&mixed_schema(1), &mixed_record()).expect("flatten");

        assert_eq!(data.strings, vec!["svc".to_string(), "host-1".to_string()]);
        assert_eq!(data.ints, vec![8080, 1]);
        assert_eq!(data.longs, vec![1_709_660_520_000]);
        assert_eq!(data.bytes, vec![vec![0, 1, 2, 255]]);
    }

    #[test]
    fn test_frame_roundtrip_restores_record() {
        let schema = mixed_schema(3);
        let message = RemoteMessage::from_record("instance_heartbeat", &schema, &mixed_record())
            .expect("message");

        let decoded = RemoteMessage::decode(&message.encode()).expect("decode");
        assert_eq!(decoded, message);
        assert_eq!(decoded.into_record(&schema).expect("record"), mixed_record());
    }

    #[test]
    fn test_version_mismatch_rejected() {
        let message = RemoteMessage::from_record("r", &mixed_schema(1), &mixed_record())
            .expect("message");

        let err = message.into_record(&mixed_schema(2)).unwrap_err();
        assert!(matches!(
            err,
            WireError::VersionMismatch {
                local: 2,
                remote: 1,
                ..
            }
        ));
    }

    #[test]
    fn test_arity_mismatch_rejected() {
        let mut data = RemoteData::from_record(&mixed_schema(1), &mixed_record()).expect("flatten");
        data.longs.push(7);

        let err = data.into_record(&mixed_schema(1), "x".into()).unwrap_err();
        assert!(matches!(
            err,
            WireError::Arity {
                array: "long",
                expected: 1,
                actual: 2,
                ..
            }
        ));
    }

    #[test]
    fn test_value_type_mismatch_rejected() {
        let record = Record::new(
            "x",
            vec![
                Value::Int64(1),
                Value::Int64(1),
                Value::Int32(1),
                Value::Bool(false),
                Value::from("h"),
                Value::Bytes(Vec::new()),
            ],
        );
        let err = RemoteData::from_record(&mixed_schema(1), &record).unwrap_err();
        assert!(matches!(err, WireError::ValueType { expected: "string", actual: "int64", .. }));
    }

    #[test]
    fn test_truncated_frames_rejected() {
        let frame = RemoteMessage::from_record("r", &mixed_schema(1), &mixed_record())
            .expect("message")
            .encode();

        for cut in 0..frame.len() {
            assert!(
                RemoteMessage::decode(&frame[..cut]).is_err(),
                "prefix of {cut} bytes decoded"
            );
        }
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut frame = RemoteMessage::from_record("r", &mixed_schema(1), &mixed_record())
            .expect("message")
            .encode();
        frame.push(0);

        assert_eq!(
            RemoteMessage::decode(&frame).unwrap_err(),
            WireError::TrailingBytes { trailing: 1 }
        );
    }

    #[test]
    fn test_huge_count_does_not_allocate() {
        let mut frame = Vec::new();
        put_str(&mut frame, "r");
        frame.extend_from_slice(&1u32.to_le_bytes());
        put_str(&mut frame, "id");
        frame.extend_from_slice(&u32::MAX.to_le_bytes());

        assert!(matches!(
            RemoteMessage::decode(&frame).unwrap_err(),
            WireError::Truncated { .. }
        ));
    }
}
