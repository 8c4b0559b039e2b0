use std::collections::HashSet;

use serde::Deserialize;
use thiserror::Error;

use super::record::{Record, Value};

/// Declared type of a single attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeType {
    String,
    Int32,
    Int64,
    Bytes,
    Bool,
}

impl AttributeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Int32 => "int32",
            Self::Int64 => "int64",
            Self::Bytes => "bytes",
            Self::Bool => "bool",
        }
    }

    /// Zero value for a freshly created record.
    pub fn default_value(&self) -> Value {
        match self {
            Self::String => Value::String(String::new()),
            Self::Int32 => Value::Int32(0),
            Self::Int64 => Value::Int64(0),
            Self::Bytes => Value::Bytes(Vec::new()),
            Self::Bool => Value::Bool(false),
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Self::Int32 | Self::Int64)
    }
}

/// How an incoming value combines with the value already held for the
/// same id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeOperation {
    /// Newest value wins.
    Cover,
    /// First value wins; later values are ignored.
    Non,
    /// Saturating numeric accumulation. Not idempotent.
    Sum,
    /// Smallest value seen.
    Min,
    /// Largest value seen.
    Max,
}

impl MergeOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cover => "cover",
            Self::Non => "non",
            Self::Sum => "sum",
            Self::Min => "min",
            Self::Max => "max",
        }
    }

    /// True for operations that require a numeric attribute.
    pub fn requires_numeric(&self) -> bool {
        matches!(self, Self::Sum | Self::Min | Self::Max)
    }
}

/// One `(name, type, merge)` column of a schema.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Attribute {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: AttributeType,
    #[serde(default = "default_merge")]
    pub merge: MergeOperation,
}

impl Attribute {
    pub fn new(name: impl Into<String>, ty: AttributeType, merge: MergeOperation) -> Self {
        Self {
            name: name.into(),
            ty,
            merge,
        }
    }
}

fn default_merge() -> MergeOperation {
    MergeOperation::Cover
}

/// Errors raised while building a schema or checking a record against it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchemaError {
    #[error("schema {schema}: no attributes declared")]
    Empty { schema: String },

    #[error("schema {schema}: attribute at ordinal {ordinal} has an empty name")]
    EmptyAttributeName { schema: String, ordinal: usize },

    #[error("schema {schema}: duplicate attribute {name}")]
    DuplicateAttribute { schema: String, name: String },

    #[error("schema {schema}: merge {merge} is not valid for {ty} attribute {name}")]
    InvalidMerge {
        schema: String,
        name: String,
        merge: &'static str,
        ty: &'static str,
    },

    #[error("record {id} for schema {schema}: expected {expected} values, got {found}")]
    Arity {
        schema: String,
        id: String,
        expected: usize,
        found: usize,
    },

    #[error("record {id} for schema {schema}: attribute {name} expects {expected}, got {found}")]
    ValueType {
        schema: String,
        id: String,
        name: String,
        expected: &'static str,
        found: &'static str,
    },
}

/// Ordered attribute list describing one aggregate record.
///
/// The ordinal of an attribute is its wire index (see
/// [`crate::remote::codec`]) and must not change without bumping
/// `version`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeSchema {
    name: String,
    version: u32,
    attributes: Vec<Attribute>,
}

impl AttributeSchema {
    /// Builds a schema, rejecting empty or duplicate attribute names and
    /// numeric merge operations on non-numeric attributes.
    pub fn new(
        name: impl Into<String>,
        version: u32,
        attributes: Vec<Attribute>,
    ) -> Result<Self, SchemaError> {
        let name = name.into();

        if attributes.is_empty() {
            return Err(SchemaError::Empty { schema: name });
        }

        let mut seen = HashSet::with_capacity(attributes.len());
        for (ordinal, attr) in attributes.iter().enumerate() {
            if attr.name.is_empty() {
                return Err(SchemaError::EmptyAttributeName {
                    schema: name,
                    ordinal,
                });
            }

            if !seen.insert(attr.name.as_str()) {
                return Err(SchemaError::DuplicateAttribute {
                    schema: name,
                    name: attr.name.clone(),
                });
            }

            if attr.merge.requires_numeric() && !attr.ty.is_numeric() {
                return Err(SchemaError::InvalidMerge {
                    schema: name.clone(),
                    name: attr.name.clone(),
                    merge: attr.merge.as_str(),
                    ty: attr.ty.as_str(),
                });
            }
        }

        Ok(Self {
            name,
            version,
            attributes,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    pub fn attribute_count(&self) -> usize {
        self.attributes.len()
    }

    /// Returns the ordinal of the named attribute.
    pub fn ordinal(&self, name: &str) -> Option<usize> {
        self.attributes.iter().position(|a| a.name == name)
    }

    /// Verifies arity and per-attribute value types.
    pub fn check(&self, record: &Record) -> Result<(), SchemaError> {
        let values = record.values();
        if values.len() != self.attributes.len() {
            return Err(SchemaError::Arity {
                schema: self.name.clone(),
                id: record.id().to_string(),
                expected: self.attributes.len(),
                found: values.len(),
            });
        }

        for (attr, value) in self.attributes.iter().zip(values) {
            let found = value.value_type();
            if found != attr.ty {
                return Err(SchemaError::ValueType {
                    schema: self.name.clone(),
                    id: record.id().to_string(),
                    name: attr.name.clone(),
                    expected: attr.ty.as_str(),
                    found: found.as_str(),
                });
            }
        }

        Ok(())
    }

    /// Creates a record holding the zero value of every attribute.
    pub fn empty_record(&self, id: impl Into<String>) -> Record {
        Record::new(
            id,
            self.attributes.iter().map(|a| a.ty.default_value()).collect(),
        )
    }

    /// Creates a record and checks it against this schema.
    pub fn record(&self, id: impl Into<String>, values: Vec<Value>) -> Result<Record, SchemaError> {
        let record = Record::new(id, values);
        self.check(&record)?;
        Ok(record)
    }
}
