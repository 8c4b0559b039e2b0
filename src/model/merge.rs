use thiserror::Error;

use super::record::{Record, Value};
use super::schema::{AttributeSchema, MergeOperation};

/// A stored and an incoming record could not be combined.
///
/// Always a schema-versioning defect rather than a data problem; the
/// caller drops the single record and keeps going.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MergeError {
    #[error(
        "merging {id} for schema {schema}: stored has {stored} values, incoming has {incoming}, schema declares {expected}"
    )]
    AttributeCount {
        schema: String,
        id: String,
        expected: usize,
        stored: usize,
        incoming: usize,
    },

    #[error("merging {id} for schema {schema}: attribute {name} expects {expected}, stored {stored}, incoming {incoming}")]
    TypeMismatch {
        schema: String,
        id: String,
        name: String,
        expected: &'static str,
        stored: &'static str,
        incoming: &'static str,
    },

    #[error("merging for schema {schema}: stored id {stored} differs from incoming id {incoming}")]
    IdMismatch {
        schema: String,
        stored: String,
        incoming: String,
    },
}

/// Merges `incoming` into `stored`, attribute by attribute.
///
/// `stored` is the older value. The whole pair is validated before any
/// attribute is touched, so `stored` is unchanged when an error is
/// returned.
pub fn merge_into(
    schema: &AttributeSchema,
    stored: &mut Record,
    incoming: &Record,
) -> Result<(), MergeError> {
    if stored.id() != incoming.id() {
        return Err(MergeError::IdMismatch {
            schema: schema.name().to_string(),
            stored: stored.id().to_string(),
            incoming: incoming.id().to_string(),
        });
    }

    let expected = schema.attribute_count();
    if stored.values().len() != expected || incoming.values().len() != expected {
        return Err(MergeError::AttributeCount {
            schema: schema.name().to_string(),
            id: incoming.id().to_string(),
            expected,
            stored: stored.values().len(),
            incoming: incoming.values().len(),
        });
    }

    for ((attr, old), new) in schema
        .attributes()
        .iter()
        .zip(stored.values())
        .zip(incoming.values())
    {
        let (old_ty, new_ty) = (old.value_type(), new.value_type());
        if old_ty != attr.ty || new_ty != attr.ty {
            return Err(MergeError::TypeMismatch {
                schema: schema.name().to_string(),
                id: incoming.id().to_string(),
                name: attr.name.clone(),
                expected: attr.ty.as_str(),
                stored: old_ty.as_str(),
                incoming: new_ty.as_str(),
            });
        }
    }

    for ((attr, old), new) in schema
        .attributes()
        .iter()
        .zip(stored.values_mut())
        .zip(incoming.values())
    {
        apply(attr.merge, old, new);
    }

    Ok(())
}

fn apply(op: MergeOperation, old: &mut Value, new: &Value) {
    match op {
        MergeOperation::Cover => {
            if old != new {
                old.clone_from(new);
            }
        }
        MergeOperation::Non => {}
        MergeOperation::Sum => match (old, new) {
            (Value::Int32(a), Value::Int32(b)) => *a = a.saturating_add(*b),
            (Value::Int64(a), Value::Int64(b)) => *a = a.saturating_add(*b),
            _ => {}
        },
        MergeOperation::Min => match (old, new) {
            (Value::Int32(a), Value::Int32(b)) => *a = (*a).min(*b),
            (Value::Int64(a), Value::Int64(b)) => *a = (*a).min(*b),
            _ => {}
        },
        MergeOperation::Max => match (old, new) {
            (Value::Int32(a), Value::Int32(b)) => *a = (*a).max(*b),
            (Value::Int64(a), Value::Int64(b)) => *a = (*a).max(*b),
            _ => {}
        },
    }
}
