//! Entity and attribute model.
//!
//! A schema is plain data: an ordered list of `(name, type, merge)`
//! attributes. Records carry one value per attribute, addressed by
//! ordinal, and are combined with [`merge_into`].

pub mod merge;
pub mod record;
pub mod schema;
pub mod time_bucket;

pub use merge::{merge_into, MergeError};
pub use record::{Record, Value};
pub use schema::{Attribute, AttributeSchema, AttributeType, MergeOperation, SchemaError};
