use super::schema::AttributeType;

/// A single typed attribute value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Value {
    String(String),
    Int32(i32),
    Int64(i64),
    Bytes(Vec<u8>),
    Bool(bool),
}

impl Value {
    /// Returns the attribute type this value satisfies.
    pub fn value_type(&self) -> AttributeType {
        match self {
            Self::String(_) => AttributeType::String,
            Self::Int32(_) => AttributeType::Int32,
            Self::Int64(_) => AttributeType::Int64,
            Self::Bytes(_) => AttributeType::Bytes,
            Self::Bool(_) => AttributeType::Bool,
        }
    }

    /// Widens integer values to i64.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int32(v) => Some(i64::from(*v)),
            Self::Int64(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int64(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

/// One aggregate instance: an id plus one value per schema attribute.
///
/// Records are moved into worker queues and buffers; they are never
/// shared by reference between tasks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    id: String,
    values: Vec<Value>,
}

impl Record {
    /// Creates a record without validating it against a schema.
    ///
    /// Use [`AttributeSchema::record`](super::AttributeSchema::record) when
    /// the values come from untrusted input.
    pub fn new(id: impl Into<String>, values: Vec<Value>) -> Self {
        Self {
            id: id.into(),
            values,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn values_mut(&mut self) -> &mut [Value] {
        &mut self.values
    }

    /// Returns the value at the given attribute ordinal.
    pub fn get(&self, ordinal: usize) -> Option<&Value> {
        self.values.get(ordinal)
    }

    pub fn into_parts(self) -> (String, Vec<Value>) {
        (self.id, self.values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_type_matches_variant() {
        assert_eq!(Value::from("a").value_type(), AttributeType::String);
        assert_eq!(Value::from(1i32).value_type(), AttributeType::Int32);
        assert_eq!(Value::from(1i64).value_type(), AttributeType::Int64);
        assert_eq!(Value::from(vec![1u8]).value_type(), AttributeType::Bytes);
        assert_eq!(Value::from(true).value_type(), AttributeType::Bool);
    }

    #[test]
    fn test_as_i64_widens_int32() {
        assert_eq!(Value::Int32(-7).as_i64(), Some(-7));
        assert_eq!(Value::Int64(i64::MAX).as_i64(), Some(i64::MAX));
        assert_eq!(Value::Bool(true).as_i64(), None);
    }

    #[test]
    fn test_record_accessors() {
        let mut record = Record::new("svc-a", vec![Value::from("svc-a"), Value::Int64(3)]);
        assert_eq!(record.id(), "svc-a");
        assert_eq!(record.get(1), Some(&Value::Int64(3)));
        assert_eq!(record.get(2), None);

        record.values_mut()[1] = Value::Int64(9);
        let (id, values) = record.into_parts();
        assert_eq!(id, "svc-a");
        assert_eq!(values[1], Value::Int64(9));
    }
}
