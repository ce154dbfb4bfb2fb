//! Value types for the keyspace

use bytes::Bytes;

use super::zset::SortedSet;

/// A stored value.
///
/// The engine's command surface only operates on sorted sets. The `String`
/// variant exists so the keyspace can hold foreign values placed there by an
/// embedding layer and still report honest type tags and WRONGTYPE errors
/// for them; no string command surface is exposed.
#[derive(Debug, Clone)]
pub enum Value {
    /// Opaque binary-safe blob.
    String(Bytes),

    /// Set of unique members ordered by (score, member).
    SortedSet(SortedSet),
}

impl Value {
    /// Create a string value.
    pub fn string(bytes: impl Into<Bytes>) -> Self {
        Value::String(bytes.into())
    }

    /// Create an empty sorted set.
    pub fn empty_zset() -> Self {
        Value::SortedSet(SortedSet::new())
    }

    /// Type tag as reported by `TYPE`.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::String(_) => "string",
            Value::SortedSet(_) => "zset",
        }
    }

    /// Try to get as a sorted set reference.
    pub fn as_zset(&self) -> Option<&SortedSet> {
        match self {
            Value::SortedSet(set) => Some(set),
            _ => None,
        }
    }

    /// Try to get as a mutable sorted set.
    pub fn as_zset_mut(&mut self) -> Option<&mut SortedSet> {
        match self {
            Value::SortedSet(set) => Some(set),
            _ => None,
        }
    }

    /// Approximate heap footprint in bytes.
    pub fn memory_usage(&self) -> usize {
        match self {
            Value::String(bytes) => bytes.len(),
            Value::SortedSet(set) => set.memory_usage(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_names() {
        assert_eq!(Value::string("hello").type_name(), "string");
        assert_eq!(Value::empty_zset().type_name(), "zset");
    }

    #[test]
    fn test_zset_accessors() {
        let mut value = Value::empty_zset();
        assert!(value.as_zset().is_some());
        assert!(value.as_zset_mut().is_some());

        let mut other = Value::string("nope");
        assert!(other.as_zset().is_none());
        assert!(other.as_zset_mut().is_none());
    }
}
