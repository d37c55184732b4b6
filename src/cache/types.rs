//! Core type definitions for the query cache: keys, hashes, statuses and stats

use crate::error::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::borrow::Borrow;
use std::fmt;

/// Ordered description of "what to fetch", e.g. `["todos", {"page": 2}]`
///
/// Two keys are equal iff their canonical encodings are byte-equal, so
/// `{"a": 1, "b": 2}` and `{"b": 2, "a": 1}` address the same query.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryKey(Vec<Value>);

impl QueryKey {
    /// Create a key from its parts
    pub fn new<I, V>(parts: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Self(parts.into_iter().map(Into::into).collect())
    }

    /// Build a key from any serializable value
    ///
    /// Arrays and tuples become the key's parts; any other value becomes a
    /// single-part key.
    pub fn from_serialize<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        Ok(Self::from(serde_json::to_value(value)?))
    }

    /// Key parts in order
    pub fn parts(&self) -> &[Value] {
        &self.0
    }

    /// Number of parts
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check if the key has no parts
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Canonical hash of this key
    pub fn hash(&self) -> QueryHash {
        hash_key(self)
    }

    /// Compare two keys by canonical encoding
    pub fn matches(&self, other: &QueryKey) -> bool {
        canonical_encoding(self) == canonical_encoding(other)
    }
}

impl PartialEq for QueryKey {
    fn eq(&self, other: &Self) -> bool {
        self.matches(other)
    }
}

impl Eq for QueryKey {}

impl From<Vec<Value>> for QueryKey {
    fn from(parts: Vec<Value>) -> Self {
        Self(parts)
    }
}

/// Arrays become the key's parts; any other value becomes a single part
impl From<Value> for QueryKey {
    fn from(value: Value) -> Self {
        match value {
            Value::Array(parts) => Self(parts),
            other => Self(vec![other]),
        }
    }
}

impl From<&str> for QueryKey {
    fn from(part: &str) -> Self {
        Self(vec![Value::String(part.to_string())])
    }
}

impl From<String> for QueryKey {
    fn from(part: String) -> Self {
        Self(vec![Value::String(part)])
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&canonical_encoding(self))
    }
}

/// Build a [`QueryKey`] from JSON-like parts
///
/// Parts use `serde_json::json!` array syntax, so negative numbers and
/// arbitrary expressions work too.
///
/// ```
/// use ouroboros_query::query_key;
///
/// let key = query_key!["todos", { "page": 2, "done": false }, -1];
/// assert_eq!(key.len(), 3);
/// ```
#[macro_export]
macro_rules! query_key {
    ($($parts:tt)*) => {
        $crate::cache::QueryKey::from($crate::__serde_json::json!([$($parts)*]))
    };
}

/// Canonical encoding of a [`QueryKey`]; the store's primary key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryHash(String);

impl QueryHash {
    /// Hash as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for QueryHash {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for QueryHash {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueryHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Derive the canonical hash of a key
pub fn hash_key(key: &QueryKey) -> QueryHash {
    QueryHash(canonical_encoding(key))
}

/// JSON encoding with object fields sorted at every depth.
///
/// Field order is sorted explicitly rather than relying on the map type
/// serde_json happens to be compiled with.
fn canonical_encoding(key: &QueryKey) -> String {
    let mut out = String::with_capacity(16 * key.len().max(1));
    out.push('[');
    for (i, part) in key.0.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        write_canonical(part, &mut out);
    }
    out.push(']');
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut fields: Vec<(&String, &Value)> = map.iter().collect();
            fields.sort_by(|a, b| a.0.cmp(b.0));

            out.push('{');
            for (i, (name, field)) in fields.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // Display on a string Value yields the escaped, quoted form
                out.push_str(&Value::String(name.clone()).to_string());
                out.push(':');
                write_canonical(field, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Resolution status of a query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryStatus {
    /// No resolution attempt has completed yet
    #[default]
    Pending,

    /// The last resolution attempt failed
    Error,

    /// Data resolved without error
    Success,
}

impl fmt::Display for QueryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryStatus::Pending => write!(f, "pending"),
            QueryStatus::Error => write!(f, "error"),
            QueryStatus::Success => write!(f, "success"),
        }
    }
}

/// Whether a resolution is currently running
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchStatus {
    /// A fetch is in flight
    Fetching,

    /// A fetch wants to run but waits on an external condition
    Paused,

    /// Nothing is running
    #[default]
    Idle,
}

impl fmt::Display for FetchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchStatus::Fetching => write!(f, "fetching"),
            FetchStatus::Paused => write!(f, "paused"),
            FetchStatus::Idle => write!(f, "idle"),
        }
    }
}

/// Statistics for query cache monitoring
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct QueryCacheStats {
    /// Lookups (`get`/`find`) that found a query
    pub hits: u64,

    /// Lookups that found nothing
    pub misses: u64,

    /// Number of queries currently stored
    pub queries: usize,

    /// Total `added` events emitted
    pub added: u64,

    /// Total `removed` events emitted
    pub removed: u64,

    /// Removals triggered by an expired gc timer
    pub evicted: u64,

    /// Total `updated` events emitted
    pub updated: u64,

    /// Listener calls that panicked during a broadcast
    pub listener_failures: u64,
}

impl QueryCacheStats {
    /// Lookup hit rate as a percentage
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }

    /// Lookup miss rate as a percentage
    pub fn miss_rate(&self) -> f64 {
        100.0 - self.hit_rate()
    }
}

impl fmt::Display for QueryCacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "QueryCacheStats {{ queries: {}, hits: {}, misses: {}, hit_rate: {:.2}%, added: {}, removed: {}, evicted: {} }}",
            self.queries,
            self.hits,
            self.misses,
            self.hit_rate(),
            self.added,
            self.removed,
            self.evicted
        )
    }
}
