//! # Quiver Types
//!
//! Shared type definitions for the Quiver graph database.
//!
//! This crate provides the entity model (docs, connections, refs,
//! metadata), the filter and change-feed types, the request context, and
//! the error enum surfaced at every boundary, ensuring a single source of
//! truth and preventing circular dependencies between the other crates.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

pub mod context;

pub use context::{cancel_pair, CancelHandle, CancelToken, Context};

/// Reserved gtype for identity documents.
pub const USER_GTYPE: &str = "user";

/// Wildcard gtype matching any type partition in queries.
pub const ANY_GTYPE: &str = "*";

// ============================================================================
// Error Types
// ============================================================================

/// Errors surfaced at the operation boundary.
#[derive(Debug, Error)]
pub enum Error {
    /// Missing doc/connection/index/bucket on read or delete.
    #[error("not found")]
    NotFound,

    /// A connection write referenced a `from` or `to` doc that is not present.
    #[error("endpoint missing: {0}")]
    EndpointMissing(String),

    /// Compile failure for any expression (index, authorizer, filter).
    #[error("invalid expression: {0}")]
    InvalidExpression(String),

    /// Absent/invalid token, JWKS lookup failure, or userinfo failure.
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    /// An authorizer program evaluated to false.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Context cancellation observed.
    #[error("cancelled")]
    Cancelled,

    /// A subscriber fell behind its buffer and was dropped.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Codec errors, KV I/O errors.
    #[error("internal: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Internal(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

// ============================================================================
// Core Entity Types
// ============================================================================

/// An entity address: a type partition plus an id unique within it.
///
/// The string form `gtype/gid` doubles as the deterministic sort key for
/// adjacency traversal order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Ref {
    pub gtype: String,
    pub gid: String,
}

impl Ref {
    pub fn new(gtype: impl Into<String>, gid: impl Into<String>) -> Self {
        Self { gtype: gtype.into(), gid: gid.into() }
    }

    /// Address of an identity doc for the given email claim.
    pub fn user(email: impl Into<String>) -> Self {
        Self::new(USER_GTYPE, email)
    }

    /// Fill in a fresh UUID when the caller left the gid blank.
    pub fn or_new_gid(mut self) -> Self {
        if self.gid.is_empty() {
            self.gid = Uuid::new_v4().to_string();
        }
        self
    }

    pub fn is_wildcard(&self) -> bool {
        self.gtype == ANY_GTYPE
    }
}

impl fmt::Display for Ref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.gtype, self.gid)
    }
}

/// Mutation bookkeeping stamped onto every entity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    /// Ref of the identity doc that created the entity.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_by: Option<Ref>,
    /// Ref of the identity doc that last mutated the entity.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_by: Option<Ref>,
    /// Strictly increases on every successful write.
    #[serde(default)]
    pub version: u64,
    /// Per-bucket monotone counter assigned at first insert.
    #[serde(default)]
    pub sequence: u64,
}

/// A vertex entity: typed address plus an ordered attribute map.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Doc {
    #[serde(rename = "ref")]
    pub ref_: Ref,
    #[serde(default)]
    pub attributes: Map<String, Value>,
    #[serde(default)]
    pub metadata: Metadata,
    /// Fields from newer schema revisions, preserved on round-trip.
    /// An empty map flattens to nothing, so it never shows on the wire.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Doc {
    pub fn new(ref_: Ref) -> Self {
        Self { ref_, ..Default::default() }
    }

    pub fn with_attributes(mut self, attributes: Map<String, Value>) -> Self {
        self.attributes = attributes;
        self
    }

    /// The email attribute, when present (identity docs always carry one).
    pub fn email(&self) -> Option<&str> {
        self.attributes.get("email").and_then(Value::as_str)
    }
}

/// An edge entity between two refs, optionally directed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    #[serde(rename = "ref")]
    pub ref_: Ref,
    #[serde(default)]
    pub attributes: Map<String, Value>,
    #[serde(default)]
    pub metadata: Metadata,
    pub from: Ref,
    pub to: Ref,
    #[serde(default)]
    pub directed: bool,
    /// Fields from newer schema revisions, preserved on round-trip.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Connection {
    pub fn new(ref_: Ref, from: Ref, to: Ref, directed: bool) -> Self {
        Self { ref_, from, to, directed, ..Default::default() }
    }
}

// ============================================================================
// Index & Authorizer Descriptors
// ============================================================================

/// A persistent materialized filter over entities of one kind and gtype.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Index {
    /// Unique key; doubles as the index bucket name.
    pub name: String,
    pub gtype: String,
    /// Source text of the filter expression.
    pub expression: String,
    /// Whether the index covers docs.
    #[serde(default)]
    pub docs: bool,
    /// Whether the index covers connections.
    #[serde(default)]
    pub connections: bool,
    #[serde(default)]
    pub sequence: u64,
}

/// A policy expression evaluated against the request context; all
/// registered authorizers must return true for a request to proceed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Authorizer {
    pub name: String,
    pub expression: String,
}

// ============================================================================
// Query Types
// ============================================================================

/// Search parameters shared by doc and connection queries.
///
/// When `index` is set, the scan runs over the named index bucket instead
/// of the primary bucket. `limit == 0` means no cap.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Filter {
    pub gtype: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
    #[serde(default)]
    pub limit: usize,
    /// Attribute path to order results by; ref string order when empty.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sort: Option<String>,
    /// Inclusive cursor start key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seek: Option<String>,
    #[serde(default)]
    pub reverse: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<String>,
}

impl Filter {
    pub fn gtype(gtype: impl Into<String>) -> Self {
        Self { gtype: gtype.into(), ..Default::default() }
    }

    pub fn with_expression(mut self, expression: impl Into<String>) -> Self {
        self.expression = Some(expression.into());
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_index(mut self, index: impl Into<String>) -> Self {
        self.index = Some(index.into());
        self
    }
}

/// Neighborhood query rooted at one doc.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionFilter {
    pub doc_ref: Ref,
    pub gtype: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
    #[serde(default)]
    pub limit: usize,
}

/// Query results plus the pagination cursor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Docs {
    pub docs: Vec<Doc>,
    /// Last key examined; feed back as `seek` to resume.
    pub seek_next: String,
}

/// Query results plus the pagination cursor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Connections {
    pub connections: Vec<Connection>,
    /// Last key examined; feed back as `seek` to resume.
    pub seek_next: String,
}

/// A connection with both endpoint docs resolved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionDetail {
    pub connection: Connection,
    pub from: Doc,
    pub to: Doc,
}

/// A doc with its neighborhoods resolved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocDetail {
    pub doc: Doc,
    pub connections_from: Vec<ConnectionDetail>,
    pub connections_to: Vec<ConnectionDetail>,
}

/// Neighborhood selection for [`DocDetail`] queries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DetailFilter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connections_from: Option<ConnectionFilter>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connections_to: Option<ConnectionFilter>,
}

/// A full dump of the graph, as produced by export and consumed by import.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphDump {
    pub docs: Vec<Doc>,
    pub connections: Vec<Connection>,
}

/// Doc and connection type partitions currently present.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Schema {
    pub doc_types: Vec<String>,
    pub connection_types: Vec<String>,
}

/// Attribute patch applied to one entity.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Patch {
    #[serde(rename = "ref")]
    pub ref_: Ref,
    pub attributes: Map<String, Value>,
}

/// Attribute patch applied to every entity a filter matches.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PatchFilter {
    pub filter: Filter,
    pub attributes: Map<String, Value>,
}

// ============================================================================
// Messaging & Change Feed
// ============================================================================

/// A client-published message on a named channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub channel: String,
    pub data: Map<String, Value>,
    /// Ref of the identity doc that published the message.
    pub sender: Ref,
    pub timestamp: DateTime<Utc>,
}

/// Before/after images of one doc mutation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocChange {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before: Option<Doc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after: Option<Doc>,
}

/// Before/after images of one connection mutation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionChange {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before: Option<Connection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after: Option<Connection>,
}

/// An event describing a committed mutation, delivered on the `changes`
/// topic strictly after the commit succeeds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    /// Operation name the mutating request invoked.
    pub method: String,
    pub identity: Doc,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub doc_changes: Vec<DocChange>,
    #[serde(default)]
    pub connection_changes: Vec<ConnectionChange>,
}

/// The context every authorizer program is evaluated against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthRequest {
    pub method: String,
    pub user: Doc,
    pub timestamp: DateTime<Utc>,
    /// JSON form of the request payload.
    pub request: Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ref_display_is_sort_key() {
        let a = Ref::new("dog", "charlie");
        assert_eq!(a.to_string(), "dog/charlie");
        let b = Ref::new("dog", "rex");
        assert!(a.to_string() < b.to_string());
    }

    #[test]
    fn test_ref_or_new_gid() {
        let blank = Ref::new("dog", "").or_new_gid();
        assert!(!blank.gid.is_empty());

        let kept = Ref::new("dog", "charlie").or_new_gid();
        assert_eq!(kept.gid, "charlie");
    }

    #[test]
    fn test_doc_round_trip_preserves_unknown_fields() {
        let raw = serde_json::json!({
            "ref": {"gtype": "dog", "gid": "charlie"},
            "attributes": {"name": "Charlie"},
            "metadata": {"version": 1, "sequence": 1},
            "shard_hint": "future-field"
        });
        let doc: Doc = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(doc.extra.get("shard_hint").and_then(Value::as_str), Some("future-field"));

        let back = serde_json::to_value(&doc).unwrap();
        assert_eq!(back.get("shard_hint"), raw.get("shard_hint"));
    }

    #[test]
    fn test_attribute_order_round_trip() {
        let mut attrs = Map::new();
        attrs.insert("zebra".to_string(), Value::from(1));
        attrs.insert("alpha".to_string(), Value::from(2));
        let doc = Doc::new(Ref::new("dog", "charlie")).with_attributes(attrs);

        let bytes = serde_json::to_vec(&doc).unwrap();
        let decoded: Doc = serde_json::from_slice(&bytes).unwrap();
        let keys: Vec<_> = decoded.attributes.keys().cloned().collect();
        assert_eq!(keys, vec!["zebra".to_string(), "alpha".to_string()]);
        assert_eq!(serde_json::to_vec(&decoded).unwrap(), bytes);
    }

    #[test]
    fn test_error_from_serde() {
        let err = serde_json::from_str::<Doc>("not json").unwrap_err();
        let err: Error = err.into();
        assert!(matches!(err, Error::Internal(_)));
    }
}
