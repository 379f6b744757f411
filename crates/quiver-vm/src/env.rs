//! Builders for the JSON values that programs are evaluated against.
//!
//! Each environment exposes exactly one root variable whose name matches
//! the [`EnvKind`](crate::EnvKind) the program was compiled for.

use quiver_types::{AuthRequest, Change, Connection, Doc, Message, Result};
use serde_json::{Map, Value};

fn wrap(root: &'static str, value: Value) -> Value {
    let mut map = Map::new();
    map.insert(root.to_string(), value);
    Value::Object(map)
}

/// `{ doc: { ref, attributes, metadata } }`
pub fn doc_env(doc: &Doc) -> Result<Value> {
    Ok(wrap("doc", serde_json::to_value(doc)?))
}

/// `{ connection: { ref, attributes, metadata, from, to, directed } }`
pub fn connection_env(connection: &Connection) -> Result<Value> {
    Ok(wrap("connection", serde_json::to_value(connection)?))
}

/// `{ request: { method, user, timestamp, request } }`
pub fn auth_env(request: &AuthRequest) -> Result<Value> {
    Ok(wrap("request", serde_json::to_value(request)?))
}

/// `{ message: { channel, data, sender, timestamp } }`
pub fn message_env(message: &Message) -> Result<Value> {
    Ok(wrap("message", serde_json::to_value(message)?))
}

/// `{ change: { method, identity, timestamp, doc_changes, connection_changes } }`
pub fn change_env(change: &Change) -> Result<Value> {
    Ok(wrap("change", serde_json::to_value(change)?))
}
