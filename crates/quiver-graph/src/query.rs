//! Read-path scans: primary and index bucket cursors, neighborhood
//! loads, and result ordering.

use std::cmp::Ordering;

use quiver_store::{backend as kv, codec};
use quiver_types::{Connection, Context, Doc, Error, Filter, Ref, Result, ANY_GTYPE};
use quiver_vm::Program;
use serde_json::Value;

/// Cursor scan for docs: primary bucket(s) or a named index bucket,
/// expression-filtered, limit-capped. Returns the matches and the last
/// key examined.
pub fn scan_docs(
    ctx: &Context,
    rtx: &kv::ReadTransaction,
    filter: &Filter,
    programs: &[Program],
) -> Result<(Vec<Doc>, String)> {
    let buckets = doc_buckets(rtx, filter)?;
    let start = filter.seek.clone().unwrap_or_default();
    let mut docs = Vec::new();
    let mut last = Vec::new();

    for bucket in buckets {
        ctx.err()?;
        last = kv::seek(rtx, &bucket, start.as_bytes(), filter.reverse, |_, value| {
            ctx.err()?;
            let doc: Doc = codec::decode(value)?;
            if quiver_vm::eval(&quiver_vm::doc_env(&doc)?, programs)? {
                docs.push(doc);
            }
            Ok(filter.limit == 0 || docs.len() < filter.limit)
        })?;
        if filter.limit != 0 && docs.len() >= filter.limit {
            break;
        }
    }
    Ok((docs, String::from_utf8_lossy(&last).into_owned()))
}

/// Cursor scan for connections; see [`scan_docs`].
pub fn scan_connections(
    ctx: &Context,
    rtx: &kv::ReadTransaction,
    filter: &Filter,
    programs: &[Program],
) -> Result<(Vec<Connection>, String)> {
    let buckets = connection_buckets(rtx, filter)?;
    let start = filter.seek.clone().unwrap_or_default();
    let mut connections = Vec::new();
    let mut last = Vec::new();

    for bucket in buckets {
        ctx.err()?;
        last = kv::seek(rtx, &bucket, start.as_bytes(), filter.reverse, |_, value| {
            ctx.err()?;
            let connection: Connection = codec::decode(value)?;
            if quiver_vm::eval(&quiver_vm::connection_env(&connection)?, programs)? {
                connections.push(connection);
            }
            Ok(filter.limit == 0 || connections.len() < filter.limit)
        })?;
        if filter.limit != 0 && connections.len() >= filter.limit {
            break;
        }
    }
    Ok((connections, String::from_utf8_lossy(&last).into_owned()))
}

fn doc_buckets(rtx: &kv::ReadTransaction, filter: &Filter) -> Result<Vec<String>> {
    if let Some(index) = filter.index.as_deref().filter(|name| !name.is_empty()) {
        return Ok(vec![kv::index_bucket(false, index)]);
    }
    if filter.gtype == ANY_GTYPE {
        Ok(kv::list_buckets(rtx, kv::DOCS_PREFIX)?
            .into_iter()
            .map(|gtype| kv::docs_bucket(&gtype))
            .collect())
    } else {
        Ok(vec![kv::docs_bucket(&filter.gtype)])
    }
}

fn connection_buckets(rtx: &kv::ReadTransaction, filter: &Filter) -> Result<Vec<String>> {
    if let Some(index) = filter.index.as_deref().filter(|name| !name.is_empty()) {
        return Ok(vec![kv::index_bucket(true, index)]);
    }
    if filter.gtype == ANY_GTYPE {
        Ok(kv::list_buckets(rtx, kv::CONNECTIONS_PREFIX)?
            .into_iter()
            .map(|gtype| kv::connections_bucket(&gtype))
            .collect())
    } else {
        Ok(vec![kv::connections_bucket(&filter.gtype)])
    }
}

/// Load the connection records behind a slice of adjacency refs, applying
/// a gtype filter and expression programs. Adjacency invariants make a
/// missing record an inconsistency, surfaced as `NotFound`.
pub fn load_connections(
    ctx: &Context,
    rtx: &kv::ReadTransaction,
    refs: &[Ref],
    gtype: &str,
    programs: &[Program],
    limit: usize,
) -> Result<Vec<Connection>> {
    let mut connections = Vec::new();
    for connection_ref in refs {
        ctx.err()?;
        if gtype != ANY_GTYPE && connection_ref.gtype != gtype {
            continue;
        }
        let bucket = kv::connections_bucket(&connection_ref.gtype);
        let bytes = kv::get(rtx, &bucket, connection_ref.gid.as_bytes())?
            .ok_or(Error::NotFound)?;
        let connection: Connection = codec::decode(&bytes)?;
        if quiver_vm::eval(&quiver_vm::connection_env(&connection)?, programs)? {
            connections.push(connection);
        }
        if limit != 0 && connections.len() >= limit {
            break;
        }
    }
    Ok(connections)
}

/// Order docs by an attribute path, or by ref string when none is given.
pub fn sort_docs(docs: &mut [Doc], sort: Option<&str>) {
    match sort.filter(|path| !path.is_empty()) {
        None => docs.sort_by_key(|doc| doc.ref_.to_string()),
        Some(path) => docs.sort_by(|a, b| {
            compare_values(&value_at(a, path), &value_at(b, path))
                .then_with(|| a.ref_.to_string().cmp(&b.ref_.to_string()))
        }),
    }
}

/// Order connections by an attribute path, or by ref string.
pub fn sort_connections(connections: &mut [Connection], sort: Option<&str>) {
    match sort.filter(|path| !path.is_empty()) {
        None => connections.sort_by_key(|connection| connection.ref_.to_string()),
        Some(path) => connections.sort_by(|a, b| {
            compare_values(&value_at(a, path), &value_at(b, path))
                .then_with(|| a.ref_.to_string().cmp(&b.ref_.to_string()))
        }),
    }
}

/// Navigate a dotted path from the entity's JSON root
/// (e.g. `attributes.weight` or `metadata.sequence`).
fn value_at<T: serde::Serialize>(entity: &T, path: &str) -> Option<Value> {
    let mut current = serde_json::to_value(entity).ok()?;
    for segment in path.split('.') {
        current = current.get(segment)?.clone();
    }
    Some(current)
}

fn compare_values(a: &Option<Value>, b: &Option<Value>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => match (a, b) {
            (Value::Number(a), Value::Number(b)) => a
                .as_f64()
                .partial_cmp(&b.as_f64())
                .unwrap_or(Ordering::Equal),
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            _ => Ordering::Equal,
        },
    }
}
