//! Writer-transaction entity operations: stamping, puts, deletes, and the
//! secondary-index bookkeeping that rides along with every mutation.

use chrono::Utc;
use quiver_store::backend::WriteTransaction;
use quiver_store::{backend as kv, codec};
use quiver_types::{Connection, Context, Doc, Error, Metadata, Ref, Result};

use crate::adjacency::{Adjacency, AdjacencyBatch};
use crate::indexes::IndexCache;

/// Fill creation fields iff unset, refresh mutation fields, and advance
/// the version past whatever is stored so it strictly increases even
/// when the caller hands in a stale or zeroed entity.
fn stamp(ctx: &Context, meta: &mut Metadata, existing: Option<&Metadata>) {
    let now = Utc::now();
    if meta.created_at.is_none() {
        meta.created_at = Some(now);
    }
    if meta.created_by.is_none() {
        meta.created_by = Some(ctx.identity_ref().clone());
    }
    meta.updated_at = Some(now);
    meta.updated_by = Some(ctx.identity_ref().clone());

    let floor = existing.map(|m| m.version).unwrap_or(0).max(meta.version);
    meta.version = floor + 1;

    if meta.sequence == 0 {
        if let Some(existing) = existing {
            meta.sequence = existing.sequence;
        }
    }
}

fn decode_opt<T: serde::de::DeserializeOwned>(bytes: Option<Vec<u8>>) -> Result<Option<T>> {
    bytes.map(|bytes| codec::decode(&bytes)).transpose()
}

/// Point read inside the writer; `NotFound` when absent.
pub fn get_doc(wtx: &WriteTransaction, ref_: &Ref) -> Result<Doc> {
    let bucket = kv::docs_bucket(&ref_.gtype);
    decode_opt(kv::get_for_update(wtx, &bucket, ref_.gid.as_bytes())?)?.ok_or(Error::NotFound)
}

/// Point read inside the writer; `NotFound` when absent.
pub fn get_connection(wtx: &WriteTransaction, ref_: &Ref) -> Result<Connection> {
    let bucket = kv::connections_bucket(&ref_.gtype);
    decode_opt(kv::get_for_update(wtx, &bucket, ref_.gid.as_bytes())?)?.ok_or(Error::NotFound)
}

/// Persist a doc and re-evaluate every doc index against it.
pub fn set_doc(
    ctx: &Context,
    wtx: &WriteTransaction,
    indexes: &IndexCache,
    mut doc: Doc,
) -> Result<Doc> {
    ctx.err()?;
    doc.ref_ = doc.ref_.clone().or_new_gid();
    let bucket = kv::docs_bucket(&doc.ref_.gtype);

    let existing: Option<Doc> = decode_opt(kv::get_for_update(wtx, &bucket, doc.ref_.gid.as_bytes())?)?;
    stamp(ctx, &mut doc.metadata, existing.as_ref().map(|d| &d.metadata));
    if doc.metadata.sequence == 0 {
        doc.metadata.sequence = kv::next_sequence(wtx, &bucket)?;
    }

    let bytes = codec::encode(&doc)?;
    kv::put(wtx, &bucket, doc.ref_.gid.as_bytes(), &bytes)?;
    apply_doc_indexes(ctx, wtx, indexes, &doc, &bytes)?;
    Ok(doc)
}

/// Persist a connection after checking both endpoints exist, stage its
/// adjacency entries, and re-evaluate every connection index.
pub fn set_connection(
    ctx: &Context,
    wtx: &WriteTransaction,
    indexes: &IndexCache,
    batch: &mut AdjacencyBatch,
    mut connection: Connection,
) -> Result<Connection> {
    ctx.err()?;
    for endpoint in [&connection.from, &connection.to] {
        let bucket = kv::docs_bucket(&endpoint.gtype);
        if kv::get_for_update(wtx, &bucket, endpoint.gid.as_bytes())?.is_none() {
            return Err(Error::EndpointMissing(endpoint.to_string()));
        }
    }

    connection.ref_ = connection.ref_.clone().or_new_gid();
    let bucket = kv::connections_bucket(&connection.ref_.gtype);

    let existing: Option<Connection> =
        decode_opt(kv::get_for_update(wtx, &bucket, connection.ref_.gid.as_bytes())?)?;
    stamp(ctx, &mut connection.metadata, existing.as_ref().map(|c| &c.metadata));
    if connection.metadata.sequence == 0 {
        connection.metadata.sequence = kv::next_sequence(wtx, &bucket)?;
    }

    let bytes = codec::encode(&connection)?;
    kv::put(wtx, &bucket, connection.ref_.gid.as_bytes(), &bytes)?;

    // A rewrite may move endpoints; retire the old entries first.
    if let Some(existing) = &existing {
        batch.push_remove(
            existing.ref_.clone(),
            existing.from.clone(),
            existing.to.clone(),
            existing.directed,
        );
    }
    batch.push_add(
        connection.ref_.clone(),
        connection.from.clone(),
        connection.to.clone(),
        connection.directed,
    );

    apply_connection_indexes(ctx, wtx, indexes, &connection, &bytes)?;
    Ok(connection)
}

/// Delete a doc, cascading over every incident connection first.
pub fn del_doc(
    ctx: &Context,
    wtx: &WriteTransaction,
    indexes: &IndexCache,
    adjacency: &Adjacency,
    batch: &mut AdjacencyBatch,
    ref_: &Ref,
) -> Result<(Doc, Vec<Connection>)> {
    ctx.err()?;
    let bucket = kv::docs_bucket(&ref_.gtype);
    let doc = get_doc(wtx, ref_)?;

    let mut cascaded = Vec::new();
    for connection_ref in adjacency.incident(&ref_.to_string()) {
        ctx.err()?;
        match del_connection(ctx, wtx, indexes, batch, &connection_ref) {
            Ok(connection) => cascaded.push(connection),
            // Another endpoint of an undirected pair may already be gone.
            Err(Error::NotFound) => {}
            Err(err) => return Err(err),
        }
    }

    for cached in indexes.values() {
        if cached.descriptor.docs && cached.matches_gtype(&ref_.gtype) {
            kv::delete(wtx, &kv::index_bucket(false, &cached.descriptor.name), ref_.gid.as_bytes())?;
        }
    }

    kv::delete(wtx, &bucket, ref_.gid.as_bytes())?;
    Ok((doc, cascaded))
}

/// Delete a connection from its bucket, the adjacency maps, and every
/// connection index.
pub fn del_connection(
    ctx: &Context,
    wtx: &WriteTransaction,
    indexes: &IndexCache,
    batch: &mut AdjacencyBatch,
    ref_: &Ref,
) -> Result<Connection> {
    ctx.err()?;
    let bucket = kv::connections_bucket(&ref_.gtype);
    let connection: Connection = match kv::get_for_update(wtx, &bucket, ref_.gid.as_bytes())? {
        Some(bytes) => codec::decode(&bytes)?,
        None => return Err(Error::NotFound),
    };

    batch.push_remove(
        connection.ref_.clone(),
        connection.from.clone(),
        connection.to.clone(),
        connection.directed,
    );

    for cached in indexes.values() {
        if cached.descriptor.connections && cached.matches_gtype(&ref_.gtype) {
            kv::delete(wtx, &kv::index_bucket(true, &cached.descriptor.name), ref_.gid.as_bytes())?;
        }
    }

    kv::delete(wtx, &bucket, ref_.gid.as_bytes())?;
    Ok(connection)
}

/// Re-evaluate doc indexes for one write. Evaluation failures are logged
/// and leave that index's entry unchanged; the write itself never fails
/// on an index program.
fn apply_doc_indexes(
    ctx: &Context,
    wtx: &WriteTransaction,
    indexes: &IndexCache,
    doc: &Doc,
    bytes: &[u8],
) -> Result<()> {
    for cached in indexes.values() {
        ctx.err()?;
        if !cached.descriptor.docs || !cached.matches_gtype(&doc.ref_.gtype) {
            continue;
        }
        let programs = match &cached.doc_program {
            Some(program) => std::slice::from_ref(program),
            None => continue,
        };
        let bucket = kv::index_bucket(false, &cached.descriptor.name);
        let env = match quiver_vm::doc_env(doc) {
            Ok(env) => env,
            Err(err) => {
                tracing::warn!(index = %cached.descriptor.name, error = %err, "failed to evaluate index");
                continue;
            }
        };
        match quiver_vm::eval(&env, programs) {
            Ok(true) => kv::put(wtx, &bucket, doc.ref_.gid.as_bytes(), bytes)?,
            Ok(false) => kv::delete(wtx, &bucket, doc.ref_.gid.as_bytes())?,
            Err(err) => {
                tracing::warn!(index = %cached.descriptor.name, error = %err, "failed to evaluate index");
            }
        }
    }
    Ok(())
}

/// Connection-side twin of [`apply_doc_indexes`].
fn apply_connection_indexes(
    ctx: &Context,
    wtx: &WriteTransaction,
    indexes: &IndexCache,
    connection: &Connection,
    bytes: &[u8],
) -> Result<()> {
    for cached in indexes.values() {
        ctx.err()?;
        if !cached.descriptor.connections || !cached.matches_gtype(&connection.ref_.gtype) {
            continue;
        }
        let programs = match &cached.connection_program {
            Some(program) => std::slice::from_ref(program),
            None => continue,
        };
        let bucket = kv::index_bucket(true, &cached.descriptor.name);
        let env = match quiver_vm::connection_env(connection) {
            Ok(env) => env,
            Err(err) => {
                tracing::warn!(index = %cached.descriptor.name, error = %err, "failed to evaluate index");
                continue;
            }
        };
        match quiver_vm::eval(&env, programs) {
            Ok(true) => kv::put(wtx, &bucket, connection.ref_.gid.as_bytes(), bytes)?,
            Ok(false) => kv::delete(wtx, &bucket, connection.ref_.gid.as_bytes())?,
            Err(err) => {
                tracing::warn!(index = %cached.descriptor.name, error = %err, "failed to evaluate index");
            }
        }
    }
    Ok(())
}
