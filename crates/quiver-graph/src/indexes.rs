//! Secondary index descriptors, their compiled programs, and the
//! create/backfill/drop lifecycle.

use std::collections::BTreeMap;

use quiver_store::{backend as kv, codec};
use quiver_types::{Connection, Context, Doc, Error, Index, Result};
use quiver_vm::{EnvKind, Program};

/// An index descriptor with its programs compiled once at load time.
#[derive(Debug, Clone)]
pub struct CachedIndex {
    pub descriptor: Index,
    pub doc_program: Option<Program>,
    pub connection_program: Option<Program>,
}

impl CachedIndex {
    /// Compile the descriptor's expression for each entity kind it
    /// covers; fails with `InvalidExpression`.
    pub fn compile(descriptor: Index) -> Result<Self> {
        if descriptor.name.is_empty() {
            return Err(Error::InvalidExpression("index name must not be empty".to_string()));
        }
        if !descriptor.docs && !descriptor.connections {
            return Err(Error::InvalidExpression(format!(
                "index {:?} covers neither docs nor connections",
                descriptor.name
            )));
        }
        let doc_program = if descriptor.docs {
            Some(quiver_vm::program(EnvKind::Doc, &descriptor.expression)?)
        } else {
            None
        };
        let connection_program = if descriptor.connections {
            Some(quiver_vm::program(EnvKind::Connection, &descriptor.expression)?)
        } else {
            None
        };
        Ok(Self { descriptor, doc_program, connection_program })
    }

    pub fn matches_gtype(&self, gtype: &str) -> bool {
        self.descriptor.gtype == quiver_types::ANY_GTYPE || self.descriptor.gtype == gtype
    }
}

/// Compiled indexes keyed by name; shared read-mostly behind the graph's
/// rwlock.
pub type IndexCache = BTreeMap<String, CachedIndex>;

/// Load and compile every persisted index descriptor.
pub fn load(rtx: &kv::ReadTransaction) -> Result<IndexCache> {
    let mut cache = IndexCache::new();
    match kv::for_each(rtx, kv::INDEXES, |_, value| {
        let descriptor: Index = codec::decode(value)?;
        let cached = CachedIndex::compile(descriptor)?;
        cache.insert(cached.descriptor.name.clone(), cached);
        Ok(true)
    }) {
        Ok(()) | Err(Error::NotFound) => Ok(cache),
        Err(err) => Err(err),
    }
}

/// Persist the descriptor, create its buckets, and backfill them by
/// scanning every entity of the matching kind. Runs inside the creating
/// transaction; this is the only full-scan write path.
pub fn create(
    ctx: &Context,
    wtx: &kv::WriteTransaction,
    cached: &mut CachedIndex,
) -> Result<()> {
    ctx.err()?;
    cached.descriptor.sequence = kv::next_sequence(wtx, kv::INDEXES)?;
    let bytes = codec::encode(&cached.descriptor)?;
    kv::put(wtx, kv::INDEXES, cached.descriptor.name.as_bytes(), &bytes)?;

    if cached.descriptor.docs {
        kv::ensure_bucket(wtx, &kv::index_bucket(false, &cached.descriptor.name))?;
        backfill_docs(ctx, wtx, cached)?;
    }
    if cached.descriptor.connections {
        kv::ensure_bucket(wtx, &kv::index_bucket(true, &cached.descriptor.name))?;
        backfill_connections(ctx, wtx, cached)?;
    }
    Ok(())
}

/// Remove the descriptor and drop the index buckets.
pub fn delete(ctx: &Context, wtx: &kv::WriteTransaction, descriptor: &Index) -> Result<()> {
    ctx.err()?;
    kv::delete(wtx, kv::INDEXES, descriptor.name.as_bytes())?;
    if descriptor.docs {
        kv::drop_bucket(wtx, &kv::index_bucket(false, &descriptor.name))?;
    }
    if descriptor.connections {
        kv::drop_bucket(wtx, &kv::index_bucket(true, &descriptor.name))?;
    }
    Ok(())
}

fn backfill_docs(ctx: &Context, wtx: &kv::WriteTransaction, cached: &CachedIndex) -> Result<()> {
    let program = match &cached.doc_program {
        Some(program) => std::slice::from_ref(program),
        None => return Ok(()),
    };
    let buckets = if cached.descriptor.gtype == quiver_types::ANY_GTYPE {
        kv::list_buckets_for_update(wtx, kv::DOCS_PREFIX)?
    } else {
        vec![cached.descriptor.gtype.clone()]
    };
    let index_bucket = kv::index_bucket(false, &cached.descriptor.name);

    for gtype in buckets {
        ctx.err()?;
        let mut matched: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
        kv::for_each_for_update(wtx, &kv::docs_bucket(&gtype), |key, value| {
            ctx.err()?;
            let doc: Doc = codec::decode(value)?;
            if quiver_vm::eval(&quiver_vm::doc_env(&doc)?, program)? {
                matched.push((key.to_vec(), value.to_vec()));
            }
            Ok(true)
        })?;
        for (key, value) in matched {
            kv::put(wtx, &index_bucket, &key, &value)?;
        }
    }
    Ok(())
}

fn backfill_connections(
    ctx: &Context,
    wtx: &kv::WriteTransaction,
    cached: &CachedIndex,
) -> Result<()> {
    let program = match &cached.connection_program {
        Some(program) => std::slice::from_ref(program),
        None => return Ok(()),
    };
    let buckets = if cached.descriptor.gtype == quiver_types::ANY_GTYPE {
        kv::list_buckets_for_update(wtx, kv::CONNECTIONS_PREFIX)?
    } else {
        vec![cached.descriptor.gtype.clone()]
    };
    let index_bucket = kv::index_bucket(true, &cached.descriptor.name);

    for gtype in buckets {
        ctx.err()?;
        let mut matched: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
        kv::for_each_for_update(wtx, &kv::connections_bucket(&gtype), |key, value| {
            ctx.err()?;
            let connection: Connection = codec::decode(value)?;
            if quiver_vm::eval(&quiver_vm::connection_env(&connection)?, program)? {
                matched.push((key.to_vec(), value.to_vec()));
            }
            Ok(true)
        })?;
        for (key, value) in matched {
            kv::put(wtx, &index_bucket, &key, &value)?;
        }
    }
    Ok(())
}
