//! redb-backed bucket adapter.
//!
//! One database file holds every bucket. Nested buckets become flat table
//! names (`docs/dog`, `index_docs/heavy`); per-bucket sequence counters
//! live in a dedicated `sequences` table. Transactions come straight from
//! redb: one writer at a time, readers see the last committed state.

use std::path::Path;

use quiver_types::{Error, Result};
use redb::{
    AccessGuard, Database, ReadableTable, StorageError, TableDefinition, TableError, TableHandle,
};
pub use redb::{ReadTransaction, WriteTransaction};

/// Database file name under the configured storage path.
pub const GRAPH_DB_FILE: &str = "graph.db";

pub const DOCS_PREFIX: &str = "docs/";
pub const CONNECTIONS_PREFIX: &str = "connections/";
pub const INDEX_DOCS_PREFIX: &str = "index_docs/";
pub const INDEX_CONNECTIONS_PREFIX: &str = "index_connections/";
pub const INDEXES: &str = "indexes";
pub const AUTHORIZERS: &str = "authorizers";

const SEQUENCES: TableDefinition<&str, u64> = TableDefinition::new("sequences");

type Bytes = &'static [u8];

fn def(name: &str) -> TableDefinition<'_, Bytes, Bytes> {
    TableDefinition::new(name)
}

fn internal(err: impl std::fmt::Display) -> Error {
    Error::Internal(err.to_string())
}

pub fn docs_bucket(gtype: &str) -> String {
    format!("{DOCS_PREFIX}{gtype}")
}

pub fn connections_bucket(gtype: &str) -> String {
    format!("{CONNECTIONS_PREFIX}{gtype}")
}

/// Bucket holding one index's materialized entries for docs or
/// connections.
pub fn index_bucket(connections: bool, name: &str) -> String {
    if connections {
        format!("{INDEX_CONNECTIONS_PREFIX}{name}")
    } else {
        format!("{INDEX_DOCS_PREFIX}{name}")
    }
}

pub fn indexes_bucket() -> String {
    INDEXES.to_string()
}

pub fn authorizers_bucket() -> String {
    AUTHORIZERS.to_string()
}

/// Handle to the single database file.
pub struct Backend {
    db: Database,
}

impl Backend {
    /// Open (or create) the database under `storage_path`, ensuring the
    /// flat top-level buckets exist.
    pub fn open(storage_path: &Path) -> Result<Self> {
        std::fs::create_dir_all(storage_path).map_err(internal)?;
        let db = Database::create(storage_path.join(GRAPH_DB_FILE)).map_err(internal)?;
        let backend = Self { db };
        backend.update(|wtx| {
            wtx.open_table(def(INDEXES)).map_err(internal)?;
            wtx.open_table(def(AUTHORIZERS)).map_err(internal)?;
            wtx.open_table(SEQUENCES).map_err(internal)?;
            Ok(())
        })?;
        Ok(backend)
    }

    /// Read-only transaction, concurrent with other viewers.
    pub fn view<T>(&self, f: impl FnOnce(&ReadTransaction) -> Result<T>) -> Result<T> {
        let rtx = self.db.begin_read().map_err(internal)?;
        f(&rtx)
    }

    /// Read-write transaction. The closure's error aborts the commit;
    /// nothing it wrote becomes visible.
    pub fn update<T>(&self, f: impl FnOnce(&WriteTransaction) -> Result<T>) -> Result<T> {
        let wtx = self.db.begin_write().map_err(internal)?;
        match f(&wtx) {
            Ok(value) => {
                wtx.commit().map_err(internal)?;
                Ok(value)
            }
            Err(err) => {
                let _ = wtx.abort();
                Err(err)
            }
        }
    }
}

/// Point read inside a viewer. A missing bucket reads as a missing key.
pub fn get(rtx: &ReadTransaction, bucket: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
    let table = match rtx.open_table(def(bucket)) {
        Ok(table) => table,
        Err(TableError::TableDoesNotExist(_)) => return Ok(None),
        Err(err) => return Err(internal(err)),
    };
    let value = table.get(key).map_err(internal)?;
    Ok(value.map(|guard| guard.value().to_vec()))
}

/// Point read inside the writer, without creating the bucket as a side
/// effect.
pub fn get_for_update(wtx: &WriteTransaction, bucket: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
    if !bucket_exists(wtx, bucket)? {
        return Ok(None);
    }
    let table = wtx.open_table(def(bucket)).map_err(internal)?;
    let value = table.get(key).map_err(internal)?;
    Ok(value.map(|guard| guard.value().to_vec()))
}

/// Put into a bucket, creating it if absent.
pub fn put(wtx: &WriteTransaction, bucket: &str, key: &[u8], value: &[u8]) -> Result<()> {
    let mut table = wtx.open_table(def(bucket)).map_err(internal)?;
    table.insert(key, value).map_err(internal)?;
    Ok(())
}

pub fn delete(wtx: &WriteTransaction, bucket: &str, key: &[u8]) -> Result<()> {
    let mut table = wtx.open_table(def(bucket)).map_err(internal)?;
    table.remove(key).map_err(internal)?;
    Ok(())
}

/// Iterate a bucket in key order; the callback returns false to stop.
/// Missing buckets surface as `NotFound`, matching read semantics.
pub fn for_each(
    rtx: &ReadTransaction,
    bucket: &str,
    mut f: impl FnMut(&[u8], &[u8]) -> Result<bool>,
) -> Result<()> {
    let table = match rtx.open_table(def(bucket)) {
        Ok(table) => table,
        Err(TableError::TableDoesNotExist(_)) => return Err(Error::NotFound),
        Err(err) => return Err(internal(err)),
    };
    for entry in table.iter().map_err(internal)? {
        let (key, value) = entry.map_err(internal)?;
        if !f(key.value(), value.value())? {
            break;
        }
    }
    Ok(())
}

/// Cursor scan from `start` (inclusive; empty means the bucket edge),
/// forward or reverse. Returns the last key examined so callers can
/// paginate.
pub fn seek(
    rtx: &ReadTransaction,
    bucket: &str,
    start: &[u8],
    reverse: bool,
    mut f: impl FnMut(&[u8], &[u8]) -> Result<bool>,
) -> Result<Vec<u8>> {
    let table = match rtx.open_table(def(bucket)) {
        Ok(table) => table,
        Err(TableError::TableDoesNotExist(_)) => return Err(Error::NotFound),
        Err(err) => return Err(internal(err)),
    };
    let mut last = Vec::new();
    if reverse {
        if start.is_empty() {
            scan(table.iter().map_err(internal)?.rev(), &mut f, &mut last)?;
        } else {
            scan(table.range::<&[u8]>(..=start).map_err(internal)?.rev(), &mut f, &mut last)?;
        }
    } else if start.is_empty() {
        scan(table.iter().map_err(internal)?, &mut f, &mut last)?;
    } else {
        scan(table.range::<&[u8]>(start..).map_err(internal)?, &mut f, &mut last)?;
    }
    Ok(last)
}

fn scan<'a, I>(
    iter: I,
    f: &mut impl FnMut(&[u8], &[u8]) -> Result<bool>,
    last: &mut Vec<u8>,
) -> Result<()>
where
    I: Iterator<
        Item = std::result::Result<(AccessGuard<'a, Bytes>, AccessGuard<'a, Bytes>), StorageError>,
    >,
{
    for entry in iter {
        let (key, value) = entry.map_err(internal)?;
        last.clear();
        last.extend_from_slice(key.value());
        if !f(key.value(), value.value())? {
            break;
        }
    }
    Ok(())
}

/// Create a bucket if it does not already exist.
pub fn ensure_bucket(wtx: &WriteTransaction, bucket: &str) -> Result<()> {
    wtx.open_table(def(bucket)).map_err(internal)?;
    Ok(())
}

/// Iterate a bucket inside the writer; a missing bucket reads as empty
/// (used by index backfill, which may run before any entity exists).
pub fn for_each_for_update(
    wtx: &WriteTransaction,
    bucket: &str,
    mut f: impl FnMut(&[u8], &[u8]) -> Result<bool>,
) -> Result<()> {
    if !bucket_exists(wtx, bucket)? {
        return Ok(());
    }
    let table = wtx.open_table(def(bucket)).map_err(internal)?;
    for entry in table.iter().map_err(internal)? {
        let (key, value) = entry.map_err(internal)?;
        if !f(key.value(), value.value())? {
            break;
        }
    }
    Ok(())
}

/// Bucket names under `prefix` as seen by the writer.
pub fn list_buckets_for_update(wtx: &WriteTransaction, prefix: &str) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for handle in wtx.list_tables().map_err(internal)? {
        if let Some(rest) = handle.name().strip_prefix(prefix) {
            names.push(rest.to_string());
        }
    }
    names.sort();
    Ok(names)
}

/// Advance and return the bucket's monotone counter.
pub fn next_sequence(wtx: &WriteTransaction, bucket: &str) -> Result<u64> {
    let mut table = wtx.open_table(SEQUENCES).map_err(internal)?;
    let next = table.get(bucket).map_err(internal)?.map(|guard| guard.value()).unwrap_or(0) + 1;
    table.insert(bucket, next).map_err(internal)?;
    Ok(next)
}

/// Bucket names under `prefix`, with the prefix stripped, sorted.
pub fn list_buckets(rtx: &ReadTransaction, prefix: &str) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for handle in rtx.list_tables().map_err(internal)? {
        if let Some(rest) = handle.name().strip_prefix(prefix) {
            names.push(rest.to_string());
        }
    }
    names.sort();
    Ok(names)
}

fn bucket_exists(wtx: &WriteTransaction, bucket: &str) -> Result<bool> {
    let mut tables = wtx.list_tables().map_err(internal)?;
    Ok(tables.any(|handle| handle.name() == bucket))
}

/// Drop a bucket and everything in it.
pub fn drop_bucket(wtx: &WriteTransaction, bucket: &str) -> Result<bool> {
    wtx.delete_table(def(bucket)).map_err(internal)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open() -> (tempfile::TempDir, Backend) {
        let dir = tempfile::tempdir().unwrap();
        let backend = Backend::open(dir.path()).unwrap();
        (dir, backend)
    }

    #[test]
    fn test_put_get_delete() {
        let (_dir, backend) = open();
        let bucket = docs_bucket("dog");

        backend.update(|wtx| put(wtx, &bucket, b"charlie", b"payload")).unwrap();

        let found = backend.view(|rtx| get(rtx, &bucket, b"charlie")).unwrap();
        assert_eq!(found.as_deref(), Some(&b"payload"[..]));

        backend.update(|wtx| delete(wtx, &bucket, b"charlie")).unwrap();
        let found = backend.view(|rtx| get(rtx, &bucket, b"charlie")).unwrap();
        assert!(found.is_none());
    }

    #[test]
    fn test_missing_bucket_reads_as_missing_key() {
        let (_dir, backend) = open();
        let found = backend.view(|rtx| get(rtx, &docs_bucket("nope"), b"k")).unwrap();
        assert!(found.is_none());
    }

    #[test]
    fn test_failed_update_aborts() {
        let (_dir, backend) = open();
        let bucket = docs_bucket("dog");

        let result: Result<()> = backend.update(|wtx| {
            put(wtx, &bucket, b"charlie", b"payload")?;
            Err(Error::Internal("boom".to_string()))
        });
        assert!(result.is_err());

        let found = backend.view(|rtx| get(rtx, &bucket, b"charlie")).unwrap();
        assert!(found.is_none());
    }

    #[test]
    fn test_for_each_in_key_order_with_stop() {
        let (_dir, backend) = open();
        let bucket = docs_bucket("dog");
        backend
            .update(|wtx| {
                put(wtx, &bucket, b"b", b"2")?;
                put(wtx, &bucket, b"a", b"1")?;
                put(wtx, &bucket, b"c", b"3")
            })
            .unwrap();

        let mut seen = Vec::new();
        backend
            .view(|rtx| {
                for_each(rtx, &bucket, |key, _| {
                    seen.push(key.to_vec());
                    Ok(seen.len() < 2)
                })
            })
            .unwrap();
        assert_eq!(seen, vec![b"a".to_vec(), b"b".to_vec()]);
    }

    #[test]
    fn test_seek_forward_and_reverse() {
        let (_dir, backend) = open();
        let bucket = docs_bucket("dog");
        backend
            .update(|wtx| {
                for key in [b"a", b"b", b"c", b"d"] {
                    put(wtx, &bucket, key, b"v")?;
                }
                Ok(())
            })
            .unwrap();

        let mut seen = Vec::new();
        let last = backend
            .view(|rtx| {
                seek(rtx, &bucket, b"b", false, |key, _| {
                    seen.push(key.to_vec());
                    Ok(true)
                })
            })
            .unwrap();
        assert_eq!(seen, vec![b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]);
        assert_eq!(last, b"d".to_vec());

        let mut seen = Vec::new();
        backend
            .view(|rtx| {
                seek(rtx, &bucket, b"b", true, |key, _| {
                    seen.push(key.to_vec());
                    Ok(true)
                })
            })
            .unwrap();
        assert_eq!(seen, vec![b"b".to_vec(), b"a".to_vec()]);
    }

    #[test]
    fn test_seek_missing_bucket_is_not_found() {
        let (_dir, backend) = open();
        let err = backend
            .view(|rtx| seek(rtx, &docs_bucket("nope"), b"", false, |_, _| Ok(true)))
            .unwrap_err();
        assert!(matches!(err, Error::NotFound));
    }

    #[test]
    fn test_sequences_are_per_bucket_and_monotone() {
        let (_dir, backend) = open();
        let seqs = backend
            .update(|wtx| {
                Ok((
                    next_sequence(wtx, "docs/dog")?,
                    next_sequence(wtx, "docs/dog")?,
                    next_sequence(wtx, "docs/cat")?,
                ))
            })
            .unwrap();
        assert_eq!(seqs, (1, 2, 1));
    }

    #[test]
    fn test_list_and_drop_buckets() {
        let (_dir, backend) = open();
        backend
            .update(|wtx| {
                put(wtx, &docs_bucket("dog"), b"a", b"1")?;
                put(wtx, &docs_bucket("cat"), b"b", b"2")?;
                put(wtx, &connections_bucket("owner"), b"c", b"3")
            })
            .unwrap();

        let types = backend.view(|rtx| list_buckets(rtx, DOCS_PREFIX)).unwrap();
        assert_eq!(types, vec!["cat".to_string(), "dog".to_string()]);

        backend.update(|wtx| drop_bucket(wtx, &docs_bucket("cat"))).unwrap();
        let types = backend.view(|rtx| list_buckets(rtx, DOCS_PREFIX)).unwrap();
        assert_eq!(types, vec!["dog".to_string()]);
    }
}
