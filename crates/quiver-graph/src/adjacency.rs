//! In-memory adjacency maps: endpoint ref string → sorted connection refs.
//!
//! The maps are the only shared mutable state outside the database file.
//! Writers stage their mutations in an [`AdjacencyBatch`] while the
//! transaction runs and apply it only after the commit returns, under the
//! write half of the graph's rwlock, so a reader that acquires the lock
//! after the writer releases it sees storage and maps move together.

use std::collections::BTreeMap;

use quiver_types::Ref;

#[derive(Debug, Clone)]
enum AdjacencyOp {
    Add { connection: Ref, from: Ref, to: Ref, directed: bool },
    Remove { connection: Ref, from: Ref, to: Ref, directed: bool },
}

/// Mutations staged by one writer transaction.
#[derive(Debug, Default)]
pub struct AdjacencyBatch {
    ops: Vec<AdjacencyOp>,
}

impl AdjacencyBatch {
    pub fn push_add(&mut self, connection: Ref, from: Ref, to: Ref, directed: bool) {
        self.ops.push(AdjacencyOp::Add { connection, from, to, directed });
    }

    pub fn push_remove(&mut self, connection: Ref, from: Ref, to: Ref, directed: bool) {
        self.ops.push(AdjacencyOp::Remove { connection, from, to, directed });
    }
}

/// `from` and `to` neighbor indexes. An undirected connection occupies
/// both directions for both endpoints.
#[derive(Debug, Default)]
pub struct Adjacency {
    from: BTreeMap<String, Vec<Ref>>,
    to: BTreeMap<String, Vec<Ref>>,
}

impl Adjacency {
    /// Connection refs leaving the doc, in ref-string order.
    pub fn from_refs(&self, doc_key: &str) -> &[Ref] {
        self.from.get(doc_key).map(Vec::as_slice).unwrap_or_default()
    }

    /// Connection refs arriving at the doc, in ref-string order.
    pub fn to_refs(&self, doc_key: &str) -> &[Ref] {
        self.to.get(doc_key).map(Vec::as_slice).unwrap_or_default()
    }

    /// Every connection ref incident to the doc, deduplicated.
    pub fn incident(&self, doc_key: &str) -> Vec<Ref> {
        let mut refs: Vec<Ref> = self
            .from_refs(doc_key)
            .iter()
            .chain(self.to_refs(doc_key))
            .cloned()
            .collect();
        refs.sort();
        refs.dedup();
        refs
    }

    /// Register a connection directly; used by the startup rebuild scan.
    pub fn add(&mut self, connection: &Ref, from: &Ref, to: &Ref, directed: bool) {
        insert_sorted(self.from.entry(from.to_string()).or_default(), connection);
        insert_sorted(self.to.entry(to.to_string()).or_default(), connection);
        if !directed {
            insert_sorted(self.to.entry(from.to_string()).or_default(), connection);
            insert_sorted(self.from.entry(to.to_string()).or_default(), connection);
        }
    }

    fn remove(&mut self, connection: &Ref, from: &Ref, to: &Ref, directed: bool) {
        remove_ref(&mut self.from, &from.to_string(), connection);
        remove_ref(&mut self.to, &to.to_string(), connection);
        if !directed {
            remove_ref(&mut self.to, &from.to_string(), connection);
            remove_ref(&mut self.from, &to.to_string(), connection);
        }
    }

    /// Apply a committed writer's staged mutations.
    pub fn apply(&mut self, batch: AdjacencyBatch) {
        for op in batch.ops {
            match op {
                AdjacencyOp::Add { connection, from, to, directed } => {
                    self.add(&connection, &from, &to, directed)
                }
                AdjacencyOp::Remove { connection, from, to, directed } => {
                    self.remove(&connection, &from, &to, directed)
                }
            }
        }
    }
}

fn insert_sorted(list: &mut Vec<Ref>, connection: &Ref) {
    match list.binary_search(connection) {
        // Already present; re-writing a connection must not duplicate it.
        Ok(_) => {}
        Err(position) => list.insert(position, connection.clone()),
    }
}

/// Keep only entries whose `(gtype, gid)` differs from the target.
fn remove_ref(map: &mut BTreeMap<String, Vec<Ref>>, doc_key: &str, connection: &Ref) {
    if let Some(list) = map.get_mut(doc_key) {
        list.retain(|r| r.gtype != connection.gtype || r.gid != connection.gid);
        if list.is_empty() {
            map.remove(doc_key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn refs(gids: &[&str]) -> Vec<Ref> {
        gids.iter().map(|gid| Ref::new("owner", *gid)).collect()
    }

    #[test]
    fn test_directed_add_and_remove() {
        let mut adj = Adjacency::default();
        let conn = Ref::new("owner", "e1");
        let from = Ref::new("dog", "charlie");
        let to = Ref::new("human", "alice");

        adj.add(&conn, &from, &to, true);
        assert_eq!(adj.from_refs("dog/charlie"), refs(&["e1"]).as_slice());
        assert_eq!(adj.to_refs("human/alice"), refs(&["e1"]).as_slice());
        assert!(adj.to_refs("dog/charlie").is_empty());
        assert!(adj.from_refs("human/alice").is_empty());

        adj.remove(&conn, &from, &to, true);
        assert!(adj.from_refs("dog/charlie").is_empty());
        assert!(adj.to_refs("human/alice").is_empty());
    }

    #[test]
    fn test_undirected_occupies_both_directions() {
        let mut adj = Adjacency::default();
        let conn = Ref::new("owner", "e1");
        let from = Ref::new("dog", "charlie");
        let to = Ref::new("human", "alice");

        adj.add(&conn, &from, &to, false);
        assert_eq!(adj.from_refs("dog/charlie"), refs(&["e1"]).as_slice());
        assert_eq!(adj.from_refs("human/alice"), refs(&["e1"]).as_slice());
        assert_eq!(adj.to_refs("dog/charlie"), refs(&["e1"]).as_slice());
        assert_eq!(adj.to_refs("human/alice"), refs(&["e1"]).as_slice());

        adj.remove(&conn, &from, &to, false);
        assert!(adj.incident("dog/charlie").is_empty());
        assert!(adj.incident("human/alice").is_empty());
    }

    #[test]
    fn test_entries_stay_sorted_and_deduplicated() {
        let mut adj = Adjacency::default();
        let from = Ref::new("dog", "charlie");
        let to = Ref::new("human", "alice");

        for gid in ["e2", "e1", "e3", "e1"] {
            adj.add(&Ref::new("owner", gid), &from, &to, true);
        }
        assert_eq!(adj.from_refs("dog/charlie"), refs(&["e1", "e2", "e3"]).as_slice());
    }

    #[test]
    fn test_batch_applies_in_order() {
        let mut adj = Adjacency::default();
        let from = Ref::new("dog", "charlie");
        let to = Ref::new("human", "alice");

        let mut batch = AdjacencyBatch::default();
        batch.push_add(Ref::new("owner", "e1"), from.clone(), to.clone(), true);
        batch.push_add(Ref::new("owner", "e2"), from.clone(), to.clone(), true);
        batch.push_remove(Ref::new("owner", "e1"), from.clone(), to.clone(), true);
        adj.apply(batch);

        assert_eq!(adj.from_refs("dog/charlie"), refs(&["e2"]).as_slice());
        assert_eq!(adj.incident("human/alice"), refs(&["e2"]));
    }
}
