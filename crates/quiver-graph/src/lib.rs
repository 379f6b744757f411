//! # Quiver Graph
//!
//! The storage-and-query core: a transactional document/connection store
//! over the KV backend, the in-memory adjacency index, the secondary
//! index manager, and the operation surface the RPC layer exposes.
//!
//! Writer discipline: the backend serializes writers; adjacency mutations
//! are staged during the transaction and applied under the adjacency
//! write lock only after the commit returns, so any reader acquiring the
//! lock afterwards sees storage and maps in lock-step. Change events
//! publish strictly after the commit succeeds.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use quiver_bus::{Bus, Event, Subscription, CHANGES_TOPIC};
use quiver_store::{backend as kv, codec, Backend};
use quiver_types::{
    cancel_pair, Authorizer, CancelHandle, CancelToken, Change, Connection, ConnectionChange,
    ConnectionDetail, ConnectionFilter, Connections, Context, DetailFilter, Doc, DocChange,
    DocDetail, Docs, Error, Filter, GraphDump, Index, Message, Patch, PatchFilter, Ref, Result,
    Schema, ANY_GTYPE,
};
use quiver_vm::{EnvKind, Program};
use serde_json::{Map, Value};
use tokio::sync::RwLock;

mod adjacency;
mod authorizers;
mod indexes;
mod query;
mod store;

use adjacency::{Adjacency, AdjacencyBatch};
use authorizers::{AuthorizerCache, CachedAuthorizer};
use indexes::{CachedIndex, IndexCache};

/// The graph database handle. Cheap to share behind an [`Arc`].
pub struct Graph {
    backend: Backend,
    adjacency: RwLock<Adjacency>,
    indexes: RwLock<IndexCache>,
    authorizers: RwLock<AuthorizerCache>,
    bus: Arc<Bus>,
    shutdown: CancelHandle,
    shutdown_token: CancelToken,
}

impl Graph {
    /// Open the database under `storage_path`, rebuild the adjacency maps
    /// by scanning every connection bucket, compile the persisted index
    /// and authorizer expressions, and register the boot authorizers.
    pub fn open(storage_path: &Path, bus: Arc<Bus>, boot_authorizers: &[String]) -> Result<Self> {
        let backend = Backend::open(storage_path)?;

        let mut adjacency = Adjacency::default();
        let (index_cache, mut authorizer_cache) = backend.view(|rtx| {
            for gtype in kv::list_buckets(rtx, kv::CONNECTIONS_PREFIX)? {
                kv::for_each(rtx, &kv::connections_bucket(&gtype), |_, value| {
                    let connection: Connection = codec::decode(value)?;
                    adjacency.add(
                        &connection.ref_,
                        &connection.from,
                        &connection.to,
                        connection.directed,
                    );
                    Ok(true)
                })?;
            }
            Ok((indexes::load(rtx)?, authorizers::load(rtx)?))
        })?;

        for (i, expression) in boot_authorizers.iter().enumerate() {
            if expression.trim().is_empty() {
                continue;
            }
            let cached = CachedAuthorizer::compile(Authorizer {
                name: format!("boot-{i}"),
                expression: expression.clone(),
            })?;
            backend.update(|wtx| authorizers::persist(wtx, &cached.descriptor))?;
            authorizer_cache.insert(cached.descriptor.name.clone(), cached);
        }

        tracing::info!(
            path = %storage_path.display(),
            indexes = index_cache.len(),
            authorizers = authorizer_cache.len(),
            "graph opened"
        );

        let (shutdown, shutdown_token) = cancel_pair();
        Ok(Self {
            backend,
            adjacency: RwLock::new(adjacency),
            indexes: RwLock::new(index_cache),
            authorizers: RwLock::new(authorizer_cache),
            bus,
            shutdown,
            shutdown_token,
        })
    }

    pub fn bus(&self) -> &Arc<Bus> {
        &self.bus
    }

    /// Fires when [`Graph::shutdown`] is called; background tasks watch
    /// this to stop.
    pub fn on_shutdown(&self) -> CancelToken {
        self.shutdown_token.clone()
    }

    pub fn shutdown(&self) {
        tracing::info!("graph shutting down");
        self.shutdown.cancel();
    }

    pub async fn ping(&self, ctx: &Context) -> Result<String> {
        ctx.err()?;
        Ok("PONG".to_string())
    }

    pub async fn get_schema(&self, ctx: &Context) -> Result<Schema> {
        ctx.err()?;
        self.backend.view(|rtx| {
            Ok(Schema {
                doc_types: kv::list_buckets(rtx, kv::DOCS_PREFIX)?,
                connection_types: kv::list_buckets(rtx, kv::CONNECTIONS_PREFIX)?,
            })
        })
    }

    pub async fn doc_types(&self, ctx: &Context) -> Result<Vec<String>> {
        Ok(self.get_schema(ctx).await?.doc_types)
    }

    pub async fn connection_types(&self, ctx: &Context) -> Result<Vec<String>> {
        Ok(self.get_schema(ctx).await?.connection_types)
    }

    // ========================================================================
    // Docs
    // ========================================================================

    pub async fn create_doc(&self, ctx: &Context, doc: Doc) -> Result<Doc> {
        let mut docs = self.create_docs(ctx, vec![doc]).await?;
        docs.pop().ok_or_else(|| Error::Internal("empty create result".to_string()))
    }

    /// Batch create/overwrite in a single writer transaction; fails all
    /// on any error.
    pub async fn create_docs(&self, ctx: &Context, docs: Vec<Doc>) -> Result<Vec<Doc>> {
        ctx.err()?;
        let indexes = self.indexes.read().await;
        let mut created = self.backend.update(|wtx| {
            docs.into_iter()
                .map(|doc| store::set_doc(ctx, wtx, &indexes, doc))
                .collect::<Result<Vec<_>>>()
        })?;
        drop(indexes);

        let changes = created
            .iter()
            .map(|doc| DocChange { before: None, after: Some(doc.clone()) })
            .collect();
        self.publish_change(ctx, changes, Vec::new()).await;

        created.sort_by_key(|doc| doc.ref_.to_string());
        Ok(created)
    }

    pub async fn get_doc(&self, ctx: &Context, ref_: &Ref) -> Result<Doc> {
        ctx.err()?;
        self.backend.view(|rtx| {
            let bytes = kv::get(rtx, &kv::docs_bucket(&ref_.gtype), ref_.gid.as_bytes())?
                .ok_or(Error::NotFound)?;
            codec::decode(&bytes)
        })
    }

    pub async fn has_doc(&self, ctx: &Context, ref_: &Ref) -> bool {
        self.get_doc(ctx, ref_).await.is_ok()
    }

    /// Shallow attribute merge; never touches the ref.
    pub async fn patch_doc(&self, ctx: &Context, patch: Patch) -> Result<Doc> {
        ctx.err()?;
        let indexes = self.indexes.read().await;
        let (before, after) = self.backend.update(|wtx| {
            let mut doc = store::get_doc(wtx, &patch.ref_)?;
            let before = doc.clone();
            for (key, value) in patch.attributes {
                doc.attributes.insert(key, value);
            }
            let after = store::set_doc(ctx, wtx, &indexes, doc)?;
            Ok((before, after))
        })?;
        drop(indexes);

        self.publish_change(
            ctx,
            vec![DocChange { before: Some(before), after: Some(after.clone()) }],
            Vec::new(),
        )
        .await;
        Ok(after)
    }

    /// Patch every doc the filter matches. The re-read, merge, re-stamp,
    /// and write all happen in one writer transaction.
    pub async fn patch_docs(&self, ctx: &Context, patch: PatchFilter) -> Result<Docs> {
        ctx.err()?;
        let matched = self.search_docs(ctx, &patch.filter).await?;

        let indexes = self.indexes.read().await;
        let changes = self.backend.update(|wtx| {
            let mut changes = Vec::with_capacity(matched.docs.len());
            for doc in &matched.docs {
                ctx.err()?;
                let mut current = store::get_doc(wtx, &doc.ref_)?;
                let before = current.clone();
                for (key, value) in &patch.attributes {
                    current.attributes.insert(key.clone(), value.clone());
                }
                let after = store::set_doc(ctx, wtx, &indexes, current)?;
                changes.push(DocChange { before: Some(before), after: Some(after) });
            }
            Ok(changes)
        })?;
        drop(indexes);

        let mut docs: Vec<Doc> = changes.iter().filter_map(|c| c.after.clone()).collect();
        self.publish_change(ctx, changes, Vec::new()).await;

        docs.sort_by_key(|doc| doc.ref_.to_string());
        Ok(Docs { docs, seek_next: String::new() })
    }

    /// Delete a doc and cascade over every incident connection.
    #[tracing::instrument(skip_all, fields(doc = %ref_))]
    pub async fn del_doc(&self, ctx: &Context, ref_: &Ref) -> Result<()> {
        ctx.err()?;
        let indexes = self.indexes.read().await;
        let mut adjacency = self.adjacency.write().await;
        let mut batch = AdjacencyBatch::default();

        let (doc, _cascaded) = self
            .backend
            .update(|wtx| store::del_doc(ctx, wtx, &indexes, &adjacency, &mut batch, ref_))?;
        adjacency.apply(batch);
        drop(adjacency);
        drop(indexes);

        self.publish_change(
            ctx,
            vec![DocChange { before: Some(doc), after: None }],
            Vec::new(),
        )
        .await;
        Ok(())
    }

    /// Delete every doc the filter matches; `NotFound` when none do.
    pub async fn del_docs(&self, ctx: &Context, filter: &Filter) -> Result<()> {
        ctx.err()?;
        let matched = self.search_docs(ctx, filter).await?;
        if matched.docs.is_empty() {
            return Err(Error::NotFound);
        }

        let indexes = self.indexes.read().await;
        let mut adjacency = self.adjacency.write().await;
        let mut batch = AdjacencyBatch::default();
        let deleted = self.backend.update(|wtx| {
            let mut deleted = Vec::with_capacity(matched.docs.len());
            for doc in &matched.docs {
                let (doc, _) =
                    store::del_doc(ctx, wtx, &indexes, &adjacency, &mut batch, &doc.ref_)?;
                deleted.push(doc);
            }
            Ok(deleted)
        })?;
        adjacency.apply(batch);
        drop(adjacency);
        drop(indexes);

        let changes = deleted
            .into_iter()
            .map(|doc| DocChange { before: Some(doc), after: None })
            .collect();
        self.publish_change(ctx, changes, Vec::new()).await;
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(gtype = %filter.gtype))]
    pub async fn search_docs(&self, ctx: &Context, filter: &Filter) -> Result<Docs> {
        ctx.err()?;
        let programs = match &filter.expression {
            Some(source) => vec![quiver_vm::program(EnvKind::Doc, source)?],
            None => Vec::new(),
        };
        let (mut docs, seek_next) =
            self.backend.view(|rtx| query::scan_docs(ctx, rtx, filter, &programs))?;
        query::sort_docs(&mut docs, filter.sort.as_deref());
        Ok(Docs { docs, seek_next })
    }

    // ========================================================================
    // Connections
    // ========================================================================

    pub async fn create_connection(&self, ctx: &Context, connection: Connection) -> Result<Connection> {
        let mut connections = self.create_connections(ctx, vec![connection]).await?;
        connections.pop().ok_or_else(|| Error::Internal("empty create result".to_string()))
    }

    /// Batch create/overwrite in a single writer transaction; endpoint
    /// existence is enforced for every connection, and any failure rolls
    /// the whole batch back.
    pub async fn create_connections(
        &self,
        ctx: &Context,
        connections: Vec<Connection>,
    ) -> Result<Vec<Connection>> {
        ctx.err()?;
        let indexes = self.indexes.read().await;
        let mut adjacency = self.adjacency.write().await;
        let mut batch = AdjacencyBatch::default();
        let created = self.backend.update(|wtx| {
            connections
                .into_iter()
                .map(|connection| store::set_connection(ctx, wtx, &indexes, &mut batch, connection))
                .collect::<Result<Vec<_>>>()
        })?;
        adjacency.apply(batch);
        drop(adjacency);
        drop(indexes);

        let changes = created
            .iter()
            .map(|connection| ConnectionChange { before: None, after: Some(connection.clone()) })
            .collect();
        self.publish_change(ctx, Vec::new(), changes).await;

        let mut created = created;
        created.sort_by_key(|connection| connection.ref_.to_string());
        Ok(created)
    }

    pub async fn get_connection(&self, ctx: &Context, ref_: &Ref) -> Result<Connection> {
        ctx.err()?;
        self.backend.view(|rtx| {
            let bytes = kv::get(rtx, &kv::connections_bucket(&ref_.gtype), ref_.gid.as_bytes())?
                .ok_or(Error::NotFound)?;
            codec::decode(&bytes)
        })
    }

    pub async fn has_connection(&self, ctx: &Context, ref_: &Ref) -> bool {
        self.get_connection(ctx, ref_).await.is_ok()
    }

    /// Shallow attribute merge; never touches ref or endpoints.
    pub async fn patch_connection(&self, ctx: &Context, patch: Patch) -> Result<Connection> {
        ctx.err()?;
        let indexes = self.indexes.read().await;
        let mut adjacency = self.adjacency.write().await;
        let mut batch = AdjacencyBatch::default();
        let (before, after) = self.backend.update(|wtx| {
            let mut connection = store::get_connection(wtx, &patch.ref_)?;
            let before = connection.clone();
            for (key, value) in patch.attributes {
                connection.attributes.insert(key, value);
            }
            let after = store::set_connection(ctx, wtx, &indexes, &mut batch, connection)?;
            Ok((before, after))
        })?;
        adjacency.apply(batch);
        drop(adjacency);
        drop(indexes);

        self.publish_change(
            ctx,
            Vec::new(),
            vec![ConnectionChange { before: Some(before), after: Some(after.clone()) }],
        )
        .await;
        Ok(after)
    }

    /// Patch every connection the filter matches in one transaction.
    pub async fn patch_connections(&self, ctx: &Context, patch: PatchFilter) -> Result<Connections> {
        ctx.err()?;
        let matched = self.search_connections(ctx, &patch.filter).await?;

        let indexes = self.indexes.read().await;
        let mut adjacency = self.adjacency.write().await;
        let mut batch = AdjacencyBatch::default();
        let changes = self.backend.update(|wtx| {
            let mut changes = Vec::with_capacity(matched.connections.len());
            for connection in &matched.connections {
                ctx.err()?;
                let mut current = store::get_connection(wtx, &connection.ref_)?;
                let before = current.clone();
                for (key, value) in &patch.attributes {
                    current.attributes.insert(key.clone(), value.clone());
                }
                let after = store::set_connection(ctx, wtx, &indexes, &mut batch, current)?;
                changes.push(ConnectionChange { before: Some(before), after: Some(after) });
            }
            Ok(changes)
        })?;
        adjacency.apply(batch);
        drop(adjacency);
        drop(indexes);

        let mut connections: Vec<Connection> =
            changes.iter().filter_map(|c| c.after.clone()).collect();
        self.publish_change(ctx, Vec::new(), changes).await;

        connections.sort_by_key(|connection| connection.ref_.to_string());
        Ok(Connections { connections, seek_next: String::new() })
    }

    #[tracing::instrument(skip_all, fields(connection = %ref_))]
    pub async fn del_connection(&self, ctx: &Context, ref_: &Ref) -> Result<()> {
        ctx.err()?;
        let indexes = self.indexes.read().await;
        let mut adjacency = self.adjacency.write().await;
        let mut batch = AdjacencyBatch::default();
        let connection = self
            .backend
            .update(|wtx| store::del_connection(ctx, wtx, &indexes, &mut batch, ref_))?;
        adjacency.apply(batch);
        drop(adjacency);
        drop(indexes);

        self.publish_change(
            ctx,
            Vec::new(),
            vec![ConnectionChange { before: Some(connection), after: None }],
        )
        .await;
        Ok(())
    }

    /// Delete every connection the filter matches; `NotFound` when none do.
    pub async fn del_connections(&self, ctx: &Context, filter: &Filter) -> Result<()> {
        ctx.err()?;
        let matched = self.search_connections(ctx, filter).await?;
        if matched.connections.is_empty() {
            return Err(Error::NotFound);
        }

        let indexes = self.indexes.read().await;
        let mut adjacency = self.adjacency.write().await;
        let mut batch = AdjacencyBatch::default();
        let deleted = self.backend.update(|wtx| {
            let mut deleted = Vec::with_capacity(matched.connections.len());
            for connection in &matched.connections {
                deleted.push(store::del_connection(ctx, wtx, &indexes, &mut batch, &connection.ref_)?);
            }
            Ok(deleted)
        })?;
        adjacency.apply(batch);
        drop(adjacency);
        drop(indexes);

        let changes = deleted
            .into_iter()
            .map(|connection| ConnectionChange { before: Some(connection), after: None })
            .collect();
        self.publish_change(ctx, Vec::new(), changes).await;
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(gtype = %filter.gtype))]
    pub async fn search_connections(&self, ctx: &Context, filter: &Filter) -> Result<Connections> {
        ctx.err()?;
        let programs = match &filter.expression {
            Some(source) => vec![quiver_vm::program(EnvKind::Connection, source)?],
            None => Vec::new(),
        };
        let (mut connections, seek_next) =
            self.backend.view(|rtx| query::scan_connections(ctx, rtx, filter, &programs))?;
        query::sort_connections(&mut connections, filter.sort.as_deref());
        Ok(Connections { connections, seek_next })
    }

    // ========================================================================
    // Neighborhoods
    // ========================================================================

    /// Connections leaving a doc, in deterministic ref order.
    pub async fn connections_from(
        &self,
        ctx: &Context,
        filter: &ConnectionFilter,
    ) -> Result<Connections> {
        ctx.err()?;
        let programs = match &filter.expression {
            Some(source) => vec![quiver_vm::program(EnvKind::Connection, source)?],
            None => Vec::new(),
        };
        let refs =
            self.adjacency.read().await.from_refs(&filter.doc_ref.to_string()).to_vec();
        let mut connections = self.backend.view(|rtx| {
            query::load_connections(ctx, rtx, &refs, &filter.gtype, &programs, filter.limit)
        })?;
        query::sort_connections(&mut connections, None);
        Ok(Connections { connections, seek_next: String::new() })
    }

    /// Connections arriving at a doc, in deterministic ref order.
    pub async fn connections_to(
        &self,
        ctx: &Context,
        filter: &ConnectionFilter,
    ) -> Result<Connections> {
        ctx.err()?;
        let programs = match &filter.expression {
            Some(source) => vec![quiver_vm::program(EnvKind::Connection, source)?],
            None => Vec::new(),
        };
        let refs = self.adjacency.read().await.to_refs(&filter.doc_ref.to_string()).to_vec();
        let mut connections = self.backend.view(|rtx| {
            query::load_connections(ctx, rtx, &refs, &filter.gtype, &programs, filter.limit)
        })?;
        query::sort_connections(&mut connections, None);
        Ok(Connections { connections, seek_next: String::new() })
    }

    /// The docs a filter matches plus each one's outbound neighborhood.
    pub async fn sub_graph(
        &self,
        ctx: &Context,
        doc_filter: &Filter,
        connection_filter: &Filter,
    ) -> Result<GraphDump> {
        ctx.err()?;
        let docs = self.search_docs(ctx, doc_filter).await?;
        let mut dump = GraphDump::default();
        for doc in docs.docs {
            ctx.err()?;
            let from = self
                .connections_from(
                    ctx,
                    &ConnectionFilter {
                        doc_ref: doc.ref_.clone(),
                        gtype: connection_filter.gtype.clone(),
                        expression: connection_filter.expression.clone(),
                        limit: connection_filter.limit,
                    },
                )
                .await?;
            dump.connections.extend(from.connections);
            dump.docs.push(doc);
        }
        dump.docs.sort_by_key(|doc| doc.ref_.to_string());
        dump.connections.sort_by_key(|connection| connection.ref_.to_string());
        dump.connections.dedup_by_key(|connection| connection.ref_.clone());
        Ok(dump)
    }

    /// A doc with its selected neighborhoods, endpoints resolved.
    pub async fn get_doc_detail(
        &self,
        ctx: &Context,
        ref_: &Ref,
        filter: &DetailFilter,
    ) -> Result<DocDetail> {
        let doc = self.get_doc(ctx, ref_).await?;
        let mut detail =
            DocDetail { doc, connections_from: Vec::new(), connections_to: Vec::new() };

        if let Some(from_filter) = &filter.connections_from {
            let mut from_filter = from_filter.clone();
            from_filter.doc_ref = ref_.clone();
            for connection in self.connections_from(ctx, &from_filter).await?.connections {
                detail.connections_from.push(self.resolve_detail(ctx, connection).await?);
            }
        }
        if let Some(to_filter) = &filter.connections_to {
            let mut to_filter = to_filter.clone();
            to_filter.doc_ref = ref_.clone();
            for connection in self.connections_to(ctx, &to_filter).await?.connections {
                detail.connections_to.push(self.resolve_detail(ctx, connection).await?);
            }
        }
        Ok(detail)
    }

    /// The caller's own identity doc with its neighborhoods.
    pub async fn me(&self, ctx: &Context, filter: &DetailFilter) -> Result<DocDetail> {
        let ref_ = ctx.identity_ref().clone();
        self.get_doc_detail(ctx, &ref_, filter).await
    }

    async fn resolve_detail(
        &self,
        ctx: &Context,
        connection: Connection,
    ) -> Result<ConnectionDetail> {
        let from = self.get_doc(ctx, &connection.from).await?;
        let to = self.get_doc(ctx, &connection.to).await?;
        Ok(ConnectionDetail { connection, from, to })
    }

    // ========================================================================
    // Export / Import
    // ========================================================================

    pub async fn export(&self, ctx: &Context) -> Result<GraphDump> {
        ctx.err()?;
        let docs = self.search_docs(ctx, &Filter::gtype(ANY_GTYPE)).await?;
        let connections = self.search_connections(ctx, &Filter::gtype(ANY_GTYPE)).await?;
        Ok(GraphDump { docs: docs.docs, connections: connections.connections })
    }

    /// Write a full dump in one transaction; docs land before
    /// connections so endpoint checks see them.
    pub async fn import(&self, ctx: &Context, dump: GraphDump) -> Result<GraphDump> {
        ctx.err()?;
        let indexes = self.indexes.read().await;
        let mut adjacency = self.adjacency.write().await;
        let mut batch = AdjacencyBatch::default();
        let stored = self.backend.update(|wtx| {
            let docs = dump
                .docs
                .into_iter()
                .map(|doc| store::set_doc(ctx, wtx, &indexes, doc))
                .collect::<Result<Vec<_>>>()?;
            let connections = dump
                .connections
                .into_iter()
                .map(|connection| store::set_connection(ctx, wtx, &indexes, &mut batch, connection))
                .collect::<Result<Vec<_>>>()?;
            Ok(GraphDump { docs, connections })
        })?;
        adjacency.apply(batch);
        drop(adjacency);
        drop(indexes);
        Ok(stored)
    }

    // ========================================================================
    // Messaging
    // ========================================================================

    /// Publish a message on a caller-supplied topic.
    pub async fn publish(
        &self,
        ctx: &Context,
        channel: &str,
        data: Map<String, Value>,
    ) -> Result<()> {
        ctx.err()?;
        let message = Message {
            channel: channel.to_string(),
            data,
            sender: ctx.identity_ref().clone(),
            timestamp: Utc::now(),
        };
        self.bus.publish(channel, Event::Message(message)).await;
        Ok(())
    }

    /// Stream messages on a channel whose filter expressions all pass.
    pub async fn subscribe(
        &self,
        ctx: &Context,
        channel: &str,
        expressions: &[String],
    ) -> Result<Subscription> {
        ctx.err()?;
        let programs = quiver_vm::programs(EnvKind::Message, expressions)?;
        Ok(self.bus.subscribe(ctx.clone(), channel, programs).await)
    }

    /// Stream committed mutation events whose filter expressions all pass.
    pub async fn subscribe_changes(
        &self,
        ctx: &Context,
        expressions: &[String],
    ) -> Result<Subscription> {
        ctx.err()?;
        let programs = quiver_vm::programs(EnvKind::Change, expressions)?;
        Ok(self.bus.subscribe(ctx.clone(), CHANGES_TOPIC, programs).await)
    }

    async fn publish_change(
        &self,
        ctx: &Context,
        doc_changes: Vec<DocChange>,
        connection_changes: Vec<ConnectionChange>,
    ) {
        let change = Change {
            method: ctx.method().to_string(),
            identity: ctx.identity().clone(),
            timestamp: Utc::now(),
            doc_changes,
            connection_changes,
        };
        self.bus.publish(CHANGES_TOPIC, Event::Change(change)).await;
    }

    // ========================================================================
    // Indexes
    // ========================================================================

    /// Compile, persist, and backfill a secondary index.
    #[tracing::instrument(skip_all, fields(index = %descriptor.name))]
    pub async fn create_index(&self, ctx: &Context, descriptor: Index) -> Result<Index> {
        ctx.err()?;
        let mut cached = CachedIndex::compile(descriptor)?;
        let mut cache = self.indexes.write().await;
        self.backend.update(|wtx| indexes::create(ctx, wtx, &mut cached))?;
        let descriptor = cached.descriptor.clone();
        cache.insert(descriptor.name.clone(), cached);
        Ok(descriptor)
    }

    /// Drop an index descriptor and its materialized bucket.
    pub async fn del_index(&self, ctx: &Context, name: &str) -> Result<()> {
        ctx.err()?;
        let mut cache = self.indexes.write().await;
        let cached = cache.get(name).cloned().ok_or(Error::NotFound)?;
        self.backend.update(|wtx| indexes::delete(ctx, wtx, &cached.descriptor))?;
        cache.remove(name);
        Ok(())
    }

    pub async fn list_indexes(&self, ctx: &Context) -> Result<Vec<Index>> {
        ctx.err()?;
        let cache = self.indexes.read().await;
        Ok(cache.values().map(|cached| cached.descriptor.clone()).collect())
    }

    // ========================================================================
    // Authorizers
    // ========================================================================

    /// Compile and persist a policy expression; replaces any authorizer
    /// with the same name.
    pub async fn set_authorizer(&self, descriptor: Authorizer) -> Result<Authorizer> {
        let cached = CachedAuthorizer::compile(descriptor)?;
        let mut cache = self.authorizers.write().await;
        self.backend.update(|wtx| authorizers::persist(wtx, &cached.descriptor))?;
        let descriptor = cached.descriptor.clone();
        cache.insert(descriptor.name.clone(), cached);
        Ok(descriptor)
    }

    pub async fn del_authorizer(&self, name: &str) -> Result<()> {
        let mut cache = self.authorizers.write().await;
        if !cache.contains_key(name) {
            return Err(Error::NotFound);
        }
        self.backend.update(|wtx| authorizers::remove(wtx, name))?;
        cache.remove(name);
        Ok(())
    }

    pub async fn authorizers(&self) -> Vec<Authorizer> {
        let cache = self.authorizers.read().await;
        cache.values().map(|cached| cached.descriptor.clone()).collect()
    }

    /// Compiled policy programs for the auth interceptor.
    pub async fn authorizer_programs(&self) -> Vec<Program> {
        let cache = self.authorizers.read().await;
        cache.values().map(|cached| cached.program.clone()).collect()
    }

    // ========================================================================
    // Identity
    // ========================================================================

    /// Look up an identity doc by verified email claim.
    pub async fn identity(&self, email: &str) -> Result<Option<Doc>> {
        let ref_ = Ref::user(email);
        self.backend.view(|rtx| {
            match kv::get(rtx, &kv::docs_bucket(&ref_.gtype), ref_.gid.as_bytes())? {
                Some(bytes) => Ok(Some(codec::decode(&bytes)?)),
                None => Ok(None),
            }
        })
    }

    /// First-sight identity upsert: the claims become the doc's
    /// attributes, and the doc records itself as its own creator.
    pub async fn create_identity(&self, email: &str, claims: Map<String, Value>) -> Result<Doc> {
        tracing::info!(email = %email, "creating identity");
        let doc = Doc::new(Ref::user(email)).with_attributes(claims);
        let ctx = Context::background(doc.clone(), "CreateIdentity");
        let indexes = self.indexes.read().await;
        let created =
            self.backend.update(|wtx| store::set_doc(&ctx, wtx, &indexes, doc))?;
        Ok(created)
    }
}
