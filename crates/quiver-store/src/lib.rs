//! # Quiver Store
//!
//! The transactional bucketed byte-store underneath the graph, plus the
//! deterministic entity codec.
//!
//! The backend maps the nested-bucket model (`docs/<gtype>`,
//! `index_docs/<name>`, ...) onto flat redb tables, which gives us
//! single-writer/many-reader copy-on-write transactions, cursors, and
//! crash safety without a hand-rolled pager.

pub mod backend;
pub mod codec;

pub use backend::{
    authorizers_bucket, connections_bucket, docs_bucket, index_bucket, indexes_bucket, Backend,
    AUTHORIZERS, CONNECTIONS_PREFIX, DOCS_PREFIX, INDEXES, INDEX_CONNECTIONS_PREFIX,
    INDEX_DOCS_PREFIX,
};
pub use codec::{decode, encode, CODEC_VERSION};
