//! Persisted policy expressions and their compiled programs.

use std::collections::BTreeMap;

use quiver_store::{backend as kv, codec};
use quiver_types::{Authorizer, Error, Result};
use quiver_vm::{EnvKind, Program};

/// An authorizer with its program compiled once at load time.
#[derive(Debug, Clone)]
pub struct CachedAuthorizer {
    pub descriptor: Authorizer,
    pub program: Program,
}

impl CachedAuthorizer {
    pub fn compile(descriptor: Authorizer) -> Result<Self> {
        if descriptor.name.is_empty() {
            return Err(Error::InvalidExpression("authorizer name must not be empty".to_string()));
        }
        let program = quiver_vm::program(EnvKind::Auth, &descriptor.expression)?;
        Ok(Self { descriptor, program })
    }
}

pub type AuthorizerCache = BTreeMap<String, CachedAuthorizer>;

/// Load and compile every persisted authorizer.
pub fn load(rtx: &kv::ReadTransaction) -> Result<AuthorizerCache> {
    let mut cache = AuthorizerCache::new();
    match kv::for_each(rtx, kv::AUTHORIZERS, |_, value| {
        let descriptor: Authorizer = codec::decode(value)?;
        let cached = CachedAuthorizer::compile(descriptor)?;
        cache.insert(cached.descriptor.name.clone(), cached);
        Ok(true)
    }) {
        Ok(()) | Err(Error::NotFound) => Ok(cache),
        Err(err) => Err(err),
    }
}

pub fn persist(wtx: &kv::WriteTransaction, descriptor: &Authorizer) -> Result<()> {
    let bytes = codec::encode(descriptor)?;
    kv::put(wtx, kv::AUTHORIZERS, descriptor.name.as_bytes(), &bytes)
}

pub fn remove(wtx: &kv::WriteTransaction, name: &str) -> Result<()> {
    kv::delete(wtx, kv::AUTHORIZERS, name.as_bytes())
}
