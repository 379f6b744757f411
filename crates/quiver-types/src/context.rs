//! Request-scoped context: caller identity, invoked method, cancellation.
//!
//! Every core operation checks the context at entry and on each loop
//! iteration over buckets or adjacency lists, returning
//! [`Error::Cancelled`](crate::Error::Cancelled) without partial external
//! effects.

use tokio::sync::watch;

use crate::{Doc, Error, Ref, Result};

/// Observer half of a cancellation pair.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

/// Trigger half of a cancellation pair. Dropping the handle without
/// calling [`CancelHandle::cancel`] leaves the token live forever.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

/// Create a linked cancellation handle/token pair.
pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelToken { rx })
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

impl CancelToken {
    /// A token that can never fire.
    pub fn never() -> Self {
        static NEVER: std::sync::OnceLock<CancelToken> = std::sync::OnceLock::new();
        NEVER
            .get_or_init(|| {
                let (tx, rx) = watch::channel(false);
                // Keeping one sender alive forever means `changed()` never errors.
                std::mem::forget(tx);
                Self { rx }
            })
            .clone()
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves when the handle fires. Pends forever if the handle was
    /// dropped without cancelling.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Identity, method, and cancellation for one request.
#[derive(Debug, Clone)]
pub struct Context {
    identity: Doc,
    method: String,
    cancel: CancelToken,
}

impl Context {
    /// A context that cannot be cancelled, for internal and test callers.
    pub fn background(identity: Doc, method: impl Into<String>) -> Self {
        Self { identity, method: method.into(), cancel: CancelToken::never() }
    }

    /// A request context wired to the given cancellation token.
    pub fn new(identity: Doc, method: impl Into<String>, cancel: CancelToken) -> Self {
        Self { identity, method: method.into(), cancel }
    }

    pub fn identity(&self) -> &Doc {
        &self.identity
    }

    pub fn identity_ref(&self) -> &Ref {
        &self.identity.ref_
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// `Err(Cancelled)` once the caller's cancellation has been observed.
    pub fn err(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}
