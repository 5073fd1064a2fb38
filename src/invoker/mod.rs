//! Single-use handles that run one search or fill operation
//!
//! A [`SearchInvoker`] is bound to one node, one group (interleaved over its
//! nodes) or to nothing at all when it only carries an error. It is sent at
//! most once, yields one result and is released exactly once: on
//! [`SearchInvoker::close`] or, failing that, on drop.

mod error;
mod factory;
mod fill;
mod interleaved;
mod node;

pub use factory::{hits_to_fetch, InvokerFactory};
pub use fill::FillInvoker;

use crate::search::{DispatchResult, ErrorMessage, Query};
use crate::{Error, Result};
use error::ErrorInvoker;
use interleaved::InterleavedInvoker;
use node::NodeInvoker;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// Called once when an invoker is released, with whether it produced an
/// error-free result and how long it was in use.
pub type ReleaseHook = Box<dyn FnOnce(bool, Duration) + Send>;

static NEXT_INVOKER_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) enum InvokerKind {
    Node(NodeInvoker),
    Interleaved(InterleavedInvoker),
    Error(ErrorInvoker),
}

/// A search operation against one node, one group, or a synthesized error.
///
/// Invokers compare by identity: two invokers are equal only if they are the
/// same live handle.
pub struct SearchInvoker {
    id: u64,
    kind: InvokerKind,
    release: Option<ReleaseHook>,
    trace: Vec<String>,
    started: Option<Instant>,
    success: bool,
    closed: bool,
}

impl SearchInvoker {
    pub(crate) fn new(kind: InvokerKind) -> Self {
        Self {
            id: NEXT_INVOKER_ID.fetch_add(1, Ordering::Relaxed),
            kind,
            release: None,
            trace: Vec::new(),
            started: None,
            success: false,
            closed: false,
        }
    }

    pub(crate) fn with_release(mut self, hook: ReleaseHook) -> Self {
        self.release = Some(hook);
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            InvokerKind::Node(_) => "node",
            InvokerKind::Interleaved(_) => "interleaved",
            InvokerKind::Error(_) => "error",
        }
    }

    /// Distribution keys of the nodes this invoker talks to
    pub fn distribution_keys(&self) -> Vec<u32> {
        match &self.kind {
            InvokerKind::Node(node) => vec![node.distribution_key()],
            InvokerKind::Interleaved(interleaved) => interleaved.distribution_keys(),
            InvokerKind::Error(_) => Vec::new(),
        }
    }

    /// Add a note to the trace of the result this invoker produces.
    pub fn add_trace(&mut self, note: impl Into<String>) {
        self.trace.push(note.into());
    }

    /// Send the query. An invoker accepts exactly one send.
    pub fn send(&mut self, query: &Query) -> Result<()> {
        if self.started.is_some() || self.closed {
            return Err(Error::InvokerReused);
        }
        self.started = Some(Instant::now());
        match &mut self.kind {
            InvokerKind::Node(node) => node.send(query),
            InvokerKind::Interleaved(interleaved) => interleaved.send(query),
            InvokerKind::Error(_) => {}
        }
        Ok(())
    }

    /// Wait for the result of the query sent earlier.
    pub async fn result(&mut self) -> DispatchResult {
        if self.started.is_none() {
            return DispatchResult::from_error(
                ErrorMessage::internal("result requested from an invoker that was never sent"),
                Default::default(),
            );
        }
        let mut result = match &mut self.kind {
            InvokerKind::Node(node) => node.result().await,
            InvokerKind::Interleaved(interleaved) => interleaved.result().await,
            InvokerKind::Error(error) => error.result(),
        };
        self.success = !result.is_error();
        let mut trace = std::mem::take(&mut self.trace);
        trace.append(&mut result.trace);
        result.trace = trace;
        result
    }

    /// Send, wait and release in one go.
    pub async fn search(&mut self, query: &Query) -> Result<DispatchResult> {
        self.send(query)?;
        let result = self.result().await;
        self.close();
        Ok(result)
    }

    /// Release everything this invoker holds. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        match &mut self.kind {
            InvokerKind::Node(node) => node.close(),
            InvokerKind::Interleaved(interleaved) => interleaved.close(),
            InvokerKind::Error(_) => {}
        }
        if let Some(release) = self.release.take() {
            let elapsed = self.started.map(|s| s.elapsed()).unwrap_or_default();
            release(self.success, elapsed);
        }
    }
}

impl Drop for SearchInvoker {
    fn drop(&mut self) {
        self.close();
    }
}

impl PartialEq for SearchInvoker {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for SearchInvoker {}

impl fmt::Debug for SearchInvoker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SearchInvoker")
            .field("id", &self.id)
            .field("kind", &self.kind_name())
            .field("distribution_keys", &self.distribution_keys())
            .field("closed", &self.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::{Coverage, ErrorCode};
    use bytes::Bytes;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn error_invoker() -> SearchInvoker {
        InvokerFactory::error_invoker(ErrorMessage::illegal_query("bad path"), 0)
    }

    fn query() -> Query {
        Query::new(Bytes::from_static(b"q"), 10, Duration::from_secs(1))
    }

    #[tokio::test]
    async fn test_send_is_single_use() {
        let mut invoker = error_invoker();
        invoker.send(&query()).unwrap();
        assert!(matches!(invoker.send(&query()), Err(Error::InvokerReused)));
    }

    #[tokio::test]
    async fn test_error_invoker_result() {
        let mut invoker = error_invoker();
        invoker.add_trace("resolving path");
        let result = invoker.search(&query()).await.unwrap();

        assert_eq!(result.first_error().unwrap().code, ErrorCode::IllegalQuery);
        assert_eq!(result.coverage, Coverage::none_answered(0));
        assert_eq!(result.trace, vec!["resolving path".to_string()]);
        assert!(matches!(invoker.send(&query()), Err(Error::InvokerReused)));
    }

    #[tokio::test]
    async fn test_release_runs_once() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let seen = calls.clone();
        let mut invoker = error_invoker().with_release(Box::new(move |success, _| {
            seen.lock().push(success);
        }));
        invoker.send(&query()).unwrap();
        let _ = invoker.result().await;
        invoker.close();
        invoker.close();
        drop(invoker);

        assert_eq!(*calls.lock(), vec![false]);
    }

    #[test]
    fn test_release_on_drop_without_send() {
        let calls = Arc::new(Mutex::new(0));
        let seen = calls.clone();
        let invoker = error_invoker().with_release(Box::new(move |_, elapsed| {
            assert_eq!(elapsed, Duration::ZERO);
            *seen.lock() += 1;
        }));
        drop(invoker);
        assert_eq!(*calls.lock(), 1);
    }

    #[test]
    fn test_identity_equality() {
        let a = error_invoker();
        let b = error_invoker();
        assert_ne!(a, b);
        assert_ne!(a.id(), b.id());
    }
}
