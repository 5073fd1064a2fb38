//! Query, request and result types, and the pure algorithms of the merge
//!
//! Nothing in here talks to the network. The invokers drive these pieces:
//! [`merge`] orders lean hits, [`coverage`] tallies what was searched,
//! [`timeout`] decides how long to keep waiting and [`topk`] shrinks per-node
//! hit counts.

pub mod coverage;
pub mod grouping;
pub mod hit;
pub mod merge;
pub mod path;
pub mod timeout;
pub mod topk;

pub use coverage::{Coverage, CoverageAggregator, DegradedReason};
pub use grouping::{Aggregate, Grouping, GroupingAggregator};
pub use hit::{GlobalId, LeanHit, SortKey, GID_LEN};
pub use merge::{merge_lean_hits, trim_window};
pub use path::{ResolvedPath, SearchPath, Selection};
pub use timeout::{AdaptiveTimeoutHandler, SimpleTimeoutHandler, TimeoutHandler};
pub use topk::TopKEstimator;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// A query as handed to the dispatcher.
///
/// The payload is opaque to dispatch. `hits` and `offset` describe the window
/// the caller wants back; dispatch never rewrites them.
#[derive(Debug, Clone)]
pub struct Query {
    pub payload: Bytes,
    pub hits: u32,
    pub offset: u32,
    pub timeout: Duration,
    pub started: Instant,
    /// Explicit node/group targeting, see [`SearchPath`]
    pub search_path: Option<String>,
    /// Overrides the configured top-k probability for this query
    pub top_k_probability: Option<f64>,
}

impl Query {
    pub fn new(payload: impl Into<Bytes>, hits: u32, timeout: Duration) -> Self {
        Self {
            payload: payload.into(),
            hits,
            offset: 0,
            timeout,
            started: Instant::now(),
            search_path: None,
            top_k_probability: None,
        }
    }

    pub fn with_offset(mut self, offset: u32) -> Self {
        self.offset = offset;
        self
    }

    pub fn with_search_path(mut self, path: impl Into<String>) -> Self {
        self.search_path = Some(path.into());
        self
    }

    pub fn with_top_k_probability(mut self, p: f64) -> Self {
        self.top_k_probability = Some(p);
        self
    }

    pub fn started_at(mut self, started: Instant) -> Self {
        self.started = started;
        self
    }

    pub fn deadline(&self) -> Instant {
        self.started + self.timeout
    }

    pub fn time_left(&self, now: Instant) -> Duration {
        self.deadline().saturating_duration_since(now)
    }

    /// Hits every node must be asked for: any node may hold the top results.
    pub fn needed(&self) -> u32 {
        self.offset.saturating_add(self.hits)
    }

    /// The search path directive, if one is set and non-blank
    pub fn search_path(&self) -> Option<&str> {
        self.search_path
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
    }
}

/// Effective request sent to one node
#[derive(Debug, Clone, PartialEq)]
pub struct SearchRequest {
    pub payload: Bytes,
    pub distribution_key: u32,
    pub hits: u32,
    pub offset: u32,
    pub timeout: Duration,
}

/// What one node answers to a [`SearchRequest`]
#[derive(Debug, Clone, Default)]
pub struct SearchReply {
    /// Ordered best first
    pub hits: Vec<LeanHit>,
    pub total_hits: u64,
    pub coverage: Coverage,
    pub groupings: Vec<Grouping>,
    pub errors: Vec<ErrorMessage>,
}

/// Summary request for the hits one node returned
#[derive(Debug, Clone, PartialEq)]
pub struct FillRequest {
    pub payload: Bytes,
    pub distribution_key: u32,
    pub gids: Vec<GlobalId>,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct FillReply {
    pub summaries: Vec<(GlobalId, Bytes)>,
    pub errors: Vec<ErrorMessage>,
}

/// Merged outcome of a fill fan-out
#[derive(Debug, Default)]
pub struct FillResult {
    pub summaries: HashMap<GlobalId, Bytes>,
    pub errors: Vec<ErrorMessage>,
}

/// Category of a result-level error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Timeout,
    BackendCommunication,
    IllegalQuery,
    Internal,
    NoSuitableGroup,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Timeout => "timeout",
            ErrorCode::BackendCommunication => "backend_communication",
            ErrorCode::IllegalQuery => "illegal_query",
            ErrorCode::Internal => "internal",
            ErrorCode::NoSuitableGroup => "no_suitable_group",
        }
    }
}

/// An error attached to a result. Unlike [`crate::Error`] it does not
/// abort anything; other nodes' hits still come back alongside it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub code: ErrorCode,
    pub message: String,
}

impl ErrorMessage {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Timeout, message)
    }

    pub fn backend_communication(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BackendCommunication, message)
    }

    pub fn illegal_query(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::IllegalQuery, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }
}

impl fmt::Display for ErrorMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code.as_str(), self.message)
    }
}

impl From<&crate::Error> for ErrorMessage {
    fn from(e: &crate::Error) -> Self {
        let code = match e {
            crate::Error::InvalidSearchPath(_) => ErrorCode::IllegalQuery,
            crate::Error::NoSuitableGroup { .. } => ErrorCode::NoSuitableGroup,
            crate::Error::Timeout => ErrorCode::Timeout,
            crate::Error::NodeUnreachable { .. } | crate::Error::Transport(_) => {
                ErrorCode::BackendCommunication
            }
            _ => ErrorCode::Internal,
        };
        Self::new(code, e.to_string())
    }
}

/// Comma separated distribution keys, as used in result messages
pub(crate) fn join_keys(keys: &[u32]) -> String {
    keys.iter()
        .map(|k| k.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Merged, windowed result of one dispatched query
#[derive(Debug, Default)]
pub struct DispatchResult {
    /// Hits of the caller's window, already trimmed
    pub hits: Vec<LeanHit>,
    pub total_hits: u64,
    pub coverage: Coverage,
    pub groupings: Vec<Grouping>,
    pub errors: Vec<ErrorMessage>,
    /// Query-level trace notes
    pub trace: Vec<String>,
}

impl DispatchResult {
    pub fn from_error(error: ErrorMessage, coverage: Coverage) -> Self {
        Self {
            coverage,
            errors: vec![error],
            ..Default::default()
        }
    }

    pub fn is_error(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn first_error(&self) -> Option<&ErrorMessage> {
        self.errors.first()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_window_and_deadline() {
        let started = Instant::now();
        let query = Query::new(Bytes::from_static(b"q"), 10, Duration::from_millis(200))
            .with_offset(5)
            .started_at(started);

        assert_eq!(query.needed(), 15);
        assert_eq!(query.deadline(), started + Duration::from_millis(200));
        assert_eq!(
            query.time_left(started + Duration::from_millis(50)),
            Duration::from_millis(150)
        );
        assert_eq!(query.time_left(started + Duration::from_secs(1)), Duration::ZERO);
    }

    #[test]
    fn test_blank_search_path_is_none() {
        let query = Query::new(Bytes::new(), 10, Duration::from_secs(1));
        assert!(query.search_path().is_none());
        assert!(query.clone().with_search_path("  ").search_path().is_none());
        assert_eq!(query.with_search_path(" 0/1 ").search_path(), Some("0/1"));
    }

    #[test]
    fn test_error_message_from_error() {
        let msg = ErrorMessage::from(&crate::Error::NoSuitableGroup { rejected: vec![1, 2] });
        assert_eq!(msg.code, ErrorCode::NoSuitableGroup);
        assert_eq!(
            msg.message,
            "No suitable groups to dispatch query. Rejected: [1, 2]"
        );
        assert_eq!(join_keys(&[3, 4]), "3, 4");
    }
}
