//! Error types for the dispatch core

use std::fmt;

/// Result type alias for dispatch operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the dispatch core
///
/// These are failures the caller has to act on. Conditions that only degrade
/// a query (a slow node, a node answering with an error) are reported as
/// [`crate::search::ErrorMessage`] entries on the result instead.
#[derive(Debug)]
pub enum Error {
    /// IO errors
    Io(std::io::Error),
    /// Serialization errors
    Serialization(String),
    /// Configuration errors
    Config(String),
    /// Malformed search-path directive
    InvalidSearchPath(String),
    /// Load balancer could not hand out a usable group
    NoSuitableGroup { rejected: Vec<u32> },
    /// Connection to a node could not be established
    NodeUnreachable { distribution_key: u32, reason: String },
    /// Transport failure after a request was sent
    Transport(String),
    /// An invoker was asked to run a second operation
    InvokerReused,
    /// Timeout
    Timeout,
    /// Internal error
    Internal(String),
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "IO error: {}", e),
            Error::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            Error::Config(msg) => write!(f, "Configuration error: {}", msg),
            Error::InvalidSearchPath(msg) => write!(f, "Invalid search path: {}", msg),
            Error::NoSuitableGroup { rejected } => {
                let rejected = rejected
                    .iter()
                    .map(|id| id.to_string())
                    .collect::<Vec<_>>()
                    .join(", ");
                write!(f, "No suitable groups to dispatch query. Rejected: [{}]", rejected)
            }
            Error::NodeUnreachable {
                distribution_key,
                reason,
            } => write!(
                f,
                "Node with distribution-key {} unreachable: {}",
                distribution_key, reason
            ),
            Error::Transport(msg) => write!(f, "Transport error: {}", msg),
            Error::InvokerReused => write!(f, "Invoker already used for an operation"),
            Error::Timeout => write!(f, "Operation timed out"),
            Error::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
