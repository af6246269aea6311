//! Shared error taxonomy for the session execution core.
//!
//! Mirrors the sentinel-error style used throughout the rest of the crate's
//! lineage: a small `std::error::Error` enum for conditions callers are
//! expected to match on, plus a boxed `Box<dyn Error + Send + Sync>` at the
//! boundary with external collaborators (LLM client, tool executor, store).

use std::error::Error;
use std::fmt;

pub type BoxError = Box<dyn Error + Send + Sync>;

/// Crate-wide error type. Most variants correspond 1:1 to a sentinel
/// condition a caller is expected to branch on (poll-loop backoff, chat
/// single-flight, graceful shutdown); `Other` wraps anything from a
/// collaborator.
#[derive(Debug)]
pub enum CoreError {
    /// The claim query found no pending, unlocked session.
    NoSessionsAvailable,
    /// The worker pool is at its configured concurrency ceiling.
    AtCapacity,
    /// A chat already has a non-terminal stage in flight.
    ChatExecutionActive,
    /// `Stop` was called, or a caller tried to submit after it completed.
    ShuttingDown,
    /// The session's chain id does not resolve, or resolves to zero stages.
    ChainNotFound(String),
    ChainHasNoStages(String),
    /// An MCP-selection override named a server unknown to the registry.
    UnknownMcpServer(String),
    /// An MCP-selection override supplied an empty server list.
    EmptyServerList,
    /// A store operation failed.
    Store(BoxError),
    /// Any other collaborator error (LLM client, tool executor, resolver).
    Other(BoxError),
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreError::NoSessionsAvailable => write!(f, "no sessions available"),
            CoreError::AtCapacity => write!(f, "at capacity"),
            CoreError::ChatExecutionActive => write!(f, "chat execution active"),
            CoreError::ShuttingDown => write!(f, "shutting down"),
            CoreError::ChainNotFound(id) => write!(f, "chain not found: {}", id),
            CoreError::ChainHasNoStages(id) => write!(f, "chain {} has no stages", id),
            CoreError::UnknownMcpServer(name) => write!(f, "unknown mcp server: {}", name),
            CoreError::EmptyServerList => {
                write!(f, "mcp selection override must name at least one server")
            }
            CoreError::Store(e) => write!(f, "store error: {}", e),
            CoreError::Other(e) => write!(f, "{}", e),
        }
    }
}

impl Error for CoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            CoreError::Store(e) | CoreError::Other(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl CoreError {
    pub fn is_sentinel(&self) -> bool {
        matches!(
            self,
            CoreError::NoSessionsAvailable
                | CoreError::AtCapacity
                | CoreError::ChatExecutionActive
                | CoreError::ShuttingDown
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_errors_are_classified() {
        assert!(CoreError::NoSessionsAvailable.is_sentinel());
        assert!(CoreError::AtCapacity.is_sentinel());
        assert!(CoreError::ChatExecutionActive.is_sentinel());
        assert!(CoreError::ShuttingDown.is_sentinel());
        assert!(!CoreError::EmptyServerList.is_sentinel());
    }

    #[test]
    fn display_messages_are_stable() {
        assert_eq!(format!("{}", CoreError::NoSessionsAvailable), "no sessions available");
        assert_eq!(format!("{}", CoreError::AtCapacity), "at capacity");
        assert_eq!(
            format!("{}", CoreError::ChainHasNoStages("c1".into())),
            "chain c1 has no stages"
        );
    }
}
