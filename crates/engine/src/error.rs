//! Error types for the replication engine

use std::fmt;

use strata_topology::NodeId;
use thiserror::Error;

/// Result type for engine operations
pub type EngineResult<T> = Result<T, Error>;

/// Main error type for the replication engine
#[derive(Debug, Error)]
pub struct Error {
    /// Error kind
    kind: ErrorKind,
    /// Error context
    context: ErrorContext,
}

impl Error {
    /// Create a new error
    pub fn new(kind: ErrorKind, context: ErrorContext) -> Self {
        Self { kind, context }
    }

    /// Create error with string context
    pub fn with_context(kind: ErrorKind, context: impl Into<String>) -> Self {
        Self {
            kind,
            context: ErrorContext::Message(context.into()),
        }
    }

    /// Get error kind
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    /// Create a protocol violation error
    ///
    /// Protocol violations are fatal: they signal a programming or
    /// assumption error, never a recoverable network condition.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::with_context(ErrorKind::Protocol, msg)
    }

    /// Create a communication error naming the unreachable peer
    pub fn communication(node: &NodeId, msg: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Communication,
            context: ErrorContext::Peer {
                message: msg.into(),
                node: node.clone(),
            },
        }
    }

    /// Create an invalid state error
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::with_context(ErrorKind::InvalidState, msg)
    }

    /// Create a sync failure error
    pub fn sync(msg: impl Into<String>) -> Self {
        Self::with_context(ErrorKind::Sync, msg)
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::with_context(ErrorKind::Configuration, msg)
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::with_context(ErrorKind::Internal, msg)
    }

    /// Check whether this error is fatal for the component that raised it
    pub fn is_fatal(&self) -> bool {
        matches!(self.kind, ErrorKind::Protocol)
    }

    /// Get the peer a communication error names, if any
    pub fn peer(&self) -> Option<&NodeId> {
        match &self.context {
            ErrorContext::Peer { node, .. } => Some(node),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.context {
            ErrorContext::Message(msg) => write!(f, "{}: {}", self.kind, msg),
            ErrorContext::Chain { message, source } => {
                write!(f, "{}: {} (caused by: {})", self.kind, message, source)
            }
            ErrorContext::Peer { message, node } => {
                write!(f, "{}: {} (peer: {})", self.kind, message, node)
            }
        }
    }
}

/// Error kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Protocol violation (unknown message kind, sequence gap)
    Protocol,
    /// Communication failure to a specific node
    Communication,
    /// Invalid state for operation
    InvalidState,
    /// State sync failure (read/serialize failure for a destination)
    Sync,
    /// Configuration error
    Configuration,
    /// Serialization error
    Serialization,
    /// Internal error
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Protocol => write!(f, "Protocol violation"),
            ErrorKind::Communication => write!(f, "Communication error"),
            ErrorKind::InvalidState => write!(f, "Invalid state"),
            ErrorKind::Sync => write!(f, "Sync error"),
            ErrorKind::Configuration => write!(f, "Configuration error"),
            ErrorKind::Serialization => write!(f, "Serialization error"),
            ErrorKind::Internal => write!(f, "Internal error"),
        }
    }
}

/// Error context
#[derive(Debug)]
pub enum ErrorContext {
    /// Simple message
    Message(String),
    /// Error chain with source
    Chain {
        /// Error message
        message: String,
        /// Source error
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// Failure involving a specific peer
    Peer {
        /// Error message
        message: String,
        /// The peer involved
        node: NodeId,
    },
}

impl From<strata_transport::TransportError> for Error {
    fn from(err: strata_transport::TransportError) -> Self {
        use strata_transport::TransportError;
        match &err {
            TransportError::SendFailed { node, .. } | TransportError::NotAMember(node) => {
                let node = node.clone();
                Self {
                    kind: ErrorKind::Communication,
                    context: ErrorContext::Peer {
                        message: err.to_string(),
                        node,
                    },
                }
            }
            _ => Self {
                kind: ErrorKind::Communication,
                context: ErrorContext::Chain {
                    message: "transport failure".to_string(),
                    source: Box::new(err),
                },
            },
        }
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for Error {
    fn from(err: ciborium::ser::Error<std::io::Error>) -> Self {
        Self {
            kind: ErrorKind::Serialization,
            context: ErrorContext::Chain {
                message: "message encode failed".to_string(),
                source: Box::new(err),
            },
        }
    }
}

impl From<ciborium::de::Error<std::io::Error>> for Error {
    fn from(err: ciborium::de::Error<std::io::Error>) -> Self {
        // An undecodable payload from a peer is an unknown-message-type
        // class failure, which the dispatch layer treats as fatal.
        Self {
            kind: ErrorKind::Protocol,
            context: ErrorContext::Chain {
                message: "message decode failed".to_string(),
                source: Box::new(err),
            },
        }
    }
}
