//! Errors raised by the pure scheduler primitives.

use thiserror::Error;

/// Deterministic failure of a core primitive. Storage and I/O errors are
/// owned by the infra layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A stored or transmitted status name is not one of the five lifecycle states.
    #[error("unknown work status: {0}")]
    UnknownStatus(String),

    /// `kind` names the identifier type that failed to parse.
    #[error("invalid {kind}: {reason}")]
    InvalidId { kind: &'static str, reason: String },
}
