//! Error types for instruction admission and arbiter operations.
//!
//! Admission failures are split in two so callers can tell a malformed
//! payload (fix it) from a refused producer (accept the denial). Capacity and
//! rate-limit rejections are not errors at all: `Scheduler::enqueue` returns
//! `Ok(None)` for those.

use crate::instruction::InstructionKind;
use crate::types::ProducerId;
use std::fmt;

/// Structural or parameter-level problem with an instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// The payload is not a well-formed instruction document.
    InvalidJson(String),

    /// The `kind` is not one of the known instruction kinds.
    UnknownKind(String),

    /// `metadata.priority` is not one of low, normal, high.
    InvalidPriority(String),

    /// `metadata.version` is not a semantic version.
    InvalidVersion(String),

    /// `metadata.sequence` was negative.
    NegativeSequence(i64),

    /// The parameters could not be decoded into the record for this kind.
    MalformedParameters {
        kind: InstructionKind,
        message: String,
    },

    /// A decoded parameter has an unacceptable value.
    InvalidParameter {
        kind: InstructionKind,
        field: String,
        reason: String,
    },
}

impl ValidationError {
    pub(crate) fn invalid(
        kind: InstructionKind,
        field: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidParameter {
            kind,
            field: field.into(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidJson(msg) => write!(f, "Invalid instruction JSON: {}", msg),
            Self::UnknownKind(kind) => write!(f, "Unknown instruction kind: {}", kind),
            Self::InvalidPriority(p) => {
                write!(f, "Invalid priority: {} (expected low, normal or high)", p)
            }
            Self::InvalidVersion(v) => write!(f, "Invalid version: {} (expected semver)", v),
            Self::NegativeSequence(s) => write!(f, "Sequence must be non-negative, got {}", s),
            Self::MalformedParameters { kind, message } => {
                write!(f, "Malformed parameters for {}: {}", kind, message)
            }
            Self::InvalidParameter {
                kind,
                field,
                reason,
            } => write!(f, "Invalid parameter '{}' for {}: {}", field, kind, reason),
        }
    }
}

impl std::error::Error for ValidationError {}

/// The producer is not allowed to submit the instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthorizationError {
    /// The instruction carries no producer id.
    MissingProducerId,

    /// No producer with this id is registered.
    UnknownProducer(ProducerId),

    /// The producer is registered but may not issue this kind.
    KindNotPermitted {
        producer: ProducerId,
        kind: InstructionKind,
    },
}

impl fmt::Display for AuthorizationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingProducerId => write!(f, "Instruction has no producer id"),
            Self::UnknownProducer(id) => write!(f, "Unknown producer: {}", id),
            Self::KindNotPermitted { producer, kind } => {
                write!(f, "Producer {} is not permitted to issue {}", producer, kind)
            }
        }
    }
}

impl std::error::Error for AuthorizationError {}

/// Errors surfaced by the arbiter.
#[derive(Debug, Clone)]
pub enum ArbiterError {
    /// Malformed instruction (never reaches the queue).
    Validation(ValidationError),

    /// Unauthorized producer (never reaches the queue).
    Authorization(AuthorizationError),

    /// Invalid configuration, e.g. an asymmetric conflict table.
    Config(String),

    /// Durable store failure. The scheduler logs and swallows these; only the
    /// store APIs themselves return them.
    Persistence(String),

    /// Internal error occurred.
    Internal(String),
}

impl fmt::Display for ArbiterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation(e) => write!(f, "Validation failed: {}", e),
            Self::Authorization(e) => write!(f, "Authorization failed: {}", e),
            Self::Config(msg) => write!(f, "Configuration error: {}", msg),
            Self::Persistence(msg) => write!(f, "Persistence error: {}", msg),
            Self::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for ArbiterError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Validation(e) => Some(e),
            Self::Authorization(e) => Some(e),
            _ => None,
        }
    }
}

/// Result type for arbiter operations.
pub type ArbiterResult<T> = Result<T, ArbiterError>;

impl From<ValidationError> for ArbiterError {
    fn from(err: ValidationError) -> Self {
        Self::Validation(err)
    }
}

impl From<AuthorizationError> for ArbiterError {
    fn from(err: AuthorizationError) -> Self {
        Self::Authorization(err)
    }
}

impl From<anyhow::Error> for ArbiterError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl ArbiterError {
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    pub fn is_authorization(&self) -> bool {
        matches!(self, Self::Authorization(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        let err = ValidationError::UnknownKind("show_fireworks".to_string());
        assert_eq!(err.to_string(), "Unknown instruction kind: show_fireworks");

        let err = AuthorizationError::KindNotPermitted {
            producer: ProducerId::new("agent2"),
            kind: InstructionKind::DisplayForm,
        };
        assert_eq!(
            err.to_string(),
            "Producer agent2 is not permitted to issue display_form"
        );
    }

    #[test]
    fn test_conversions_keep_category() {
        let err: ArbiterError = ValidationError::NegativeSequence(-1).into();
        assert!(err.is_validation());
        assert!(!err.is_authorization());

        let err: ArbiterError = AuthorizationError::MissingProducerId.into();
        assert!(err.is_authorization());
        assert!(std::error::Error::source(&err).is_some());
    }
}
