//! Error types for ACL reconciliation.

use std::fmt;

use thiserror::Error;

use crate::reconciler::Phase;
use crate::validation::ValidationError;

/// Errors reported by the rule control API.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    /// Resource not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// The API answered with an error status.
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// The request never got an answer.
    #[error("request failed: {0}")]
    Transport(String),

    /// The answer could not be decoded.
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl RemoteError {
    /// Whether this error means the sub-rule `id` no longer exists.
    ///
    /// The control plane has no dedicated status for this, so the message
    /// text is the only signal.
    pub fn is_already_gone(&self, id: &str) -> bool {
        self.to_string().contains(&already_gone_message(id))
    }
}

/// Message the control plane returns when deleting an unknown sub-rule.
pub fn already_gone_message(id: &str) -> String {
    format!(
        "Invalid parameter id value={} due to incorrect long value format, or entity does not exist",
        id
    )
}

/// Kind of remote operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Create,
    Delete,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Create => write!(f, "create"),
            OperationKind::Delete => write!(f, "delete"),
        }
    }
}

/// A single failed sub-rule operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} of sub-rule {key:?} for rule {rule_index} ({rule}) failed: {source}")]
pub struct OperationError {
    pub kind: OperationKind,
    /// Position of the owning rule in the batch input
    pub rule_index: usize,
    /// Description of the owning rule
    pub rule: String,
    pub key: String,
    pub source: RemoteError,
}

/// All failures of one applier batch.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BatchError {
    pub errors: Vec<OperationError>,
}

impl BatchError {
    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// `Ok` when the batch had no failures, otherwise the errors ordered by
    /// rule and key.
    pub fn into_result(mut self) -> std::result::Result<(), BatchError> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            self.errors
                .sort_by(|a, b| (a.rule_index, &a.key).cmp(&(b.rule_index, &b.key)));
            Err(self)
        }
    }

    /// Whether the batch contains a failure for the given rule and key.
    pub fn contains(&self, rule_index: usize, key: &str) -> bool {
        self.errors
            .iter()
            .any(|e| e.rule_index == rule_index && e.key == key)
    }
}

impl fmt::Display for BatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let noun = if self.errors.len() == 1 {
            "error"
        } else {
            "errors"
        };
        write!(f, "{} {} occurred:", self.errors.len(), noun)?;
        for err in &self.errors {
            write!(f, "\n\t* {}", err)?;
        }
        Ok(())
    }
}

impl std::error::Error for BatchError {}

/// Top-level reconciliation error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AclError {
    #[error("invalid configuration: {0}")]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Batch(#[from] BatchError),

    #[error("control plane error: {0}")]
    Remote(#[from] RemoteError),

    #[error("cannot move from {from} to {to}")]
    InvalidTransition { from: Phase, to: Phase },

    #[error("configuration targets ACL {configured} but state tracks ACL {tracked}")]
    AclMismatch { configured: String, tracked: String },
}

pub type Result<T> = std::result::Result<T, AclError>;
