//! Crate-wide error taxonomy.
//!
//! Every fatal condition a preparation pass can hit maps onto one variant;
//! per-row recoverable outcomes (unknown group, filtered application)
//! never surface here; they yield the configured sentinel value instead.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PrepareError {
    /// Invalid component configuration, detected at validation or when a
    /// preparer is created. Carries the display name of the offending
    /// producer or option.
    #[error("invalid configuration for {subject}: {message}")]
    Configuration { subject: String, message: String },

    /// Invalid argument passed to a builder setter.
    #[error("invalid argument {argument}: {message}")]
    Argument { argument: String, message: String },

    /// DAG validation failure (unresolved placeholder, arity mismatch).
    #[error("invalid graph: {message}")]
    Validation { message: String },

    /// Graph reduction failed to produce the required constant.
    #[error("reduction of {subject} did not yield a constant result")]
    Reduction { subject: String },

    /// A wrapped preparer's process/finish raised.
    #[error("inner preparation task failed: {message}")]
    InnerTask { message: String },

    /// Preparation observed a cancellation request.
    #[error("preparation was cancelled")]
    Cancelled,
}

impl PrepareError {
    pub fn configuration(subject: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Configuration {
            subject: subject.into(),
            message: message.into(),
        }
    }

    pub fn argument(argument: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Argument {
            argument: argument.into(),
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn reduction(subject: impl Into<String>) -> Self {
        Self::Reduction {
            subject: subject.into(),
        }
    }

    pub fn inner(message: impl Into<String>) -> Self {
        Self::InnerTask {
            message: message.into(),
        }
    }

    /// Wraps an inner failure, keeping cancellation transparent so the
    /// outer executor still observes `Cancelled`.
    pub fn from_inner(err: PrepareError) -> Self {
        match err {
            Self::Cancelled => Self::Cancelled,
            other => Self::InnerTask {
                message: other.to_string(),
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, PrepareError>;
