use serde_json::Value;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("failed to decode message: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("malformed operation: {0}")]
    MalformedOperation(String),
    #[error("message too large: {size} > {limit}")]
    TooLarge { size: usize, limit: usize },
}

/// Failure reported by a handler factory, setter, method or listener hook.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    #[error("object is not a {expected}")]
    TypeMismatch { expected: &'static str },
    #[error("invalid value for {property}: {reason}")]
    InvalidValue { property: String, reason: String },
    #[error("{0}")]
    Failed(String),
}

impl HandlerError {
    pub fn invalid(property: impl Into<String>, reason: impl Into<String>) -> Self {
        HandlerError::InvalidValue {
            property: property.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("target not found: {0}")]
    TargetNotFound(String),
    #[error("no handler registered for type {0}")]
    UnknownType(String),
    #[error("type {0} is a service object and cannot be created")]
    UnsupportedOperation(String),
    #[error("method {method} is not declared by type {type_name}")]
    UnknownMethod { type_name: String, method: String },
    #[error(transparent)]
    Handler(#[from] HandlerError),
    #[error("a paused message is already pending")]
    PauseAlreadyPending,
    #[error("no paused message to resume")]
    NothingToResume,
    #[error(transparent)]
    OperationFailed(Box<OperationFault>),
}

impl ProcessError {
    /// The underlying cause, looking through an operation fault wrapper.
    pub fn root_cause(&self) -> &ProcessError {
        match self {
            ProcessError::OperationFailed(fault) => fault.cause.root_cause(),
            other => other,
        }
    }
}

/// Diagnostic context captured when one operation of a message fails.
#[derive(Debug)]
pub struct OperationFault {
    pub kind: &'static str,
    pub target: String,
    pub type_name: Option<String>,
    pub properties: Option<Value>,
    pub index: usize,
    pub cause: Box<ProcessError>,
}

impl fmt::Display for OperationFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "operation \"{}\" #{} on target \"{}\"",
            self.kind, self.index, self.target
        )?;
        if let Some(type_name) = &self.type_name {
            write!(f, " of type \"{type_name}\"")?;
        }
        write!(f, " failed: {}", self.cause)?;
        if let Some(properties) = &self.properties {
            write!(f, "; properties: {properties}")?;
        }
        Ok(())
    }
}

impl std::error::Error for OperationFault {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.cause.as_ref())
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no failed request to retry")]
    NothingToRetry,
    #[error("session has terminated: {0}")]
    Terminated(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Process(#[from] ProcessError),
}
