//! Uniform success/failure envelope shared by every public operation.
//!
//! An operation either yields its value or a [`Failure`]: a non-empty,
//! ordered list of [`ErrorRecord`]s. The first record is the one a caller
//! surfaces when it halts a workflow.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Result type returned by every engine operation.
pub type Outcome<T = ()> = Result<T, Failure>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Operation attempted from a stage where it is not legal.
    StageViolation,
    /// Malformed device-description, topology or configuration input.
    ParseError,
    UnknownDeviceType,
    DuplicateTypeError,
    DeviceNotFound,
    ModuleNotFound,
    /// Value outside a parameter's type, range or allowed set.
    InvalidParameterValue,
    SafetyModeMismatch,
    CompileError,
    /// Opaque failure reported by (or escaping from) the engineering backend.
    BackendFault,
    /// Required input file missing.
    ResourceUnavailable,
    InvalidArgument,
    Unsupported,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(String::from))
            .unwrap_or_else(|| format!("{:?}", self));
        f.write_str(&s)
    }
}

/// One structured error: what kind, what happened, and optionally why.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub details: serde_json::Value,
}

impl ErrorRecord {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            cause: None,
            details: serde_json::Value::Null,
        }
    }

    pub fn with_cause(mut self, cause: impl fmt::Display) -> Self {
        self.cause = Some(cause.to_string());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    /// Add one field to `details`, turning it into an object if needed.
    pub fn with_detail(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        if !self.details.is_object() {
            self.details = serde_json::Value::Object(Default::default());
        }
        if let Some(map) = self.details.as_object_mut() {
            map.insert(key.to_string(), value.into());
        }
        self
    }

    /// Look up a string field in `details` (e.g. `"parameter"`, `"device"`).
    pub fn detail(&self, key: &str) -> Option<&str> {
        self.details.get(key).and_then(|v| v.as_str())
    }
}

impl fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if let Some(cause) = &self.cause {
            write!(f, " ({})", cause)?;
        }
        Ok(())
    }
}

impl std::error::Error for ErrorRecord {}

/// Non-empty ordered list of error records.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Failure {
    errors: Vec<ErrorRecord>,
}

impl Failure {
    pub fn new(first: ErrorRecord) -> Self {
        Self {
            errors: vec![first],
        }
    }

    /// Returns `None` when `errors` is empty.
    pub fn from_records(errors: Vec<ErrorRecord>) -> Option<Self> {
        if errors.is_empty() {
            None
        } else {
            Some(Self { errors })
        }
    }

    pub fn push(&mut self, record: ErrorRecord) {
        self.errors.push(record);
    }

    pub fn extend(&mut self, other: Failure) {
        self.errors.extend(other.errors);
    }

    pub fn first(&self) -> &ErrorRecord {
        &self.errors[0]
    }

    /// Kind of the first error.
    pub fn kind(&self) -> ErrorKind {
        self.first().kind
    }

    pub fn errors(&self) -> &[ErrorRecord] {
        &self.errors
    }

    pub fn into_errors(self) -> Vec<ErrorRecord> {
        self.errors
    }

    pub fn has_kind(&self, kind: ErrorKind) -> bool {
        self.errors.iter().any(|e| e.kind == kind)
    }
}

impl From<ErrorRecord> for Failure {
    fn from(record: ErrorRecord) -> Self {
        Failure::new(record)
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.first())?;
        if self.errors.len() > 1 {
            write!(f, " (and {} more)", self.errors.len() - 1)?;
        }
        Ok(())
    }
}

impl std::error::Error for Failure {}

/// Shorthand for a single-record failure.
pub fn fail<T>(kind: ErrorKind, message: impl Into<String>) -> Outcome<T> {
    Err(ErrorRecord::new(kind, message).into())
}
