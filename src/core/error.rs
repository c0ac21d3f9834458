//! Error types and canonical status mapping.
//!
//! Fleetrpc surfaces one closed vocabulary of failures to callers. New code
//! emits a [`FleetError`] variant carrying its context fields; legacy backend
//! paths may still return plain string errors, which are routed by the
//! phrase classifier in [`crate::core::status`].

use crate::core::status::StatusCode;
use std::fmt;
use thiserror::Error;

/// Typed fleet errors.
///
/// Every variant maps to exactly one [`StatusCode`] via [`FleetError::code`],
/// independent of the text carried in its fields.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FleetError {
    /// A referenced resource does not exist.
    #[error("{}", render_pair(.resource, .id, "not found"))]
    NotFound {
        /// Resource kind (e.g. "machine", "hypervisor", "subnet").
        resource: String,
        /// Optional identifier (hostname, IP, ...).
        id: String,
    },

    /// The caller lacks permission for the action.
    #[error("{}", render_permission(.resource, .action, .reason))]
    PermissionDenied {
        resource: String,
        action: String,
        reason: String,
    },

    /// The caller could not be authenticated.
    #[error("{}", render_unauthenticated(.message))]
    Unauthenticated { message: String },

    /// The resource already exists.
    #[error("{}", render_pair(.resource, .id, "already exists"))]
    AlreadyExists { resource: String, id: String },

    /// A request argument is invalid.
    #[error("{}", render_invalid(.argument, .reason))]
    InvalidArgument { argument: String, reason: String },

    /// A dependent service is unavailable.
    #[error("{}", render_unavailable(.service, .reason))]
    Unavailable { service: String, reason: String },

    /// An operation ran past its deadline.
    #[error("{}", render_deadline(.operation, .timeout))]
    DeadlineExceeded { operation: String, timeout: String },

    /// A quota or capacity limit was reached.
    #[error("{} exhausted: {}", .resource, .reason)]
    ResourceExhausted { resource: String, reason: String },
}

fn render_pair(resource: &str, id: &str, suffix: &str) -> String {
    if id.is_empty() {
        format!("{} {}", resource, suffix)
    } else {
        format!("{} {} {}", resource, id, suffix)
    }
}

fn render_permission(resource: &str, action: &str, reason: &str) -> String {
    if reason.is_empty() {
        format!("permission denied: {} on {}", action, resource)
    } else {
        format!("permission denied: {} on {}: {}", action, resource, reason)
    }
}

fn render_unauthenticated(message: &str) -> String {
    if message.is_empty() {
        "unauthenticated".to_string()
    } else {
        format!("unauthenticated: {}", message)
    }
}

fn render_invalid(argument: &str, reason: &str) -> String {
    if reason.is_empty() {
        format!("invalid argument: {}", argument)
    } else {
        format!("invalid argument {}: {}", argument, reason)
    }
}

fn render_unavailable(service: &str, reason: &str) -> String {
    if reason.is_empty() {
        format!("{} unavailable", service)
    } else {
        format!("{} unavailable: {}", service, reason)
    }
}

fn render_deadline(operation: &str, timeout: &str) -> String {
    if timeout.is_empty() {
        format!("{} exceeded deadline", operation)
    } else {
        format!("{} exceeded deadline of {}", operation, timeout)
    }
}

impl FleetError {
    /// Canonical status code for this error kind.
    pub fn code(&self) -> StatusCode {
        match self {
            Self::NotFound { .. } => StatusCode::NotFound,
            Self::PermissionDenied { .. } => StatusCode::PermissionDenied,
            Self::Unauthenticated { .. } => StatusCode::Unauthenticated,
            Self::AlreadyExists { .. } => StatusCode::AlreadyExists,
            Self::InvalidArgument { .. } => StatusCode::InvalidArgument,
            Self::Unavailable { .. } => StatusCode::Unavailable,
            Self::DeadlineExceeded { .. } => StatusCode::DeadlineExceeded,
            Self::ResourceExhausted { .. } => StatusCode::ResourceExhausted,
        }
    }

    pub fn not_found(resource: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
            id: id.into(),
        }
    }

    pub fn permission_denied(
        resource: impl Into<String>,
        action: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::PermissionDenied {
            resource: resource.into(),
            action: action.into(),
            reason: reason.into(),
        }
    }

    pub fn unauthenticated(message: impl Into<String>) -> Self {
        Self::Unauthenticated {
            message: message.into(),
        }
    }

    pub fn already_exists(resource: impl Into<String>, id: impl Into<String>) -> Self {
        Self::AlreadyExists {
            resource: resource.into(),
            id: id.into(),
        }
    }

    pub fn invalid_argument(argument: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            argument: argument.into(),
            reason: reason.into(),
        }
    }

    pub fn unavailable(service: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Unavailable {
            service: service.into(),
            reason: reason.into(),
        }
    }

    pub fn deadline_exceeded(operation: impl Into<String>, timeout: impl Into<String>) -> Self {
        Self::DeadlineExceeded {
            operation: operation.into(),
            timeout: timeout.into(),
        }
    }

    pub fn resource_exhausted(resource: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ResourceExhausted {
            resource: resource.into(),
            reason: reason.into(),
        }
    }
}

/// Result type using FleetError.
pub type FleetResult<T> = Result<T, FleetError>;

/// Several independent failures reported together.
///
/// The classifier inspects every member, so a typed error joined with
/// untyped ones still decides the status code.
#[derive(Debug, Default)]
pub struct ErrorList {
    errors: Vec<anyhow::Error>,
}

impl ErrorList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, error: impl Into<anyhow::Error>) {
        self.errors.push(error.into());
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// Iterate over the joined errors.
    pub fn iter(&self) -> impl Iterator<Item = &anyhow::Error> {
        self.errors.iter()
    }

    /// Collapse into `Ok(())` when nothing was recorded.
    pub fn into_result(self) -> anyhow::Result<()> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(anyhow::Error::new(self))
        }
    }
}

impl fmt::Display for ErrorList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, error) in self.errors.iter().enumerate() {
            if i > 0 {
                f.write_str("\n")?;
            }
            write!(f, "{:#}", error)?;
        }
        Ok(())
    }
}

impl std::error::Error for ErrorList {}

impl FromIterator<anyhow::Error> for ErrorList {
    fn from_iter<I: IntoIterator<Item = anyhow::Error>>(iter: I) -> Self {
        Self {
            errors: iter.into_iter().collect(),
        }
    }
}
