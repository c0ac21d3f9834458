//! Status translation.
//!
//! Turns any error into a transport-neutral [`Classification`]:
//!
//! ```text
//!   error ──► typed FleetError anywhere in chain? ──yes──► kind's fixed code
//!                    │ no
//!                    ▼
//!             phrase table (fixed priority) ──match──► kind's code
//!                    │ none
//!                    ▼
//!                 Internal
//! ```
//!
//! The same classification is rendered as a `tonic::Status` on the schema
//! transport, an inline fault on the binary transport and an HTTP status on
//! the JSON gateway.

use crate::core::error::{ErrorList, FleetError};
use serde::{Deserialize, Serialize};
use std::error::Error as StdError;
use std::fmt;

/// Canonical status codes (numbering matches gRPC).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum StatusCode {
    Ok = 0,
    Cancelled = 1,
    Unknown = 2,
    InvalidArgument = 3,
    DeadlineExceeded = 4,
    NotFound = 5,
    AlreadyExists = 6,
    PermissionDenied = 7,
    ResourceExhausted = 8,
    FailedPrecondition = 9,
    Aborted = 10,
    OutOfRange = 11,
    Unimplemented = 12,
    Internal = 13,
    Unavailable = 14,
    DataLoss = 15,
    Unauthenticated = 16,
}

impl StatusCode {
    /// Numeric value as carried on the wire.
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    /// Parse a numeric code; unknown values map to `Unknown`.
    pub fn from_i32(value: i32) -> Self {
        match value {
            0 => Self::Ok,
            1 => Self::Cancelled,
            3 => Self::InvalidArgument,
            4 => Self::DeadlineExceeded,
            5 => Self::NotFound,
            6 => Self::AlreadyExists,
            7 => Self::PermissionDenied,
            8 => Self::ResourceExhausted,
            9 => Self::FailedPrecondition,
            10 => Self::Aborted,
            11 => Self::OutOfRange,
            12 => Self::Unimplemented,
            13 => Self::Internal,
            14 => Self::Unavailable,
            15 => Self::DataLoss,
            16 => Self::Unauthenticated,
            _ => Self::Unknown,
        }
    }

    /// Equivalent tonic code.
    pub fn to_tonic(self) -> tonic::Code {
        tonic::Code::from_i32(self.as_i32())
    }

    /// HTTP status used by the JSON gateway.
    pub fn http_status(self) -> http::StatusCode {
        use http::StatusCode as H;
        match self {
            Self::Ok => H::OK,
            Self::Cancelled => H::from_u16(499).unwrap_or(H::BAD_REQUEST),
            Self::Unknown | Self::Internal | Self::DataLoss => H::INTERNAL_SERVER_ERROR,
            Self::InvalidArgument | Self::FailedPrecondition | Self::OutOfRange => H::BAD_REQUEST,
            Self::DeadlineExceeded => H::GATEWAY_TIMEOUT,
            Self::NotFound => H::NOT_FOUND,
            Self::AlreadyExists | Self::Aborted => H::CONFLICT,
            Self::PermissionDenied => H::FORBIDDEN,
            Self::ResourceExhausted => H::TOO_MANY_REQUESTS,
            Self::Unimplemented => H::NOT_IMPLEMENTED,
            Self::Unavailable => H::SERVICE_UNAVAILABLE,
            Self::Unauthenticated => H::UNAUTHORIZED,
        }
    }

    /// Upper snake case name, as rendered in gateway error bodies.
    pub fn name(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Cancelled => "CANCELLED",
            Self::Unknown => "UNKNOWN",
            Self::InvalidArgument => "INVALID_ARGUMENT",
            Self::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Self::NotFound => "NOT_FOUND",
            Self::AlreadyExists => "ALREADY_EXISTS",
            Self::PermissionDenied => "PERMISSION_DENIED",
            Self::ResourceExhausted => "RESOURCE_EXHAUSTED",
            Self::FailedPrecondition => "FAILED_PRECONDITION",
            Self::Aborted => "ABORTED",
            Self::OutOfRange => "OUT_OF_RANGE",
            Self::Unimplemented => "UNIMPLEMENTED",
            Self::Internal => "INTERNAL",
            Self::Unavailable => "UNAVAILABLE",
            Self::DataLoss => "DATA_LOSS",
            Self::Unauthenticated => "UNAUTHENTICATED",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl From<tonic::Code> for StatusCode {
    fn from(code: tonic::Code) -> Self {
        Self::from_i32(code as i32)
    }
}

/// Result of classifying an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    /// Status code callers branch on.
    pub code: StatusCode,
    /// Full rendered error text, for diagnostics only.
    pub message: String,
}

impl Classification {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Render as a tonic status.
    pub fn to_status(&self) -> tonic::Status {
        tonic::Status::new(self.code.to_tonic(), self.message.clone())
    }
}

impl From<Classification> for tonic::Status {
    fn from(c: Classification) -> Self {
        tonic::Status::new(c.code.to_tonic(), c.message)
    }
}

impl From<&tonic::Status> for Classification {
    fn from(status: &tonic::Status) -> Self {
        Self::new(status.code().into(), status.message())
    }
}

/// Untyped error phrases, tested in this order; first match wins.
const PHRASES: &[(StatusCode, &[&str])] = &[
    (
        StatusCode::NotFound,
        &["not found", "does not exist", "no such", "unknown"],
    ),
    (
        StatusCode::PermissionDenied,
        &["permission denied", "access denied", "forbidden"],
    ),
    (
        StatusCode::Unauthenticated,
        &[
            "unauthenticated",
            "not authenticated",
            "authentication required",
        ],
    ),
    (
        StatusCode::AlreadyExists,
        &["already exists", "duplicate", "conflict"],
    ),
    (
        StatusCode::InvalidArgument,
        &["invalid", "malformed", "bad request", "illegal"],
    ),
    (
        StatusCode::Unavailable,
        &["unavailable", "service down", "connection refused"],
    ),
    (
        StatusCode::DeadlineExceeded,
        &["timeout", "deadline exceeded", "timed out"],
    ),
];

/// Classify an untyped message by phrase.
pub fn classify_message(message: &str) -> StatusCode {
    let lower = message.to_lowercase();
    PHRASES
        .iter()
        .find(|(_, phrases)| phrases.iter().any(|p| lower.contains(p)))
        .map(|(code, _)| *code)
        .unwrap_or(StatusCode::Internal)
}

/// Find the first typed error in a source chain, descending into joined
/// error lists.
fn find_typed(error: &(dyn StdError + 'static)) -> Option<StatusCode> {
    let mut current: Option<&(dyn StdError + 'static)> = Some(error);
    while let Some(err) = current {
        if let Some(typed) = err.downcast_ref::<FleetError>() {
            return Some(typed.code());
        }
        if let Some(list) = err.downcast_ref::<ErrorList>() {
            for member in list.iter() {
                let member: &(dyn StdError + 'static) = member.as_ref();
                if let Some(code) = find_typed(member) {
                    return Some(code);
                }
            }
        }
        current = err.source();
    }
    None
}

/// Render the error together with its causes.
fn render_chain(error: &(dyn StdError + 'static)) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if !message.ends_with(&text) {
            message.push_str(": ");
            message.push_str(&text);
        }
        source = cause.source();
    }
    message
}

/// Classify any standard error.
///
/// Deterministic and total: every input yields a classification.
pub fn classify(error: &(dyn StdError + 'static)) -> Classification {
    let message = render_chain(error);
    match find_typed(error) {
        Some(code) => Classification::new(code, message),
        None => Classification::new(classify_message(&message), message),
    }
}

/// Classify an `anyhow` error, walking its whole context chain.
pub fn classify_anyhow(error: &anyhow::Error) -> Classification {
    let message = format!("{:#}", error);
    let typed = error.chain().find_map(|err| {
        if let Some(typed) = err.downcast_ref::<FleetError>() {
            return Some(typed.code());
        }
        err.downcast_ref::<ErrorList>().and_then(|list| {
            list.iter().find_map(|member| {
                let member: &(dyn StdError + 'static) = member.as_ref();
                find_typed(member)
            })
        })
    });
    match typed {
        Some(code) => Classification::new(code, message),
        None => Classification::new(classify_message(&message), message),
    }
}
