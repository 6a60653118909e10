use std::fmt;

use crate::ids::ClientIdentity;
use crate::wire::ErrorMessage;

pub type Result<T, E = ConnectorError> = std::result::Result<T, E>;

/// Error categories reported by the platform, keyed by their `AXONIQ-xxxx` code.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorCategory {
    AuthenticationTokenMissing,
    AuthenticationInvalidToken,
    UnsupportedInstruction,
    InstructionAckError,
    InstructionExecutionError,
    InvalidEventSequence,
    NoEventStoreMasterAvailable,
    EventPayloadTooLarge,
    ConnectionFailed,
    GrpcMessageTooLarge,
    NoHandlerForCommand,
    CommandExecutionError,
    CommandDispatchError,
    ConcurrencyException,
    NoHandlerForQuery,
    QueryExecutionError,
    QueryDispatchError,
    DatafileReadError,
    IndexReadError,
    DatafileWriteError,
    IndexWriteError,
    DirectoryCreationFailed,
    ValidationFailed,
    TransactionRolledBack,
    Other,
}

impl ErrorCategory {
    pub const ALL: [ErrorCategory; 25] = [
        Self::AuthenticationTokenMissing,
        Self::AuthenticationInvalidToken,
        Self::UnsupportedInstruction,
        Self::InstructionAckError,
        Self::InstructionExecutionError,
        Self::InvalidEventSequence,
        Self::NoEventStoreMasterAvailable,
        Self::EventPayloadTooLarge,
        Self::ConnectionFailed,
        Self::GrpcMessageTooLarge,
        Self::NoHandlerForCommand,
        Self::CommandExecutionError,
        Self::CommandDispatchError,
        Self::ConcurrencyException,
        Self::NoHandlerForQuery,
        Self::QueryExecutionError,
        Self::QueryDispatchError,
        Self::DatafileReadError,
        Self::IndexReadError,
        Self::DatafileWriteError,
        Self::IndexWriteError,
        Self::DirectoryCreationFailed,
        Self::ValidationFailed,
        Self::TransactionRolledBack,
        Self::Other,
    ];

    pub fn code(self) -> &'static str {
        match self {
            Self::AuthenticationTokenMissing => "AXONIQ-1000",
            Self::AuthenticationInvalidToken => "AXONIQ-1001",
            Self::UnsupportedInstruction => "AXONIQ-1002",
            Self::InstructionAckError => "AXONIQ-1003",
            Self::InstructionExecutionError => "AXONIQ-1004",
            Self::InvalidEventSequence => "AXONIQ-2000",
            Self::NoEventStoreMasterAvailable => "AXONIQ-2100",
            Self::EventPayloadTooLarge => "AXONIQ-2001",
            Self::ConnectionFailed => "AXONIQ-3001",
            Self::GrpcMessageTooLarge => "AXONIQ-3002",
            Self::NoHandlerForCommand => "AXONIQ-4000",
            Self::CommandExecutionError => "AXONIQ-4002",
            Self::CommandDispatchError => "AXONIQ-4003",
            Self::ConcurrencyException => "AXONIQ-4004",
            Self::NoHandlerForQuery => "AXONIQ-5000",
            Self::QueryExecutionError => "AXONIQ-5001",
            Self::QueryDispatchError => "AXONIQ-5002",
            Self::DatafileReadError => "AXONIQ-9000",
            Self::IndexReadError => "AXONIQ-9001",
            Self::DatafileWriteError => "AXONIQ-9100",
            Self::IndexWriteError => "AXONIQ-9101",
            Self::DirectoryCreationFailed => "AXONIQ-9102",
            Self::ValidationFailed => "AXONIQ-9200",
            Self::TransactionRolledBack => "AXONIQ-9900",
            Self::Other => "AXONIQ-0001",
        }
    }

    /// Unknown or empty codes map to [`ErrorCategory::Other`].
    pub fn parse(code: &str) -> Self {
        Self::ALL
            .iter()
            .copied()
            .find(|category| category.code() == code)
            .unwrap_or(Self::Other)
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// An instruction the platform rejected, or a failure the client reports in the
/// platform's vocabulary.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
#[error("{category}: {message}")]
pub struct PlatformError {
    pub client_identity: ClientIdentity,
    pub category: ErrorCategory,
    pub message: String,
    pub location: String,
    pub details: Vec<String>,
}

impl PlatformError {
    pub fn new(
        client_identity: ClientIdentity,
        category: ErrorCategory,
        message: impl Into<String>,
    ) -> Self {
        Self {
            client_identity,
            category,
            message: message.into(),
            location: String::new(),
            details: Vec::new(),
        }
    }

    pub fn from_error_message(client_identity: ClientIdentity, error: &ErrorMessage) -> Self {
        Self {
            client_identity,
            category: ErrorCategory::parse(&error.error_code),
            message: error.message.clone(),
            location: error.location.clone(),
            details: error.details.clone(),
        }
    }

    pub fn to_error_message(&self) -> ErrorMessage {
        ErrorMessage {
            error_code: self.category.code().to_string(),
            message: self.message.clone(),
            location: self.location.clone(),
            details: self.details.clone(),
        }
    }
}

/// Status codes a streaming RPC transport reports.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StatusCode {
    Ok,
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
    Unauthenticated,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum TransportError {
    #[error("rpc failed with {code:?}: {message}")]
    Status { code: StatusCode, message: String },

    #[error("stream io failure: {message}")]
    Io { message: String },

    #[error("stream closed")]
    Closed,
}

impl TransportError {
    pub fn status(code: StatusCode, message: impl Into<String>) -> Self {
        Self::Status {
            code,
            message: message.into(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::status(StatusCode::Unavailable, message)
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::Io {
            message: message.into(),
        }
    }

    /// IO failures carry no status and count as `Unknown`.
    pub fn code(&self) -> StatusCode {
        match self {
            Self::Status { code, .. } => *code,
            Self::Io { .. } => StatusCode::Unknown,
            Self::Closed => StatusCode::Unavailable,
        }
    }

    /// Returns `true` when the failure means the connection itself is gone.
    pub fn requires_reconnect(&self) -> bool {
        match self {
            Self::Status { code, .. } => *code == StatusCode::Unavailable,
            Self::Io { .. } | Self::Closed => true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("failed to parse configuration: {0}")]
    Parse(String),
}

impl ConfigError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Errors surfaced by connector operations.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum ConnectorError {
    #[error(transparent)]
    Platform(#[from] PlatformError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("timeout: {operation}")]
    Timeout { operation: String },

    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("{component} is closed")]
    Closed { component: &'static str },

    #[error("{} operations failed, first: {}", .0.len(), first_message(.0))]
    Aggregate(Vec<ConnectorError>),
}

fn first_message(errors: &[ConnectorError]) -> String {
    errors.first().map(ToString::to_string).unwrap_or_default()
}

impl ConnectorError {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable {
            reason: reason.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Returns `true` for transient errors that may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Unavailable { .. } | Self::Timeout { .. } => true,
            Self::Transport(error) => error.requires_reconnect(),
            _ => false,
        }
    }

    /// The platform category this error maps to, `Other` for local failures.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Platform(error) => error.category,
            Self::Aggregate(errors) => errors
                .first()
                .map(ConnectorError::category)
                .unwrap_or(ErrorCategory::Other),
            _ => ErrorCategory::Other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categories_round_trip_through_their_codes() {
        for category in ErrorCategory::ALL {
            assert_eq!(ErrorCategory::parse(category.code()), category);
        }
    }

    #[test]
    fn unknown_codes_parse_as_other() {
        assert_eq!(ErrorCategory::parse(""), ErrorCategory::Other);
        assert_eq!(ErrorCategory::parse("AXONIQ-7777"), ErrorCategory::Other);
        assert_eq!(ErrorCategory::Other.code(), "AXONIQ-0001");
    }

    #[test]
    fn unavailable_and_io_failures_require_reconnect() {
        assert!(TransportError::unavailable("down").requires_reconnect());
        assert!(TransportError::io("reset").requires_reconnect());
        assert!(!TransportError::status(StatusCode::PermissionDenied, "no").requires_reconnect());
        assert_eq!(TransportError::io("reset").code(), StatusCode::Unknown);
    }

    #[test]
    fn aggregate_reports_first_category() {
        let identity = crate::ids::ClientIdentity::new(
            crate::ids::ComponentName::generate(),
            crate::ids::ClientInstanceId::generate(),
        );
        let error = ConnectorError::Aggregate(vec![
            PlatformError::new(identity, ErrorCategory::NoHandlerForCommand, "none").into(),
            ConnectorError::Cancelled,
        ]);
        assert_eq!(error.category(), ErrorCategory::NoHandlerForCommand);
        assert!(error.to_string().starts_with("2 operations failed"));
    }
}
