/*!
 * @file error.rs
 * @brief Unified error type for relaydb, carrying MongoDB's numeric error taxonomy
 */

use thiserror::Error;

/// MongoDB numeric error codes this server is able to produce on the wire.
/// See spec §6/§7. Not exhaustive of MongoDB's own enumeration — only the
/// subset this server emits.
pub mod code {
    pub const BAD_VALUE: i32 = 2;
    pub const ABORTED: i32 = 4;
    pub const HOST_UNREACHABLE: i32 = 6;
    pub const FAILED_TO_PARSE: i32 = 9;
    pub const ILLEGAL_OPERATION: i32 = 20;
    pub const NAMESPACE_NOT_FOUND: i32 = 26;
    pub const INDEX_NOT_FOUND: i32 = 27;
    pub const EXCEEDED_TIME_LIMIT: i32 = 50;
    pub const COMMAND_NOT_FOUND: i32 = 59;
    pub const CURSOR_NOT_FOUND: i32 = 43;
    pub const CURSOR_IN_USE: i32 = 211;
}

fn code_name(code: i32) -> &'static str {
    use self::code::*;
    match code {
        BAD_VALUE => "BadValue",
        ABORTED => "Aborted",
        HOST_UNREACHABLE => "HostUnreachable",
        FAILED_TO_PARSE => "FailedToParse",
        ILLEGAL_OPERATION => "IllegalOperation",
        NAMESPACE_NOT_FOUND => "NamespaceNotFound",
        INDEX_NOT_FOUND => "IndexNotFound",
        EXCEEDED_TIME_LIMIT => "ExceededTimeLimit",
        COMMAND_NOT_FOUND => "CommandNotFound",
        CURSOR_NOT_FOUND => "CursorNotFound",
        CURSOR_IN_USE => "CursorInUse",
        _ => "UnknownError",
    }
}

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("{0}")]
    BadValue(String),

    #[error("failed to parse: {0}")]
    FailedToParse(String),

    #[error("namespace not found: {0}")]
    NamespaceNotFound(String),

    #[error("index not found: {0}")]
    IndexNotFound(String),

    #[error("{operation} is not permitted: backend is read-only")]
    ReadOnlyOperation { operation: String },

    #[error("command not found: {0}")]
    CommandNotFound(String),

    #[error("cursor not found: {0}")]
    CursorNotFound(u64),

    #[error("cursor {0} is already in use by a concurrent getMore")]
    CursorInUse(u64),

    #[error("operation exceeded its time limit")]
    ExceededTimeLimit,

    #[error("operation aborted: {0}")]
    Aborted(String),

    #[error("backend unreachable: {0}")]
    HostUnreachable(String),

    #[error("circuit breaker open: {0}")]
    CircuitBreakerOpen(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("wire protocol error: {0}")]
    WireProtocol(String),

    #[error("function evaluator error: {0}")]
    FunctionEvaluator(String),

    #[error("connection pool error: {0}")]
    ConnectionPool(String),

    #[error(transparent)]
    Bson(#[from] bson::de::Error),

    #[error(transparent)]
    BsonSerialization(#[from] bson::ser::Error),

    #[error(transparent)]
    Network(#[from] std::io::Error),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Postgres(#[from] tokio_postgres::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, RelayError>;

impl RelayError {
    pub fn bad_value(msg: impl Into<String>) -> Self {
        Self::BadValue(msg.into())
    }

    pub fn internal_error(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn timeout_error(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn circuit_breaker_error(msg: impl Into<String>) -> Self {
        Self::CircuitBreakerOpen(msg.into())
    }

    pub fn read_only(operation: impl Into<String>) -> Self {
        Self::ReadOnlyOperation {
            operation: operation.into(),
        }
    }

    /// The MongoDB numeric error code this error maps to on the wire.
    pub fn code(&self) -> i32 {
        use self::code::*;
        match self {
            Self::BadValue(_) => BAD_VALUE,
            Self::FailedToParse(_) => FAILED_TO_PARSE,
            Self::NamespaceNotFound(_) => NAMESPACE_NOT_FOUND,
            Self::IndexNotFound(_) => INDEX_NOT_FOUND,
            Self::ReadOnlyOperation { .. } => ILLEGAL_OPERATION,
            Self::CommandNotFound(_) => COMMAND_NOT_FOUND,
            Self::CursorNotFound(_) => CURSOR_NOT_FOUND,
            Self::CursorInUse(_) => CURSOR_IN_USE,
            Self::ExceededTimeLimit => EXCEEDED_TIME_LIMIT,
            Self::Aborted(_) => ABORTED,
            Self::HostUnreachable(_) => HOST_UNREACHABLE,
            Self::CircuitBreakerOpen(_) => HOST_UNREACHABLE,
            Self::Timeout(_) => EXCEEDED_TIME_LIMIT,
            _ => BAD_VALUE,
        }
    }

    pub fn code_name(&self) -> &'static str {
        code_name(self.code())
    }

    /// Whether a caller may retry this error (transient backend failure).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::HostUnreachable(_) | Self::CircuitBreakerOpen(_) | Self::Timeout(_)
        )
    }

    /// Build the `{ ok: 0, code, codeName, errmsg }` wire response document.
    pub fn to_command_error_document(&self) -> bson::Document {
        bson::doc! {
            "ok": 0.0,
            "code": self.code(),
            "codeName": self.code_name(),
            "errmsg": self.to_string(),
        }
    }
}
