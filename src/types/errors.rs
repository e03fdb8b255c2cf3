//! Application error types.
//!
//! All errors use `thiserror` for automatic Error trait derivation. Every
//! variant carries an application (HTTP-style) status code; the RPC adapter
//! translates that status through [`crate::status`], the bus adapter ships it
//! to the caller unchanged.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Application result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Whether an error is an expected business outcome or a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ErrorType {
    /// Expected failure the caller can act on (bad input, missing entity).
    #[default]
    Operated,
    /// Unexpected failure (infrastructure, programmer defect).
    Unoperated,
}

impl ErrorType {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorType::Operated => "operated",
            ErrorType::Unoperated => "unoperated",
        }
    }
}

/// Secondary error payload carried by business errors.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorData {
    /// Process code shown to end users; forwarded as RPC metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_code: Option<u64>,

    /// Secondary status code, consulted when the primary status is unmapped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<u16>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Business-logic failure raised by an action handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiError {
    pub message: String,
    /// Application status code (HTTP vocabulary).
    #[serde(rename = "code")]
    pub status: u16,
    #[serde(default = "ApiError::default_name")]
    pub name: String,
    #[serde(rename = "type", default)]
    pub error_type: ErrorType,
    #[serde(default)]
    pub data: ErrorData,
}

impl ApiError {
    pub fn new(message: impl Into<String>, status: u16) -> Self {
        Self {
            message: message.into(),
            status,
            name: Self::default_name(),
            error_type: ErrorType::Operated,
            data: ErrorData::default(),
        }
    }

    fn default_name() -> String {
        "ApiError".to_string()
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_type(mut self, error_type: ErrorType) -> Self {
        self.error_type = error_type;
        self
    }

    pub fn with_process_code(mut self, process_code: u64) -> Self {
        self.data.process_code = Some(process_code);
        self
    }

    pub fn with_data_code(mut self, code: u16) -> Self {
        self.data.code = Some(code);
        self
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Main error enum for the gateway.
#[derive(Error, Debug)]
pub enum Error {
    /// Input failed schema validation (422, maps to INVALID_ARGUMENT).
    #[error("validation error: {0}")]
    Validation(String),

    /// Business error raised by an action handler.
    #[error("{0}")]
    Api(ApiError),

    /// Resource not found (404).
    #[error("not found: {0}")]
    NotFound(String),

    /// No action registered for the requested version (501).
    #[error("action not found for version {version}")]
    NotImplemented { version: String },

    /// RPC call addressed a service or method nobody serves (501).
    #[error("unknown method: {0}")]
    UnknownMethod(String),

    /// Lock provider refused or timed out (503).
    #[error("lock unavailable for resource {resource}: {reason}")]
    LockUnavailable { resource: String, reason: String },

    /// Session carried a tag outside the closed set. Programmer defect.
    #[error("Unexpected sessionType: {0}")]
    UnknownSessionType(String),

    /// Startup misconfiguration of the action set.
    #[error("registration error: {0}")]
    Registration(String),

    /// Transport deadline elapsed before the call completed (504).
    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),

    /// Error reply received from a remote RPC server.
    #[error("rpc error {}: {}", .0.code.as_str(), .0.message)]
    Rpc(crate::status::RpcError),

    /// Internal errors (500).
    #[error("internal error: {0}")]
    Internal(String),

    /// Serialization/deserialization errors.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Application status code (HTTP vocabulary).
    pub fn status_code(&self) -> u16 {
        match self {
            Error::Validation(_) => 422,
            Error::Api(api) => api.status,
            Error::NotFound(_) => 404,
            Error::NotImplemented { .. } | Error::UnknownMethod(_) => 501,
            Error::LockUnavailable { .. } => 503,
            Error::DeadlineExceeded(_) => 504,
            Error::Rpc(rpc) => rpc.code.to_http_status(),
            Error::UnknownSessionType(_)
            | Error::Registration(_)
            | Error::Internal(_)
            | Error::Serialization(_)
            | Error::Io(_) => 500,
        }
    }

    pub fn error_type(&self) -> ErrorType {
        match self {
            Error::Validation(_)
            | Error::NotFound(_)
            | Error::NotImplemented { .. }
            | Error::UnknownMethod(_) => ErrorType::Operated,
            Error::Api(api) => api.error_type,
            _ => ErrorType::Unoperated,
        }
    }

    /// Short error class name recorded on spans.
    pub fn name(&self) -> &str {
        match self {
            Error::Validation(_) => "ValidationError",
            Error::Api(api) => &api.name,
            Error::NotFound(_) => "NotFoundError",
            Error::NotImplemented { .. } | Error::UnknownMethod(_) => "NotImplementedError",
            Error::LockUnavailable { .. } => "LockError",
            Error::UnknownSessionType(_) => "UnknownSessionTypeError",
            Error::Registration(_) => "RegistrationError",
            Error::DeadlineExceeded(_) => "DeadlineExceededError",
            Error::Rpc(_) => "RpcError",
            Error::Internal(_) => "InternalError",
            Error::Serialization(_) => "SerializationError",
            Error::Io(_) => "IoError",
        }
    }

    pub fn process_code(&self) -> Option<u64> {
        match self {
            Error::Api(api) => api.data.process_code,
            Error::Rpc(rpc) => rpc
                .metadata
                .get(crate::status::PROCESS_CODE_KEY)
                .and_then(|v| v.parse().ok()),
            _ => None,
        }
    }

    /// Secondary status code carried in the error data, if any.
    pub fn data_code(&self) -> Option<u16> {
        match self {
            Error::Api(api) => api.data.code,
            _ => None,
        }
    }

    /// Wire form shipped to bus callers.
    pub fn to_api_error(&self) -> ApiError {
        match self {
            Error::Api(api) => api.clone(),
            other => {
                let mut api = ApiError::new(other.to_string(), other.status_code())
                    .with_name(other.name())
                    .with_type(other.error_type());
                api.data.process_code = other.process_code();
                api
            }
        }
    }
}

// Convenience constructors
impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn not_implemented(version: impl Into<String>) -> Self {
        Self::NotImplemented {
            version: version.into(),
        }
    }

    pub fn lock_unavailable(resource: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::LockUnavailable {
            resource: resource.into(),
            reason: reason.into(),
        }
    }

    pub fn registration(msg: impl Into<String>) -> Self {
        Self::Registration(msg.into())
    }

    pub fn deadline_exceeded(msg: impl Into<String>) -> Self {
        Self::DeadlineExceeded(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn api(message: impl Into<String>, status: u16) -> Self {
        Self::Api(ApiError::new(message, status))
    }
}

impl From<ApiError> for Error {
    fn from(err: ApiError) -> Self {
        Error::Api(err)
    }
}
