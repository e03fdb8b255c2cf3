//! Application status to RPC status translation.
//!
//! Application errors speak HTTP status codes; RPC callers receive the gRPC
//! status vocabulary. Lookup order: primary status, then the error's
//! secondary data code, then `UNKNOWN`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::types::Error;

/// Metadata key carrying the user-facing process code of a failed call.
pub const PROCESS_CODE_KEY: &str = "processCode";

/// RPC status codes (gRPC numbering).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum RpcCode {
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

impl RpcCode {
    pub fn as_str(self) -> &'static str {
        match self {
            RpcCode::Ok => "OK",
            RpcCode::Cancelled => "CANCELLED",
            RpcCode::Unknown => "UNKNOWN",
            RpcCode::InvalidArgument => "INVALID_ARGUMENT",
            RpcCode::DeadlineExceeded => "DEADLINE_EXCEEDED",
            RpcCode::NotFound => "NOT_FOUND",
            RpcCode::AlreadyExists => "ALREADY_EXISTS",
            RpcCode::PermissionDenied => "PERMISSION_DENIED",
            RpcCode::ResourceExhausted => "RESOURCE_EXHAUSTED",
            RpcCode::FailedPrecondition => "FAILED_PRECONDITION",
            RpcCode::Aborted => "ABORTED",
            RpcCode::OutOfRange => "OUT_OF_RANGE",
            RpcCode::Unimplemented => "UNIMPLEMENTED",
            RpcCode::Internal => "INTERNAL",
            RpcCode::Unavailable => "UNAVAILABLE",
            RpcCode::DataLoss => "DATA_LOSS",
            RpcCode::Unauthenticated => "UNAUTHENTICATED",
        }
    }

    /// Application status for an RPC status received from a remote server.
    pub fn to_http_status(self) -> u16 {
        match self {
            RpcCode::Ok => 200,
            RpcCode::InvalidArgument | RpcCode::OutOfRange | RpcCode::FailedPrecondition => 400,
            RpcCode::Unauthenticated => 401,
            RpcCode::PermissionDenied => 403,
            RpcCode::NotFound => 404,
            RpcCode::AlreadyExists | RpcCode::Aborted => 409,
            RpcCode::ResourceExhausted => 429,
            RpcCode::Cancelled => 499,
            RpcCode::Unimplemented => 501,
            RpcCode::Unavailable => 503,
            RpcCode::DeadlineExceeded => 504,
            RpcCode::Unknown | RpcCode::Internal | RpcCode::DataLoss => 500,
        }
    }
}

impl fmt::Display for RpcCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<RpcCode> for u8 {
    fn from(code: RpcCode) -> u8 {
        code as u8
    }
}

impl TryFrom<u8> for RpcCode {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => RpcCode::Ok,
            1 => RpcCode::Cancelled,
            2 => RpcCode::Unknown,
            3 => RpcCode::InvalidArgument,
            4 => RpcCode::DeadlineExceeded,
            5 => RpcCode::NotFound,
            6 => RpcCode::AlreadyExists,
            7 => RpcCode::PermissionDenied,
            8 => RpcCode::ResourceExhausted,
            9 => RpcCode::FailedPrecondition,
            10 => RpcCode::Aborted,
            11 => RpcCode::OutOfRange,
            12 => RpcCode::Unimplemented,
            13 => RpcCode::Internal,
            14 => RpcCode::Unavailable,
            15 => RpcCode::DataLoss,
            16 => RpcCode::Unauthenticated,
            other => return Err(format!("unknown rpc status code {other}")),
        })
    }
}

/// Static application status → RPC status table.
pub const STATUS_TABLE: &[(u16, RpcCode)] = &[
    (102, RpcCode::Ok),
    (200, RpcCode::Ok),
    (201, RpcCode::Ok),
    (202, RpcCode::Ok),
    (204, RpcCode::Ok),
    (206, RpcCode::Ok),
    (400, RpcCode::InvalidArgument),
    (422, RpcCode::InvalidArgument),
    (401, RpcCode::Unauthenticated),
    (403, RpcCode::PermissionDenied),
    (404, RpcCode::NotFound),
    (408, RpcCode::DeadlineExceeded),
    (504, RpcCode::DeadlineExceeded),
    (429, RpcCode::ResourceExhausted),
    (500, RpcCode::Internal),
    (501, RpcCode::Unimplemented),
    (502, RpcCode::Unavailable),
    (503, RpcCode::Unavailable),
    (0, RpcCode::Unknown),
];

/// Table lookup for one status.
pub fn lookup(status: u16) -> Option<RpcCode> {
    STATUS_TABLE
        .iter()
        .find(|(app, _)| *app == status)
        .map(|(_, rpc)| *rpc)
}

/// Translate with fallback: primary status, then secondary data code, then UNKNOWN.
pub fn translate(primary: u16, data_code: Option<u16>) -> RpcCode {
    lookup(primary)
        .or_else(|| data_code.and_then(lookup))
        .unwrap_or(RpcCode::Unknown)
}

/// Error shape returned to RPC callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub message: String,
    pub code: RpcCode,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl RpcError {
    pub fn new(code: RpcCode, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code,
            metadata: BTreeMap::new(),
        }
    }

    pub fn process_code(&self) -> Option<&str> {
        self.metadata.get(PROCESS_CODE_KEY).map(String::as_str)
    }
}

impl From<&Error> for RpcError {
    fn from(err: &Error) -> Self {
        if let Error::Rpc(remote) = err {
            return remote.clone();
        }

        let mut rpc = RpcError::new(translate(err.status_code(), err.data_code()), err.to_string());
        if let Some(process_code) = err.process_code() {
            rpc.metadata
                .insert(PROCESS_CODE_KEY.to_string(), process_code.to_string());
        }
        rpc
    }
}

impl From<RpcError> for Error {
    fn from(err: RpcError) -> Self {
        Error::Rpc(err)
    }
}
