//! Core types for the action gateway.
//!
//! This module provides foundational types used throughout the system:
//! - **IDs**: Strongly-typed identifiers (TraceId, ObjectId)
//! - **Errors**: Application error types with thiserror derives
//! - **Config**: Configuration structures for transports, locks and observability

mod config;
mod errors;
mod ids;

pub use config::{BusConfig, Config, LockConfig, ObservabilityConfig, RpcConfig};
pub use errors::{ApiError, Error, ErrorData, ErrorType, Result};
pub use ids::{ObjectId, ObjectIdParseError, RequestId, TraceId, OBJECT_ID_LEN};
