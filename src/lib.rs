//! # Action Gateway - Transport-Agnostic Action Execution
//!
//! One execution core behind two transports:
//! - Action registry with versioned routes and JSON Schema rules
//! - Dispatch core: validation, session projection, resource locks, spans, metrics
//! - Message bus adapter and outbound bus client
//! - Framed RPC adapter with service descriptors, health and deadlines
//! - Identifier codec for ObjectIds on the bus
//!
//! ## Architecture
//!
//! ```text
//!   bus call ──► BusAdapter ──┐
//!                             ├──► ActionExecutor ──► handler
//!   rpc call ──► RpcServer  ──┘      │   │   │
//!                                    │   │   └── LockProvider
//!                                    │   └────── Tracer / MetricsSink
//!                                    └────────── Validator
//! ```

// Enforce strict safety at compile time
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

pub mod action;
pub mod bus;
pub mod codec;
pub mod dispatch;
pub mod lock;
pub mod rpc;
pub mod session;
pub mod status;
pub mod telemetry;
pub mod testing;
pub mod types;
pub mod validation;

// Internal utilities
pub mod observability;

pub use types::{Config, Error, Result};
