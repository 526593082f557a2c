//! Key selection and health bookkeeping for the relay.
//!
//! This crate does **not** perform IO. The core crate builds requests with the types
//! here, sends them through its HTTP client, and feeds results back in.

pub mod classify;
pub mod headers;
pub mod health;
pub mod rotation;
pub mod stats;
pub mod upstream;

pub use classify::{FailureClass, classify_failure, error_message, is_quota_error};
pub use headers::{Headers, header_get};
pub use health::{HealthBoard, HealthStatus, SweepGuard};
pub use rotation::{RotationCursor, RotationError, select, select_after_failure};
pub use stats::{KeyCounters, KeyStats};
pub use upstream::{
    HttpMethod, UpstreamFailure, UpstreamHttpRequest, UpstreamHttpResponse,
    UpstreamTransportErrorKind,
};

pub use keyrelay_common::ExhaustedPolicy;
