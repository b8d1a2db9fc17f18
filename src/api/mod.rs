//! REST API client module for the sync server.
//!
//! This module provides the `ApiClient` for the pairing endpoints
//! (code issue, enrollment polling, finalize), the heartbeat ping,
//! and the per-file upload.
//!
//! Authenticated calls use the bearer token obtained at enrollment.

pub mod client;
pub mod error;

pub use client::{ApiClient, EnrollmentCode, HeartbeatResponse, PollResult};
pub use error::ApiError;
