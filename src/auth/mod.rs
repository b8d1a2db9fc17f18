//! Credential persistence and access gating.
//!
//! This module provides:
//! - `Credential` / `CredentialStore`: the bearer token and its decoded
//!   claims, persisted through the settings store
//! - `SessionGuard`: the boolean gate protected flows check before
//!   rendering anything that needs a signed-in device
//!
//! Tokens are opaque; the claims payload is decoded without signature
//! verification and only trusted for display and expiry checks.

pub mod credentials;
pub mod guard;

pub use credentials::{Credential, CredentialStore, TokenClaims};
pub use guard::{Access, SessionGuard};
