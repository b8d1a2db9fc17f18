use tracing::debug;

use super::CredentialStore;

/// Outcome of a protected-view access check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Authenticated,
    Unauthenticated,
}

/// Gate for protected flows.
///
/// `check_access` never fails: a missing token, an expired or garbled
/// claims payload, and a store read problem all collapse to
/// `Unauthenticated`, which sends the caller back to enrollment.
#[derive(Clone)]
pub struct SessionGuard {
    credentials: CredentialStore,
}

impl SessionGuard {
    pub fn new(credentials: CredentialStore) -> Self {
        Self { credentials }
    }

    pub fn check_access(&self) -> Access {
        match self.credentials.load() {
            Some(cred) if !cred.is_expired() => Access::Authenticated,
            Some(_) => {
                debug!("Stored token is expired");
                Access::Unauthenticated
            }
            None => Access::Unauthenticated,
        }
    }

    /// Drop the credential. Errors are logged, not surfaced - a failed
    /// delete still means the caller should treat the session as gone.
    pub fn sign_out(&self) {
        if let Err(e) = self.credentials.clear() {
            debug!(error = %e, "Failed to clear credential on sign-out");
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::credentials::tests::fake_token;
    use crate::store::{MemoryStore, Settings};
    use chrono::Utc;
    use std::sync::Arc;

    fn guard_with_token(token: Option<String>) -> SessionGuard {
        let settings = Settings::new(Arc::new(MemoryStore::new()));
        if let Some(token) = token {
            settings.set_token(&token).unwrap();
        }
        SessionGuard::new(CredentialStore::new(settings))
    }

    #[test]
    fn test_missing_token_is_unauthenticated() {
        let guard = guard_with_token(None);
        assert_eq!(guard.check_access(), Access::Unauthenticated);
    }

    #[test]
    fn test_expired_token_is_unauthenticated() {
        let token = fake_token(serde_json::json!({
            "exp": Utc::now().timestamp() - 1
        }));
        let guard = guard_with_token(Some(token));
        assert_eq!(guard.check_access(), Access::Unauthenticated);
    }

    #[test]
    fn test_live_token_is_authenticated() {
        let token = fake_token(serde_json::json!({
            "exp": Utc::now().timestamp() + 3600
        }));
        let guard = guard_with_token(Some(token));
        assert_eq!(guard.check_access(), Access::Authenticated);
    }

    #[test]
    fn test_sign_out_revokes_access() {
        let token = fake_token(serde_json::json!({
            "exp": Utc::now().timestamp() + 3600
        }));
        let guard = guard_with_token(Some(token));
        assert_eq!(guard.check_access(), Access::Authenticated);

        guard.sign_out();
        assert_eq!(guard.check_access(), Access::Unauthenticated);
    }
}
