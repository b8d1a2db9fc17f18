use anyhow::{Context, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::store::Settings;

/// Claims decoded from the bearer token payload.
///
/// Decoded without signature verification - these are only used for
/// expiry checks and display, never to authorize anything locally.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenClaims {
    #[serde(default, alias = "organizationId")]
    pub org_id: Option<String>,
    #[serde(default, alias = "organizationName")]
    pub org_name: Option<String>,
    /// Expiry as unix seconds
    #[serde(default)]
    pub exp: Option<i64>,
    #[serde(default)]
    pub scope: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Credential {
    pub token: String,
    pub claims: TokenClaims,
    pub organization_id: String,
}

impl Credential {
    /// Build a credential from a raw token, decoding whatever claims
    /// the payload carries. A token without a decodable payload still
    /// yields a credential - it just has no expiry and counts as
    /// expired.
    pub fn from_token(token: &str, stored_org_id: Option<String>) -> Self {
        let claims = decode_claims(token).unwrap_or_default();
        let organization_id = stored_org_id
            .or_else(|| claims.org_id.clone())
            .unwrap_or_default();

        Self {
            token: token.to_string(),
            claims,
            organization_id,
        }
    }

    /// A token whose expiry is at or before now is expired; a token
    /// with no readable expiry is treated the same way.
    pub fn is_expired(&self) -> bool {
        match self.claims.exp {
            Some(exp) => exp <= Utc::now().timestamp(),
            None => true,
        }
    }

    /// Display name for the paired organization, when the claims carry one.
    pub fn organization_name(&self) -> Option<&str> {
        self.claims.org_name.as_deref()
    }
}

/// Decode the middle (payload) segment of a JWT-shaped token.
fn decode_claims(token: &str) -> Option<TokenClaims> {
    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload).ok()?;
    match serde_json::from_slice(&bytes) {
        Ok(claims) => Some(claims),
        Err(e) => {
            debug!(error = %e, "Token payload is not a claims object");
            None
        }
    }
}

/// Reads and writes the credential through the settings store.
/// Clone is cheap - the settings facade is Arc-backed.
#[derive(Clone)]
pub struct CredentialStore {
    settings: Settings,
}

impl CredentialStore {
    pub fn new(settings: Settings) -> Self {
        Self { settings }
    }

    /// Load the stored credential, if any.
    pub fn load(&self) -> Option<Credential> {
        let token = self.settings.token()?;
        Some(Credential::from_token(
            &token,
            self.settings.organization_id(),
        ))
    }

    /// Persist a freshly issued token verbatim and return the credential.
    pub fn store_token(&self, token: &str) -> Result<Credential> {
        self.settings
            .set_token(token)
            .context("Failed to persist session token")?;
        Ok(Credential::from_token(
            token,
            self.settings.organization_id(),
        ))
    }

    pub fn store_organization_id(&self, org_id: &str) -> Result<()> {
        self.settings
            .set_organization_id(org_id)
            .context("Failed to persist organization id")
    }

    pub fn organization_id(&self) -> Option<String> {
        self.settings.organization_id()
    }

    /// Drop the credential and the paired organization.
    pub fn clear(&self) -> Result<()> {
        self.settings.delete_token()?;
        self.settings.delete_organization_id()?;
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
