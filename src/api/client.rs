//! API client for communicating with the sync server.
//!
//! This module provides the `ApiClient` struct for the device-pairing
//! protocol, the heartbeat ping, and the authenticated file upload.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use reqwest::{header, multipart, Body, Client};
use serde::{Deserialize, Serialize};
use tokio_util::io::ReaderStream;
use tracing::debug;

use crate::device::DeviceInfo;

use super::ApiError;

// ============================================================================
// Constants
// ============================================================================

/// HTTP request timeout in seconds.
/// 30s allows for slow server responses while failing fast enough that
/// the next schedule tick is not starved.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Pairing endpoint paths under the configured base URL
const GET_CODE_PATH: &str = "/api/sync/get_code";
const POLL_ENROLLMENT_PATH: &str = "/api/sync/poll_enrollment";
const FINISH_ENROLLMENT_PATH: &str = "/api/sync/finish_enrollment";
const HEARTBEAT_PATH: &str = "/api/sync/heartbeat";
const UPLOAD_PATH: &str = "/api/sync/upload";

// ============================================================================
// Wire types
// ============================================================================

#[derive(Serialize)]
struct GetCodeRequest<'a> {
    #[serde(flatten)]
    device: &'a DeviceInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    org_id: Option<&'a str>,
}

#[derive(Deserialize)]
struct GetCodeResponse {
    success: bool,
    otp_code: Option<String>,
    /// Unix seconds
    expires_at: Option<i64>,
}

#[derive(Serialize)]
struct FingerprintBody<'a> {
    device_fingerprint: &'a str,
}

#[derive(Deserialize)]
struct PollEnrollmentResponse {
    success: bool,
    #[serde(default)]
    enrolled: bool,
    #[serde(default)]
    signin_token: Option<String>,
    #[serde(default)]
    organization_id: Option<String>,
    #[serde(default)]
    organization_name: Option<String>,
}

#[derive(Serialize)]
struct HeartbeatRequest<'a> {
    device_fingerprint: &'a str,
    app_version: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HeartbeatResponse {
    pub status: String,
    #[serde(default)]
    pub last_seen: Option<String>,
}

/// A pairing code the server expects the user to type into the web
/// console. `decoy` marks a locally generated placeholder produced when
/// the server could not be reached.
#[derive(Debug, Clone)]
pub struct EnrollmentCode {
    pub code: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub decoy: bool,
}

/// One enrollment poll outcome.
#[derive(Debug, Clone, Default)]
pub struct PollResult {
    pub enrolled: bool,
    pub signin_token: Option<String>,
    pub organization_id: Option<String>,
    pub organization_name: Option<String>,
}

// ============================================================================
// Client
// ============================================================================

/// API client for the sync server.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl ApiClient {
    /// Create a new API client for the given server base URL
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: None,
        })
    }

    /// Create a new ApiClient with the given token, sharing the connection pool.
    pub fn with_token(&self, token: String) -> Self {
        Self {
            client: self.client.clone(), // Cheap clone, shares connection pool
            base_url: self.base_url.clone(),
            token: Some(token),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn auth_headers(&self) -> Result<header::HeaderMap> {
        let mut headers = header::HeaderMap::new();
        if let Some(ref token) = self.token {
            headers.insert(
                header::AUTHORIZATION,
                header::HeaderValue::from_str(&format!("Bearer {}", token))?,
            );
        }
        Ok(headers)
    }

    /// Check if response is successful, returning an error with body if not.
    async fn check_response(response: reqwest::Response) -> Result<reqwest::Response> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body).into())
        }
    }

    // ===== Pairing =====

    /// Request a fresh one-time pairing code for this device. Passing
    /// the previously paired organization id lets the server re-issue
    /// against the same account.
    pub async fn get_code(
        &self,
        device: &DeviceInfo,
        org_id: Option<&str>,
    ) -> Result<EnrollmentCode> {
        let url = self.url(GET_CODE_PATH);
        let body = GetCodeRequest { device, org_id };

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(ApiError::Network)?;
        let response = Self::check_response(response).await?;

        let parsed: GetCodeResponse = response.json().await.map_err(|e| {
            ApiError::UnexpectedResponse(format!("Bad pairing code payload: {}", e))
        })?;

        if !parsed.success {
            return Err(ApiError::UnexpectedResponse(
                "Pairing code request reported failure".to_string(),
            )
            .into());
        }

        let code = parsed.otp_code.ok_or_else(|| {
            ApiError::UnexpectedResponse("Pairing code response missing otp_code".to_string())
        })?;

        Ok(EnrollmentCode {
            code,
            expires_at: parsed
                .expires_at
                .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0)),
            decoy: false,
        })
    }

    /// Ask whether enrollment for this device fingerprint has completed.
    /// Side-effect-free on the server while `enrolled` is false.
    pub async fn poll_enrollment(&self, device_fingerprint: &str) -> Result<PollResult> {
        let url = self.url(POLL_ENROLLMENT_PATH);
        let body = FingerprintBody { device_fingerprint };

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(ApiError::Network)?;
        let response = Self::check_response(response).await?;

        let parsed: PollEnrollmentResponse = response.json().await.map_err(|e| {
            ApiError::UnexpectedResponse(format!("Bad enrollment poll payload: {}", e))
        })?;

        if !parsed.success {
            return Err(ApiError::UnexpectedResponse(
                "Enrollment poll reported failure".to_string(),
            )
            .into());
        }

        Ok(PollResult {
            enrolled: parsed.enrolled,
            signin_token: parsed.signin_token,
            organization_id: parsed.organization_id,
            organization_name: parsed.organization_name,
        })
    }

    /// Acknowledge a completed pairing, authenticated with the new token.
    pub async fn finish_enrollment(&self, device_fingerprint: &str) -> Result<()> {
        let url = self.url(FINISH_ENROLLMENT_PATH);
        let body = FingerprintBody { device_fingerprint };

        let response = self
            .client
            .post(&url)
            .headers(self.auth_headers()?)
            .json(&body)
            .send()
            .await
            .map_err(ApiError::Network)?;
        Self::check_response(response).await?;
        Ok(())
    }

    // ===== Liveness =====

    pub async fn heartbeat(
        &self,
        device_fingerprint: &str,
        app_version: &str,
    ) -> Result<HeartbeatResponse> {
        let url = self.url(HEARTBEAT_PATH);
        let body = HeartbeatRequest {
            device_fingerprint,
            app_version,
        };

        let response = self
            .client
            .post(&url)
            .headers(self.auth_headers()?)
            .json(&body)
            .send()
            .await
            .map_err(ApiError::Network)?;
        let response = Self::check_response(response).await?;

        let parsed = response.json().await.map_err(|e| {
            ApiError::UnexpectedResponse(format!("Bad heartbeat payload: {}", e))
        })?;
        Ok(parsed)
    }

    // ===== Upload =====

    /// Upload one file as an authenticated multipart POST. The body is
    /// streamed from disk so a large file never sits in memory whole;
    /// the relative path doubles as the remote object name.
    pub async fn upload_file(&self, path: &Path, relative_path: &str) -> Result<()> {
        let file = tokio::fs::File::open(path)
            .await
            .with_context(|| format!("Failed to open {}", path.display()))?;
        let size = file
            .metadata()
            .await
            .with_context(|| format!("Failed to stat {}", path.display()))?
            .len();

        let content_type = mime_guess::from_path(path)
            .first_or_octet_stream()
            .to_string();
        debug!(path = relative_path, size, %content_type, "Uploading file");

        let body = Body::wrap_stream(ReaderStream::new(file));
        let part = multipart::Part::stream_with_length(body, size)
            .file_name(relative_path.to_string())
            .mime_str(&content_type)
            .context("Invalid content type for upload")?;
        let form = multipart::Form::new()
            .text("relativePath", relative_path.to_string())
            .part("file", part);

        let response = self
            .client
            .post(self.url(UPLOAD_PATH))
            .headers(self.auth_headers()?)
            .multipart(form)
            .send()
            .await
            .map_err(ApiError::Network)?;
        Self::check_response(response).await?;
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
