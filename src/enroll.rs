//! Device enrollment session.
//!
//! Drives the pairing protocol: request a one-time code to display,
//! poll until someone enters it into the organization console, then
//! exchange the resulting signin token for a durable credential.
//!
//! State machine:
//! `Idle -> CodeRequested -> CodeDisplayed -> Polling ->
//! { SignedIn | CodeExpired -> CodeRequested }`
//!
//! Nothing here is fatal. A failed code request degrades to a locally
//! generated decoy code so there is always something to display, and
//! the next refresh tick retries for real.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use tracing::{debug, info, warn};

use crate::api::{ApiClient, EnrollmentCode, PollResult};
use crate::auth::{Credential, CredentialStore};
use crate::device::DeviceInfo;
use crate::notice::{self, NoticeSender};

// ============================================================================
// Constants
// ============================================================================

/// How often the displayed pairing code is rotated.
/// Middle of the 30s-120s window the server tolerates.
pub const CODE_REFRESH_INTERVAL_SECS: u64 = 60;

/// How often enrollment completion is polled while a code is displayed
pub const POLL_INTERVAL_SECS: u64 = 1;

/// Notice id for pairing-code toasts, stable so sinks replace rather
/// than stack them
const CODE_NOTICE_ID: &str = "pairing_code";

// ============================================================================
// API seam
// ============================================================================

/// The slice of the server API the session needs. Tests script this.
#[async_trait]
pub trait EnrollmentApi: Send + Sync {
    async fn request_code(
        &self,
        device: &DeviceInfo,
        org_id: Option<&str>,
    ) -> Result<EnrollmentCode>;

    async fn poll(&self, device_fingerprint: &str) -> Result<PollResult>;

    /// Acknowledge completion, authenticated with the freshly issued token.
    async fn finish(&self, device_fingerprint: &str, token: &str) -> Result<()>;
}

#[async_trait]
impl EnrollmentApi for ApiClient {
    async fn request_code(
        &self,
        device: &DeviceInfo,
        org_id: Option<&str>,
    ) -> Result<EnrollmentCode> {
        self.get_code(device, org_id).await
    }

    async fn poll(&self, device_fingerprint: &str) -> Result<PollResult> {
        self.poll_enrollment(device_fingerprint).await
    }

    async fn finish(&self, device_fingerprint: &str, token: &str) -> Result<()> {
        self.with_token(token.to_string())
            .finish_enrollment(device_fingerprint)
            .await
    }
}

// ============================================================================
// Session
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    CodeRequested,
    CodeDisplayed,
    Polling,
    CodeExpired,
    SigningIn,
    SignedIn,
}

pub struct EnrollmentSession<A: EnrollmentApi> {
    api: A,
    device: DeviceInfo,
    credentials: CredentialStore,
    notices: NoticeSender,
    state: SessionState,
    code: Option<EnrollmentCode>,
    /// Set exactly once, before the token exchange starts. Guards
    /// against racing poll results both trying to exchange.
    claimed: AtomicBool,
}

impl<A: EnrollmentApi> EnrollmentSession<A> {
    pub fn new(
        api: A,
        device: DeviceInfo,
        credentials: CredentialStore,
        notices: NoticeSender,
    ) -> Self {
        Self {
            api,
            device,
            credentials,
            notices,
            state: SessionState::Idle,
            code: None,
            claimed: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Request a fresh pairing code, falling back to a local decoy on
    /// any failure so the caller always has a code to show.
    pub async fn refresh_code(&mut self) -> EnrollmentCode {
        self.state = SessionState::CodeRequested;
        let org_hint = self.credentials.organization_id();

        let code = match self
            .api
            .request_code(&self.device, org_hint.as_deref())
            .await
        {
            Ok(code) => {
                notice::post(
                    &self.notices,
                    CODE_NOTICE_ID,
                    format!("Pairing code: {}", code.code),
                );
                code
            }
            Err(e) => {
                warn!(error = %e, "Pairing code request failed, showing placeholder");
                let code = decoy_code();
                notice::post(
                    &self.notices,
                    CODE_NOTICE_ID,
                    format!("Server unreachable - placeholder code: {}", code.code),
                );
                code
            }
        };

        self.code = Some(code.clone());
        self.state = SessionState::CodeDisplayed;
        code
    }

    /// One enrollment poll. Returns the credential once the exchange
    /// has completed; `None` means keep polling.
    ///
    /// Safe to call from racing ticks: the claimed flag guarantees the
    /// token exchange runs at most once.
    pub async fn poll_once(&mut self) -> Option<Credential> {
        if self.state == SessionState::SignedIn {
            return None;
        }
        if matches!(self.state, SessionState::CodeDisplayed | SessionState::Polling) {
            self.state = SessionState::Polling;
        }

        let result = match self.api.poll(&self.device.device_fingerprint).await {
            Ok(result) => result,
            Err(e) => {
                // Transport and protocol failures alike: log and let the
                // next tick retry.
                debug!(error = %e, "Enrollment poll failed");
                return None;
            }
        };

        if !result.enrolled {
            self.expire_code_if_needed();
            return None;
        }

        let Some(token) = result.signin_token.clone() else {
            warn!("Poll reported enrolled without a signin token");
            return None;
        };

        // Check-and-set: only the first enrolled poll result wins.
        if self
            .claimed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Signin token already claimed, ignoring duplicate poll result");
            return None;
        }

        self.state = SessionState::SigningIn;
        match self.exchange(&token, &result).await {
            Ok(credential) => {
                self.state = SessionState::SignedIn;
                info!(
                    organization = %credential.organization_id,
                    "Device enrolled"
                );
                notice::post(&self.notices, CODE_NOTICE_ID, "Device paired");
                Some(credential)
            }
            Err(e) => {
                // Persisting the token failed locally; release the claim
                // so a later poll can try again.
                warn!(error = %e, "Token exchange failed, will retry");
                self.claimed.store(false, Ordering::SeqCst);
                self.state = SessionState::Polling;
                None
            }
        }
    }

    /// Persist the token, resolve and persist the organization id, and
    /// acknowledge completion server-side. The local credential is
    /// authoritative once stored: a finalize failure is only a warning.
    async fn exchange(&self, token: &str, result: &PollResult) -> Result<Credential> {
        let credential = self.credentials.store_token(token)?;

        let org_id = credential
            .claims
            .org_id
            .clone()
            .or_else(|| result.organization_id.clone());
        if let Some(ref org_id) = org_id {
            self.credentials.store_organization_id(org_id)?;
        } else {
            warn!("No organization id in claims or poll response");
        }

        if let Err(e) = self.api.finish(&self.device.device_fingerprint, token).await {
            warn!(error = %e, "Enrollment finalize failed; local pairing stands");
        }

        Ok(Credential::from_token(token, org_id))
    }

    fn expire_code_if_needed(&mut self) {
        let expired = self
            .code
            .as_ref()
            .and_then(|c| c.expires_at)
            .map(|at| at <= Utc::now())
            .unwrap_or(false);
        if expired && self.state == SessionState::Polling {
            debug!("Displayed pairing code expired");
            self.state = SessionState::CodeExpired;
        }
    }

    /// Drive the session to completion: rotate the code on a fixed
    /// interval, poll every second, return the credential once signed
    /// in. Dropping the future cancels both timers.
    pub async fn run(&mut self) -> Credential {
        let mut refresh = tokio::time::interval(Duration::from_secs(CODE_REFRESH_INTERVAL_SECS));
        refresh.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut poll = tokio::time::interval(Duration::from_secs(POLL_INTERVAL_SECS));
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        // First tick fires immediately and displays the initial code.
        loop {
            tokio::select! {
                _ = refresh.tick() => {
                    if self.state != SessionState::SignedIn {
                        let code = self.refresh_code().await;
                        info!(code = %code.code, decoy = code.decoy, "Pairing code rotated");
                    }
                }
                _ = poll.tick() => {
                    if self.state == SessionState::CodeExpired {
                        self.refresh_code().await;
                    }
                    if let Some(credential) = self.poll_once().await {
                        return credential;
                    }
                }
            }
        }
    }
}

/// Locally generated 6-digit placeholder shown when the server cannot
/// issue a real code.
fn decoy_code() -> EnrollmentCode {
    let n: u32 = rand::thread_rng().gen_range(0..1_000_000);
    EnrollmentCode {
        code: format!("{:06}", n),
        expires_at: None,
        decoy: true,
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, Settings};
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Arc, Mutex};

    struct FakeApi {
        codes: Mutex<VecDeque<Result<EnrollmentCode>>>,
        polls: Mutex<VecDeque<Result<PollResult>>>,
        finish_calls: AtomicUsize,
        finish_fails: bool,
    }

    impl FakeApi {
        fn new() -> Self {
            Self {
                codes: Mutex::new(VecDeque::new()),
                polls: Mutex::new(VecDeque::new()),
                finish_calls: AtomicUsize::new(0),
                finish_fails: false,
            }
        }

        fn push_code(&self, code: &str) {
            self.codes.lock().unwrap().push_back(Ok(EnrollmentCode {
                code: code.to_string(),
                expires_at: None,
                decoy: false,
            }));
        }

        fn push_code_error(&self) {
            self.codes
                .lock()
                .unwrap()
                .push_back(Err(anyhow::anyhow!("connection refused")));
        }

        fn push_poll(&self, result: PollResult) {
            self.polls.lock().unwrap().push_back(Ok(result));
        }
    }

    #[async_trait]
    impl EnrollmentApi for Arc<FakeApi> {
        async fn request_code(
            &self,
            _device: &DeviceInfo,
            _org_id: Option<&str>,
        ) -> Result<EnrollmentCode> {
            self.codes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(anyhow::anyhow!("no scripted code")))
        }

        async fn poll(&self, _fingerprint: &str) -> Result<PollResult> {
            self.polls
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(PollResult::default()))
        }

        async fn finish(&self, _fingerprint: &str, _token: &str) -> Result<()> {
            self.finish_calls.fetch_add(1, Ordering::SeqCst);
            if self.finish_fails {
                Err(anyhow::anyhow!("finalize rejected"))
            } else {
                Ok(())
            }
        }
    }

    fn enrolled_poll(token: &str) -> PollResult {
        PollResult {
            enrolled: true,
            signin_token: Some(token.to_string()),
            organization_id: Some("org-9".to_string()),
            organization_name: Some("Acme".to_string()),
        }
    }

    fn session(api: Arc<FakeApi>) -> (EnrollmentSession<Arc<FakeApi>>, Settings) {
        let settings = Settings::new(Arc::new(MemoryStore::new()));
        let credentials = CredentialStore::new(settings.clone());
        // Receiver dropped immediately; post() tolerates a closed sink.
        let (tx, _rx) = notice::channel();
        let device = DeviceInfo::collect();
        (
            EnrollmentSession::new(api, device, credentials, tx),
            settings,
        )
    }

    #[tokio::test]
    async fn test_code_request_failure_yields_decoy() {
        let api = Arc::new(FakeApi::new());
        api.push_code_error();
        let (mut session, _settings) = session(api);

        let code = session.refresh_code().await;
        assert!(code.decoy);
        assert_eq!(code.code.len(), 6);
        assert!(code.code.chars().all(|c| c.is_ascii_digit()));
        assert_eq!(session.state(), SessionState::CodeDisplayed);
    }

    #[tokio::test]
    async fn test_successful_code_is_displayed() {
        let api = Arc::new(FakeApi::new());
        api.push_code("123456");
        let (mut session, _settings) = session(api);

        let code = session.refresh_code().await;
        assert_eq!(code.code, "123456");
        assert!(!code.decoy);
    }

    #[tokio::test]
    async fn test_enrolled_poll_exchanges_exactly_once() {
        let api = Arc::new(FakeApi::new());
        api.push_code("123456");
        for _ in 0..3 {
            api.push_poll(enrolled_poll("tok-abc"));
        }
        let (mut session, settings) = session(api.clone());

        session.refresh_code().await;
        let first = session.poll_once().await;
        assert!(first.is_some());
        assert_eq!(session.state(), SessionState::SignedIn);

        // Two more polls carrying the same token change nothing.
        assert!(session.poll_once().await.is_none());
        assert!(session.poll_once().await.is_none());

        assert_eq!(api.finish_calls.load(Ordering::SeqCst), 1);
        assert_eq!(settings.token().as_deref(), Some("tok-abc"));
        assert_eq!(settings.organization_id().as_deref(), Some("org-9"));
    }

    #[tokio::test]
    async fn test_not_enrolled_poll_is_side_effect_free() {
        let api = Arc::new(FakeApi::new());
        api.push_code("123456");
        api.push_poll(PollResult::default());
        let (mut session, settings) = session(api.clone());

        session.refresh_code().await;
        assert!(session.poll_once().await.is_none());
        assert_eq!(session.state(), SessionState::Polling);
        assert_eq!(settings.token(), None);
        assert_eq!(api.finish_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_finalize_failure_keeps_local_credential() {
        let mut inner = FakeApi::new();
        inner.finish_fails = true;
        let api = Arc::new(inner);
        api.push_code("123456");
        api.push_poll(enrolled_poll("tok-xyz"));
        let (mut session, settings) = session(api.clone());

        session.refresh_code().await;
        let credential = session.poll_once().await;
        assert!(credential.is_some());
        assert_eq!(session.state(), SessionState::SignedIn);
        assert_eq!(settings.token().as_deref(), Some("tok-xyz"));
    }

    #[tokio::test]
    async fn test_org_id_falls_back_to_poll_response() {
        let api = Arc::new(FakeApi::new());
        api.push_code("123456");
        // Opaque token: no decodable claims, so the poll body must win.
        api.push_poll(enrolled_poll("opaque-token"));
        let (mut session, settings) = session(api);

        session.refresh_code().await;
        session.poll_once().await.unwrap();
        assert_eq!(settings.organization_id().as_deref(), Some("org-9"));
    }
}
