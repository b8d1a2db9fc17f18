//! Periodic liveness reporting.
//!
//! While signed in, the agent posts a bearer-authed heartbeat every 30
//! seconds. The last successful server payload is retained across
//! failures so observers still see when the device was last known
//! good; its status string flips to `offline` until the next success.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, warn};

use crate::api::{ApiClient, HeartbeatResponse};

/// Seconds between heartbeat requests
const HEARTBEAT_INTERVAL_SECS: u64 = 30;

/// Status string reported while the server is unreachable
const OFFLINE_STATUS: &str = "offline";

#[derive(Debug, Clone, Default)]
pub struct HeartbeatStatus {
    pub last: Option<HeartbeatResponse>,
    pub error: Option<String>,
}

/// Owns the background heartbeat task. Stopping (or dropping) the
/// service aborts the task; there is never more than one running.
pub struct HeartbeatService {
    status: Arc<Mutex<HeartbeatStatus>>,
    task: Option<JoinHandle<()>>,
}

impl HeartbeatService {
    /// Start the loop with an already-authenticated client.
    pub fn start(api: ApiClient, device_fingerprint: String, app_version: String) -> Self {
        let status = Arc::new(Mutex::new(HeartbeatStatus::default()));
        let status_cell = status.clone();

        let task = tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(HEARTBEAT_INTERVAL_SECS));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;

                match api.heartbeat(&device_fingerprint, &app_version).await {
                    Ok(response) => {
                        debug!(status = %response.status, "Heartbeat ok");
                        let mut status = status_cell.lock().await;
                        *status = HeartbeatStatus {
                            last: Some(response),
                            error: None,
                        };
                    }
                    Err(e) => {
                        warn!(error = %e, "Heartbeat failed");
                        let mut status = status_cell.lock().await;
                        // Keep the last good payload but mark it offline.
                        if let Some(ref mut last) = status.last {
                            last.status = OFFLINE_STATUS.to_string();
                        }
                        status.error = Some(format!("{:#}", e));
                    }
                }
            }
        });

        Self {
            status,
            task: Some(task),
        }
    }

    pub async fn status(&self) -> HeartbeatStatus {
        self.status.lock().await.clone()
    }

    /// Abort the loop and clear the status.
    pub async fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            debug!("Heartbeat task stopped");
        }
        *self.status.lock().await = HeartbeatStatus::default();
    }
}

impl Drop for HeartbeatService {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
