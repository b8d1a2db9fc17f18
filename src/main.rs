//! Tether - a desktop agent that pairs this machine to an organization
//! account and keeps a watched folder uploaded to the sync server.
//!
//! Run with a folder to watch:
//!
//! ```text
//! tether /path/to/folder
//! ```
//!
//! On first run the agent displays a one-time pairing code (rotated
//! every minute) and waits for it to be entered in the organization
//! console. Once paired, the credential persists and subsequent runs go
//! straight to watching.

mod api;
mod auth;
mod device;
mod enroll;
mod heartbeat;
mod notice;
mod store;
mod upload;
mod watcher;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use api::ApiClient;
use auth::{Access, CredentialStore, SessionGuard};
use device::DeviceInfo;
use enroll::EnrollmentSession;
use heartbeat::HeartbeatService;
use store::{JsonFileStore, Settings};
use upload::{FileStatusEvent, HttpUploader, UploadManager};

/// Environment variable overriding the configured server base URL
const SERVER_URL_ENV: &str = "TETHER_SERVER_URL";

/// Initialize the tracing subscriber for logging
fn init_tracing() {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();
    init_tracing();
    info!("Tether agent starting");

    let arg = std::env::args().nth(1);

    let store = JsonFileStore::open_default().context("Failed to open settings store")?;
    let settings = Settings::new(Arc::new(store));
    let credentials = CredentialStore::new(settings.clone());
    let guard = SessionGuard::new(credentials.clone());

    if arg.as_deref() == Some("--sign-out") {
        guard.sign_out();
        info!("Signed out; next run will re-enroll this device");
        return Ok(());
    }
    let watch_dir = arg.map(PathBuf::from);

    let device = DeviceInfo::collect();

    let mut upload_config = settings.upload_config();
    if let Ok(url) = std::env::var(SERVER_URL_ENV) {
        upload_config.server_url = url;
    }

    // Notices would feed a toast UI; headless, they go to the log.
    let (notice_tx, mut notice_rx) = notice::channel();
    tokio::spawn(async move {
        while let Some(notice) = notice_rx.recv().await {
            info!(id = %notice.id, "{}", notice.text);
        }
    });

    // Pair the device if there is no live credential.
    if guard.check_access() == Access::Unauthenticated {
        info!("No valid credential, starting enrollment");
        let api = ApiClient::new(&upload_config.server_url)?;
        let mut session = EnrollmentSession::new(
            api,
            device.clone(),
            credentials.clone(),
            notice_tx.clone(),
        );
        let credential = session.run().await;
        if let Some(name) = credential.organization_name() {
            info!(organization = name, "Paired");
        }
    }

    let credential = credentials
        .load()
        .context("Credential missing after enrollment")?;
    let api = ApiClient::new(&upload_config.server_url)?.with_token(credential.token.clone());

    let mut heartbeat = HeartbeatService::start(
        api.clone(),
        device.device_fingerprint.clone(),
        env!("CARGO_PKG_VERSION").to_string(),
    );

    let Some(watch_dir) = watch_dir else {
        info!("No folder argument given; idling (heartbeat only). Ctrl-C to exit");
        tokio::signal::ctrl_c().await?;
        let status = heartbeat.status().await;
        if let Some(last) = status.last {
            info!(status = %last.status, last_seen = ?last.last_seen, "Last heartbeat");
        }
        heartbeat.stop().await;
        return Ok(());
    };

    let dir_display = watch_dir.display().to_string();
    if let Err(e) = settings.push_recent_dir(&dir_display) {
        warn!(error = %e, "Failed to remember watched folder");
    }

    // Wire the watcher into the upload manager.
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let folder_watcher = watcher::watch(&watch_dir, event_tx)?;

    let (status_tx, mut status_rx) = mpsc::unbounded_channel::<FileStatusEvent>();
    tokio::spawn(async move {
        while let Some(event) = status_rx.recv().await {
            info!(path = %event.relative_path, status = ?event.status, "File status");
        }
    });

    let uploader = Arc::new(HttpUploader::new(api));
    let (upload_handle, upload_task) = UploadManager::spawn(
        upload_config,
        folder_watcher.root().to_path_buf(),
        uploader,
        settings.clone(),
        status_tx,
        notice_tx.clone(),
    );

    let forward_handle = upload_handle.clone();
    let forwarder = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            forward_handle.change(event);
        }
    });

    info!(folder = %dir_display, "Watching; Ctrl-C to exit");
    tokio::signal::ctrl_c().await?;

    // Teardown: stop the watcher first so no new events arrive, then
    // let the manager drain.
    drop(folder_watcher);
    forwarder.abort();
    upload_handle.shutdown();
    let _ = upload_task.await;
    heartbeat.stop().await;

    let progress = upload_handle.progress();
    info!(
        uploaded = progress.total_uploaded,
        failed = progress.total_failed,
        "Tether agent shutting down"
    );
    Ok(())
}
