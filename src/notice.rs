//! User-facing status notices.
//!
//! Components never talk to a UI directly; they push `Notice` values
//! into an unbounded channel and whoever owns the other end decides how
//! to surface them. The `id` is stable per subject (a relative path, a
//! service name) so a sink can replace an in-progress toast instead of
//! stacking duplicates.

use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub id: String,
    pub text: String,
}

pub type NoticeSender = mpsc::UnboundedSender<Notice>;
pub type NoticeReceiver = mpsc::UnboundedReceiver<Notice>;

pub fn channel() -> (NoticeSender, NoticeReceiver) {
    mpsc::unbounded_channel()
}

/// Send a notice, ignoring a closed sink (headless runs may not drain).
pub fn post(tx: &NoticeSender, id: impl Into<String>, text: impl Into<String>) {
    let notice = Notice {
        id: id.into(),
        text: text.into(),
    };
    if tx.send(notice).is_err() {
        debug!("Notice sink closed, dropping notice");
    }
}
