//! The ingestion loop: poll the engine for new messages, deduplicate,
//! auto-download attachments, dispatch, and reply.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

use wxbridge_core::bounded::{BoundedRing, BoundedSet};
use wxbridge_core::types::{InboundMessage, MsgKind};

use crate::app::AppState;

/// Messages fetched from the engine cache per tick.
const FETCH_LIMIT: usize = 12;

/// Adaptive pacing: busy ticks poll at the minimum, idle ticks back off
/// multiplicatively to the maximum.
const POLL_MIN: f64 = 0.5;
const POLL_MAX: f64 = 3.0;
const POLL_BACKOFF: f64 = 1.2;

/// Dedup window for processed message keys.
const PROCESSED_KEYS_CAP: usize = 5000;

/// Recently sent replies, consulted for text-level self-echo suppression.
const SENT_REPLIES_CAP: usize = 10;

pub struct IngestLoop {
    state: Arc<AppState>,
    processed: BoundedSet,
    sent_replies: BoundedRing<String>,
}

impl IngestLoop {
    pub fn new(state: Arc<AppState>) -> Self {
        Self {
            state,
            processed: BoundedSet::new(PROCESSED_KEYS_CAP),
            sent_replies: BoundedRing::new(SENT_REPLIES_CAP),
        }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("ingestion loop started");
        let mut delay = POLL_MIN;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs_f64(delay)) => {
                    let handled = match self.tick().await {
                        Ok(n) => n,
                        Err(e) => {
                            self.state.stability.record_error("ingest", &e);
                            warn!("ingestion tick failed: {e}");
                            0
                        }
                    };
                    delay = if handled > 0 {
                        POLL_MIN
                    } else {
                        (delay * POLL_BACKOFF).min(POLL_MAX)
                    };
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("ingestion loop stopped");
                        break;
                    }
                }
            }
        }
    }

    /// One poll round. Returns how many messages were processed.
    async fn tick(&mut self) -> Result<usize, String> {
        let engine = &self.state.engine;

        if !engine.is_logged_in() {
            if engine.check_login_status(true).await {
                info!("login detected by ingestion loop");
                self.state.stability.reset_reconnects();
            } else {
                return Ok(0);
            }
        }

        let messages = engine.get_latest_messages(FETCH_LIMIT).await;
        let mut handled = 0;

        // Oldest first, as the engine cache preserves AddMsgList order.
        for msg in messages {
            let key = if msg.id.is_empty() { msg.text.clone() } else { msg.id.clone() };
            if key.is_empty() || self.processed.contains(&key) {
                continue;
            }
            // Text-level loop prevention: our own recent replies come back
            // through sync looking like fresh messages.
            if self.sent_replies.contains(&msg.text.trim().to_string()) {
                self.processed.insert(key);
                continue;
            }
            self.processed.insert(key);

            let mut msg = msg;
            if msg.kind.is_attachment() && self.state.settings.auto_download {
                self.auto_download(&mut msg).await;
            }

            if let Some(reply) = self.state.dispatcher.dispatch(&msg, true).await {
                self.send_reply(&reply).await;
            }
            handled += 1;
        }

        Ok(handled)
    }

    /// Download an attachment next to the configured directory, record its
    /// row in the files table, and acknowledge into the chat.
    async fn auto_download(&mut self, msg: &mut InboundMessage) {
        let file_name = derive_file_name(msg);
        let dir = self.download_dir();
        let save_path = dir.join(&file_name);

        match self
            .state
            .engine
            .download_message_content(&msg.id, &save_path)
            .await
        {
            Ok(()) => {
                let size = std::fs::metadata(&save_path).map(|m| m.len()).unwrap_or(0);
                let mime = mime_type_of(&file_name);
                if let Err(e) = self.state.store.save_file(
                    &msg.id,
                    &file_name,
                    &save_path.display().to_string(),
                    size as i64,
                    mime.as_deref(),
                    None,
                    true,
                ) {
                    warn!(msg_id = %msg.id, "file row save failed: {e}");
                }
                msg.file_name = Some(file_name.clone());
                msg.file_path = Some(save_path.display().to_string());
                msg.file_size = Some(size);

                let ack = format!("Saved: {file_name}");
                self.send_reply(&ack).await;
            }
            Err(e) => {
                warn!(msg_id = %msg.id, "auto-download failed: {e}");
                self.state
                    .stability
                    .record_error("auto-download", &e.to_string());
            }
        }
    }

    async fn send_reply(&mut self, reply: &str) {
        match self.state.engine.send_text(reply).await {
            Ok(_) => self.sent_replies.push(reply.to_string()),
            Err(e) => warn!("reply send failed: {e}"),
        }
    }

    fn download_dir(&self) -> PathBuf {
        let base = self.state.settings.download_dir.clone();
        if self.state.settings.file_date_subdir {
            base.join(chrono::Local::now().format("%Y-%m-%d").to_string())
        } else {
            base
        }
    }
}

/// Attachment filename: the upstream-provided name, falling back to
/// `download_<id>`; extensionless images get `.jpg` appended.
fn derive_file_name(msg: &InboundMessage) -> String {
    let mut name = msg
        .file_name
        .clone()
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| format!("download_{}", msg.id));
    if msg.kind == MsgKind::Image && !name.contains('.') {
        name.push_str(".jpg");
    }
    name
}

fn mime_type_of(file_name: &str) -> Option<String> {
    let guess = mime_guess::from_path(file_name).first()?;
    Some(guess.essence_str().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(id: &str, kind: MsgKind, file_name: Option<&str>) -> InboundMessage {
        InboundMessage {
            id: id.to_string(),
            kind,
            text: String::new(),
            file_name: file_name.map(|s| s.to_string()),
            is_mine: false,
            file_path: None,
            file_size: None,
            reply_to: None,
        }
    }

    #[test]
    fn upstream_names_are_kept() {
        let m = msg("1", MsgKind::File, Some("report.pdf"));
        assert_eq!(derive_file_name(&m), "report.pdf");
    }

    #[test]
    fn missing_names_fall_back_to_id() {
        let m = msg("77", MsgKind::File, None);
        assert_eq!(derive_file_name(&m), "download_77");
    }

    #[test]
    fn extensionless_images_get_jpg() {
        let m = msg("77", MsgKind::Image, None);
        assert_eq!(derive_file_name(&m), "download_77.jpg");
        let named = msg("78", MsgKind::Image, Some("photo.png"));
        assert_eq!(derive_file_name(&named), "photo.png");
    }

    #[test]
    fn poll_backoff_reaches_max_and_resets() {
        let mut delay = POLL_MIN;
        for _ in 0..20 {
            delay = (delay * POLL_BACKOFF).min(POLL_MAX);
        }
        assert_eq!(delay, POLL_MAX);
        // A busy tick drops straight back to the minimum.
        delay = POLL_MIN;
        assert_eq!(delay, 0.5);
    }
}
