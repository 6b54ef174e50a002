use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::platform::{Media, MediaFile, Poll, SourceClient, SourceMessage};

/// Largest attachment the destination accepts, in bytes
pub const UPLOAD_CEILING: u64 = 8 * 1024 * 1024;

/// A cross-platform destination that is connected to once per message
#[async_trait]
pub trait RelayTarget: Send + Sync {
    /// Authenticate and resolve the destination channel
    async fn open_session(&self) -> Result<Box<dyn RelaySession>>;
}

/// An open connection to the relay destination
#[async_trait]
pub trait RelaySession: Send {
    async fn send(&mut self, text: &str, attachment: Option<&Path>) -> Result<()>;

    async fn close(self: Box<Self>);
}

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("failed to open relay session: {0:#}")]
    Session(anyhow::Error),
    #[error("failed to download attachment: {0:#}")]
    Download(anyhow::Error),
    #[error("failed to send relay post: {0:#}")]
    Send(anyhow::Error),
    #[error("failed to remove temporary media directory {}: {source}", .path.display())]
    Cleanup {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// What the relay posts for a message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayPlan {
    /// Post text only
    Text(String),
    /// Attachment too large (or of unknown size): post text with a link to the original
    Link(String),
    /// Download the file and post it with the text
    Attach { media: MediaFile, text: String },
}

/// Cross-posts every new message to one fixed destination on another platform
pub struct Relay {
    target: Arc<dyn RelayTarget>,
    source: Arc<dyn SourceClient>,
    permits: Arc<Semaphore>,
    media_dir: PathBuf,
}

impl Relay {
    pub fn new(
        target: Arc<dyn RelayTarget>,
        source: Arc<dyn SourceClient>,
        max_sessions: usize,
        media_dir: &Path,
    ) -> Result<Self> {
        std::fs::create_dir_all(media_dir).with_context(|| {
            format!("Failed to create relay media directory: {}", media_dir.display())
        })?;

        info!(
            "Relay configured: up to {} concurrent session(s), media in {}",
            max_sessions,
            media_dir.display()
        );
        Ok(Self {
            target,
            source,
            permits: Arc::new(Semaphore::new(max_sessions.max(1))),
            media_dir: media_dir.to_path_buf(),
        })
    }

    /// Relay a message in the background, bounded by the session limit
    pub fn spawn(self: &Arc<Self>, message: SourceMessage) -> JoinHandle<()> {
        let relay = Arc::clone(self);
        tokio::spawn(async move {
            let Ok(_permit) = Arc::clone(&relay.permits).acquire_owned().await else {
                warn!("Relay closed, dropping {}#{}", message.chat_id, message.id);
                return;
            };

            match relay.relay(&message).await {
                Ok(Some(_)) => info!("Relayed {}#{}", message.chat_id, message.id),
                Ok(None) => debug!("Nothing to relay for {}#{}", message.chat_id, message.id),
                Err(e @ RelayError::Cleanup { .. }) => {
                    warn!("Relayed {}#{} but {}", message.chat_id, message.id, e)
                }
                Err(e) => error!("Failed to relay {}#{}: {}", message.chat_id, message.id, e),
            }
        })
    }

    /// Relay one message over a fresh session. Returns the plan that was carried out.
    pub async fn relay(&self, message: &SourceMessage) -> Result<Option<RelayPlan>, RelayError> {
        let Some(plan) = plan(message) else {
            return Ok(None);
        };

        let mut session = self.target.open_session().await.map_err(RelayError::Session)?;
        let result = match &plan {
            RelayPlan::Text(text) | RelayPlan::Link(text) => session
                .send(text, None)
                .await
                .map_err(RelayError::Send),
            RelayPlan::Attach { media, text } => {
                self.send_with_attachment(session.as_mut(), media, text, message.id)
                    .await
            }
        };
        session.close().await;

        result.map(|()| Some(plan))
    }

    /// Download into a directory private to this call, send, then always remove the directory
    async fn send_with_attachment(
        &self,
        session: &mut dyn RelaySession,
        media: &MediaFile,
        text: &str,
        message_id: i64,
    ) -> Result<(), RelayError> {
        let dir = tempfile::Builder::new()
            .prefix("relay-")
            .tempdir_in(&self.media_dir)
            .context("Failed to create temporary media directory")
            .map_err(RelayError::Download)?;
        let dir_path = dir.path().to_path_buf();
        let file_path = dir_path.join(media.local_name(message_id));

        let outcome = match self.source.download_media(media, &file_path).await {
            Ok(()) => session
                .send(text, Some(&file_path))
                .await
                .map_err(RelayError::Send),
            Err(e) => Err(RelayError::Download(e)),
        };

        let cleanup = dir.close().map_err(|source| RelayError::Cleanup {
            path: dir_path,
            source,
        });

        match (outcome, cleanup) {
            (Ok(()), cleanup) => cleanup,
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(cleanup)) => {
                warn!("{}", cleanup);
                Err(e)
            }
        }
    }
}

/// Decide what to post for a message. `None` when there is nothing to post.
pub fn plan(message: &SourceMessage) -> Option<RelayPlan> {
    match &message.media {
        None if message.text.trim().is_empty() => None,
        None => Some(RelayPlan::Text(message.text.clone())),
        Some(Media::Poll(poll)) => Some(RelayPlan::Text(format_poll(&message.text, poll))),
        Some(Media::File(media)) => match media.size {
            Some(size) if size < UPLOAD_CEILING => Some(RelayPlan::Attach {
                media: media.clone(),
                text: message.text.clone(),
            }),
            _ => Some(RelayPlan::Link(with_permalink(message))),
        },
        Some(Media::Other(_)) => Some(RelayPlan::Link(with_permalink(message))),
    }
}

fn with_permalink(message: &SourceMessage) -> String {
    let link = message.permalink();
    if message.text.trim().is_empty() {
        link
    } else {
        format!("{}\n\n{}", message.text, link)
    }
}

fn format_poll(text: &str, poll: &Poll) -> String {
    let mut out = String::new();
    if !text.trim().is_empty() {
        out.push_str(text);
        out.push_str("\n\n");
    }
    out.push_str("📊 ");
    out.push_str(&poll.question);
    for option in &poll.options {
        out.push_str("\n• ");
        out.push_str(option);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::FileKind;
    use crate::testing::{FakeClient, FakeRelayTarget};

    fn media_message(size: Option<u64>) -> SourceMessage {
        SourceMessage {
            id: 7,
            chat_id: -1001234,
            chat_username: Some("news".to_string()),
            text: "caption".to_string(),
            entities: Vec::new(),
            media: Some(Media::File(MediaFile {
                kind: FileKind::Video,
                file_id: "file-7".to_string(),
                size,
                file_name: Some("clip.mp4".to_string()),
            })),
            group_id: None,
            edit_hide: false,
        }
    }

    fn relay(
        target: &Arc<FakeRelayTarget>,
        client: &Arc<FakeClient>,
        media_dir: &Path,
    ) -> Relay {
        Relay::new(target.clone(), client.clone(), 2, media_dir).unwrap()
    }

    #[tokio::test]
    async fn test_large_attachment_posts_link_without_download() {
        let dir = tempfile::tempdir().unwrap();
        let target = Arc::new(FakeRelayTarget::new());
        let client = Arc::new(FakeClient::new());
        let relay = relay(&target, &client, dir.path());

        let plan = relay
            .relay(&media_message(Some(UPLOAD_CEILING)))
            .await
            .unwrap();

        assert!(matches!(plan, Some(RelayPlan::Link(_))));
        assert!(client.downloads().is_empty());
        let sent = target.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].text, "caption\n\nhttps://t.me/news/7");
        assert_eq!(sent[0].attachment, None);
    }

    #[tokio::test]
    async fn test_unknown_size_posts_link() {
        let dir = tempfile::tempdir().unwrap();
        let target = Arc::new(FakeRelayTarget::new());
        let client = Arc::new(FakeClient::new());
        let relay = relay(&target, &client, dir.path());

        relay.relay(&media_message(None)).await.unwrap();

        assert!(client.downloads().is_empty());
        assert_eq!(target.sent()[0].attachment, None);
    }

    #[tokio::test]
    async fn test_small_attachment_downloaded_sent_and_removed() {
        let dir = tempfile::tempdir().unwrap();
        let target = Arc::new(FakeRelayTarget::new());
        let client = Arc::new(FakeClient::new());
        let relay = relay(&target, &client, dir.path());

        let plan = relay
            .relay(&media_message(Some(UPLOAD_CEILING - 1)))
            .await
            .unwrap();

        assert!(matches!(plan, Some(RelayPlan::Attach { .. })));
        let downloads = client.downloads();
        assert_eq!(downloads.len(), 1);
        assert!(downloads[0].ends_with("clip.mp4"));

        let sent = target.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].text, "caption");
        assert_eq!(sent[0].attachment.as_deref(), Some(downloads[0].as_path()));
        assert!(sent[0].attachment_existed);

        assert!(!downloads[0].exists());
        assert!(!downloads[0].parent().unwrap().exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_temp_dir_removed_when_send_fails() {
        let dir = tempfile::tempdir().unwrap();
        let target = Arc::new(FakeRelayTarget::failing_send());
        let client = Arc::new(FakeClient::new());
        let relay = relay(&target, &client, dir.path());

        let err = relay
            .relay(&media_message(Some(1024)))
            .await
            .unwrap_err();

        assert!(matches!(err, RelayError::Send(_)));
        let downloads = client.downloads();
        assert_eq!(downloads.len(), 1);
        assert!(!downloads[0].parent().unwrap().exists());
        assert_eq!(target.closed(), 1);
    }

    #[tokio::test]
    async fn test_temp_dir_removed_when_download_fails() {
        let dir = tempfile::tempdir().unwrap();
        let target = Arc::new(FakeRelayTarget::new());
        let client = Arc::new(FakeClient::new().failing_downloads());
        let relay = relay(&target, &client, dir.path());

        let err = relay
            .relay(&media_message(Some(1024)))
            .await
            .unwrap_err();

        assert!(matches!(err, RelayError::Download(_)));
        assert!(target.sent().is_empty());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_session_per_message() {
        let dir = tempfile::tempdir().unwrap();
        let target = Arc::new(FakeRelayTarget::new());
        let client = Arc::new(FakeClient::new());
        let relay = Arc::new(relay(&target, &client, dir.path()));

        let mut text = media_message(None);
        text.media = None;
        let handles: Vec<_> = (0..3).map(|_| relay.spawn(text.clone())).collect();
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(target.opened(), 3);
        assert_eq!(target.closed(), 3);
        assert_eq!(target.sent().len(), 3);
    }

    #[tokio::test]
    async fn test_sessions_wait_for_a_permit() {
        let dir = tempfile::tempdir().unwrap();
        let target = Arc::new(FakeRelayTarget::new());
        let client = Arc::new(FakeClient::new());
        let relay = Arc::new(relay(&target, &client, dir.path()));

        let held = Arc::clone(&relay.permits).acquire_many_owned(2).await.unwrap();

        let mut text = media_message(None);
        text.media = None;
        let handle = relay.spawn(text);
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(target.opened(), 0);

        drop(held);
        handle.await.unwrap();
        assert_eq!(target.opened(), 1);
        assert_eq!(target.closed(), 1);
    }

    #[tokio::test]
    async fn test_cleanup_failure_reported_after_send() {
        let dir = tempfile::tempdir().unwrap();
        let target = Arc::new(FakeRelayTarget::new());
        let client = Arc::new(FakeClient::new().removing_download_dir());
        let relay = relay(&target, &client, dir.path());

        let err = relay
            .relay(&media_message(Some(1024)))
            .await
            .unwrap_err();

        match err {
            RelayError::Cleanup { path, source } => {
                assert_eq!(Some(path.as_path()), client.downloads()[0].parent());
                assert_eq!(source.kind(), std::io::ErrorKind::NotFound);
            }
            other => panic!("expected a cleanup error, got {other:?}"),
        }
        assert_eq!(target.sent().len(), 1);
        assert_eq!(target.closed(), 1);
    }

    #[tokio::test]
    async fn test_send_failure_wins_over_cleanup_failure() {
        let dir = tempfile::tempdir().unwrap();
        let target = Arc::new(FakeRelayTarget::failing_send());
        let client = Arc::new(FakeClient::new().removing_download_dir());
        let relay = relay(&target, &client, dir.path());

        let err = relay
            .relay(&media_message(Some(1024)))
            .await
            .unwrap_err();

        assert!(matches!(err, RelayError::Send(_)));
        assert_eq!(target.closed(), 1);
    }

    #[test]
    fn test_plan_native_payload_as_link() {
        let mut msg = media_message(None);
        msg.text = String::new();
        msg.media = Some(Media::Other("location"));
        assert_eq!(
            plan(&msg),
            Some(RelayPlan::Link("https://t.me/news/7".to_string()))
        );
    }

    #[test]
    fn test_plan_skips_empty_text() {
        let mut msg = media_message(None);
        msg.media = None;
        msg.text = "  ".to_string();
        assert_eq!(plan(&msg), None);
    }

    #[test]
    fn test_plan_poll_as_text() {
        let mut msg = media_message(None);
        msg.text = String::new();
        msg.media = Some(Media::Poll(Poll {
            question: "Lunch?".to_string(),
            options: vec!["Pizza".to_string(), "Soup".to_string()],
            is_anonymous: true,
            allows_multiple_answers: false,
        }));
        assert_eq!(
            plan(&msg),
            Some(RelayPlan::Text("📊 Lunch?\n• Pizza\n• Soup".to_string()))
        );
    }
}
