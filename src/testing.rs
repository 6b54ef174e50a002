//! Recording fakes for the platform and relay seams.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use async_trait::async_trait;

use crate::mirror::filter::MessageFilter;
use crate::mirror::relay::{RelaySession, RelayTarget};
use crate::platform::{AlbumItem, MediaFile, Poll, SourceClient, SourceMessage, TextEntity};
use crate::store::{MappingRecord, MappingStore, SqliteMappingStore};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    SendText {
        chat_id: i64,
        text: String,
    },
    CopyMedia {
        chat_id: i64,
        source_id: i64,
        caption: String,
    },
    SendPoll {
        chat_id: i64,
        question: String,
    },
    SendAlbum {
        chat_id: i64,
        captions: Vec<String>,
    },
    EditText {
        chat_id: i64,
        message_id: i64,
        text: String,
    },
    EditCaption {
        chat_id: i64,
        message_id: i64,
        caption: String,
    },
}

/// Records every call and hands out increasing message ids
pub struct FakeClient {
    calls: Mutex<Vec<Call>>,
    albums: Mutex<HashMap<i64, Vec<i64>>>,
    downloads: Mutex<Vec<PathBuf>>,
    formatting: Mutex<Vec<Vec<TextEntity>>>,
    next_id: AtomicI64,
    failing_chats: HashSet<i64>,
    album_response_len: Option<usize>,
    fail_downloads: bool,
    remove_download_dir: bool,
}

impl FakeClient {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            albums: Mutex::new(HashMap::new()),
            downloads: Mutex::new(Vec::new()),
            formatting: Mutex::new(Vec::new()),
            next_id: AtomicI64::new(1000),
            failing_chats: HashSet::new(),
            album_response_len: None,
            fail_downloads: false,
            remove_download_dir: false,
        }
    }

    /// Every send to this chat fails
    pub fn failing_chat(mut self, chat_id: i64) -> Self {
        self.failing_chats.insert(chat_id);
        self
    }

    /// Albums come back with this many messages regardless of how many were sent
    pub fn album_response_len(mut self, len: usize) -> Self {
        self.album_response_len = Some(len);
        self
    }

    pub fn failing_downloads(mut self) -> Self {
        self.fail_downloads = true;
        self
    }

    /// Downloads succeed but delete the directory they were asked to write into
    pub fn removing_download_dir(mut self) -> Self {
        self.remove_download_dir = true;
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn album_ids(&self, chat_id: i64) -> Vec<i64> {
        self.albums
            .lock()
            .unwrap()
            .get(&chat_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn downloads(&self) -> Vec<PathBuf> {
        self.downloads.lock().unwrap().clone()
    }

    /// Formatting passed along with each text send, copy and edit, in call order
    pub fn formatting(&self) -> Vec<Vec<TextEntity>> {
        self.formatting.lock().unwrap().clone()
    }

    fn record_formatting(&self, entities: &[TextEntity]) {
        self.formatting.lock().unwrap().push(entities.to_vec());
    }

    fn record(&self, chat_id: i64, call: Call) -> Result<i64> {
        self.calls.lock().unwrap().push(call);
        if self.failing_chats.contains(&chat_id) {
            bail!("chat {chat_id} is unavailable");
        }
        Ok(self.next_id.fetch_add(1, Ordering::SeqCst))
    }
}

#[async_trait]
impl SourceClient for FakeClient {
    async fn send_text(&self, chat_id: i64, text: &str, entities: &[TextEntity]) -> Result<i64> {
        self.record_formatting(entities);
        self.record(
            chat_id,
            Call::SendText {
                chat_id,
                text: text.to_string(),
            },
        )
    }

    async fn copy_media(&self, chat_id: i64, message: &SourceMessage) -> Result<i64> {
        self.record_formatting(&message.entities);
        self.record(
            chat_id,
            Call::CopyMedia {
                chat_id,
                source_id: message.id,
                caption: message.text.clone(),
            },
        )
    }

    async fn send_poll(&self, chat_id: i64, poll: &Poll) -> Result<i64> {
        self.record(
            chat_id,
            Call::SendPoll {
                chat_id,
                question: poll.question.clone(),
            },
        )
    }

    async fn send_album(&self, chat_id: i64, items: &[AlbumItem]) -> Result<Vec<i64>> {
        let call = Call::SendAlbum {
            chat_id,
            captions: items.iter().map(|item| item.caption.clone()).collect(),
        };
        let first = self.record(chat_id, call)?;
        let len = self.album_response_len.unwrap_or(items.len());
        let ids: Vec<i64> = (0..len)
            .map(|offset| first + offset as i64 * 10_000)
            .collect();
        self.albums.lock().unwrap().insert(chat_id, ids.clone());
        Ok(ids)
    }

    async fn edit_text(
        &self,
        chat_id: i64,
        message_id: i64,
        text: &str,
        entities: &[TextEntity],
    ) -> Result<()> {
        self.record_formatting(entities);
        self.record(
            chat_id,
            Call::EditText {
                chat_id,
                message_id,
                text: text.to_string(),
            },
        )
        .map(|_| ())
    }

    async fn edit_caption(
        &self,
        chat_id: i64,
        message_id: i64,
        caption: &str,
        entities: &[TextEntity],
    ) -> Result<()> {
        self.record_formatting(entities);
        self.record(
            chat_id,
            Call::EditCaption {
                chat_id,
                message_id,
                caption: caption.to_string(),
            },
        )
        .map(|_| ())
    }

    async fn download_media(&self, media: &MediaFile, dest: &Path) -> Result<()> {
        self.downloads.lock().unwrap().push(dest.to_path_buf());
        if self.fail_downloads {
            bail!("download of {} failed", media.file_id);
        }
        if self.remove_download_dir {
            if let Some(dir) = dest.parent() {
                tokio::fs::remove_dir_all(dir).await?;
            }
            return Ok(());
        }
        tokio::fs::write(dest, media.file_id.as_bytes()).await?;
        Ok(())
    }
}

/// Fails on one message id and passes every other message through
pub struct FailingFilter {
    pub message_id: i64,
}

impl MessageFilter for FailingFilter {
    fn process(&self, message: SourceMessage) -> Result<SourceMessage> {
        if message.id == self.message_id {
            bail!("filter rejected message {}", message.id);
        }
        Ok(message)
    }
}

/// Counts store reads so tests can assert a path never touched the store
pub struct CountingStore {
    inner: SqliteMappingStore,
    reads: AtomicUsize,
}

impl CountingStore {
    pub fn new(inner: SqliteMappingStore) -> Self {
        Self {
            inner,
            reads: AtomicUsize::new(0),
        }
    }

    pub fn inner(&self) -> &SqliteMappingStore {
        &self.inner
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MappingStore for CountingStore {
    async fn insert(&self, record: &MappingRecord) -> Result<()> {
        self.inner.insert(record).await
    }

    async fn get_messages_to_edit(
        &self,
        original_id: i64,
        original_channel: i64,
    ) -> Result<Vec<MappingRecord>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.inner
            .get_messages_to_edit(original_id, original_channel)
            .await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentPost {
    pub text: String,
    pub attachment: Option<PathBuf>,
    /// Whether the attachment was on disk when it was sent
    pub attachment_existed: bool,
}

#[derive(Default)]
struct RelayLog {
    opened: AtomicUsize,
    closed: AtomicUsize,
    sent: Mutex<Vec<SentPost>>,
}

pub struct FakeRelayTarget {
    log: Arc<RelayLog>,
    fail_send: bool,
}

impl FakeRelayTarget {
    pub fn new() -> Self {
        Self {
            log: Arc::default(),
            fail_send: false,
        }
    }

    pub fn failing_send() -> Self {
        Self {
            fail_send: true,
            ..Self::new()
        }
    }

    pub fn opened(&self) -> usize {
        self.log.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.log.closed.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<SentPost> {
        self.log.sent.lock().unwrap().clone()
    }
}

struct FakeSession {
    log: Arc<RelayLog>,
    fail_send: bool,
}

#[async_trait]
impl RelayTarget for FakeRelayTarget {
    async fn open_session(&self) -> Result<Box<dyn RelaySession>> {
        self.log.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeSession {
            log: Arc::clone(&self.log),
            fail_send: self.fail_send,
        }))
    }
}

#[async_trait]
impl RelaySession for FakeSession {
    async fn send(&mut self, text: &str, attachment: Option<&Path>) -> Result<()> {
        self.log.sent.lock().unwrap().push(SentPost {
            text: text.to_string(),
            attachment: attachment.map(Path::to_path_buf),
            attachment_existed: attachment.is_some_and(Path::exists),
        });
        if self.fail_send {
            bail!("destination rejected the post");
        }
        Ok(())
    }

    async fn close(self: Box<Self>) {
        self.log.closed.fetch_add(1, Ordering::SeqCst);
    }
}
