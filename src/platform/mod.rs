pub mod album;
pub mod discord;
pub mod telegram;

use std::ops::Range;
use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;

/// Kind of file attached to a source message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Photo,
    Video,
    Document,
    Audio,
    Animation,
    Voice,
    VideoNote,
    Sticker,
}

impl FileKind {
    /// Whether the platform accepts a caption alongside this kind of file
    pub fn supports_caption(self) -> bool {
        !matches!(self, FileKind::Sticker | FileKind::VideoNote)
    }

    fn default_extension(self) -> &'static str {
        match self {
            FileKind::Photo => "jpg",
            FileKind::Video | FileKind::Animation | FileKind::VideoNote => "mp4",
            FileKind::Document => "bin",
            FileKind::Audio => "mp3",
            FileKind::Voice => "ogg",
            FileKind::Sticker => "webp",
        }
    }
}

/// A file stored on the source platform, referenced by its file id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaFile {
    pub kind: FileKind,
    pub file_id: String,
    /// Size in bytes as reported by the platform, if known
    pub size: Option<u64>,
    pub file_name: Option<String>,
}

impl MediaFile {
    /// File name to use when the file is saved locally.
    /// Path separators and leading dots are stripped so the name stays inside its directory.
    pub fn local_name(&self, message_id: i64) -> String {
        let sanitized = self
            .file_name
            .as_deref()
            .map(|name| name.replace(['/', '\\'], "_").trim_start_matches('.').to_owned())
            .unwrap_or_default();

        if sanitized.is_empty() {
            format!("{}.{}", message_id, self.kind.default_extension())
        } else {
            sanitized
        }
    }
}

/// A native poll
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Poll {
    pub question: String,
    pub options: Vec<String>,
    pub is_anonymous: bool,
    pub allows_multiple_answers: bool,
}

/// Payload attached to a message besides its text
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Media {
    File(MediaFile),
    Poll(Poll),
    /// A payload copied verbatim without being read (location, contact, dice, ...)
    Other(&'static str),
}

/// Formatting the bot reproduces on mirrored copies.
/// Spans the platform detects on its own (mentions, plain URLs, hashtags) are not carried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityKind {
    Bold,
    Italic,
    Underline,
    Strikethrough,
    Spoiler,
    Code,
    Pre { language: Option<String> },
    TextLink { url: String },
    Blockquote,
    ExpandableBlockquote,
    CustomEmoji { id: String },
}

/// A formatting span over the message text. Offsets and lengths are in UTF-16 code units.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextEntity {
    pub kind: EntityKind,
    pub offset: usize,
    pub length: usize,
}

fn utf16_len(text: &str) -> usize {
    text.encode_utf16().count()
}

/// A message observed on the source platform.
///
/// `text` holds the message text, or the caption for media messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceMessage {
    pub id: i64,
    pub chat_id: i64,
    /// Public username of the source chat, used to build links back to the message
    pub chat_username: Option<String>,
    pub text: String,
    /// Formatting of `text`
    pub entities: Vec<TextEntity>,
    pub media: Option<Media>,
    /// Album correlation id shared by all items of one album
    pub group_id: Option<String>,
    /// Set on edits that only change metadata (reactions and so on)
    pub edit_hide: bool,
}

impl SourceMessage {
    pub fn file(&self) -> Option<&MediaFile> {
        match &self.media {
            Some(Media::File(file)) => Some(file),
            _ => None,
        }
    }

    /// Cut byte ranges out of the text and move the formatting spans with it.
    ///
    /// Ranges must be sorted, disjoint and on char boundaries. Spans left empty are dropped.
    pub fn remove_spans(&mut self, spans: &[Range<usize>]) {
        if spans.is_empty() {
            return;
        }

        let removed: Vec<(usize, usize)> = spans
            .iter()
            .map(|span| {
                (
                    utf16_len(&self.text[..span.start]),
                    utf16_len(&self.text[..span.end]),
                )
            })
            .collect();
        let shift = |pos: usize| -> usize {
            let cut: usize = removed
                .iter()
                .map(|&(start, end)| end.min(pos).saturating_sub(start))
                .sum();
            pos - cut
        };

        self.entities = std::mem::take(&mut self.entities)
            .into_iter()
            .filter_map(|entity| {
                let start = shift(entity.offset);
                let end = shift(entity.offset + entity.length);
                (end > start).then(|| TextEntity {
                    offset: start,
                    length: end - start,
                    ..entity
                })
            })
            .collect();

        let mut text = String::with_capacity(self.text.len());
        let mut last = 0;
        for span in spans {
            text.push_str(&self.text[last..span.start]);
            last = span.end;
        }
        text.push_str(&self.text[last..]);
        self.text = text;
    }

    /// Durable link back to the original message
    pub fn permalink(&self) -> String {
        match &self.chat_username {
            Some(username) => format!("https://t.me/{}/{}", username, self.id),
            None => {
                let chat = self.chat_id.to_string();
                let internal = chat
                    .strip_prefix("-100")
                    .unwrap_or_else(|| chat.trim_start_matches('-'));
                format!("https://t.me/c/{}/{}", internal, self.id)
            }
        }
    }
}

/// Events produced by the source platform for the configured chats
#[derive(Debug, Clone)]
pub enum SourceEvent {
    NewMessage(SourceMessage),
    Album(Vec<SourceMessage>),
    Edited(SourceMessage),
}

impl SourceEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            SourceEvent::NewMessage(_) => "message",
            SourceEvent::Album(_) => "album",
            SourceEvent::Edited(_) => "edit",
        }
    }

    pub fn chat_id(&self) -> Option<i64> {
        match self {
            SourceEvent::NewMessage(m) | SourceEvent::Edited(m) => Some(m.chat_id),
            SourceEvent::Album(items) => items.first().map(|m| m.chat_id),
        }
    }

    pub fn message_id(&self) -> Option<i64> {
        match self {
            SourceEvent::NewMessage(m) | SourceEvent::Edited(m) => Some(m.id),
            SourceEvent::Album(items) => items.first().map(|m| m.id),
        }
    }
}

/// One item of an outgoing album
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlbumItem {
    pub media: MediaFile,
    pub caption: String,
    pub entities: Vec<TextEntity>,
    pub source_id: i64,
}

/// Send and edit primitives of the platform the bot mirrors on.
///
/// All ids are platform ids; every send returns the id of the new message.
#[async_trait]
pub trait SourceClient: Send + Sync {
    async fn send_text(&self, chat_id: i64, text: &str, entities: &[TextEntity]) -> Result<i64>;

    /// Re-post a media message to `chat_id` with the message's (filtered) text as caption.
    /// Payloads without a caption are copied unchanged.
    async fn copy_media(&self, chat_id: i64, message: &SourceMessage) -> Result<i64>;

    async fn send_poll(&self, chat_id: i64, poll: &Poll) -> Result<i64>;

    /// Send items as one album; returns the ids of the created messages in order
    async fn send_album(&self, chat_id: i64, items: &[AlbumItem]) -> Result<Vec<i64>>;

    async fn edit_text(
        &self,
        chat_id: i64,
        message_id: i64,
        text: &str,
        entities: &[TextEntity],
    ) -> Result<()>;

    async fn edit_caption(
        &self,
        chat_id: i64,
        message_id: i64,
        caption: &str,
        entities: &[TextEntity],
    ) -> Result<()>;

    async fn download_media(&self, media: &MediaFile, dest: &Path) -> Result<()>;
}
