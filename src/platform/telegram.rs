use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use teloxide::net::Download;
use teloxide::payloads::setters::*;
use teloxide::prelude::*;
use teloxide::types::{
    CustomEmojiId, FileId, InputFile, InputMedia, InputMediaAudio, InputMediaDocument,
    InputMediaPhoto, InputMediaVideo, InputPollOption, MessageEntity, MessageEntityKind,
    MessageId,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::album::AlbumCollector;
use super::{
    AlbumItem, EntityKind, FileKind, Media, MediaFile, Poll, SourceClient, SourceEvent,
    SourceMessage, TextEntity,
};
use crate::mirror::MirrorEngine;

/// Telegram Bot API client used both to receive source posts and to mirror them
#[derive(Clone)]
pub struct TelegramClient {
    bot: Bot,
}

impl TelegramClient {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

fn to_message_id(id: i64) -> Result<MessageId> {
    let id = i32::try_from(id).with_context(|| format!("Message id {id} out of range"))?;
    Ok(MessageId(id))
}

fn entity_from_telegram(entity: &MessageEntity) -> Option<TextEntity> {
    let kind = match &entity.kind {
        MessageEntityKind::Bold => EntityKind::Bold,
        MessageEntityKind::Italic => EntityKind::Italic,
        MessageEntityKind::Underline => EntityKind::Underline,
        MessageEntityKind::Strikethrough => EntityKind::Strikethrough,
        MessageEntityKind::Spoiler => EntityKind::Spoiler,
        MessageEntityKind::Code => EntityKind::Code,
        MessageEntityKind::Pre { language } => EntityKind::Pre {
            language: language.clone(),
        },
        MessageEntityKind::TextLink { url } => EntityKind::TextLink {
            url: url.to_string(),
        },
        MessageEntityKind::Blockquote => EntityKind::Blockquote,
        MessageEntityKind::ExpandableBlockquote => EntityKind::ExpandableBlockquote,
        MessageEntityKind::CustomEmoji { custom_emoji_id } => EntityKind::CustomEmoji {
            id: custom_emoji_id.0.clone(),
        },
        // Detected by Telegram on every send, or tied to a user we cannot re-mention
        _ => return None,
    };
    Some(TextEntity {
        kind,
        offset: entity.offset,
        length: entity.length,
    })
}

fn entity_to_telegram(entity: &TextEntity) -> Option<MessageEntity> {
    let kind = match &entity.kind {
        EntityKind::Bold => MessageEntityKind::Bold,
        EntityKind::Italic => MessageEntityKind::Italic,
        EntityKind::Underline => MessageEntityKind::Underline,
        EntityKind::Strikethrough => MessageEntityKind::Strikethrough,
        EntityKind::Spoiler => MessageEntityKind::Spoiler,
        EntityKind::Code => MessageEntityKind::Code,
        EntityKind::Pre { language } => MessageEntityKind::Pre {
            language: language.clone(),
        },
        EntityKind::TextLink { url } => match reqwest::Url::parse(url) {
            Ok(url) => MessageEntityKind::TextLink { url },
            Err(e) => {
                warn!("Dropping text link with invalid URL {}: {}", url, e);
                return None;
            }
        },
        EntityKind::Blockquote => MessageEntityKind::Blockquote,
        EntityKind::ExpandableBlockquote => MessageEntityKind::ExpandableBlockquote,
        EntityKind::CustomEmoji { id } => MessageEntityKind::CustomEmoji {
            custom_emoji_id: CustomEmojiId(id.clone()),
        },
    };
    Some(MessageEntity::new(kind, entity.offset, entity.length))
}

fn to_telegram_entities(entities: &[TextEntity]) -> Vec<MessageEntity> {
    entities.iter().filter_map(entity_to_telegram).collect()
}

fn input_media(item: &AlbumItem) -> InputMedia {
    let file = InputFile::file_id(FileId(item.media.file_id.clone()));
    let caption = item.caption.clone();
    let entities = to_telegram_entities(&item.entities);
    match item.media.kind {
        FileKind::Photo => InputMedia::Photo(
            InputMediaPhoto::new(file)
                .caption(caption)
                .caption_entities(entities),
        ),
        FileKind::Video | FileKind::Animation | FileKind::VideoNote => InputMedia::Video(
            InputMediaVideo::new(file)
                .caption(caption)
                .caption_entities(entities),
        ),
        FileKind::Audio | FileKind::Voice => InputMedia::Audio(
            InputMediaAudio::new(file)
                .caption(caption)
                .caption_entities(entities),
        ),
        FileKind::Document | FileKind::Sticker => InputMedia::Document(
            InputMediaDocument::new(file)
                .caption(caption)
                .caption_entities(entities),
        ),
    }
}

#[async_trait]
impl SourceClient for TelegramClient {
    async fn send_text(&self, chat_id: i64, text: &str, entities: &[TextEntity]) -> Result<i64> {
        let mut request = self.bot.send_message(ChatId(chat_id), text);
        if !entities.is_empty() {
            request = request.entities(to_telegram_entities(entities));
        }
        let sent = request.await.context("sendMessage failed")?;
        Ok(i64::from(sent.id.0))
    }

    async fn copy_media(&self, chat_id: i64, message: &SourceMessage) -> Result<i64> {
        let request = self.bot.copy_message(
            ChatId(chat_id),
            ChatId(message.chat_id),
            to_message_id(message.id)?,
        );
        let request = match message.file() {
            Some(file) if file.kind.supports_caption() => request
                .caption(message.text.clone())
                .caption_entities(to_telegram_entities(&message.entities)),
            _ => request,
        };
        let copied = request.await.context("copyMessage failed")?;
        Ok(i64::from(copied.0))
    }

    async fn send_poll(&self, chat_id: i64, poll: &Poll) -> Result<i64> {
        let options = poll.options.iter().cloned().map(InputPollOption::new);
        let sent = self
            .bot
            .send_poll(ChatId(chat_id), poll.question.clone(), options)
            .is_anonymous(poll.is_anonymous)
            .allows_multiple_answers(poll.allows_multiple_answers)
            .await
            .context("sendPoll failed")?;
        Ok(i64::from(sent.id.0))
    }

    async fn send_album(&self, chat_id: i64, items: &[AlbumItem]) -> Result<Vec<i64>> {
        let media: Vec<InputMedia> = items.iter().map(input_media).collect();
        let sent = self
            .bot
            .send_media_group(ChatId(chat_id), media)
            .await
            .context("sendMediaGroup failed")?;
        Ok(sent.iter().map(|m| i64::from(m.id.0)).collect())
    }

    async fn edit_text(
        &self,
        chat_id: i64,
        message_id: i64,
        text: &str,
        entities: &[TextEntity],
    ) -> Result<()> {
        let mut request =
            self.bot
                .edit_message_text(ChatId(chat_id), to_message_id(message_id)?, text);
        if !entities.is_empty() {
            request = request.entities(to_telegram_entities(entities));
        }
        request.await.context("editMessageText failed")?;
        Ok(())
    }

    async fn edit_caption(
        &self,
        chat_id: i64,
        message_id: i64,
        caption: &str,
        entities: &[TextEntity],
    ) -> Result<()> {
        self.bot
            .edit_message_caption(ChatId(chat_id), to_message_id(message_id)?)
            .caption(caption.to_string())
            .caption_entities(to_telegram_entities(entities))
            .await
            .context("editMessageCaption failed")?;
        Ok(())
    }

    async fn download_media(&self, media: &MediaFile, dest: &Path) -> Result<()> {
        let file = self
            .bot
            .get_file(FileId(media.file_id.clone()))
            .await
            .context("failed to get file info from Telegram")?;

        let mut dst = tokio::fs::File::create(dest)
            .await
            .with_context(|| format!("failed to create file at {}", dest.display()))?;

        self.bot
            .download_file(&file.path, &mut dst)
            .await
            .context("failed to download file from Telegram")?;

        debug!(path = %dest.display(), "media file downloaded");
        Ok(())
    }
}

fn media_of(msg: &Message) -> Option<Media> {
    if let Some(poll) = msg.poll() {
        return Some(Media::Poll(Poll {
            question: poll.question.clone(),
            options: poll.options.iter().map(|o| o.text.clone()).collect(),
            is_anonymous: poll.is_anonymous,
            allows_multiple_answers: poll.allows_multiple_answers,
        }));
    }

    let (kind, meta, file_name) = if let Some(photos) = msg.photo() {
        // Largest size is last by Telegram convention
        (FileKind::Photo, &photos.last()?.file, None)
    } else if let Some(animation) = msg.animation() {
        (FileKind::Animation, &animation.file, animation.file_name.clone())
    } else if let Some(video) = msg.video() {
        (FileKind::Video, &video.file, video.file_name.clone())
    } else if let Some(document) = msg.document() {
        (FileKind::Document, &document.file, document.file_name.clone())
    } else if let Some(audio) = msg.audio() {
        (FileKind::Audio, &audio.file, audio.file_name.clone())
    } else if let Some(voice) = msg.voice() {
        (FileKind::Voice, &voice.file, None)
    } else if let Some(note) = msg.video_note() {
        (FileKind::VideoNote, &note.file, None)
    } else if let Some(sticker) = msg.sticker() {
        (FileKind::Sticker, &sticker.file, None)
    } else {
        return native_payload(msg).map(Media::Other);
    };

    Some(Media::File(MediaFile {
        kind,
        file_id: meta.id.0.clone(),
        size: Some(u64::from(meta.size)),
        file_name,
    }))
}

/// Payloads that are copied as they are, named for logs
fn native_payload(msg: &Message) -> Option<&'static str> {
    if msg.venue().is_some() {
        Some("venue")
    } else if msg.location().is_some() {
        Some("location")
    } else if msg.contact().is_some() {
        Some("contact")
    } else if msg.dice().is_some() {
        Some("dice")
    } else {
        None
    }
}

/// Convert a Bot API message into the platform-neutral form.
/// The Bot API does not report metadata-only edits, so `edit_hide` is always false here.
pub fn to_source_message(msg: &Message) -> SourceMessage {
    SourceMessage {
        id: i64::from(msg.id.0),
        chat_id: msg.chat.id.0,
        chat_username: msg.chat.username().map(str::to_string),
        text: msg
            .text()
            .or_else(|| msg.caption())
            .unwrap_or_default()
            .to_string(),
        entities: msg
            .entities()
            .or_else(|| msg.caption_entities())
            .unwrap_or_default()
            .iter()
            .filter_map(entity_from_telegram)
            .collect(),
        media: media_of(msg),
        group_id: msg.media_group_id().map(|g| g.0.clone()),
        edit_hide: false,
    }
}

async fn on_post(
    msg: Message,
    engine: Arc<MirrorEngine>,
    albums: Arc<AlbumCollector>,
) -> ResponseResult<()> {
    if !engine.is_source(msg.chat.id.0) {
        return Ok(());
    }

    let message = to_source_message(&msg);
    if message.group_id.is_some() {
        albums.push(message).await;
    } else {
        engine.dispatch(SourceEvent::NewMessage(message)).await;
    }
    Ok(())
}

async fn on_edit(msg: Message, engine: Arc<MirrorEngine>) -> ResponseResult<()> {
    if !engine.is_source(msg.chat.id.0) {
        return Ok(());
    }

    engine
        .dispatch(SourceEvent::Edited(to_source_message(&msg)))
        .await;
    Ok(())
}

/// Receive source updates until shutdown.
///
/// Channel posts and group messages go to the engine; album items are collected first.
pub async fn run(bot: Bot, engine: Arc<MirrorEngine>, album_window: Duration) -> Result<()> {
    let (tx, mut rx) = mpsc::channel::<SourceEvent>(64);
    let albums = Arc::new(AlbumCollector::new(album_window, tx));

    let pump_engine = Arc::clone(&engine);
    let pump = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let engine = Arc::clone(&pump_engine);
            tokio::spawn(async move { engine.dispatch(event).await });
        }
    });

    info!("Starting Telegram update dispatcher...");

    let handler = dptree::entry()
        .branch(Update::filter_channel_post().endpoint(on_post))
        .branch(Update::filter_message().endpoint(on_post))
        .branch(Update::filter_edited_channel_post().endpoint(on_edit))
        .branch(Update::filter_edited_message().endpoint(on_edit));

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![engine, albums])
        .default_handler(|upd| async move {
            debug!("Unhandled update: {:?}", upd.id);
        })
        .error_handler(LoggingErrorHandler::with_custom_text("telemirror"))
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    pump.abort();
    warn!("Telegram dispatcher stopped");
    Ok(())
}
