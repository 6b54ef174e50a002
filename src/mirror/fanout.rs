use anyhow::{Context, Result};
use tracing::{debug, error, info, warn};

use crate::platform::{AlbumItem, Media, SourceClient, SourceMessage};
use crate::store::{MappingRecord, MappingStore};

/// Result of delivering one source message (or album) to its destinations
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanoutReport {
    /// Destinations that received the message and have their mapping recorded
    pub delivered: usize,
    /// Destinations where sending (or recording) failed
    pub failed: usize,
    /// Destinations that received the message but could not be correlated
    pub unmapped: usize,
}

/// Send one filtered message to one destination, choosing the strategy by payload kind
pub async fn send_to(client: &dyn SourceClient, message: &SourceMessage, chat_id: i64) -> Result<i64> {
    match &message.media {
        Some(Media::Poll(poll)) => client.send_poll(chat_id, poll).await,
        Some(Media::File(_) | Media::Other(_)) => client.copy_media(chat_id, message).await,
        None => {
            client
                .send_text(chat_id, &message.text, &message.entities)
                .await
        }
    }
}

async fn deliver(
    client: &dyn SourceClient,
    store: &dyn MappingStore,
    message: &SourceMessage,
    target: i64,
) -> Result<()> {
    let mirror_id = send_to(client, message, target)
        .await
        .with_context(|| format!("Failed to send {}#{} to {}", message.chat_id, message.id, target))?;

    store
        .insert(&MappingRecord {
            original_id: message.id,
            original_channel: message.chat_id,
            mirror_id,
            mirror_channel: target,
        })
        .await
        .with_context(|| format!("Sent to {target} as #{mirror_id} but failed to record mapping"))?;

    debug!("Mirrored {}#{} to {}#{}", message.chat_id, message.id, target, mirror_id);
    Ok(())
}

/// Deliver a message to every target. Each target is attempted regardless of earlier failures.
pub async fn fanout(
    client: &dyn SourceClient,
    store: &dyn MappingStore,
    message: &SourceMessage,
    targets: &[i64],
) -> FanoutReport {
    let mut report = FanoutReport::default();
    for &target in targets {
        match deliver(client, store, message, target).await {
            Ok(()) => report.delivered += 1,
            Err(e) => {
                error!("{:#}", e);
                report.failed += 1;
            }
        }
    }
    report
}

/// Turn filtered album messages into outgoing items, ordered by message id.
/// Messages without a file cannot be part of an album and are dropped.
pub fn album_items(mut messages: Vec<SourceMessage>) -> Vec<AlbumItem> {
    messages.sort_by_key(|m| m.id);
    messages
        .into_iter()
        .filter_map(|message| match message.media {
            Some(Media::File(media)) => Some(AlbumItem {
                media,
                caption: message.text,
                entities: message.entities,
                source_id: message.id,
            }),
            _ => {
                warn!(
                    "Album item {}#{} has no file attached, leaving it out",
                    message.chat_id, message.id
                );
                None
            }
        })
        .collect()
}

/// Send an album to every target and record item mappings by position.
///
/// If a destination returns a different number of messages than was sent, nothing is
/// recorded for it: a positional pairing would be ambiguous.
pub async fn fanout_album(
    client: &dyn SourceClient,
    store: &dyn MappingStore,
    source_chat: i64,
    items: &[AlbumItem],
    targets: &[i64],
) -> FanoutReport {
    let mut report = FanoutReport::default();

    for &target in targets {
        let mirror_ids = match client.send_album(target, items).await {
            Ok(ids) => ids,
            Err(e) => {
                error!("Failed to send album from {} to {}: {:#}", source_chat, target, e);
                report.failed += 1;
                continue;
            }
        };

        if mirror_ids.len() != items.len() {
            warn!(
                "Album from {} to {}: sent {} item(s) but got {} back, not recording mappings",
                source_chat,
                target,
                items.len(),
                mirror_ids.len()
            );
            report.unmapped += 1;
            continue;
        }

        let mut recorded = true;
        for (item, &mirror_id) in items.iter().zip(&mirror_ids) {
            let record = MappingRecord {
                original_id: item.source_id,
                original_channel: source_chat,
                mirror_id,
                mirror_channel: target,
            };
            if let Err(e) = store.insert(&record).await {
                error!(
                    "Failed to record album mapping {}#{} -> {}#{}: {:#}",
                    source_chat, item.source_id, target, mirror_id, e
                );
                recorded = false;
            }
        }

        if recorded {
            info!("Album of {} item(s) mirrored from {} to {}", items.len(), source_chat, target);
            report.delivered += 1;
        } else {
            report.failed += 1;
        }
    }

    report
}
