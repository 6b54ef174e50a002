use anyhow::Result;
use tracing::{debug, error};

use super::filter::MessageFilter;
use super::{FanoutReport, Outcome, SkipReason};
use crate::platform::{Media, SourceClient, SourceMessage};
use crate::store::MappingStore;

/// Re-apply an edited source message to every known copy of it.
///
/// Hidden edits return before touching the store or the network.
pub async fn propagate_edit(
    client: &dyn SourceClient,
    store: &dyn MappingStore,
    filter: &dyn MessageFilter,
    message: SourceMessage,
) -> Result<Outcome<FanoutReport>> {
    if message.edit_hide {
        return Ok(Outcome::Skip(SkipReason::HiddenEdit));
    }
    let editable = match &message.media {
        None => true,
        Some(Media::File(file)) => file.kind.supports_caption(),
        Some(Media::Poll(_) | Media::Other(_)) => false,
    };
    if !editable {
        return Ok(Outcome::Skip(SkipReason::NotEditable));
    }

    let records = store.get_messages_to_edit(message.id, message.chat_id).await?;
    if records.is_empty() {
        return Ok(Outcome::Skip(SkipReason::NoMappings));
    }

    let message = filter.process(message)?;
    let is_caption = message.file().is_some();

    let mut report = FanoutReport::default();
    for record in &records {
        let result = if is_caption {
            client
                .edit_caption(
                    record.mirror_channel,
                    record.mirror_id,
                    &message.text,
                    &message.entities,
                )
                .await
        } else {
            client
                .edit_text(
                    record.mirror_channel,
                    record.mirror_id,
                    &message.text,
                    &message.entities,
                )
                .await
        };

        match result {
            Ok(()) => {
                debug!(
                    "Edited {}#{} for source {}#{}",
                    record.mirror_channel, record.mirror_id, message.chat_id, message.id
                );
                report.delivered += 1;
            }
            Err(e) => {
                error!(
                    "Failed to edit {}#{} for source {}#{}: {:#}",
                    record.mirror_channel, record.mirror_id, message.chat_id, message.id, e
                );
                report.failed += 1;
            }
        }
    }

    Ok(Outcome::Forward(report))
}
