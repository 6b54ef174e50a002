pub mod edit;
pub mod fanout;
pub mod filter;
pub mod mapping;
pub mod relay;

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, error, info, warn};

use crate::platform::{SourceClient, SourceEvent, SourceMessage};
use crate::store::MappingStore;

pub use fanout::FanoutReport;
use filter::MessageFilter;
use mapping::MirrorMapping;
use relay::Relay;

/// Why a pipeline stage decided not to forward an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The chat is not a configured source
    UnknownChat,
    /// Album items are handled by the album path
    Grouped,
    /// No destinations configured for the source chat
    NoDestinations,
    /// Only the cross-platform relay handles this chat
    RelayOnly,
    /// Nothing left to send after filtering
    Empty,
    /// Edit only changed metadata
    HiddenEdit,
    /// The edited message was never mirrored
    NoMappings,
    /// The payload cannot be edited in place
    NotEditable,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            SkipReason::UnknownChat => "chat is not a mirroring source",
            SkipReason::Grouped => "message belongs to an album",
            SkipReason::NoDestinations => "no target chats",
            SkipReason::RelayOnly => "relayed only",
            SkipReason::Empty => "nothing to send",
            SkipReason::HiddenEdit => "hidden edit",
            SkipReason::NoMappings => "no target messages",
            SkipReason::NotEditable => "payload cannot be edited",
        };
        f.write_str(text)
    }
}

/// Result of one pipeline stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T> {
    Skip(SkipReason),
    Forward(T),
}

/// Immutable mirroring configuration shared by every handler
pub struct MirrorContext {
    pub mapping: MirrorMapping,
    pub filter: Arc<dyn MessageFilter>,
    source_chats: HashSet<i64>,
}

impl MirrorContext {
    /// Source chats are the given chats plus every chat with a configured route
    pub fn new(
        mapping: MirrorMapping,
        filter: Arc<dyn MessageFilter>,
        source_chats: impl IntoIterator<Item = i64>,
    ) -> Self {
        let mut sources: HashSet<i64> = source_chats.into_iter().collect();
        sources.extend(mapping.sources());
        Self {
            mapping,
            filter,
            source_chats: sources,
        }
    }

    pub fn is_source(&self, chat_id: i64) -> bool {
        self.source_chats.contains(&chat_id)
    }

    pub fn source_count(&self) -> usize {
        self.source_chats.len()
    }
}

/// The mirroring engine: routes source events through filtering, fanout and edit tracking.
///
/// Holds the platform client by composition; every send and edit goes through it.
pub struct MirrorEngine {
    ctx: Arc<MirrorContext>,
    client: Arc<dyn SourceClient>,
    store: Arc<dyn MappingStore>,
    relay: Option<Arc<Relay>>,
}

impl MirrorEngine {
    pub fn new(
        ctx: Arc<MirrorContext>,
        client: Arc<dyn SourceClient>,
        store: Arc<dyn MappingStore>,
        relay: Option<Arc<Relay>>,
    ) -> Self {
        Self {
            ctx,
            client,
            store,
            relay,
        }
    }

    pub fn is_source(&self, chat_id: i64) -> bool {
        self.ctx.is_source(chat_id)
    }

    /// Handle one event. Never fails: errors are logged and the event is dropped.
    pub async fn dispatch(&self, event: SourceEvent) {
        let kind = event.kind();
        let chat_id = event.chat_id().unwrap_or_default();
        let message_id = event.message_id().unwrap_or_default();

        let result = match event {
            SourceEvent::NewMessage(message) => self.on_new_message(message).await,
            SourceEvent::Album(messages) => self.on_album(messages).await,
            SourceEvent::Edited(message) => self.on_edit(message).await,
        };

        match result {
            Ok(Outcome::Forward(report)) if report.failed > 0 || report.unmapped > 0 => warn!(
                "{} {}#{}: {} delivered, {} failed, {} unmapped",
                kind, chat_id, message_id, report.delivered, report.failed, report.unmapped
            ),
            Ok(Outcome::Forward(report)) => info!(
                "{} {}#{}: {} delivered",
                kind, chat_id, message_id, report.delivered
            ),
            Ok(Outcome::Skip(reason @ (SkipReason::NoDestinations | SkipReason::NoMappings))) => {
                warn!("Skipping {} {}#{}: {}", kind, chat_id, message_id, reason)
            }
            Ok(Outcome::Skip(reason)) => {
                debug!("Skipping {} {}#{}: {}", kind, chat_id, message_id, reason)
            }
            Err(e) => error!(
                "Failed to handle {} {}#{}: {:#}",
                kind, chat_id, message_id, e
            ),
        }
    }

    async fn on_new_message(&self, message: SourceMessage) -> Result<Outcome<FanoutReport>> {
        if !self.ctx.is_source(message.chat_id) {
            return Ok(Outcome::Skip(SkipReason::UnknownChat));
        }
        if message.group_id.is_some() {
            return Ok(Outcome::Skip(SkipReason::Grouped));
        }

        info!("New message from {}#{}", message.chat_id, message.id);
        debug!("{:?}", message);

        let targets = self.ctx.mapping.destinations(message.chat_id);
        if targets.is_empty() && self.relay.is_none() {
            return Ok(Outcome::Skip(SkipReason::NoDestinations));
        }

        let message = self.ctx.filter.process(message)?;
        if message.media.is_none() && message.text.trim().is_empty() {
            return Ok(Outcome::Skip(SkipReason::Empty));
        }

        if let Some(relay) = &self.relay {
            relay.spawn(message.clone());
        }

        if targets.is_empty() {
            return Ok(Outcome::Skip(SkipReason::RelayOnly));
        }

        let report = fanout::fanout(
            self.client.as_ref(),
            self.store.as_ref(),
            &message,
            targets,
        )
        .await;
        Ok(Outcome::Forward(report))
    }

    async fn on_album(&self, messages: Vec<SourceMessage>) -> Result<Outcome<FanoutReport>> {
        let Some(chat_id) = messages.first().map(|m| m.chat_id) else {
            return Ok(Outcome::Skip(SkipReason::Empty));
        };
        if !self.ctx.is_source(chat_id) {
            return Ok(Outcome::Skip(SkipReason::UnknownChat));
        }

        info!("New album of {} item(s) from {}", messages.len(), chat_id);

        let targets = self.ctx.mapping.destinations(chat_id);
        if targets.is_empty() {
            return Ok(Outcome::Skip(SkipReason::NoDestinations));
        }

        let filtered = messages
            .into_iter()
            .map(|message| self.ctx.filter.process(message))
            .collect::<Result<Vec<_>>>()?;
        let items = fanout::album_items(filtered);
        if items.is_empty() {
            return Ok(Outcome::Skip(SkipReason::Empty));
        }

        let report = fanout::fanout_album(
            self.client.as_ref(),
            self.store.as_ref(),
            chat_id,
            &items,
            targets,
        )
        .await;
        Ok(Outcome::Forward(report))
    }

    async fn on_edit(&self, message: SourceMessage) -> Result<Outcome<FanoutReport>> {
        if !self.ctx.is_source(message.chat_id) {
            return Ok(Outcome::Skip(SkipReason::UnknownChat));
        }

        info!(
            "Edit message from {}#{}{}",
            message.chat_id,
            message.id,
            if message.edit_hide { " (hidden)" } else { "" }
        );

        edit::propagate_edit(
            self.client.as_ref(),
            self.store.as_ref(),
            self.ctx.filter.as_ref(),
            message,
        )
        .await
    }
}
