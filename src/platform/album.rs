use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use super::{SourceEvent, SourceMessage};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct AlbumKey {
    chat_id: i64,
    group_id: String,
}

struct PendingAlbum {
    generation: u64,
    messages: Vec<SourceMessage>,
}

/// Groups album items that arrive as separate updates into one album event.
///
/// An album is emitted once no new item for its group has arrived for `quiet_window`.
pub struct AlbumCollector {
    pending: Arc<Mutex<HashMap<AlbumKey, PendingAlbum>>>,
    quiet_window: Duration,
    out: mpsc::Sender<SourceEvent>,
}

impl AlbumCollector {
    pub fn new(quiet_window: Duration, out: mpsc::Sender<SourceEvent>) -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            quiet_window,
            out,
        }
    }

    /// Buffer an album item. Messages without a group id are passed on as new messages.
    pub async fn push(&self, message: SourceMessage) {
        let Some(group_id) = message.group_id.clone() else {
            if self.out.send(SourceEvent::NewMessage(message)).await.is_err() {
                warn!("Event channel closed, dropping message");
            }
            return;
        };

        let key = AlbumKey {
            chat_id: message.chat_id,
            group_id,
        };
        let generation = {
            let mut pending = self.pending.lock().await;
            let entry = pending.entry(key.clone()).or_insert_with(|| PendingAlbum {
                generation: 0,
                messages: Vec::new(),
            });
            entry.generation = entry.generation.wrapping_add(1);
            entry.messages.push(message);
            entry.generation
        };

        let pending = Arc::clone(&self.pending);
        let out = self.out.clone();
        let window = self.quiet_window;
        tokio::spawn(async move {
            tokio::time::sleep(window).await;

            let album = {
                let mut pending = pending.lock().await;
                let settled = pending
                    .get(&key)
                    .is_some_and(|entry| entry.generation == generation);
                if settled {
                    pending.remove(&key)
                } else {
                    None
                }
            };

            if let Some(mut album) = album {
                album.messages.sort_by_key(|m| m.id);
                debug!(
                    "Album {} in {} settled with {} item(s)",
                    key.group_id,
                    key.chat_id,
                    album.messages.len()
                );
                if out.send(SourceEvent::Album(album.messages)).await.is_err() {
                    warn!("Event channel closed, dropping album {}", key.group_id);
                }
            }
        });
    }
}
