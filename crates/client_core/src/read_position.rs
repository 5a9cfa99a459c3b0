use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, PoisonError},
};

use async_trait::async_trait;
use shared::domain::{ChatId, ReadPosition};
use storage::Storage;
use tracing::debug;

use crate::error::SyncError;

/// Durable surface for read markers.
#[async_trait]
pub trait ReadPositionPersistence: Send + Sync {
    async fn save_read_position(&self, position: &ReadPosition) -> Result<(), SyncError>;
    async fn load_read_position(&self, chat_id: &ChatId) -> Result<Option<ReadPosition>, SyncError>;
}

#[async_trait]
impl ReadPositionPersistence for Storage {
    async fn save_read_position(&self, position: &ReadPosition) -> Result<(), SyncError> {
        Storage::save_read_position(self, position).await?;
        Ok(())
    }

    async fn load_read_position(&self, chat_id: &ChatId) -> Result<Option<ReadPosition>, SyncError> {
        Ok(Storage::load_read_position(self, chat_id).await?)
    }
}

/// Process-local persistence, for tests and ephemeral sessions.
#[derive(Default)]
pub struct InMemoryReadPositions {
    positions: Mutex<HashMap<ChatId, ReadPosition>>,
}

impl InMemoryReadPositions {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ReadPositionPersistence for InMemoryReadPositions {
    async fn save_read_position(&self, position: &ReadPosition) -> Result<(), SyncError> {
        let mut positions = self.positions.lock().unwrap_or_else(PoisonError::into_inner);
        let advances = positions
            .get(&position.chat_id)
            .map_or(true, |current| position.is_after(current));
        if advances {
            positions.insert(position.chat_id.clone(), position.clone());
        }
        Ok(())
    }

    async fn load_read_position(&self, chat_id: &ChatId) -> Result<Option<ReadPosition>, SyncError> {
        Ok(self
            .positions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(chat_id)
            .cloned())
    }
}

/// Monotonic last-read markers, cached in memory and flushed on demand.
pub struct ReadPositionTracker<P: ?Sized> {
    persistence: Arc<P>,
    cache: HashMap<ChatId, ReadPosition>,
    dirty: HashSet<ChatId>,
}

impl<P: ReadPositionPersistence + ?Sized> ReadPositionTracker<P> {
    pub fn new(persistence: Arc<P>) -> Self {
        Self {
            persistence,
            cache: HashMap::new(),
            dirty: HashSet::new(),
        }
    }

    pub async fn load(&mut self, chat_id: &ChatId) -> Result<Option<ReadPosition>, SyncError> {
        if let Some(position) = self.cache.get(chat_id) {
            return Ok(Some(position.clone()));
        }
        let loaded = self.persistence.load_read_position(chat_id).await?;
        if let Some(position) = &loaded {
            self.cache.insert(chat_id.clone(), position.clone());
        }
        Ok(loaded)
    }

    pub fn current(&self, chat_id: &ChatId) -> Option<&ReadPosition> {
        self.cache.get(chat_id)
    }

    /// Moves the marker forward. Returns `false` and leaves it untouched if
    /// `position` is not after the current marker.
    pub fn mark_read(&mut self, position: ReadPosition) -> bool {
        if let Some(current) = self.cache.get(&position.chat_id) {
            if !position.is_after(current) {
                debug!(
                    chat_id = %position.chat_id,
                    message_id = %position.last_read_message_id,
                    "read position: ignoring backward move"
                );
                return false;
            }
        }
        self.dirty.insert(position.chat_id.clone());
        self.cache.insert(position.chat_id.clone(), position);
        true
    }

    pub async fn flush(&mut self) -> Result<usize, SyncError> {
        let mut flushed = 0;
        let dirty: Vec<ChatId> = self.dirty.iter().cloned().collect();
        for chat_id in dirty {
            if let Some(position) = self.cache.get(&chat_id) {
                self.persistence.save_read_position(position).await?;
                flushed += 1;
            }
            self.dirty.remove(&chat_id);
        }
        Ok(flushed)
    }
}

#[cfg(test)]
#[path = "tests/read_position_tests.rs"]
mod tests;
