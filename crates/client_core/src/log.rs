use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::types::{EntryKey, LogEntry};

/// Canonical per-chat sequence, unique by key and sorted by
/// `(send_time, key)`.
#[derive(Debug, Default, Clone)]
pub struct OrderedLog {
    entries: Vec<LogEntry>,
    times: HashMap<EntryKey, DateTime<Utc>>,
}

impl OrderedLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn contains(&self, key: &EntryKey) -> bool {
        self.times.contains_key(key)
    }

    pub fn position(&self, key: &EntryKey) -> Option<usize> {
        let time = *self.times.get(key)?;
        self.entries
            .binary_search_by(|entry| entry.order_key().cmp(&(time, key)))
            .ok()
    }

    pub fn get(&self, key: &EntryKey) -> Option<&LogEntry> {
        self.position(key).map(|index| &self.entries[index])
    }

    /// Inserts at the ordered slot. Returns `None` if the key is already present.
    pub fn insert(&mut self, entry: LogEntry) -> Option<usize> {
        if self.times.contains_key(&entry.key) {
            return None;
        }
        let index = self
            .entries
            .partition_point(|existing| existing.order_key() < entry.order_key());
        self.times
            .insert(entry.key.clone(), entry.message.send_time);
        self.entries.insert(index, entry);
        Some(index)
    }

    pub fn remove(&mut self, key: &EntryKey) -> Option<(usize, LogEntry)> {
        let index = self.position(key)?;
        self.times.remove(key);
        Some((index, self.entries.remove(index)))
    }

    /// Mutates an entry in place. The closure must not change the entry's
    /// key or send time.
    pub fn update(&mut self, key: &EntryKey, apply: impl FnOnce(&mut LogEntry)) -> Option<usize> {
        let index = self.position(key)?;
        let entry = &mut self.entries[index];
        let before = entry.message.send_time;
        apply(entry);
        assert!(
            entry.key == *key && entry.message.send_time == before,
            "log entry update changed its ordering key"
        );
        Some(index)
    }
}

#[cfg(test)]
#[path = "tests/log_tests.rs"]
mod tests;
