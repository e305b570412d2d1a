//! In-memory entry store
//!
//! The store owns every record and keeps two views of them: a UUID map and
//! the display order. Each mutating method updates both before returning, so
//! no caller can observe one view without the other. The store does no
//! cryptography and no I/O.

use crate::error::{Result, VaultError};
use crate::model::Entry;
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntryStore {
    entries: HashMap<Uuid, Entry>,
    order: Vec<Uuid>,
}

impl EntryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn contains(&self, uuid: &Uuid) -> bool {
        self.entries.contains_key(uuid)
    }

    /// Append an entry to the end of the display order
    pub fn insert(&mut self, entry: Entry) -> Result<()> {
        let index = self.order.len();
        self.insert_at(index, entry)
    }

    /// Insert an entry at a display position (clamped to the end)
    pub fn insert_at(&mut self, index: usize, entry: Entry) -> Result<()> {
        let uuid = entry.uuid();
        if self.entries.contains_key(&uuid) {
            return Err(VaultError::DuplicateId(uuid));
        }
        let index = index.min(self.order.len());
        self.entries.insert(uuid, entry);
        self.order.insert(index, uuid);
        Ok(())
    }

    /// Remove an entry, returning it with its former display position
    pub fn remove(&mut self, uuid: &Uuid) -> Result<(usize, Entry)> {
        let entry = self
            .entries
            .remove(uuid)
            .ok_or(VaultError::NotFound(*uuid))?;
        // Both views are kept in step, so the position always exists
        let index = self.position(uuid).unwrap_or(self.order.len());
        if index < self.order.len() {
            self.order.remove(index);
        }
        Ok((index, entry))
    }

    pub fn get(&self, uuid: &Uuid) -> Result<&Entry> {
        self.entries.get(uuid).ok_or(VaultError::NotFound(*uuid))
    }

    pub(crate) fn get_mut(&mut self, uuid: &Uuid) -> Result<&mut Entry> {
        self.entries
            .get_mut(uuid)
            .ok_or(VaultError::NotFound(*uuid))
    }

    /// Display position of an entry
    pub fn position(&self, uuid: &Uuid) -> Option<usize> {
        self.order.iter().position(|id| id == uuid)
    }

    /// All entries in display order
    pub fn iter_all(&self) -> impl Iterator<Item = &Entry> + '_ {
        self.order.iter().filter_map(move |id| self.entries.get(id))
    }

    /// Lazily yield entries matching `predicate`, in display order.
    ///
    /// The iterator borrows the store, so every query sees current state.
    pub fn find_by<'a, P>(&'a self, predicate: P) -> impl Iterator<Item = &'a Entry> + 'a
    where
        P: Fn(&Entry) -> bool + 'a,
    {
        self.iter_all().filter(move |entry| predicate(entry))
    }

    /// Search entries by query; an empty query returns everything
    pub fn search<'a>(&'a self, query: &'a str) -> impl Iterator<Item = &'a Entry> + 'a {
        self.find_by(move |entry| query.is_empty() || entry.matches(query))
    }

    /// Remove every entry; secret fields are wiped as they drop
    pub fn clear(&mut self) -> Vec<Uuid> {
        self.entries.clear();
        std::mem::take(&mut self.order)
    }

    /// Check that both views agree
    pub fn indices_consistent(&self) -> bool {
        self.order.len() == self.entries.len()
            && self.order.iter().all(|id| self.entries.contains_key(id))
    }
}
