//! Command execution with undo/redo
//!
//! The engine owns the entry store and is the only way to change it once a
//! database is open. History is a list of applied commands with a cursor:
//! everything before the cursor can be undone, everything after it redone.
//! Each successful `execute`, `undo` or `redo` publishes exactly one change
//! event; failures publish nothing and leave store and history untouched.

use crate::command::Command;
use crate::error::{Result, VaultError};
use crate::notify::{ChangeEvent, ChangeKind, ChangeObserver, Notifier, ObserverId};
use crate::store::EntryStore;
use std::rc::Rc;
use tracing::debug;

/// Engine settings supplied by the caller
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineConfig {
    /// Oldest history entries are dropped beyond this many. `None` keeps all.
    pub max_history: Option<usize>,
}

pub struct CommandEngine {
    store: EntryStore,
    history: Vec<Command>,
    cursor: usize,
    /// Cursor position matching the last save, if still reachable
    saved: Option<usize>,
    notifier: Notifier,
    config: EngineConfig,
}

impl CommandEngine {
    /// Take ownership of a freshly loaded (or empty) store
    pub fn new(store: EntryStore, config: EngineConfig) -> Self {
        Self {
            store,
            history: Vec::new(),
            cursor: 0,
            saved: Some(0),
            notifier: Notifier::new(),
            config,
        }
    }

    /// Read-only view of the records
    pub fn store(&self) -> &EntryStore {
        &self.store
    }

    /// Apply a command and record it for undo
    pub fn execute(&mut self, mut command: Command) -> Result<()> {
        let event = command.apply(&mut self.store)?;
        debug!(command = command.description(), "executed command");

        self.history.truncate(self.cursor);
        if self.saved.is_some_and(|saved| saved > self.cursor) {
            self.saved = None;
        }
        self.history.push(command);
        self.cursor += 1;
        self.enforce_history_limit();

        self.notifier.publish(&self.store, event);
        Ok(())
    }

    /// Reverse the most recent command
    pub fn undo(&mut self) -> Result<()> {
        if self.cursor == 0 {
            return Err(VaultError::NothingToUndo);
        }
        let command = &mut self.history[self.cursor - 1];
        let event = command.revert(&mut self.store)?;
        debug!(command = command.description(), "undid command");

        self.cursor -= 1;
        self.notifier.publish(&self.store, event);
        Ok(())
    }

    /// Re-apply the most recently undone command
    pub fn redo(&mut self) -> Result<()> {
        if self.cursor == self.history.len() {
            return Err(VaultError::NothingToRedo);
        }
        let command = &mut self.history[self.cursor];
        let event = command.apply(&mut self.store)?;
        debug!(command = command.description(), "redid command");

        self.cursor += 1;
        self.notifier.publish(&self.store, event);
        Ok(())
    }

    pub fn can_undo(&self) -> bool {
        self.cursor > 0
    }

    pub fn can_redo(&self) -> bool {
        self.cursor < self.history.len()
    }

    pub fn undo_description(&self) -> Option<&str> {
        self.cursor
            .checked_sub(1)
            .map(|index| self.history[index].description())
    }

    pub fn redo_description(&self) -> Option<&str> {
        self.history.get(self.cursor).map(Command::description)
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// Record that the current state has been persisted
    pub fn mark_saved(&mut self) {
        self.saved = Some(self.cursor);
    }

    /// Whether the store differs from what was last saved
    pub fn is_changed(&self) -> bool {
        self.saved != Some(self.cursor)
    }

    /// Drop every record and all history
    pub fn clear(&mut self) {
        let removed = self.store.clear();
        self.history.clear();
        self.cursor = 0;
        self.saved = None;
        debug!(entries = removed.len(), "cleared store");
        self.notifier
            .publish(&self.store, ChangeEvent::new(ChangeKind::Removed, removed));
    }

    /// Swap in a newly loaded store, discarding history. Observers see every
    /// loaded entry as added.
    pub(crate) fn load(&mut self, store: EntryStore) {
        self.store = store;
        self.history.clear();
        self.cursor = 0;
        self.saved = Some(0);
        let loaded: Vec<_> = self.store.iter_all().map(|entry| entry.uuid()).collect();
        self.notifier
            .publish(&self.store, ChangeEvent::new(ChangeKind::Added, loaded));
    }

    pub fn subscribe(&mut self, observer: Rc<dyn ChangeObserver>) -> ObserverId {
        self.notifier.subscribe(observer)
    }

    pub fn unsubscribe(&mut self, id: ObserverId) -> bool {
        self.notifier.unsubscribe(id)
    }

    /// Batch notifications until the matching `resume_notifications`
    pub fn suspend_notifications(&mut self) {
        self.notifier.suspend();
    }

    pub fn resume_notifications(&mut self) {
        self.notifier.resume(&self.store);
    }

    fn enforce_history_limit(&mut self) {
        let Some(max) = self.config.max_history else {
            return;
        };
        if self.history.len() <= max {
            return;
        }
        let excess = self.history.len() - max;
        self.history.drain(..excess);
        self.cursor -= excess;
        self.saved = self.saved.and_then(|saved| saved.checked_sub(excess));
    }
}
