//! Change notification for observers of the entry store

use crate::store::EntryStore;
use std::fmt;
use std::rc::Rc;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Added,
    Removed,
    Modified,
    /// A single logical change that added, removed or modified different entries
    Mixed,
}

impl ChangeKind {
    pub fn as_str(&self) -> &str {
        match self {
            ChangeKind::Added => "added",
            ChangeKind::Removed => "removed",
            ChangeKind::Modified => "modified",
            ChangeKind::Mixed => "mixed",
        }
    }

    fn merge(self, other: Self) -> Self {
        if self == other {
            self
        } else {
            ChangeKind::Mixed
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One committed mutation: what kind of change and which entries it touched
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub uuids: Vec<Uuid>,
}

impl ChangeEvent {
    pub fn new(kind: ChangeKind, uuids: Vec<Uuid>) -> Self {
        let mut event = Self {
            kind,
            uuids: Vec::with_capacity(uuids.len()),
        };
        event.push_uuids(uuids);
        event
    }

    pub fn single(kind: ChangeKind, uuid: Uuid) -> Self {
        Self {
            kind,
            uuids: vec![uuid],
        }
    }

    /// Fold another event into this one, keeping first-seen UUID order.
    /// An event that touched no entries does not affect the kind.
    pub fn merge(&mut self, other: ChangeEvent) {
        if other.uuids.is_empty() {
            return;
        }
        if self.uuids.is_empty() {
            *self = other;
            return;
        }
        self.kind = self.kind.merge(other.kind);
        self.push_uuids(other.uuids);
    }

    fn push_uuids(&mut self, uuids: Vec<Uuid>) {
        for uuid in uuids {
            if !self.uuids.contains(&uuid) {
                self.uuids.push(uuid);
            }
        }
    }
}

/// Something that wants to hear about committed changes.
///
/// Observers get a read-only view of the store so they can re-read whatever
/// they display.
pub trait ChangeObserver {
    fn on_change(&self, store: &EntryStore, event: &ChangeEvent);
}

impl<F> ChangeObserver for F
where
    F: Fn(&EntryStore, &ChangeEvent),
{
    fn on_change(&self, store: &EntryStore, event: &ChangeEvent) {
        self(store, event)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

/// Registry of observers, with support for suspending delivery
#[derive(Default)]
pub struct Notifier {
    observers: Vec<(ObserverId, Rc<dyn ChangeObserver>)>,
    next_id: u64,
    suspended: usize,
    pending: Option<ChangeEvent>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, observer: Rc<dyn ChangeObserver>) -> ObserverId {
        let id = ObserverId(self.next_id);
        self.next_id += 1;
        self.observers.push((id, observer));
        id
    }

    /// Returns whether the observer was registered
    pub fn unsubscribe(&mut self, id: ObserverId) -> bool {
        let before = self.observers.len();
        self.observers.retain(|(existing, _)| *existing != id);
        self.observers.len() != before
    }

    /// Hold back events until the matching `resume`. Calls nest.
    pub fn suspend(&mut self) {
        self.suspended += 1;
    }

    /// Undo one `suspend`. When the outermost suspension ends, everything
    /// collected meanwhile goes out as one merged event.
    pub fn resume(&mut self, store: &EntryStore) {
        if self.suspended == 0 {
            return;
        }
        self.suspended -= 1;
        if self.suspended == 0 {
            if let Some(event) = self.pending.take() {
                self.deliver(store, &event);
            }
        }
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended > 0
    }

    /// Deliver an event now, or queue it while suspended
    pub fn publish(&mut self, store: &EntryStore, event: ChangeEvent) {
        if self.suspended > 0 {
            match self.pending.as_mut() {
                Some(pending) => pending.merge(event),
                None => self.pending = Some(event),
            }
            return;
        }
        self.deliver(store, &event);
    }

    fn deliver(&self, store: &EntryStore, event: &ChangeEvent) {
        debug!(
            kind = %event.kind,
            entries = event.uuids.len(),
            observers = self.observers.len(),
            "publishing change"
        );
        for (_, observer) in &self.observers {
            observer.on_change(store, event);
        }
    }
}
