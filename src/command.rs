//! Invertible mutations of the entry store
//!
//! A `Command` describes one user-visible change together with everything
//! needed to reverse it. Commands keep their own copies of the data involved
//! (a delete holds the whole deleted entry) and never point into the live
//! store. They are built by the factory functions below, which validate
//! against the current store, and are run through the
//! [`CommandEngine`](crate::engine::CommandEngine).

use crate::error::{Result, VaultError};
use crate::model::{Entry, Field};
use crate::notify::{ChangeEvent, ChangeKind};
use crate::secure::SecureBuffer;
use crate::store::EntryStore;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct Command {
    description: String,
    action: Action,
}

#[derive(Debug, Clone)]
enum Action {
    Add {
        entry: Entry,
    },
    Delete {
        uuid: Uuid,
        /// Entry and display position as of the last removal
        removed: (usize, Entry),
    },
    Edit {
        uuid: Uuid,
        field: Field,
        old: SecureBuffer,
        new: SecureBuffer,
        stamps: Stamps,
    },
    SetExpiry {
        uuid: Uuid,
        old: Option<DateTime<Utc>>,
        new: Option<DateTime<Utc>>,
        stamps: Stamps,
    },
    Composite(Vec<Command>),
}

/// Modification times around an edit. The new time is fixed on first
/// application so that redo reproduces the same state.
#[derive(Debug, Clone, Default)]
struct Stamps {
    before: Option<DateTime<Utc>>,
    after: Option<DateTime<Utc>>,
}

impl Stamps {
    fn apply(&mut self, entry: &mut Entry) {
        self.before = Some(entry.modified);
        entry.modified = *self.after.get_or_insert_with(Utc::now);
    }

    fn revert(&self, entry: &mut Entry) {
        if let Some(before) = self.before {
            entry.modified = before;
        }
    }
}

impl Command {
    /// Add a new entry. Fails if the UUID or the (title, user, group)
    /// identity is already taken.
    pub fn add_entry(store: &EntryStore, entry: Entry) -> Result<Self> {
        if store.contains(&entry.uuid()) {
            return Err(VaultError::DuplicateId(entry.uuid()));
        }
        ensure_unique(store, entry.identity(), &[])?;
        Ok(Self {
            description: format!("Add entry '{}'", entry.title()),
            action: Action::Add { entry },
        })
    }

    /// Delete one entry
    pub fn delete_entry(store: &EntryStore, uuid: Uuid) -> Result<Self> {
        let entry = store.get(&uuid)?.clone();
        let position = store.position(&uuid).unwrap_or(store.len());
        Ok(Self {
            description: format!("Delete entry '{}'", entry.title()),
            action: Action::Delete {
                uuid,
                removed: (position, entry),
            },
        })
    }

    /// Delete several entries as one undoable step
    pub fn delete_many(store: &EntryStore, uuids: &[Uuid]) -> Result<Self> {
        let mut seen = HashSet::new();
        let commands = uuids
            .iter()
            .filter(|uuid| seen.insert(**uuid))
            .map(|uuid| Self::delete_entry(store, *uuid))
            .collect::<Result<Vec<_>>>()?;
        let description = match commands.len() {
            1 => commands[0].description.clone(),
            n => format!("Delete {} entries", n),
        };
        Ok(Self::composite(description, commands))
    }

    /// Replace one field of an entry
    pub fn edit_field(
        store: &EntryStore,
        uuid: Uuid,
        field: Field,
        value: SecureBuffer,
    ) -> Result<Self> {
        let entry = store.get(&uuid)?;
        let description = if field.is_secret() {
            format!("Edit {} of '{}'", field, entry.title())
        } else {
            format!("Edit {} of '{}' to '{}'", field, entry.title(), value.as_str()?)
        };
        Self::edit(store, entry, field, value, description)
    }

    /// Change the title of an entry
    pub fn rename(store: &EntryStore, uuid: Uuid, title: &str) -> Result<Self> {
        let entry = store.get(&uuid)?;
        let description = format!("Rename '{}' to '{}'", entry.title(), title);
        Self::edit(store, entry, Field::Title, SecureBuffer::from(title), description)
    }

    /// Set or clear the expiry time of an entry
    pub fn set_expiry(
        store: &EntryStore,
        uuid: Uuid,
        expires: Option<DateTime<Utc>>,
    ) -> Result<Self> {
        let entry = store.get(&uuid)?;
        let description = match expires {
            Some(_) => format!("Set expiry of '{}'", entry.title()),
            None => format!("Clear expiry of '{}'", entry.title()),
        };
        Ok(Self {
            description,
            action: Action::SetExpiry {
                uuid,
                old: entry.expires(),
                new: expires,
                stamps: Stamps::default(),
            },
        })
    }

    /// Move entries into `group`. Entries already there are left alone.
    pub fn move_group(store: &EntryStore, uuids: &[Uuid], group: &str) -> Result<Self> {
        let mut seen = HashSet::new();
        let mut claimed: Vec<(String, String)> = Vec::new();
        let mut commands = Vec::new();

        for uuid in uuids.iter().filter(|uuid| seen.insert(**uuid)) {
            let entry = store.get(uuid)?;
            if entry.group() == group {
                continue;
            }
            let pair = (entry.title().to_string(), entry.user().to_string());
            if claimed.contains(&pair) {
                return Err(VaultError::DuplicateEntry {
                    title: pair.0,
                    user: pair.1,
                    group: group.to_string(),
                });
            }
            ensure_unique(store, (entry.title(), entry.user(), group), &[*uuid])?;
            claimed.push(pair);
            commands.push(Self {
                description: format!("Move '{}' to '{}'", entry.title(), group),
                action: Action::Edit {
                    uuid: *uuid,
                    field: Field::Group,
                    old: SecureBuffer::from(entry.group()),
                    new: SecureBuffer::from(group),
                    stamps: Stamps::default(),
                },
            });
        }

        let description = match commands.len() {
            1 => commands[0].description.clone(),
            n => format!("Move {} entries to '{}'", n, group),
        };
        Ok(Self::composite(description, commands))
    }

    /// Bundle commands into a single history step. Applied in order,
    /// reverted in reverse order.
    pub fn composite(description: impl Into<String>, commands: Vec<Command>) -> Self {
        Self {
            description: description.into(),
            action: Action::Composite(commands),
        }
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Number of primitive changes this command performs
    pub fn len(&self) -> usize {
        match &self.action {
            Action::Composite(commands) => commands.iter().map(Command::len).sum(),
            _ => 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn edit(
        store: &EntryStore,
        entry: &Entry,
        field: Field,
        value: SecureBuffer,
        description: String,
    ) -> Result<Self> {
        if !field.is_secret() {
            value.as_str()?;
        }
        ensure_unique_edit(store, &entry.uuid(), field, &value)?;
        Ok(Self {
            description,
            action: Action::Edit {
                uuid: entry.uuid(),
                field,
                old: SecureBuffer::from_slice(entry.field(field))?,
                new: value,
                stamps: Stamps::default(),
            },
        })
    }

    /// Run the forward transition
    pub(crate) fn apply(&mut self, store: &mut EntryStore) -> Result<ChangeEvent> {
        match &mut self.action {
            Action::Add { entry } => {
                let uuid = entry.uuid();
                ensure_unique(store, entry.identity(), &[])?;
                store.insert(entry.clone())?;
                Ok(ChangeEvent::single(ChangeKind::Added, uuid))
            }
            Action::Delete { uuid, removed } => {
                *removed = store.remove(uuid)?;
                Ok(ChangeEvent::single(ChangeKind::Removed, *uuid))
            }
            Action::Edit {
                uuid,
                field,
                old,
                new,
                stamps,
            } => {
                ensure_unique_edit(store, uuid, *field, new)?;
                let entry = store.get_mut(uuid)?;
                *old = entry.replace_field(*field, new.clone())?;
                stamps.apply(entry);
                Ok(ChangeEvent::single(ChangeKind::Modified, *uuid))
            }
            Action::SetExpiry {
                uuid,
                old,
                new,
                stamps,
            } => {
                let entry = store.get_mut(uuid)?;
                *old = std::mem::replace(&mut entry.expires, *new);
                stamps.apply(entry);
                Ok(ChangeEvent::single(ChangeKind::Modified, *uuid))
            }
            Action::Composite(commands) => apply_all(commands, store),
        }
    }

    /// Run the inverse transition
    pub(crate) fn revert(&mut self, store: &mut EntryStore) -> Result<ChangeEvent> {
        match &mut self.action {
            Action::Add { entry } => {
                let uuid = entry.uuid();
                store.remove(&uuid)?;
                Ok(ChangeEvent::single(ChangeKind::Removed, uuid))
            }
            Action::Delete { uuid, removed } => {
                let (position, entry) = removed;
                store.insert_at(*position, entry.clone())?;
                Ok(ChangeEvent::single(ChangeKind::Added, *uuid))
            }
            Action::Edit {
                uuid,
                field,
                old,
                stamps,
                ..
            } => {
                let entry = store.get_mut(uuid)?;
                entry.replace_field(*field, old.clone())?;
                stamps.revert(entry);
                Ok(ChangeEvent::single(ChangeKind::Modified, *uuid))
            }
            Action::SetExpiry {
                uuid, old, stamps, ..
            } => {
                let entry = store.get_mut(uuid)?;
                entry.expires = *old;
                stamps.revert(entry);
                Ok(ChangeEvent::single(ChangeKind::Modified, *uuid))
            }
            Action::Composite(commands) => revert_all(commands, store),
        }
    }
}

/// Apply sub-commands in order. On failure the ones already applied are
/// reverted, leaving the store as it was.
fn apply_all(commands: &mut [Command], store: &mut EntryStore) -> Result<ChangeEvent> {
    let mut event: Option<ChangeEvent> = None;
    for index in 0..commands.len() {
        match commands[index].apply(store) {
            Ok(next) => merge_into(&mut event, next),
            Err(err) => {
                for done in commands[..index].iter_mut().rev() {
                    if let Err(rollback) = done.revert(store) {
                        warn!(error = %rollback, "rollback of partially applied command failed");
                    }
                }
                return Err(err);
            }
        }
    }
    Ok(event.unwrap_or_else(|| ChangeEvent::new(ChangeKind::Modified, Vec::new())))
}

/// Revert sub-commands in reverse order, re-applying on failure
fn revert_all(commands: &mut [Command], store: &mut EntryStore) -> Result<ChangeEvent> {
    let mut event: Option<ChangeEvent> = None;
    for index in (0..commands.len()).rev() {
        match commands[index].revert(store) {
            Ok(next) => merge_into(&mut event, next),
            Err(err) => {
                for done in commands[index + 1..].iter_mut() {
                    if let Err(rollback) = done.apply(store) {
                        warn!(error = %rollback, "rollback of partially reverted command failed");
                    }
                }
                return Err(err);
            }
        }
    }
    Ok(event.unwrap_or_else(|| ChangeEvent::new(ChangeKind::Modified, Vec::new())))
}

fn merge_into(acc: &mut Option<ChangeEvent>, next: ChangeEvent) {
    match acc {
        Some(event) => event.merge(next),
        None => *acc = Some(next),
    }
}

/// Fail if another entry (outside `except`) already has this identity
fn ensure_unique(store: &EntryStore, identity: (&str, &str, &str), except: &[Uuid]) -> Result<()> {
    let (title, user, group) = identity;
    let clash = store
        .find_by(|entry| entry.identity() == identity && !except.contains(&entry.uuid()))
        .next()
        .is_some();
    if clash {
        return Err(VaultError::DuplicateEntry {
            title: title.to_string(),
            user: user.to_string(),
            group: group.to_string(),
        });
    }
    Ok(())
}

/// Fail if setting `field` of `uuid` to `value` would give it the identity
/// of another entry
fn ensure_unique_edit(
    store: &EntryStore,
    uuid: &Uuid,
    field: Field,
    value: &SecureBuffer,
) -> Result<()> {
    if !field.is_identity() {
        return Ok(());
    }
    let (mut title, mut user, mut group) = store.get(uuid)?.identity();
    let text = value.as_str()?;
    match field {
        Field::Title => title = text,
        Field::User => user = text,
        _ => group = text,
    }
    ensure_unique(store, (title, user, group), &[*uuid])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(title: &str, user: &str) -> Entry {
        Entry::new(title, user, SecureBuffer::from("pw"))
    }

    fn store_with(entries: &[Entry]) -> EntryStore {
        let mut store = EntryStore::new();
        for e in entries {
            store.insert(e.clone()).unwrap();
        }
        store
    }

    #[test]
    fn test_add_apply_and_revert() {
        let mut store = EntryStore::new();
        let e = entry("Bank", "alice");
        let mut cmd = Command::add_entry(&store, e.clone()).unwrap();
        assert_eq!(cmd.description(), "Add entry 'Bank'");

        let event = cmd.apply(&mut store).unwrap();
        assert_eq!(event, ChangeEvent::single(ChangeKind::Added, e.uuid()));
        assert_eq!(store.get(&e.uuid()).unwrap(), &e);

        let event = cmd.revert(&mut store).unwrap();
        assert_eq!(event.kind, ChangeKind::Removed);
        assert!(store.is_empty());
    }

    #[test]
    fn test_add_rejects_duplicate_identity() {
        let existing = entry("Bank", "alice");
        let store = store_with(&[existing.clone()]);

        let clash = Command::add_entry(&store, entry("Bank", "alice"));
        assert!(matches!(clash, Err(VaultError::DuplicateEntry { .. })));

        // Same title and user in another group is fine
        assert!(Command::add_entry(&store, entry("Bank", "alice").with_group("Old")).is_ok());
        assert!(matches!(
            Command::add_entry(&store, existing.clone()),
            Err(VaultError::DuplicateId(_))
        ));
    }

    #[test]
    fn test_delete_restores_position() {
        let (a, b, c) = (entry("A", "u"), entry("B", "u"), entry("C", "u"));
        let mut store = store_with(&[a.clone(), b.clone(), c.clone()]);
        let before = store.clone();

        let mut cmd = Command::delete_entry(&store, b.uuid()).unwrap();
        cmd.apply(&mut store).unwrap();
        assert!(!store.contains(&b.uuid()));

        cmd.revert(&mut store).unwrap();
        assert_eq!(store, before);
    }

    #[test]
    fn test_delete_many_is_atomic() {
        let entries: Vec<Entry> = ["A", "B", "C", "D"].iter().map(|t| entry(t, "u")).collect();
        let mut store = store_with(&entries);
        let before = store.clone();

        let ids = [entries[0].uuid(), entries[2].uuid(), entries[0].uuid()];
        let mut cmd = Command::delete_many(&store, &ids).unwrap();
        assert_eq!(cmd.len(), 2);
        assert_eq!(cmd.description(), "Delete 2 entries");

        let event = cmd.apply(&mut store).unwrap();
        assert_eq!(event.kind, ChangeKind::Removed);
        assert_eq!(event.uuids, vec![entries[0].uuid(), entries[2].uuid()]);
        assert_eq!(store.len(), 2);

        cmd.revert(&mut store).unwrap();
        assert_eq!(store, before);
    }

    #[test]
    fn test_delete_many_unknown_uuid() {
        let store = store_with(&[entry("A", "u")]);
        let missing = Uuid::new_v4();
        assert_eq!(
            Command::delete_many(&store, &[missing]).err(),
            Some(VaultError::NotFound(missing))
        );
    }

    #[test]
    fn test_composite_rolls_back_on_failure() {
        let (a, b) = (entry("A", "u"), entry("B", "u"));
        let mut store = store_with(&[a.clone(), b.clone()]);
        let before = store.clone();

        let mut cmd = Command::composite(
            "broken",
            vec![
                Command::delete_entry(&store, a.uuid()).unwrap(),
                Command::delete_entry(&store, b.uuid()).unwrap(),
                Command::delete_entry(&store, a.uuid()).unwrap(),
            ],
        );
        assert_eq!(cmd.apply(&mut store).err(), Some(VaultError::NotFound(a.uuid())));
        assert_eq!(store, before);
    }

    #[test]
    fn test_edit_field_and_timestamps() {
        let e = entry("Bank", "alice");
        let mut store = store_with(&[e.clone()]);

        let mut cmd =
            Command::edit_field(&store, e.uuid(), Field::Password, SecureBuffer::from("new"))
                .unwrap();
        assert_eq!(cmd.description(), "Edit password of 'Bank'");

        cmd.apply(&mut store).unwrap();
        let edited = store.get(&e.uuid()).unwrap().clone();
        assert_eq!(edited.password().as_bytes(), b"new");
        assert!(edited.modified() >= e.modified());

        cmd.revert(&mut store).unwrap();
        assert_eq!(store.get(&e.uuid()).unwrap(), &e);

        // Redo lands on exactly the same state as the first application
        cmd.apply(&mut store).unwrap();
        assert_eq!(store.get(&e.uuid()).unwrap(), &edited);
    }

    #[test]
    fn test_rename_checks_identity() {
        let (a, b) = (entry("A", "u"), entry("B", "u"));
        let store = store_with(&[a.clone(), b.clone()]);

        assert!(matches!(
            Command::rename(&store, b.uuid(), "A"),
            Err(VaultError::DuplicateEntry { .. })
        ));
        // Renaming to its own title is not a clash
        assert!(Command::rename(&store, a.uuid(), "A").is_ok());
        assert_eq!(
            Command::rename(&store, b.uuid(), "C").unwrap().description(),
            "Rename 'B' to 'C'"
        );
    }

    #[test]
    fn test_edit_text_field_requires_utf8() {
        let e = entry("A", "u");
        let store = store_with(&[e.clone()]);
        assert!(matches!(
            Command::edit_field(&store, e.uuid(), Field::Url, SecureBuffer::from(vec![0xc3])),
            Err(VaultError::Format(_))
        ));
    }

    #[test]
    fn test_set_expiry() {
        let e = entry("A", "u");
        let mut store = store_with(&[e.clone()]);
        let when = Utc::now();

        let mut cmd = Command::set_expiry(&store, e.uuid(), Some(when)).unwrap();
        cmd.apply(&mut store).unwrap();
        assert_eq!(store.get(&e.uuid()).unwrap().expires(), Some(when));

        cmd.revert(&mut store).unwrap();
        assert_eq!(store.get(&e.uuid()).unwrap(), &e);
    }

    #[test]
    fn test_move_group() {
        let a = entry("A", "u").with_group("Old");
        let b = entry("B", "u");
        let c = entry("C", "u").with_group("Finance");
        let mut store = store_with(&[a.clone(), b.clone(), c.clone()]);
        let before = store.clone();

        let mut cmd =
            Command::move_group(&store, &[a.uuid(), b.uuid(), c.uuid()], "Finance").unwrap();
        // `c` is already there
        assert_eq!(cmd.len(), 2);
        assert_eq!(cmd.description(), "Move 2 entries to 'Finance'");

        let event = cmd.apply(&mut store).unwrap();
        assert_eq!(event.kind, ChangeKind::Modified);
        assert_eq!(store.find_by(|e| e.group() == "Finance").count(), 3);

        cmd.revert(&mut store).unwrap();
        assert_eq!(store, before);
    }

    #[test]
    fn test_move_group_detects_collisions() {
        let a = entry("Mail", "u").with_group("Home");
        let b = entry("Mail", "u").with_group("Work");
        let store = store_with(&[a.clone(), b.clone()]);

        assert!(matches!(
            Command::move_group(&store, &[a.uuid(), b.uuid()], "Shared"),
            Err(VaultError::DuplicateEntry { .. })
        ));
        assert!(matches!(
            Command::move_group(&store, &[a.uuid()], "Work"),
            Err(VaultError::DuplicateEntry { .. })
        ));
    }
}
