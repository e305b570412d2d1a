//! Credential records

use crate::secure::SecureBuffer;
use chrono::{DateTime, Utc};
use std::fmt;
use uuid::Uuid;

/// Separator between levels of a group path
pub const GROUP_SEPARATOR: char = '.';

/// Editable fields of an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    Title,
    User,
    Password,
    Url,
    Notes,
    Group,
}

impl Field {
    pub fn as_str(&self) -> &str {
        match self {
            Field::Title => "title",
            Field::User => "user",
            Field::Password => "password",
            Field::Url => "url",
            Field::Notes => "notes",
            Field::Group => "group",
        }
    }

    pub fn parse_field(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "title" => Some(Field::Title),
            "user" | "username" => Some(Field::User),
            "password" => Some(Field::Password),
            "url" => Some(Field::Url),
            "notes" => Some(Field::Notes),
            "group" => Some(Field::Group),
            _ => None,
        }
    }

    /// Whether values of this field carry secret material
    pub fn is_secret(&self) -> bool {
        matches!(self, Field::Password | Field::Notes)
    }

    /// Whether changing this field can break (title, user, group) uniqueness
    pub fn is_identity(&self) -> bool {
        matches!(self, Field::Title | Field::User | Field::Group)
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A field type this version does not understand, kept verbatim so that
/// saving does not drop data written by a newer version
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownField {
    pub kind: u8,
    pub value: SecureBuffer,
}

/// A single credential record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub(crate) uuid: Uuid,
    pub(crate) title: String,
    pub(crate) user: String,
    pub(crate) password: SecureBuffer,
    pub(crate) url: String,
    pub(crate) notes: SecureBuffer,
    pub(crate) group: String,
    pub(crate) created: DateTime<Utc>,
    pub(crate) modified: DateTime<Utc>,
    pub(crate) expires: Option<DateTime<Utc>>,
    pub(crate) unknown: Vec<UnknownField>,
}

impl Entry {
    /// Create a new entry with a fresh UUID and timestamps
    pub fn new(title: &str, user: &str, password: SecureBuffer) -> Self {
        let now = Utc::now();
        Self {
            uuid: Uuid::new_v4(),
            title: title.to_string(),
            user: user.to_string(),
            password,
            url: String::new(),
            notes: SecureBuffer::new(),
            group: String::new(),
            created: now,
            modified: now,
            expires: None,
            unknown: Vec::new(),
        }
    }

    pub fn with_url(mut self, url: &str) -> Self {
        self.url = url.to_string();
        self
    }

    pub fn with_notes(mut self, notes: SecureBuffer) -> Self {
        self.notes = notes;
        self
    }

    pub fn with_group(mut self, group: &str) -> Self {
        self.group = group.to_string();
        self
    }

    pub fn with_expiry(mut self, expires: DateTime<Utc>) -> Self {
        self.expires = Some(expires);
        self
    }

    /// Blank record with a known UUID, filled in by the decoder
    pub(crate) fn empty(uuid: Uuid) -> Self {
        let epoch = DateTime::<Utc>::default();
        Self {
            uuid,
            title: String::new(),
            user: String::new(),
            password: SecureBuffer::new(),
            url: String::new(),
            notes: SecureBuffer::new(),
            group: String::new(),
            created: epoch,
            modified: epoch,
            expires: None,
            unknown: Vec::new(),
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn password(&self) -> &SecureBuffer {
        &self.password
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn notes(&self) -> &SecureBuffer {
        &self.notes
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn created(&self) -> DateTime<Utc> {
        self.created
    }

    pub fn modified(&self) -> DateTime<Utc> {
        self.modified
    }

    pub fn expires(&self) -> Option<DateTime<Utc>> {
        self.expires
    }

    pub fn unknown_fields(&self) -> &[UnknownField] {
        &self.unknown
    }

    /// Raw bytes of a field
    pub fn field(&self, field: Field) -> &[u8] {
        match field {
            Field::Title => self.title.as_bytes(),
            Field::User => self.user.as_bytes(),
            Field::Password => self.password.as_bytes(),
            Field::Url => self.url.as_bytes(),
            Field::Notes => self.notes.as_bytes(),
            Field::Group => self.group.as_bytes(),
        }
    }

    /// Replace a field, returning the previous value.
    ///
    /// Text fields must hold UTF-8; on error the entry is unchanged.
    pub(crate) fn replace_field(
        &mut self,
        field: Field,
        value: SecureBuffer,
    ) -> crate::error::Result<SecureBuffer> {
        let old = match field {
            Field::Password => std::mem::replace(&mut self.password, value),
            Field::Notes => std::mem::replace(&mut self.notes, value),
            Field::Title | Field::User | Field::Url | Field::Group => {
                let text = value.as_str()?.to_string();
                let slot = match field {
                    Field::Title => &mut self.title,
                    Field::User => &mut self.user,
                    Field::Url => &mut self.url,
                    _ => &mut self.group,
                };
                SecureBuffer::from(std::mem::replace(slot, text))
            }
        };
        Ok(old)
    }

    /// The (title, user, group) triple that should be unique per database
    pub fn identity(&self) -> (&str, &str, &str) {
        (&self.title, &self.user, &self.group)
    }

    /// Case-insensitive search over the non-secret fields
    pub fn matches(&self, query: &str) -> bool {
        let query = query.to_lowercase();

        let title_match = self.title.to_lowercase().contains(&query);
        let user_match = self.user.to_lowercase().contains(&query);
        let url_match = self.url.to_lowercase().contains(&query);
        let group_match = self.group.to_lowercase().contains(&query);

        title_match | user_match | url_match | group_match
    }

    /// Whether the entry sits in `group` or one of its subgroups
    pub fn in_group(&self, group: &str) -> bool {
        if group.is_empty() {
            return true;
        }
        match self.group.strip_prefix(group) {
            Some(rest) => rest.is_empty() || rest.starts_with(GROUP_SEPARATOR),
            None => false,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires.map(|at| at <= now).unwrap_or(false)
    }
}
