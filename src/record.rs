use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Record identifier. Canonically a UUID string; integer ids survive from the
/// pre-sync schema where categories were auto-increment keyed. A `Legacy` id
/// and a `Canonical` id with equal string forms refer to the same logical
/// record and are unified by the ID reconciler during pull.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordId {
    Legacy(i64),
    Canonical(String),
}

impl RecordId {
    pub fn new_uuid() -> Self {
        RecordId::Canonical(Uuid::new_v4().to_string())
    }

    /// String form used as the remote document key.
    pub fn canonical(&self) -> String {
        match self {
            RecordId::Legacy(n) => n.to_string(),
            RecordId::Canonical(s) => s.clone(),
        }
    }

    pub fn is_legacy(&self) -> bool {
        matches!(self, RecordId::Legacy(_))
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordId::Legacy(n) => write!(f, "{}", n),
            RecordId::Canonical(s) => write!(f, "{}", s),
        }
    }
}

impl From<&str> for RecordId {
    fn from(s: &str) -> Self {
        RecordId::Canonical(s.to_string())
    }
}

impl From<i64> for RecordId {
    fn from(n: i64) -> Self {
        RecordId::Legacy(n)
    }
}

/// Entity-specific payload carried by a [`Record`]. The sync engine never
/// inspects the fields; it merges whole records.
pub trait Entity: Serialize + DeserializeOwned + Clone {
    /// Logical collection name, shared by the local table and the remote
    /// layout `{partition}/{collection}/{id}`.
    const COLLECTION: &'static str;
}

/// The versioned, mergeable shape shared by both stores.
///
/// `group_id` is fixed for the record's lifetime; `last_modified` is the sole
/// input to conflict resolution and only ever increases for a given writer.
/// Deletion is logical: `deleted` flips to true, the row stays, and the
/// tombstone propagates like any other mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record<E> {
    pub id: RecordId,
    #[serde(rename = "groupId")]
    pub group_id: String,
    #[serde(rename = "lastModified")]
    pub last_modified: DateTime<Utc>,
    pub deleted: bool,
    #[serde(flatten)]
    pub fields: E,
}

impl<E: Entity> Record<E> {
    pub fn new(group_id: &str, fields: E) -> Self {
        Self {
            id: RecordId::new_uuid(),
            group_id: group_id.to_string(),
            last_modified: Utc::now(),
            deleted: false,
            fields,
        }
    }

    /// Stamps a new modification time. Callers mutate `fields` first.
    pub fn touch(&mut self) {
        self.last_modified = Utc::now();
    }
}

/// What the conflict resolver needs from a record: an identity to match on
/// and a timestamp to compare.
pub trait Mergeable {
    fn canonical_id(&self) -> String;
    fn last_modified(&self) -> DateTime<Utc>;
}

impl<E> Mergeable for Record<E> {
    fn canonical_id(&self) -> String {
        self.id.canonical()
    }

    fn last_modified(&self) -> DateTime<Utc> {
        self.last_modified
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    Expense,
    Income,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionFields {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: TransactionKind,
    pub category: String,
    pub date: DateTime<Utc>,
    pub amount: f64,
}

impl Entity for TransactionFields {
    const COLLECTION: &'static str = "transactions";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryFields {
    pub name: String,
    pub color: String,
}

impl Entity for CategoryFields {
    const COLLECTION: &'static str = "categories";
}
