use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use serde_json::Value;

use crate::error::{Error, Result};
use crate::record::{Entity, Record};
use crate::remote::RemoteStore;

/// In-process remote store. Documents live under
/// `{partition}/{collection}/{id}`, the same logical layout a hosted backend
/// would use. Fault injection (`set_offline`, `revoke_partition`) drives the
/// error-taxonomy tests without a real network.
#[derive(Debug, Default)]
pub struct MemoryRemote {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    docs: BTreeMap<(String, String, String), Value>,
    offline: bool,
    revoked: HashSet<String>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates connectivity loss: every call fails until cleared.
    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    /// Simulates a membership revocation for one partition.
    pub fn revoke_partition(&self, partition: &str) {
        self.lock().revoked.insert(partition.to_string());
    }

    pub fn doc_count(&self, partition: &str, collection: &str) -> usize {
        self.lock()
            .docs
            .keys()
            .filter(|(p, c, _)| p == partition && c == collection)
            .count()
    }

    pub(crate) fn list_raw(&self, partition: &str, collection: &str) -> Result<Vec<Value>> {
        let inner = self.lock();
        inner.check_reachable(partition)?;
        Ok(inner
            .docs
            .iter()
            .filter(|((p, c, _), _)| p == partition && c == collection)
            .map(|(_, value)| value.clone())
            .collect())
    }

    pub(crate) fn upsert_raw(
        &self,
        partition: &str,
        collection: &str,
        id: &str,
        mut value: Value,
    ) -> Result<()> {
        let mut inner = self.lock();
        inner.check_reachable(partition)?;
        // The document key is the id's string form, and the stored document
        // carries the same form: remote ids are canonically strings, whatever
        // representation the writing device still holds locally.
        if let Some(field) = value.get_mut("id") {
            *field = Value::String(id.to_string());
        }
        inner
            .docs
            .insert((partition.to_string(), collection.to_string(), id.to_string()), value);
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Inner {
    fn check_reachable(&self, partition: &str) -> Result<()> {
        if self.offline {
            return Err(Error::Network("remote store is offline".to_string()));
        }
        if self.revoked.contains(partition) {
            return Err(Error::PermissionDenied(partition.to_string()));
        }
        Ok(())
    }
}

impl RemoteStore for MemoryRemote {
    fn list_by_partition<E: Entity>(&self, partition: &str) -> Result<Vec<Record<E>>> {
        self.list_raw(partition, E::COLLECTION)?
            .into_iter()
            .map(|value| Ok(serde_json::from_value(value)?))
            .collect()
    }

    fn upsert<E: Entity>(&self, partition: &str, record: &Record<E>) -> Result<()> {
        let value = serde_json::to_value(record)?;
        self.upsert_raw(partition, E::COLLECTION, &record.id.canonical(), value)
    }
}
