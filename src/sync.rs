use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use tracing::{debug, info, warn};

use crate::error::Result;
use crate::local::LocalStore;
use crate::reconcile;
use crate::record::{CategoryFields, Entity, Record, TransactionFields};
use crate::remote::RemoteStore;
use crate::resolve::{resolve, Winner};

/// Yields the partitions the user may synchronize right now. Backed
/// externally by a group-membership service; the engine re-queries it every
/// run and never caches the list across runs.
pub trait PartitionResolver {
    fn current_partitions(&self, user: &str) -> Result<Vec<String>>;
}

impl<P: PartitionResolver> PartitionResolver for &P {
    fn current_partitions(&self, user: &str) -> Result<Vec<String>> {
        (**self).current_partitions(user)
    }
}

/// Membership table held in memory. Stands in for the external group service
/// in tests and demos; mutable through `&self` so membership can change
/// between runs, the way a real backend would.
#[derive(Debug, Default)]
pub struct StaticPartitions {
    memberships: Mutex<HashMap<String, Vec<String>>>,
}

impl StaticPartitions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(&self, user: &str, partition: &str) {
        let mut memberships = self.lock();
        let groups = memberships.entry(user.to_string()).or_default();
        if !groups.iter().any(|g| g == partition) {
            groups.push(partition.to_string());
        }
    }

    pub fn revoke(&self, user: &str, partition: &str) {
        if let Some(groups) = self.lock().get_mut(user) {
            groups.retain(|g| g != partition);
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<String>>> {
        self.memberships.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl PartitionResolver for StaticPartitions {
    fn current_partitions(&self, user: &str) -> Result<Vec<String>> {
        Ok(self.lock().get(user).cloned().unwrap_or_default())
    }
}

#[derive(Debug, Clone)]
pub struct PartitionFailure {
    pub partition: String,
    pub reason: String,
}

/// Outcome of one sync run. Counters are per resolver decision; `failed`
/// carries partitions whose remaining steps were aborted mid-run.
#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    pub partitions_synced: usize,
    pub pushed: usize,
    pub pulled: usize,
    pub skipped: usize,
    pub healed_ids: usize,
    pub backfilled: usize,
    pub failed: Vec<PartitionFailure>,
}

impl SyncReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn total_writes(&self) -> usize {
        self.pushed + self.pulled
    }

    /// Single human-readable status for display. Partial success is reported
    /// as failure; the caller gets one signal, not a structured breakdown.
    pub fn summary(&self) -> String {
        if self.is_success() {
            format!(
                "Sync complete: {} partition(s), {} pushed, {} pulled",
                self.partitions_synced, self.pushed, self.pulled
            )
        } else {
            format!(
                "Sync failed: {} of {} partition(s) did not finish ({})",
                self.failed.len(),
                self.partitions_synced + self.failed.len(),
                self.failed[0].reason
            )
        }
    }
}

/// Drives the push phase then the pull phase per partition. Stateless between
/// invocations: no cursor, no resume point, no change log; every run is a
/// full re-comparison of both snapshots, which keeps the LWW model simple at
/// the cost of bandwidth.
pub struct SyncEngine<R, P> {
    local: LocalStore,
    remote: R,
    partitions: P,
    // Serializes overlapping "sync now" triggers for this engine; a second
    // trigger queues behind the in-flight run instead of racing it.
    run_gate: Mutex<()>,
}

impl<R: RemoteStore, P: PartitionResolver> SyncEngine<R, P> {
    pub fn new(local: LocalStore, remote: R, partitions: P) -> Self {
        Self { local, remote, partitions, run_gate: Mutex::new(()) }
    }

    pub fn local(&self) -> &LocalStore {
        &self.local
    }

    pub fn remote(&self) -> &R {
        &self.remote
    }

    /// The "sync now" entry point. Connectivity and permission errors abort
    /// only the current partition and are reported; anything else (resolver
    /// failure, local storage failure) aborts the whole run.
    pub fn sync(&self, user: &str) -> Result<SyncReport> {
        let _running = self.run_gate.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let partitions = self.partitions.current_partitions(user)?;
        debug!(user, count = partitions.len(), "resolved partitions");

        let mut report = SyncReport::default();
        for partition in &partitions {
            match self.sync_partition(partition, &mut report) {
                Ok(()) => report.partitions_synced += 1,
                Err(err) if err.is_partition_scoped() => {
                    warn!(partition, error = %err, "partition aborted");
                    report.failed.push(PartitionFailure {
                        partition: partition.clone(),
                        reason: err.to_string(),
                    });
                }
                Err(err) => return Err(err),
            }
        }

        info!(user, status = %report.summary(), "sync run finished");
        Ok(report)
    }

    // Push always completes before pull within a partition; partitions are
    // processed in resolver order with no overlap.
    fn sync_partition(&self, partition: &str, report: &mut SyncReport) -> Result<()> {
        debug!(partition, "push phase");
        self.push::<TransactionFields>(partition, report)?;
        self.push::<CategoryFields>(partition, report)?;

        debug!(partition, "pull phase");
        self.pull::<TransactionFields>(partition, report)?;
        self.pull::<CategoryFields>(partition, report)?;
        Ok(())
    }

    fn push<E: Entity>(&self, partition: &str, report: &mut SyncReport) -> Result<()> {
        let remote_by_id: HashMap<String, Record<E>> = self
            .remote
            .list_by_partition::<E>(partition)?
            .into_iter()
            .map(|record| (record.id.canonical(), record))
            .collect();

        let entries = self.local.list_entries::<E>(partition)?;
        let mut backfills = Vec::new();

        for entry in entries {
            let counterpart = remote_by_id.get(&entry.record.id.canonical());
            match resolve(Some(&entry.record), counterpart) {
                Winner::Local => {
                    self.remote.upsert::<E>(partition, &entry.record)?;
                    report.pushed += 1;
                }
                Winner::Remote | Winner::Neither => report.skipped += 1,
            }
            if entry.backfilled {
                backfills.push(entry.record);
            }
        }

        // Rows that got in-memory defaults are persisted only after the
        // remote writes went through.
        for record in backfills {
            self.local.put(&record)?;
            report.backfilled += 1;
        }
        Ok(())
    }

    fn pull<E: Entity>(&self, partition: &str, report: &mut SyncReport) -> Result<()> {
        // Fresh snapshot rather than reusing the push-phase read: the push
        // itself and concurrent writers from other devices may have changed
        // the partition in the meantime.
        let incoming = self.remote.list_by_partition::<E>(partition)?;
        let locals = self.local.list_by_partition::<E>(partition)?;

        // Match by canonical id; where a legacy row and a canonical row
        // coexist, the newer one speaks for the pair.
        let mut local_by_id: HashMap<String, &Record<E>> = HashMap::new();
        for record in &locals {
            local_by_id
                .entry(record.id.canonical())
                .and_modify(|current| {
                    if record.last_modified > current.last_modified {
                        *current = record;
                    }
                })
                .or_insert(record);
        }

        for remote_record in &incoming {
            let counterpart = local_by_id.get(remote_record.id.canonical().as_str()).copied();
            match resolve(counterpart, Some(remote_record)) {
                Winner::Remote => {
                    report.healed_ids +=
                        reconcile::repair_before_put(&self.local, &locals, remote_record)?;
                    self.local.put(remote_record)?;
                    report.pulled += 1;
                }
                Winner::Local | Winner::Neither => report.skipped += 1,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::record::{RecordId, TransactionKind};
    use crate::remote::MemoryRemote;
    use chrono::{Duration, Utc};

    fn transaction(partition: &str, name: &str, amount: f64) -> Record<TransactionFields> {
        Record::new(
            partition,
            TransactionFields {
                name: name.into(),
                kind: TransactionKind::Expense,
                category: "Food".into(),
                date: Utc::now(),
                amount,
            },
        )
    }

    fn category(partition: &str, name: &str) -> Record<CategoryFields> {
        Record::new(partition, CategoryFields { name: name.into(), color: "#112233".into() })
    }

    fn engine<'a>(
        remote: &'a MemoryRemote,
        resolver: &'a StaticPartitions,
    ) -> SyncEngine<&'a MemoryRemote, &'a StaticPartitions> {
        SyncEngine::new(LocalStore::open_in_memory().unwrap(), remote, resolver)
    }

    #[test]
    fn test_local_only_record_reaches_remote_unaltered() {
        let remote = MemoryRemote::new();
        let resolver = StaticPartitions::new();
        resolver.grant("u1", "g1");
        let engine = engine(&remote, &resolver);

        let record = transaction("g1", "Groceries", 100.0);
        engine.local().put(&record).unwrap();

        let report = engine.sync("u1").unwrap();
        assert!(report.is_success());
        assert_eq!(report.pushed, 1);
        assert_eq!(report.pulled, 0);

        let uploaded = remote.list_by_partition::<TransactionFields>("g1").unwrap();
        assert_eq!(uploaded, vec![record]);
    }

    #[test]
    fn test_second_run_performs_zero_writes() {
        let remote = MemoryRemote::new();
        let resolver = StaticPartitions::new();
        resolver.grant("u1", "g1");
        let engine = engine(&remote, &resolver);

        engine.local().put(&transaction("g1", "Groceries", 100.0)).unwrap();
        engine.local().put(&category("g1", "Food")).unwrap();

        let first = engine.sync("u1").unwrap();
        assert_eq!(first.total_writes(), 2);

        let second = engine.sync("u1").unwrap();
        assert_eq!(second.total_writes(), 0);
        assert!(second.is_success());
    }

    #[test]
    fn test_newer_remote_copy_overwrites_local() {
        let remote = MemoryRemote::new();
        let resolver = StaticPartitions::new();
        resolver.grant("u1", "g1");
        let engine = engine(&remote, &resolver);

        let mut local_copy = transaction("g1", "Rent", 900.0);
        local_copy.id = "t2".into();
        engine.local().put(&local_copy).unwrap();

        let mut remote_copy = local_copy.clone();
        remote_copy.fields.amount = 950.0;
        remote_copy.last_modified = local_copy.last_modified + Duration::minutes(5);
        remote.upsert("g1", &remote_copy).unwrap();

        let report = engine.sync("u1").unwrap();
        assert_eq!(report.pushed, 0);
        assert_eq!(report.pulled, 1);

        let local_after =
            engine.local().get::<TransactionFields>("g1", &local_copy.id).unwrap().unwrap();
        assert_eq!(local_after, remote_copy);
        // Remote untouched by the losing side.
        assert_eq!(
            remote.list_by_partition::<TransactionFields>("g1").unwrap(),
            vec![remote_copy]
        );
    }

    #[test]
    fn test_newer_local_copy_overwrites_remote() {
        let remote = MemoryRemote::new();
        let resolver = StaticPartitions::new();
        resolver.grant("u1", "g1");
        let engine = engine(&remote, &resolver);

        let mut remote_copy = transaction("g1", "Rent", 900.0);
        remote_copy.id = "t2".into();
        remote.upsert("g1", &remote_copy).unwrap();

        let mut local_copy = remote_copy.clone();
        local_copy.fields.amount = 875.0;
        local_copy.last_modified = remote_copy.last_modified + Duration::minutes(5);
        engine.local().put(&local_copy).unwrap();

        let report = engine.sync("u1").unwrap();
        assert_eq!(report.pushed, 1);
        assert_eq!(report.pulled, 0);
        assert_eq!(
            remote.list_by_partition::<TransactionFields>("g1").unwrap(),
            vec![local_copy]
        );
    }

    #[test]
    fn test_equal_timestamps_leave_both_sides_unchanged() {
        let remote = MemoryRemote::new();
        let resolver = StaticPartitions::new();
        resolver.grant("u1", "g1");
        let engine = engine(&remote, &resolver);

        let record = transaction("g1", "Coffee", 4.5);
        engine.local().put(&record).unwrap();
        remote.upsert("g1", &record).unwrap();

        let report = engine.sync("u1").unwrap();
        assert_eq!(report.total_writes(), 0);
    }

    #[test]
    fn test_tombstone_propagates_and_is_not_resurrected() {
        let remote = MemoryRemote::new();
        let resolver = StaticPartitions::new();
        resolver.grant("u1", "g1");
        let engine = engine(&remote, &resolver);

        let mut record = transaction("g1", "Subscription", 12.0);
        record.id = "t3".into();
        engine.local().put(&record).unwrap();

        let mut stale_remote = record.clone();
        stale_remote.last_modified = record.last_modified - Duration::minutes(30);
        remote.upsert("g1", &stale_remote).unwrap();

        engine.local().soft_delete::<TransactionFields>("g1", &record.id).unwrap();
        engine.sync("u1").unwrap();

        let remote_after = remote.list_by_partition::<TransactionFields>("g1").unwrap();
        assert_eq!(remote_after.len(), 1);
        assert!(remote_after[0].deleted);

        // The tombstone stays queryable but is out of user-facing listings.
        assert!(engine.local().list_active::<TransactionFields>("g1").unwrap().is_empty());
        assert_eq!(engine.local().list_by_partition::<TransactionFields>("g1").unwrap().len(), 1);

        // A re-run carrying no newer un-delete write must not flip it back.
        engine.sync("u1").unwrap();
        let local_after =
            engine.local().get::<TransactionFields>("g1", &record.id).unwrap().unwrap();
        assert!(local_after.deleted);
    }

    #[test]
    fn test_two_devices_converge_through_shared_remote() {
        let remote = MemoryRemote::new();
        let resolver = StaticPartitions::new();
        resolver.grant("u1", "g1");

        let device_a = engine(&remote, &resolver);
        let device_b = engine(&remote, &resolver);

        let record = transaction("g1", "Groceries", 60.0);
        device_a.local().put(&record).unwrap();
        device_a.sync("u1").unwrap();
        device_b.sync("u1").unwrap();

        let on_b = device_b.local().get::<TransactionFields>("g1", &record.id).unwrap().unwrap();
        assert_eq!(on_b, record);

        // B edits later; the edit flows back to A through the remote.
        let mut edited = on_b;
        edited.fields.amount = 75.0;
        edited.last_modified = record.last_modified + Duration::minutes(10);
        device_b.local().put(&edited).unwrap();
        device_b.sync("u1").unwrap();
        device_a.sync("u1").unwrap();

        let on_a = device_a.local().get::<TransactionFields>("g1", &record.id).unwrap().unwrap();
        assert_eq!(on_a, edited);

        // Quiet network: both devices re-running changes nothing.
        assert_eq!(device_a.sync("u1").unwrap().total_writes(), 0);
        assert_eq!(device_b.sync("u1").unwrap().total_writes(), 0);
    }

    #[test]
    fn test_partitions_stay_isolated_with_shared_ids() {
        let remote = MemoryRemote::new();
        let resolver = StaticPartitions::new();
        resolver.grant("u1", "g1");
        resolver.grant("u1", "g2");
        let engine = engine(&remote, &resolver);

        let mut in_g1 = transaction("g1", "Lunch", 15.0);
        in_g1.id = "shared".into();
        let mut in_g2 = transaction("g2", "Fuel", 50.0);
        in_g2.id = "shared".into();

        remote.upsert("g1", &in_g1).unwrap();
        remote.upsert("g2", &in_g2).unwrap();

        engine.sync("u1").unwrap();

        let g1_local = engine.local().list_by_partition::<TransactionFields>("g1").unwrap();
        let g2_local = engine.local().list_by_partition::<TransactionFields>("g2").unwrap();
        assert_eq!(g1_local, vec![in_g1]);
        assert_eq!(g2_local, vec![in_g2]);

        // Neither pull displaced the other partition's copy, so a re-run has
        // nothing left to write.
        assert_eq!(engine.sync("u1").unwrap().total_writes(), 0);
    }

    #[test]
    fn test_legacy_id_is_healed_to_canonical_row() {
        let remote = MemoryRemote::new();
        let resolver = StaticPartitions::new();
        resolver.grant("u1", "g1");
        let engine = engine(&remote, &resolver);

        let mut legacy = category("g1", "Food");
        legacy.id = RecordId::Legacy(7);
        engine.local().put(&legacy).unwrap();

        let mut canonical = legacy.clone();
        canonical.id = RecordId::from("7");
        canonical.fields.color = "#ff0000".into();
        canonical.last_modified = legacy.last_modified + Duration::minutes(1);
        remote.upsert("g1", &canonical).unwrap();

        let report = engine.sync("u1").unwrap();
        assert_eq!(report.healed_ids, 1);

        // Exactly one row left, under the canonical id.
        let rows = engine.local().list_by_partition::<CategoryFields>("g1").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, canonical.id);
        assert_eq!(rows[0].fields.color, "#ff0000");

        let again = engine.sync("u1").unwrap();
        assert_eq!(again.healed_ids, 0);
        assert_eq!(again.total_writes(), 0);
    }

    #[test]
    fn test_backfilled_defaults_persist_after_push() {
        let remote = MemoryRemote::new();
        let resolver = StaticPartitions::new();
        resolver.grant("u1", "g1");
        let engine = engine(&remote, &resolver);

        engine
            .local()
            .insert_unversioned_row(
                "categories",
                &RecordId::from("c9"),
                "g1",
                r##"{"name":"Misc","color":"#444444"}"##,
            )
            .unwrap();

        let report = engine.sync("u1").unwrap();
        assert_eq!(report.backfilled, 1);
        assert_eq!(report.pushed, 1);
        assert_eq!(remote.doc_count("g1", "categories"), 1);

        // Defaults are now durable; a second run has nothing to repair.
        let entries = engine.local().list_entries::<CategoryFields>("g1").unwrap();
        assert!(!entries[0].backfilled);
        assert_eq!(engine.sync("u1").unwrap().backfilled, 0);
    }

    #[test]
    fn test_offline_remote_fails_partition_without_touching_local() {
        let remote = MemoryRemote::new();
        let resolver = StaticPartitions::new();
        resolver.grant("u1", "g1");
        let engine = engine(&remote, &resolver);

        let record = transaction("g1", "Groceries", 100.0);
        engine.local().put(&record).unwrap();
        remote.set_offline(true);

        let report = engine.sync("u1").unwrap();
        assert!(!report.is_success());
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].partition, "g1");
        assert!(report.summary().starts_with("Sync failed"));

        let local_after =
            engine.local().get::<TransactionFields>("g1", &record.id).unwrap().unwrap();
        assert_eq!(local_after, record);
    }

    #[test]
    fn test_revoked_partition_is_skipped_and_run_continues() {
        let remote = MemoryRemote::new();
        let resolver = StaticPartitions::new();
        resolver.grant("u1", "g1");
        resolver.grant("u1", "g2");
        let engine = engine(&remote, &resolver);

        engine.local().put(&transaction("g1", "Blocked", 10.0)).unwrap();
        engine.local().put(&transaction("g2", "Allowed", 20.0)).unwrap();
        remote.revoke_partition("g1");

        let report = engine.sync("u1").unwrap();
        assert_eq!(report.partitions_synced, 1);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].partition, "g1");
        // The healthy partition was still pushed.
        assert_eq!(remote.doc_count("g2", "transactions"), 1);
        assert_eq!(remote.doc_count("g1", "transactions"), 0);
    }

    #[test]
    fn test_membership_changes_are_seen_on_the_next_run() {
        let remote = MemoryRemote::new();
        let resolver = StaticPartitions::new();
        resolver.grant("u1", "g1");
        let engine = engine(&remote, &resolver);

        remote.upsert("g2", &transaction("g2", "Shared dinner", 30.0)).unwrap();
        engine.sync("u1").unwrap();
        assert!(engine.local().list_by_partition::<TransactionFields>("g2").unwrap().is_empty());

        // Invite accepted between runs: resolved fresh, not from a cache.
        resolver.grant("u1", "g2");
        engine.sync("u1").unwrap();
        assert_eq!(engine.local().list_by_partition::<TransactionFields>("g2").unwrap().len(), 1);
    }

    #[test]
    fn test_concurrent_triggers_serialize_through_the_gate() {
        let remote = MemoryRemote::new();
        let resolver = StaticPartitions::new();
        resolver.grant("u1", "g1");
        let engine = std::sync::Arc::new(SyncEngine::new(
            LocalStore::open_in_memory().unwrap(),
            &remote,
            &resolver,
        ));

        for i in 0..8 {
            engine.local().put(&transaction("g1", &format!("t{}", i), i as f64)).unwrap();
        }

        std::thread::scope(|scope| {
            for _ in 0..4 {
                let engine = engine.clone();
                scope.spawn(move || engine.sync("u1").unwrap());
            }
        });

        assert_eq!(remote.doc_count("g1", "transactions"), 8);
        // All triggers drained the same work; a fresh run is a no-op.
        assert_eq!(engine.sync("u1").unwrap().total_writes(), 0);
    }

    #[test]
    fn test_resolver_failure_aborts_the_whole_run() {
        struct FailingResolver;
        impl PartitionResolver for FailingResolver {
            fn current_partitions(&self, _user: &str) -> Result<Vec<String>> {
                Err(Error::Network("membership service down".into()))
            }
        }

        let remote = MemoryRemote::new();
        let engine =
            SyncEngine::new(LocalStore::open_in_memory().unwrap(), &remote, FailingResolver);
        assert!(engine.sync("u1").is_err());
    }

    #[test]
    fn test_sync_over_tcp_transport() {
        use crate::remote::{RemoteServer, TcpRemote};
        use std::sync::Arc;

        let store = Arc::new(MemoryRemote::new());
        let server = RemoteServer::bind("127.0.0.1:0", store.clone()).unwrap();
        let addr = server.local_addr().unwrap();
        let _accept_loop = server.spawn();

        let resolver = StaticPartitions::new();
        resolver.grant("u1", "g1");
        let engine = SyncEngine::new(
            LocalStore::open_in_memory().unwrap(),
            TcpRemote::connect_to(addr.to_string()),
            &resolver,
        );

        let record = transaction("g1", "Over the wire", 1.0);
        engine.local().put(&record).unwrap();

        let report = engine.sync("u1").unwrap();
        assert!(report.is_success());
        assert_eq!(store.doc_count("g1", "transactions"), 1);
        assert_eq!(engine.sync("u1").unwrap().total_writes(), 0);
    }
}
