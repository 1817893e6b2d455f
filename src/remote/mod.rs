mod memory;
mod tcp;

pub use memory::MemoryRemote;
pub use tcp::{RemoteServer, TcpRemote};

use crate::error::Result;
use crate::record::{Entity, Record};

/// Partition-scoped storage reachable only via network calls, acting as the
/// convergence point between devices. Reads are full snapshots (no change
/// feed); writes are idempotent upserts keyed by the id's canonical string.
/// Failures (unreachable, permission revoked, not found) surface as errors,
/// never as silent no-ops.
pub trait RemoteStore {
    fn list_by_partition<E: Entity>(&self, partition: &str) -> Result<Vec<Record<E>>>;

    fn upsert<E: Entity>(&self, partition: &str, record: &Record<E>) -> Result<()>;
}

// Lets one remote be shared by several engines (two devices, one cloud).
impl<R: RemoteStore> RemoteStore for &R {
    fn list_by_partition<E: Entity>(&self, partition: &str) -> Result<Vec<Record<E>>> {
        (**self).list_by_partition::<E>(partition)
    }

    fn upsert<E: Entity>(&self, partition: &str, record: &Record<E>) -> Result<()> {
        (**self).upsert::<E>(partition, record)
    }
}
