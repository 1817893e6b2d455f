mod error;
mod local;
mod reconcile;
mod record;
mod remote;
mod resolve;
mod sync;

pub use error::{Error, Result};
pub use local::LocalStore;
pub use reconcile::{repair_before_put, representation_mismatches};
pub use record::{
    CategoryFields, Entity, Mergeable, Record, RecordId, TransactionFields, TransactionKind,
};
pub use remote::{MemoryRemote, RemoteServer, RemoteStore, TcpRemote};
pub use resolve::{resolve, Winner};
pub use sync::{
    PartitionFailure, PartitionResolver, StaticPartitions, SyncEngine, SyncReport,
};
