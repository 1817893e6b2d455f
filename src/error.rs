use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("remote unreachable: {0}")]
    Network(String),

    #[error("permission denied for partition {0}")]
    PermissionDenied(String),

    #[error("not found: {collection}/{id}")]
    NotFound { collection: String, id: String },

    #[error("local schema version {found} is newer than supported version {supported}")]
    SchemaVersion { found: i64, supported: i64 },

    #[error("invalid record: {0}")]
    InvalidRecord(String),
}

impl Error {
    pub fn not_found(collection: &str, id: impl Into<String>) -> Self {
        Error::NotFound { collection: collection.to_string(), id: id.into() }
    }

    /// Errors that fail one partition without poisoning the rest of the run.
    pub fn is_partition_scoped(&self) -> bool {
        matches!(self, Error::Network(_) | Error::PermissionDenied(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
