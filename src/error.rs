use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("database error: {0}")]
    Redb(#[from] redb::Error),

    #[error("database open error: {0}")]
    RedbDatabase(#[from] redb::DatabaseError),

    #[error("database storage error: {0}")]
    RedbStorage(#[from] redb::StorageError),

    #[error("database transaction error: {0}")]
    RedbTransaction(#[from] redb::TransactionError),

    #[error("database table error: {0}")]
    RedbTable(#[from] redb::TableError),

    #[error("database commit error: {0}")]
    RedbCommit(#[from] redb::CommitError),

    /// A required credential, model name or setting is missing or invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// A backend was requested that this build cannot provide.
    #[error("missing dependency: {0}")]
    Dependency(String),

    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    #[error("invalid input: {0}")]
    Input(String),

    /// A retrieval or generation call was made before `load()` succeeded.
    #[error("{0} is not loaded; call load() first")]
    NotLoaded(&'static str),

    #[error("embedding error: {0}")]
    Embedding(String),

    #[error("chat completion error: {0}")]
    Chat(String),

    #[error("data directory does not exist and could not be created: {0}")]
    DataDir(PathBuf),
}
