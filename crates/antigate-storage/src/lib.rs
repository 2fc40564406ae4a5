mod credential;
mod fsutil;
mod import;
mod request_log;

pub use credential::{CredentialRecord, CredentialStore, unix_ms};
pub use import::{ImportOptions, ImportOutcome, parse_toml_accounts};
pub use request_log::{
    LogDetail, LogEntry, NewLogEntry, ProjectUsage, RequestLog, RequestSnapshot, ResponseSnapshot,
    StreamSummary, WindowUsage,
};

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage io: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt storage file {path}: {message}")]
    Corrupt { path: String, message: String },
    #[error("index out of range: {0}")]
    IndexOutOfRange(usize),
    #[error("toml parse: {0}")]
    Toml(String),
    #[error("serde json error: {0}")]
    Serde(#[from] serde_json::Error),
}
