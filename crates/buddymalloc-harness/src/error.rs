use buddymalloc_core::AllocError;
use buddymalloc_heap::ConfigError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("allocator: {0}")]
    Alloc(#[from] AllocError),
    #[error("config: {0}")]
    Config(#[from] ConfigError),
    #[error("report formatting failed")]
    Format(#[from] std::fmt::Error),
    #[error("invalid seed '{0}'")]
    InvalidSeed(String),
    #[error("unsupported format '{0}', expected text|json")]
    UnsupportedFormat(String),
    #[error("unknown log level '{0}'")]
    UnknownLogLevel(String),
    #[error("worker thread {0} panicked")]
    WorkerPanicked(usize),
    #[error("{count} invariant violation(s), first: {first}")]
    Invariants { count: usize, first: String },
}
