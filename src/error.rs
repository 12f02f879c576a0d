use std::io;

/// Failures of the event record store. Any of these while persisting an
/// inbound event fails the request.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("store is closed")]
    Closed,

    #[error("store task failed: {0}")]
    Task(String),
}

#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("invalid template key segment: {0:?}")]
    InvalidKey(String),

    #[error("template not found")]
    NotFound,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// The agent process could not be driven at all. A non-zero exit is not an
/// error; it is reported through the outcome.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("failed to launch `{program}`: {source}")]
    Launch {
        program: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("agent I/O failed: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum ExecuteError {
    #[error("rendered document {0} not found")]
    DocumentNotFound(i64),

    #[error(transparent)]
    Store(#[from] StoreError),
}
