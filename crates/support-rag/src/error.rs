use thiserror::Error;

/// Failures the request layer must see.
///
/// Per-source problems (one search backend timing out, one tool failing, a
/// malformed model reply) are absorbed where they happen and never reach this
/// type. Only total unavailability of a subsystem does.
#[derive(Debug, Error)]
pub enum SupportError {
    #[error("tool server unavailable: {0}")]
    ToolServerUnavailable(String),

    #[error("no search backend configured")]
    NoSearchBackend,

    #[error("search unavailable: {0}")]
    SearchUnavailable(String),

    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type SupportResult<T> = std::result::Result<T, SupportError>;
