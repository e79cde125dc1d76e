use thiserror::Error;

/// Failures that end a single request. None of them invalidate the session
/// or the user's stored contexts.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("missing arguments")]
    MissingAction,

    #[error("missing arguments for {0}")]
    MissingArguments(&'static str),

    #[error("code is already running")]
    AlreadyRunning,

    #[error("Rate limit exceeded")]
    RateLimited,

    #[error("Execution timed out ({0}s)")]
    ScriptTimeout(f64),

    #[error("{0}")]
    Script(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
