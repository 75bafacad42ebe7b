use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// The feed transport failed or closed without an exit message.
    #[error("Feed error: {0}")]
    Feed(String),

    #[error("Execution error: {0}")]
    Execution(String),

    /// A state-machine rule was broken. Always fatal to the owning worker.
    #[error("Invariant violated: {0}")]
    Invariant(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Error::Json(_))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
