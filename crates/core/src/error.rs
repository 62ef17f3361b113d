use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Malformed or inconsistent configuration. Fatal at startup.
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Workflow template error: {0}")]
    Workflow(String),
}

impl CoreError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }
}
