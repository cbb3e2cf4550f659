//! Error types for process introspection

/// Error type for layout and module queries
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// Reading the platform's mapping source failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A mapping line did not have the expected shape
    #[error("Malformed mapping entry: {0}")]
    Parse(String),

    /// No introspection backend for this platform
    #[error("Process introspection not supported on this platform")]
    Unsupported,
}
