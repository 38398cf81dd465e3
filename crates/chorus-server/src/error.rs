use thiserror::Error;

/// Failures while bringing the server up.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("listener error: {0}")]
    Io(#[from] std::io::Error),
}
