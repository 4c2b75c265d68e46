use std::io;
use thiserror::Error;

/// Central error type for the minuet engine.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Underlying I/O error from the OS or network.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Configuration file could not be loaded or failed validation.
    #[error("config error: {0}")]
    Config(String),

    /// A listening socket could not be created or bound.
    #[error("failed to bind port {port}: {source}")]
    Bind { port: u16, source: io::Error },

    /// Signal handler installation failed.
    #[error("signal handler: {0}")]
    Signal(String),
}

pub type ServerResult<T> = Result<T, ServerError>;
