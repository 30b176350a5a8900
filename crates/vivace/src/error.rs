use std::io;

/// Central error type for the vivace core engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Underlying I/O error from the OS or network.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Connection slot allocator reached its maximum capacity.
    #[error("connection slot table is full")]
    SlabFull,

    /// TLS context construction or record-layer failure.
    #[error("TLS error: {0}")]
    Tls(String),

    /// Template precompilation failure.
    #[error("template error: {0}")]
    Template(String),

    /// Rejected configuration value.
    #[error("config error: {0}")]
    Config(String),

    /// Generic or miscellaneous error.
    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
