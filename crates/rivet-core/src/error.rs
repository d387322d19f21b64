use std::io;

use thiserror::Error;

/// Errors surfaced by the networking core.
#[derive(Debug, Error)]
pub enum Error {
    /// Underlying socket or poller failure.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// Convenience result alias used across the workspace.
pub type Result<T> = std::result::Result<T, Error>;
