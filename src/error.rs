use std::fmt;

use crate::scheme::TileAddress;

// Errors raised by the conversion stages. Library functions return
// anyhow::Result and callers classify failures with downcast_ref::<Error>().
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // Unknown scheme/format or an option combination that cannot run. Always
    // raised before any I/O.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("tile {0} already exists")]
    Conflict(TileAddress),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("cannot decode tile path {path:?}: {reason}")]
    Structural { path: String, reason: String },

    #[error("malformed grid: {0}")]
    MalformedGrid(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn config<M: fmt::Display>(msg: M) -> Self {
        Error::Configuration(msg.to_string())
    }

    pub fn structural<P, M>(path: P, reason: M) -> Self
    where
        P: fmt::Display,
        M: fmt::Display,
    {
        Error::Structural {
            path: path.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn grid<M: fmt::Display>(msg: M) -> Self {
        Error::MalformedGrid(msg.to_string())
    }
}

// Finds the tilepack error at the root of an anyhow chain, if there is one.
pub fn classify(err: &anyhow::Error) -> Option<&Error> {
    err.chain().find_map(|e| e.downcast_ref::<Error>())
}
