//! Content-addressed artifact storage

mod cas;

pub use cas::{AddStatus, Added, ContentStore};

use std::io;
use std::path::PathBuf;

/// Errors surfaced by the content store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The configured fan-out depth requires more hex characters than the
    /// digest provides.
    #[error("store depth {depth} requires a digest of at least {required} characters")]
    InvalidConfiguration { depth: usize, required: usize },

    /// Writing the artifact failed; the temporary file has been removed.
    #[error("failed to write artifact {}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Io(#[from] io::Error),
}
