// ============================================================================
// Error taxonomy for the tile subsystem
// ============================================================================
//
// Only genuinely recoverable failures live here: the swap file refusing to
// open, and swap reads/writes going wrong (which means the affected tile's
// content is lost, but sibling tiles and other managers are untouched).
//
// Contract violations — out-of-range tile indices, mapping a tile that was
// never validated, and the like — are NOT errors. They log through the
// session logger and the operation becomes a no-op, because correct callers
// never trigger them and there is nothing sensible to recover mid-operation.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Failures that can escape the tile store to its callers.
#[derive(Debug, Error)]
pub enum TileError {
    /// The swap file could not be created or opened.
    #[error("cannot open swap file at {path}: {source}")]
    SwapCreate {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Fault-in from the swap file failed. The tile's content is lost;
    /// the caller must treat that region of the image as corrupt.
    #[error("swap read failed, tile content lost: {source}")]
    SwapRead {
        #[source]
        source: io::Error,
    },

    /// Write-back to the swap file failed during eviction. The dirty
    /// content could not be persisted and will be lost if the buffer is
    /// freed; the eviction is abandoned.
    #[error("swap write failed: {source}")]
    SwapWrite {
        #[source]
        source: io::Error,
    },

    /// An operation needed the swap file but the store was created
    /// memory-only (no swap directory configured).
    #[error("no swap directory configured for this tile store")]
    NoSwap,
}
