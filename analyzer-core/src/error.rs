use thiserror::Error;

use crate::FrameClass;

/// Error conditions surfaced by the analyzer core.
///
/// Only [`AnalyzerError::InterfaceOpen`] is meant to propagate out of the pipeline as a fatal
/// startup failure. Every other variant is constructed, logged, and discarded at the point
/// where it occurs (see SPEC_FULL.md §7).
#[derive(Debug, Error)]
pub enum AnalyzerError {
    #[error("failed to open CAN interface '{interface}': {source}")]
    InterfaceOpen {
        interface: String,
        #[source]
        source: tokio_socketcan::Error,
    },

    #[error("failed to write CAN frame: {0}")]
    Write(String),

    #[error("node id {0} out of range 1..=127")]
    InvalidNodeId(u8),

    #[error("expedited SDO size must be 1, 2, or 4 bytes, got {0}")]
    InvalidSdoSize(u8),

    #[error("PDO payload length {0} exceeds 8 bytes")]
    PayloadTooLarge(usize),

    #[error("payload size is not tracked for frame class {0:?}")]
    PayloadClassNotTracked(FrameClass),
}
