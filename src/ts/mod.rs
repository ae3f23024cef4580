//! MPEG-TS packet framing.
//!
//! `packet` holds the low-level helpers (sync detection, PCR decoding);
//! `reassembler` turns an arbitrary byte stream into PCR-aligned cuts.

pub mod packet;
pub mod reassembler;

pub use reassembler::{FilterPolicy, PacketReassembler, ReassemblerOptions};

use std::collections::TryReserveError;

/// Failures of the packet reassembler. All of them are fatal for the stream
/// instance that produced them.
#[derive(Debug, thiserror::Error)]
pub enum TsError {
    #[error("Input does not look like MPEG-TS ({anomalies} consecutive misaligned packets)")]
    NotTransportStream { anomalies: usize },

    #[error("No usable PCR boundary in {buffered} buffered bytes")]
    Starved { buffered: usize },

    #[error("Could not allocate reassembly buffer: {0}")]
    OutOfMemory(#[from] TryReserveError),

    #[error("Reassembler already destroyed")]
    Destroyed,
}
