//! Core pipeline of a CANopen bus analyzer: classification, decoding, statistics, and the
//! sniffer/processor tasks that drive them. See `SPEC_FULL.md` at the workspace root for the
//! full design.

#[macro_use]
extern crate enum_display_derive;

use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub mod eds;
pub mod error;
pub mod processor;
pub mod sniffer;
pub mod stats;
pub mod util;

pub use eds::EdsMap;
pub use error::AnalyzerError;
pub use processor::FrameProcessor;
pub use sniffer::{OutgoingRequest, Sniffer};
pub use stats::{Snapshot, StatsEngine};

/// Direction a [`RawFrame`] travelled: received off the wire, or transmitted by this process.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Rx,
    Tx,
}

/// CANopen message class, classified purely from the 11-bit COB-ID (SPEC_FULL.md §4.4).
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameClass {
    Nmt,
    Sync,
    Emcy,
    Time,
    Pdo,
    SdoReq,
    SdoRes,
    Heartbeat,
    Unknown,
}

impl FrameClass {
    pub const ALL: [FrameClass; 9] = [
        FrameClass::Nmt,
        FrameClass::Sync,
        FrameClass::Emcy,
        FrameClass::Time,
        FrameClass::Pdo,
        FrameClass::SdoReq,
        FrameClass::SdoRes,
        FrameClass::Heartbeat,
        FrameClass::Unknown,
    ];

    /// Index into a `[T; 9]` array keyed by frame class, avoiding a hash lookup on the hot path
    /// (SPEC_FULL.md §9, "Dynamic typing and string-keyed maps").
    pub fn idx(self) -> usize {
        self as usize
    }

    /// Total classification function over the full COB-ID space (SPEC_FULL.md §4.4, property P7).
    pub fn classify(cob_id: u16) -> FrameClass {
        match cob_id {
            0x000 => FrameClass::Nmt,
            0x080 => FrameClass::Sync,
            0x001..=0x07F => FrameClass::Unknown,
            0x081..=0x0FF => FrameClass::Emcy,
            0x100..=0x17F => FrameClass::Time,
            0x180..=0x4FF => FrameClass::Pdo,
            0x580..=0x5FF => FrameClass::SdoRes,
            0x600..=0x67F => FrameClass::SdoReq,
            0x700..=0x7FF => FrameClass::Heartbeat,
            _ => FrameClass::Unknown,
        }
    }
}

/// A frame as observed on (or sent to) the bus, before classification or decoding.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub timestamp: f64,
    pub direction: Direction,
    pub cob_id: u16,
    pub error: bool,
    pub payload: Vec<u8>,
}

/// A classified, decoded event ready for presentation (SPEC_FULL.md §3/§6).
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedFrame {
    pub time: String,
    pub cob_id: u16,
    pub class: FrameClass,
    pub index: u16,
    pub sub: u8,
    pub name: String,
    pub raw: String,
    pub decoded: String,
}

/// A single boolean stop event, shared cheaply across the sniffer, processor, and sampler tasks
/// (SPEC_FULL.md §5, "Cancellation semantics").
#[derive(Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn signal(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
