//! Value types returned by [`super::StatsEngine::get_snapshot`]. Deliberately owned/cloned data
//! only — no references into engine-internal state escape (SPEC_FULL.md §5).

use std::collections::HashMap;

use crate::FrameClass;

use super::RateKey;

#[derive(Debug, Clone, PartialEq)]
pub struct PayloadTotals {
    pub pdo: u64,
    pub sdo_res: u64,
    pub sdo_req: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SdoSnapshot {
    pub success: u64,
    pub abort: u64,
    pub pending_requests: HashMap<(u16, u8), f64>,
    pub response_latencies: Vec<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusState {
    Idle,
    Active,
}

impl std::fmt::Display for BusState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BusState::Idle => write!(f, "Idle"),
            BusState::Active => write!(f, "Active"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RatesSnapshot {
    pub last_counts: HashMap<RateKey, u64>,
    pub latest: HashMap<RateKey, f32>,
    pub history: HashMap<RateKey, Vec<f32>>,
    pub bus_util_percent: f32,
    pub peak_fps: f32,
    pub bus_state: BusState,
    pub last_update_time: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ErrorSnapshot {
    pub last_time: Option<String>,
    pub last_frame: Option<Vec<u8>>,
}

/// An isolated, deeply-copied view of the engine's state at one point in time (SPEC_FULL.md §3,
/// invariant 5).
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub start_time: f64,
    pub frame_counts: HashMap<FrameClass, u64>,
    pub total: u64,
    pub payload_totals: PayloadTotals,
    pub nodes: std::collections::HashSet<u8>,
    pub node_last_seen: HashMap<u8, f64>,
    pub top_talkers: HashMap<u16, u64>,
    pub sdo: SdoSnapshot,
    pub rates: RatesSnapshot,
    pub error: ErrorSnapshot,
}
