//! Thread-safe statistics aggregator with a background rate sampler. Algorithm grounded on
//! `original_source/canopen_analyzer/bus_stats.py`; the locking discipline fix for error-frame
//! recording (`record_error`) is SPEC_FULL.md §9's resolution of that module's one open question.

pub mod snapshot;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use log::{debug, warn};

use crate::util::now_secs;
use crate::FrameClass;

pub use snapshot::{BusState, ErrorSnapshot, PayloadTotals, RatesSnapshot, SdoSnapshot, Snapshot};

/// Width of the rolling rate/history window (source: `STATS_GRAPH_WIDTH`).
pub const STATS_GRAPH_WIDTH: usize = 20;

/// Sampler period, in seconds (source default).
pub const RATE_INTERVAL_SECS: f64 = 1.0;

/// Node inactivity cutoff: 5x the sampler period. Resolves the open question left by the source
/// module, which references this constant without defining it (SPEC_FULL.md §9).
pub const NODE_INACTIVE_TIMEOUT_SECS: f64 = 5.0 * RATE_INTERVAL_SECS;

/// Keys tracked by the rate sampler. A fixed-size array indexed by `RateKey as usize` drives the
/// hot path; snapshots convert to a map for presentation ergonomics (SPEC_FULL.md §9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateKey {
    Total,
    Hb,
    Emcy,
    Pdo,
    SdoRes,
    SdoReq,
}

impl RateKey {
    pub const ALL: [RateKey; 6] = [
        RateKey::Total,
        RateKey::Hb,
        RateKey::Emcy,
        RateKey::Pdo,
        RateKey::SdoRes,
        RateKey::SdoReq,
    ];

    fn idx(self) -> usize {
        self as usize
    }
}

struct RatesData {
    last_counts: [u64; 6],
    latest: [f32; 6],
    history: [VecDeque<f32>; 6],
    bus_util_percent: f32,
    peak_fps: f32,
    bus_state: BusState,
    last_update_time: f64,
}

impl RatesData {
    fn new() -> Self {
        Self {
            last_counts: [0; 6],
            latest: [0.0; 6],
            history: Default::default(),
            bus_util_percent: 0.0,
            peak_fps: 0.0,
            bus_state: BusState::Idle,
            last_update_time: 0.0,
        }
    }
}

struct SdoData {
    success: u64,
    abort: u64,
    pending_requests: HashMap<(u16, u8), f64>,
    response_latencies: VecDeque<f64>,
}

impl SdoData {
    fn new() -> Self {
        Self {
            success: 0,
            abort: 0,
            pending_requests: HashMap::new(),
            response_latencies: VecDeque::with_capacity(5 * STATS_GRAPH_WIDTH),
        }
    }
}

struct ErrorData {
    last_time: Option<String>,
    last_frame: Option<Vec<u8>>,
}

struct StatsData {
    start_time: f64,
    frame_counts: [u64; 9],
    total: u64,
    payload_pdo: u64,
    payload_sdo_res: u64,
    payload_sdo_req: u64,
    nodes: HashSet<u8>,
    node_last_seen: HashMap<u8, f64>,
    top_talkers: HashMap<u16, u64>,
    sdo: SdoData,
    rates: RatesData,
    error: ErrorData,
}

impl StatsData {
    fn new() -> Self {
        Self {
            start_time: now_secs(),
            frame_counts: [0; 9],
            total: 0,
            payload_pdo: 0,
            payload_sdo_res: 0,
            payload_sdo_req: 0,
            nodes: HashSet::new(),
            node_last_seen: HashMap::new(),
            top_talkers: HashMap::new(),
            sdo: SdoData::new(),
            rates: RatesData::new(),
            error: ErrorData {
                last_time: None,
                last_frame: None,
            },
        }
    }
}

/// Thread-safe counters, payload totals, node activity, SDO bookkeeping, and rolling rate
/// histories for one analyzer session, plus the background sampler that refreshes the rate/
/// utilization fields. See SPEC_FULL.md §4.2 for the full contract.
pub struct StatsEngine {
    inner: Mutex<StatsData>,
    bitrate: u32,
    stop: std::sync::atomic::AtomicBool,
    sampler_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl StatsEngine {
    /// Construct a new engine and spawn its background rate sampler. Requires a running tokio
    /// runtime (the sampler is `tokio::spawn`ed immediately).
    pub fn new(bitrate: u32) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<StatsEngine>| {
            let sampler_weak = weak.clone();
            let handle = tokio::spawn(run_sampler(sampler_weak));
            StatsEngine {
                inner: Mutex::new(StatsData::new()),
                bitrate,
                stop: std::sync::atomic::AtomicBool::new(false),
                sampler_handle: Mutex::new(Some(handle)),
            }
        })
    }

    pub fn increment_frame(&self, class: FrameClass) {
        let mut data = self.inner.lock().unwrap();
        data.frame_counts[class.idx()] += 1;
        data.total += 1;
    }

    /// Adds to the payload total for `class`. Only `PDO`, `SDO_RES`, `SDO_REQ` are tracked; any
    /// other class is a bookkeeping violation (SPEC_FULL.md §7, item 5) — logged, not fatal.
    pub fn increment_payload(&self, class: FrameClass, n_bytes: usize) {
        let mut data = self.inner.lock().unwrap();
        match class {
            FrameClass::Pdo => data.payload_pdo += n_bytes as u64,
            FrameClass::SdoRes => data.payload_sdo_res += n_bytes as u64,
            FrameClass::SdoReq => data.payload_sdo_req += n_bytes as u64,
            other => warn!("increment_payload called for untracked class {other:?}"),
        }
    }

    pub fn count_talker(&self, cob_id: u16) {
        let mut data = self.inner.lock().unwrap();
        *data.top_talkers.entry(cob_id).or_insert(0) += 1;
    }

    pub fn add_node(&self, node_id: u8) {
        let now = now_secs();
        let mut data = self.inner.lock().unwrap();
        data.nodes.insert(node_id);
        data.node_last_seen.insert(node_id, now);
    }

    pub fn update_sdo_request_time(&self, index: u16, sub: u8) {
        let now = now_secs();
        let mut data = self.inner.lock().unwrap();
        data.sdo.pending_requests.insert((index, sub), now);
    }

    pub fn update_sdo_response_time(&self, index: u16, sub: u8) {
        let now = now_secs();
        let mut data = self.inner.lock().unwrap();
        if let Some(request_time) = data.sdo.pending_requests.remove(&(index, sub)) {
            if data.sdo.response_latencies.len() >= 5 * STATS_GRAPH_WIDTH {
                data.sdo.response_latencies.pop_front();
            }
            data.sdo.response_latencies.push_back(now - request_time);
        }
    }

    pub fn increment_sdo_success(&self) {
        self.inner.lock().unwrap().sdo.success += 1;
    }

    pub fn increment_sdo_abort(&self) {
        self.inner.lock().unwrap().sdo.abort += 1;
    }

    /// Records the most recent error frame. The only way error state is mutated — the engine
    /// takes its own lock here rather than letting a caller reach into internal state from
    /// outside it (SPEC_FULL.md §9).
    pub fn record_error(&self, time: String, frame: Vec<u8>) {
        let mut data = self.inner.lock().unwrap();
        data.error.last_time = Some(time);
        data.error.last_frame = Some(frame);
    }

    pub fn set_start_time(&self) {
        self.inner.lock().unwrap().start_time = now_secs();
    }

    pub fn reset(&self) {
        let mut data = self.inner.lock().unwrap();
        *data = StatsData::new();
        data.rates.last_update_time = now_secs();
    }

    /// Time-gated rate update: a no-op unless at least `0.9 * interval` seconds have elapsed
    /// since the last successful update (SPEC_FULL.md §4.2).
    pub fn update_rates(&self, now: f64, interval: f64) {
        let mut data = self.inner.lock().unwrap();
        let elapsed = now - data.rates.last_update_time;
        if elapsed <= 0.0 || elapsed < 0.9 * interval {
            return;
        }

        data.node_last_seen
            .retain(|_, last_seen| now - *last_seen <= NODE_INACTIVE_TIMEOUT_SECS);
        let active: HashSet<u8> = data.node_last_seen.keys().copied().collect();
        data.nodes = active;

        data.rates.bus_state = if data.nodes.is_empty() {
            BusState::Idle
        } else {
            BusState::Active
        };

        for key in RateKey::ALL {
            let cur = cumulative_count(&data, key);
            let idx = key.idx();
            let delta = cur.saturating_sub(data.rates.last_counts[idx]);
            let rate = delta as f64 / elapsed;
            let rate = rate as f32;
            let history = &mut data.rates.history[idx];
            if history.len() >= STATS_GRAPH_WIDTH {
                history.pop_front();
            }
            history.push_back(rate);
            data.rates.latest[idx] = rate;
            data.rates.last_counts[idx] = cur;
        }

        let total_history_peak = data.rates.history[RateKey::Total.idx()]
            .iter()
            .copied()
            .fold(f32::MIN, f32::max);
        let candidate = if data.rates.history[RateKey::Total.idx()].is_empty() {
            data.rates.latest[RateKey::Total.idx()]
        } else {
            total_history_peak
        };
        data.rates.peak_fps = data.rates.peak_fps.max(candidate);

        let total_cnt = data.total.max(1);
        let payload_sum = data.payload_pdo + data.payload_sdo_res + data.payload_sdo_req;
        let avg_payload_bytes = payload_sum as f64 / total_cnt as f64;
        let avg_frame_bits = (avg_payload_bytes * 8.0).floor() as u64 + 64;
        let avg_frame_bits = avg_frame_bits.max(64);
        let util = 100.0 * data.rates.latest[RateKey::Total.idx()] as f64 * avg_frame_bits as f64
            / self.bitrate.max(1) as f64;

        data.rates.bus_util_percent = if data.nodes.is_empty() { 0.0 } else { util as f32 };

        data.rates.last_update_time = now;
    }

    pub fn get_snapshot(&self) -> Snapshot {
        let data = self.inner.lock().unwrap();

        let mut frame_counts = HashMap::new();
        for class in FrameClass::ALL {
            frame_counts.insert(class, data.frame_counts[class.idx()]);
        }

        let mut last_counts = HashMap::new();
        let mut latest = HashMap::new();
        let mut history = HashMap::new();
        for key in RateKey::ALL {
            let idx = key.idx();
            last_counts.insert(key, data.rates.last_counts[idx]);
            latest.insert(key, data.rates.latest[idx]);
            history.insert(key, data.rates.history[idx].iter().copied().collect());
        }

        Snapshot {
            start_time: data.start_time,
            frame_counts,
            total: data.total,
            payload_totals: PayloadTotals {
                pdo: data.payload_pdo,
                sdo_res: data.payload_sdo_res,
                sdo_req: data.payload_sdo_req,
            },
            nodes: data.nodes.clone(),
            node_last_seen: data.node_last_seen.clone(),
            top_talkers: data.top_talkers.clone(),
            sdo: SdoSnapshot {
                success: data.sdo.success,
                abort: data.sdo.abort,
                pending_requests: data.sdo.pending_requests.clone(),
                response_latencies: data.sdo.response_latencies.iter().copied().collect(),
            },
            rates: RatesSnapshot {
                last_counts,
                latest,
                history,
                bus_util_percent: data.rates.bus_util_percent,
                peak_fps: data.rates.peak_fps,
                bus_state: data.rates.bus_state,
                last_update_time: data.rates.last_update_time,
            },
            error: ErrorSnapshot {
                last_time: data.error.last_time.clone(),
                last_frame: data.error.last_frame.clone(),
            },
        }
    }

    /// Stops the background sampler and waits (briefly) for it to exit. Idempotent.
    pub async fn stop(&self) {
        self.stop.store(true, std::sync::atomic::Ordering::SeqCst);
        let handle = self.sampler_handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
        }
    }
}

fn cumulative_count(data: &StatsData, key: RateKey) -> u64 {
    match key {
        RateKey::Total => data.total,
        RateKey::Hb => data.frame_counts[FrameClass::Heartbeat.idx()],
        RateKey::Emcy => data.frame_counts[FrameClass::Emcy.idx()],
        RateKey::Pdo => data.frame_counts[FrameClass::Pdo.idx()],
        RateKey::SdoRes => data.frame_counts[FrameClass::SdoRes.idx()],
        RateKey::SdoReq => data.frame_counts[FrameClass::SdoReq.idx()],
    }
}

async fn run_sampler(engine: Weak<StatsEngine>) {
    let interval = Duration::from_secs_f64(RATE_INTERVAL_SECS);
    loop {
        tokio::time::sleep(interval).await;
        let Some(engine) = engine.upgrade() else {
            break;
        };
        if engine.stop.load(std::sync::atomic::Ordering::SeqCst) {
            break;
        }
        engine.update_rates(now_secs(), RATE_INTERVAL_SECS);
    }
    debug!("rate sampler exiting");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_engine() -> Arc<StatsEngine> {
        // Tests run under #[tokio::test] so `tokio::spawn` inside `new` has a runtime to attach
        // to.
        StatsEngine::new(1_000_000)
    }

    #[tokio::test]
    async fn increment_frame_keeps_total_in_sync_p1() {
        let engine = new_engine();
        engine.increment_frame(FrameClass::Sync);
        engine.increment_frame(FrameClass::Pdo);
        engine.increment_frame(FrameClass::Pdo);
        let snap = engine.get_snapshot();
        let sum: u64 = snap.frame_counts.values().sum();
        assert_eq!(snap.total, sum);
        assert_eq!(snap.total, 3);
        engine.stop().await;
    }

    #[tokio::test]
    async fn payload_totals_are_preseeded_for_all_three_tracked_classes() {
        let engine = new_engine();
        let snap = engine.get_snapshot();
        assert_eq!(snap.payload_totals.pdo, 0);
        assert_eq!(snap.payload_totals.sdo_res, 0);
        assert_eq!(snap.payload_totals.sdo_req, 0);
        engine.stop().await;
    }

    #[tokio::test]
    async fn reset_zeroes_everything_and_bus_state_is_idle_r1() {
        let engine = new_engine();
        engine.increment_frame(FrameClass::Pdo);
        engine.add_node(5);
        engine.increment_sdo_success();
        engine.reset();
        let snap = engine.get_snapshot();
        assert_eq!(snap.total, 0);
        assert!(snap.nodes.is_empty());
        assert_eq!(snap.sdo.success, 0);
        assert_eq!(snap.rates.bus_state, BusState::Idle);
        engine.stop().await;
    }

    #[tokio::test]
    async fn sdo_round_trip_records_latency_and_success_r2() {
        let engine = new_engine();
        engine.update_sdo_request_time(0x6000, 0);
        engine.update_sdo_response_time(0x6000, 0);
        engine.increment_sdo_success();
        let snap = engine.get_snapshot();
        assert_eq!(snap.sdo.success, 1);
        assert_eq!(snap.sdo.abort, 0);
        assert_eq!(snap.sdo.response_latencies.len(), 1);
        assert!(snap.sdo.response_latencies[0] >= 0.0);
        assert!(snap.sdo.pending_requests.is_empty());
        engine.stop().await;
    }

    #[tokio::test]
    async fn response_without_matching_request_does_not_grow_latencies_p3() {
        let engine = new_engine();
        engine.update_sdo_response_time(0x6000, 0);
        let snap = engine.get_snapshot();
        assert!(snap.sdo.response_latencies.is_empty());
        engine.stop().await;
    }

    #[tokio::test]
    async fn bus_util_is_zero_when_no_nodes_are_active_p4() {
        let engine = new_engine();
        engine.increment_frame(FrameClass::Pdo);
        engine.update_rates(now_secs() + 10.0, RATE_INTERVAL_SECS);
        let snap = engine.get_snapshot();
        assert!(snap.nodes.is_empty());
        assert_eq!(snap.rates.bus_util_percent, 0.0);
        engine.stop().await;
    }

    #[tokio::test]
    async fn two_snapshots_without_mutation_are_equal_p5() {
        let engine = new_engine();
        engine.increment_frame(FrameClass::Heartbeat);
        let a = engine.get_snapshot();
        let b = engine.get_snapshot();
        assert_eq!(a, b);
        engine.stop().await;
    }

    #[tokio::test]
    async fn gated_update_rates_does_not_grow_history_b3() {
        let engine = new_engine();
        engine.increment_frame(FrameClass::Sync);
        let start = now_secs();
        engine.update_rates(start, RATE_INTERVAL_SECS);
        let before = engine.get_snapshot().rates.history[&RateKey::Total].len();
        // elapsed well under 0.9 * interval: must be a no-op.
        engine.update_rates(start + 0.1, RATE_INTERVAL_SECS);
        let after = engine.get_snapshot().rates.history[&RateKey::Total].len();
        assert_eq!(before, after);
        engine.stop().await;
    }

    #[tokio::test]
    async fn history_length_never_exceeds_width_p2() {
        let engine = new_engine();
        let mut t = now_secs();
        for _ in 0..(STATS_GRAPH_WIDTH + 10) {
            engine.increment_frame(FrameClass::Sync);
            t += RATE_INTERVAL_SECS;
            engine.update_rates(t, RATE_INTERVAL_SECS);
        }
        let snap = engine.get_snapshot();
        for key in RateKey::ALL {
            assert!(snap.rates.history[&key].len() <= STATS_GRAPH_WIDTH);
        }
        engine.stop().await;
    }

    #[tokio::test]
    async fn inactive_nodes_are_pruned_after_timeout() {
        let engine = new_engine();
        engine.add_node(5);
        let t = now_secs() + NODE_INACTIVE_TIMEOUT_SECS + 1.0;
        engine.update_rates(t, RATE_INTERVAL_SECS);
        let snap = engine.get_snapshot();
        assert!(!snap.nodes.contains(&5));
        engine.stop().await;
    }

    #[tokio::test]
    async fn record_error_sets_scalar_last_time_and_frame() {
        let engine = new_engine();
        engine.record_error("12:00:00.000".to_string(), vec![1, 2, 3]);
        let snap = engine.get_snapshot();
        assert_eq!(snap.error.last_time.as_deref(), Some("12:00:00.000"));
        assert_eq!(snap.error.last_frame, Some(vec![1, 2, 3]));
        engine.stop().await;
    }
}
