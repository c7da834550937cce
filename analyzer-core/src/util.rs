use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::StopSignal;

/// Wall-clock seconds since the Unix epoch, used as the monotonic-enough timestamp basis
/// throughout the engine (matches the source's own use of `time.time()`).
pub fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// `HH:MM:SS.mmm` local wall-clock rendering for processed-frame timestamps.
pub fn now_str() -> String {
    chrono::Local::now().format("%H:%M:%S%.3f").to_string()
}

/// Render a byte slice as space-separated upper-case hex pairs, e.g. `"2F 00 60 00"`.
pub fn bytes_to_hex(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Render a float the way the source's Python `str(float)` does: always at least one
/// fractional digit, so `1.0_f32` renders as `"1.0"` rather than Rust's default `"1"`.
pub fn format_float_like_source(v: f32) -> String {
    if v.is_finite() && v.fract() == 0.0 {
        format!("{v:.1}")
    } else {
        format!("{v}")
    }
}

/// Sleep for `duration`, waking early and returning as soon as `stop` is set. Polls in small
/// steps rather than using a condvar, matching the source's cancellable-backoff pattern
/// (`canopen_sniffer.py`'s `_stop_event.wait(0.2)`).
pub async fn cancellable_backoff(stop: &StopSignal, duration: Duration) {
    const STEP: Duration = Duration::from_millis(20);
    let mut waited = Duration::ZERO;
    while waited < duration {
        if stop.is_set() {
            return;
        }
        tokio::time::sleep(STEP).await;
        waited += STEP;
    }
}
