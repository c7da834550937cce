//! Classifies, decodes, and accounts every raw frame, emitting [`ProcessedFrame`]s for
//! presentation. Algorithm grounded on `original_source/canopen_analyzer/process_frames.py`.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Datelike, NaiveDate};
use log::error;
use tokio::sync::mpsc;

use crate::eds::EdsMap;
use crate::stats::StatsEngine;
use crate::util::{bytes_to_hex, format_float_like_source, now_str};
use crate::{Direction, FrameClass, ProcessedFrame, RawFrame, StopSignal};

const INGRESS_TIMEOUT: Duration = Duration::from_millis(100);

/// Consumes raw frames from the ingress queue, classifies and decodes them, updates the
/// [`StatsEngine`], and emits [`ProcessedFrame`]s.
pub struct FrameProcessor {
    stats: Arc<StatsEngine>,
    eds: Arc<EdsMap>,
}

impl FrameProcessor {
    pub fn new(stats: Arc<StatsEngine>, eds: Arc<EdsMap>) -> Self {
        Self { stats, eds }
    }

    pub async fn run(
        self,
        mut ingress: mpsc::UnboundedReceiver<RawFrame>,
        egress: mpsc::UnboundedSender<ProcessedFrame>,
        stop: StopSignal,
    ) {
        loop {
            if stop.is_set() {
                while let Ok(frame) = ingress.try_recv() {
                    self.process(frame, &egress);
                }
                break;
            }
            match tokio::time::timeout(INGRESS_TIMEOUT, ingress.recv()).await {
                Ok(Some(frame)) => self.process(frame, &egress),
                Ok(None) => break,
                Err(_timeout) => {}
            }
        }
    }

    fn process(&self, frame: RawFrame, egress: &mpsc::UnboundedSender<ProcessedFrame>) {
        if frame.direction == Direction::Tx {
            return;
        }

        let cob = frame.cob_id;
        let class = FrameClass::classify(cob);
        self.stats.count_talker(cob);
        let node_id = (cob & 0x7F) as u8;
        if (1..=127).contains(&node_id) {
            self.stats.add_node(node_id);
        }
        self.stats.increment_frame(class);
        if frame.error {
            self.stats.record_error(now_str(), frame.payload.clone());
        }

        match class {
            FrameClass::SdoReq => self.process_sdo_req(cob, &frame.payload, egress),
            FrameClass::SdoRes => self.process_sdo_res(cob, &frame.payload, egress),
            FrameClass::Pdo => self.process_pdo(cob, &frame.payload, egress),
            FrameClass::Time => self.process_time(cob, &frame.payload, egress),
            FrameClass::Emcy => self.process_emcy(cob, &frame.payload, egress),
            FrameClass::Heartbeat => self.process_heartbeat(cob, &frame.payload, egress),
            FrameClass::Nmt | FrameClass::Sync | FrameClass::Unknown => {
                emit(egress, cob, class, 0, 0, String::new(), &frame.payload, String::new());
            }
        }
    }

    fn process_sdo_req(
        &self,
        cob: u16,
        payload: &[u8],
        egress: &mpsc::UnboundedSender<ProcessedFrame>,
    ) {
        if payload.len() < 4 {
            self.stats.increment_payload(FrameClass::SdoReq, 0);
            error!("SDO_REQ cob=0x{cob:03X} payload too short to decode: {payload:?}");
            return;
        }

        let cs = payload[0];
        let index = payload[1] as u16 | ((payload[2] as u16) << 8);
        let sub = payload[3];
        self.stats.update_sdo_request_time(index, sub);

        let (decoded, payload_len) = match cs {
            0x40 => ("READ".to_string(), 0),
            0x2F | 0x2B | 0x23 => {
                let unused = (cs >> 2) & 0x03;
                let len = (4 - unused) as usize;
                let available = len.min(payload.len().saturating_sub(4));
                let value = le_uint(&payload[4..4 + available]);
                (value.to_string(), available)
            }
            0x80 => ("ABORT".to_string(), 0),
            other => (format!("Decode error (unknown cs 0x{other:02X})"), 0),
        };
        self.stats.increment_payload(FrameClass::SdoReq, payload_len);

        if index == 0 {
            error!("dropping SDO_REQ event with index 0, cob=0x{cob:03X}");
            return;
        }
        let name = self.eds.resolve_name_or_fallback(index, sub);
        emit(egress, cob, FrameClass::SdoReq, index, sub, name, payload, decoded);
    }

    fn process_sdo_res(
        &self,
        cob: u16,
        payload: &[u8],
        egress: &mpsc::UnboundedSender<ProcessedFrame>,
    ) {
        let (index, sub, cs) = if payload.len() >= 4 {
            (
                payload[1] as u16 | ((payload[2] as u16) << 8),
                payload[3],
                payload[0],
            )
        } else {
            (0, 0, 0x00)
        };

        let (decoded, payload_len) = if cs == 0x80 && payload.len() >= 8 {
            self.stats.increment_sdo_abort();
            let abort_code = u32::from_le_bytes([payload[4], payload[5], payload[6], payload[7]]);
            (format!("ABORT 0x{abort_code:08X}"), 0)
        } else if matches!(cs, 0x43 | 0x4B | 0x4F) && payload.len() == 8 {
            self.stats.increment_sdo_success();
            let n_unused = (cs >> 2) & 0x03;
            let data_len = (4 - n_unused) as usize;
            let value = le_uint(&payload[4..4 + data_len]);
            (value.to_string(), data_len)
        } else if cs == 0x60 {
            self.stats.increment_sdo_success();
            ("OK".to_string(), 0)
        } else {
            (String::new(), 0)
        };

        self.stats.increment_payload(FrameClass::SdoRes, payload_len);
        self.stats.update_sdo_response_time(index, sub);

        if index == 0 {
            error!("dropping SDO_RES event with index 0, cob=0x{cob:03X}");
            return;
        }
        let name = self.eds.resolve_name_or_fallback(index, sub);
        emit(egress, cob, FrameClass::SdoRes, index, sub, name, payload, decoded);
    }

    fn process_pdo(&self, cob: u16, payload: &[u8], egress: &mpsc::UnboundedSender<ProcessedFrame>) {
        self.stats.increment_payload(FrameClass::Pdo, payload.len());

        let Some(entries) = self.eds.pdo_entries(cob) else {
            emit(
                egress,
                cob,
                FrameClass::Pdo,
                0,
                0,
                String::new(),
                payload,
                "No reference in EDS".to_string(),
            );
            return;
        };

        let mut offset = 0usize;
        for &(index, sub, size_bits) in entries {
            let size_bytes = (size_bits as usize / 8).max(1);
            let available = size_bytes.min(payload.len().saturating_sub(offset));
            let chunk = &payload[offset..offset + available];
            let decoded = if size_bytes == 4 && chunk.len() == 4 {
                let bits = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                format_float_like_source(f32::from_bits(bits))
            } else {
                le_uint(chunk).to_string()
            };
            let name = self.eds.resolve_name_or_fallback(index, sub);
            emit(egress, cob, FrameClass::Pdo, index, sub, name, payload, decoded);
            offset += available;
        }
    }

    fn process_time(&self, cob: u16, payload: &[u8], egress: &mpsc::UnboundedSender<ProcessedFrame>) {
        if payload.len() < 6 {
            emit(
                egress,
                cob,
                FrameClass::Time,
                0,
                0,
                "TIME".to_string(),
                payload,
                "Malformed (need >= 6 bytes)".to_string(),
            );
            return;
        }
        let ms = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
        let days = u16::from_le_bytes([payload[4], payload[5]]);

        let tod_ms = ms % 86_400_000;
        let hours = tod_ms / 3_600_000;
        let minutes = (tod_ms / 60_000) % 60;
        let seconds = (tod_ms / 1_000) % 60;
        let millis = tod_ms % 1_000;
        let time_of_day = format!("{hours:02}:{minutes:02}:{seconds:02}.{millis:03}");

        let epoch = NaiveDate::from_ymd_opt(1984, 1, 1).expect("valid epoch date");
        let date = epoch + chrono::Duration::days(days as i64);

        let current_year = chrono::Local::now().year();
        let suffix = if date.year() < 1990 || date.year() > current_year + 1 {
            " (likely-invalid)"
        } else {
            ""
        };
        let decoded = format!("[{date} {time_of_day}], Days={days}{suffix}");
        emit(egress, cob, FrameClass::Time, 0, 0, "TIME".to_string(), payload, decoded);
    }

    fn process_emcy(&self, cob: u16, payload: &[u8], egress: &mpsc::UnboundedSender<ProcessedFrame>) {
        if payload.len() < 3 {
            emit(
                egress,
                cob,
                FrameClass::Emcy,
                0,
                0,
                "EMCY".to_string(),
                payload,
                "Malformed (need >= 3 bytes)".to_string(),
            );
            return;
        }
        let code = u16::from_le_bytes([payload[0], payload[1]]);
        let reg = payload[2];
        let manuf = &payload[3..payload.len().min(8)];
        let manuf_ascii = ascii_safe(manuf);
        let decoded = format!("[0x{code:04X}], reg=0x{reg:02X}[{reg:08b}], manuf={manuf_ascii}");
        emit(egress, cob, FrameClass::Emcy, 0, 0, "EMCY".to_string(), payload, decoded);
    }

    fn process_heartbeat(
        &self,
        cob: u16,
        payload: &[u8],
        egress: &mpsc::UnboundedSender<ProcessedFrame>,
    ) {
        if payload.is_empty() {
            emit(
                egress,
                cob,
                FrameClass::Heartbeat,
                0,
                0,
                "HB".to_string(),
                payload,
                "Malformed (need >= 1 byte)".to_string(),
            );
            return;
        }
        let state = payload[0];
        let label = match state {
            0x00 => "Bootup",
            0x04 => "Stopped",
            0x05 => "Operational",
            0x7F => "Pre-operational",
            _ => "Unknown",
        };
        let node = cob & 0x7F;
        let decoded = format!("Node={node}, state=0x{state:02X} [{label}]");
        emit(egress, cob, FrameClass::Heartbeat, 0, 0, "HB".to_string(), payload, decoded);
    }
}

fn le_uint(bytes: &[u8]) -> u64 {
    let mut value: u64 = 0;
    for (i, b) in bytes.iter().enumerate() {
        value |= (*b as u64) << (8 * i);
    }
    value
}

/// Replaces non-printable bytes with `.` and strips trailing dots (SPEC_FULL.md §4.4).
fn ascii_safe(bytes: &[u8]) -> String {
    let rendered: String = bytes
        .iter()
        .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '.' })
        .collect();
    rendered.trim_end_matches('.').to_string()
}

#[allow(clippy::too_many_arguments)]
fn emit(
    egress: &mpsc::UnboundedSender<ProcessedFrame>,
    cob: u16,
    class: FrameClass,
    index: u16,
    sub: u8,
    name: String,
    raw_payload: &[u8],
    decoded: String,
) {
    let frame = ProcessedFrame {
        time: now_str(),
        cob_id: cob,
        class,
        index,
        sub,
        name,
        raw: bytes_to_hex(raw_payload),
        decoded,
    };
    let _ = egress.send(frame);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::StatsEngine;

    fn new_processor() -> (Arc<StatsEngine>, FrameProcessor) {
        let stats = StatsEngine::new(1_000_000);
        let eds = Arc::new(EdsMap::empty());
        (stats.clone(), FrameProcessor::new(stats, eds))
    }

    fn rx(cob_id: u16, payload: &[u8]) -> RawFrame {
        RawFrame {
            timestamp: 0.0,
            direction: Direction::Rx,
            cob_id,
            error: false,
            payload: payload.to_vec(),
        }
    }

    #[tokio::test]
    async fn scenario_sync() {
        let (stats, processor) = new_processor();
        let (tx, mut rx_chan) = mpsc::unbounded_channel();
        processor.process(rx(0x080, &[]), &tx);
        let frame = rx_chan.try_recv().unwrap();
        assert_eq!(frame.class, FrameClass::Sync);
        assert_eq!(frame.index, 0);
        assert_eq!(frame.sub, 0);
        assert_eq!(frame.name, "");
        assert_eq!(frame.decoded, "");
        assert_eq!(stats.get_snapshot().frame_counts[&FrameClass::Sync], 1);
        stats.stop().await;
    }

    #[tokio::test]
    async fn scenario_heartbeat_operational_node_5() {
        let (stats, processor) = new_processor();
        let (tx, mut rx_chan) = mpsc::unbounded_channel();
        processor.process(rx(0x705, &[0x05]), &tx);
        let frame = rx_chan.try_recv().unwrap();
        assert_eq!(frame.class, FrameClass::Heartbeat);
        assert_eq!(frame.name, "HB");
        assert_eq!(frame.decoded, "Node=5, state=0x05 [Operational]");
        assert!(stats.get_snapshot().nodes.contains(&5));
        stats.stop().await;
    }

    #[tokio::test]
    async fn scenario_sdo_write_and_ok_response() {
        let (stats, processor) = new_processor();
        let (tx, mut rx_chan) = mpsc::unbounded_channel();
        processor.process(
            rx(0x602, &[0x2F, 0x00, 0x60, 0x00, 0x2A, 0x00, 0x00, 0x00]),
            &tx,
        );
        let req = rx_chan.try_recv().unwrap();
        assert_eq!(req.class, FrameClass::SdoReq);
        assert_eq!(req.index, 0x6000);
        assert_eq!(req.sub, 0);
        assert_eq!(req.decoded, "42");
        assert!(stats
            .get_snapshot()
            .sdo
            .pending_requests
            .contains_key(&(0x6000, 0)));

        processor.process(rx(0x582, &[0x60, 0x00, 0x60, 0x00, 0, 0, 0, 0]), &tx);
        let res = rx_chan.try_recv().unwrap();
        assert_eq!(res.class, FrameClass::SdoRes);
        assert_eq!(res.decoded, "OK");
        let snap = stats.get_snapshot();
        assert_eq!(snap.sdo.success, 1);
        assert!(!snap.sdo.pending_requests.contains_key(&(0x6000, 0)));
        assert_eq!(snap.sdo.response_latencies.len(), 1);
        stats.stop().await;
    }

    #[tokio::test]
    async fn scenario_sdo_abort() {
        let (stats, processor) = new_processor();
        let (tx, mut rx_chan) = mpsc::unbounded_channel();
        processor.process(
            rx(0x582, &[0x80, 0x00, 0x60, 0x00, 0x00, 0x00, 0x02, 0x06]),
            &tx,
        );
        let frame = rx_chan.try_recv().unwrap();
        assert_eq!(frame.decoded, "ABORT 0x06020000");
        assert_eq!(stats.get_snapshot().sdo.abort, 1);
        stats.stop().await;
    }

    #[tokio::test]
    async fn scenario_pdo_with_two_mapped_entries() {
        let eds = "\
[2000]
ParameterName=Object

[2000sub1]
ParameterName=x
DefaultValue=0

[2000sub2]
ParameterName=y
DefaultValue=0

[1800]
ParameterName=TPDO1 comm

[1800sub1]
ParameterName=COB-ID
DefaultValue=0x181

[1A00]
ParameterName=TPDO1 mapping

[1A00sub1]
ParameterName=mapped 1
DefaultValue=0x20000110

[1A00sub2]
ParameterName=mapped 2
DefaultValue=0x20000220
";
        let mut path = std::env::temp_dir();
        path.push("analyzer-core-processor-test.eds");
        std::fs::write(&path, eds).unwrap();
        let eds_map = Arc::new(EdsMap::load(path.to_str().unwrap()));
        std::fs::remove_file(&path).ok();

        let stats = StatsEngine::new(1_000_000);
        let processor = FrameProcessor::new(stats.clone(), eds_map);
        let (tx, mut rx_chan) = mpsc::unbounded_channel();
        processor.process(rx(0x181, &[0x39, 0x30, 0x00, 0x00, 0x80, 0x3F]), &tx);

        let first = rx_chan.try_recv().unwrap();
        assert_eq!(first.index, 0x2000);
        assert_eq!(first.sub, 1);
        assert_eq!(first.name, "Object.x");
        assert_eq!(first.decoded, "12345");

        let second = rx_chan.try_recv().unwrap();
        assert_eq!(second.index, 0x2000);
        assert_eq!(second.sub, 2);
        assert_eq!(second.name, "Object.y");
        assert_eq!(second.decoded, "1.0");
        stats.stop().await;
    }

    #[tokio::test]
    async fn scenario_time_frame() {
        let (stats, processor) = new_processor();
        let (tx, mut rx_chan) = mpsc::unbounded_channel();
        processor.process(rx(0x100, &[0x00, 0x00, 0x00, 0x00, 0x00, 0x00]), &tx);
        let frame = rx_chan.try_recv().unwrap();
        assert!(frame.decoded.starts_with("[1984-01-01 00:00:00.000]"));
        assert!(frame.decoded.contains("Days=0"));
        stats.stop().await;
    }

    #[tokio::test]
    async fn boundary_pdo_short_payload_never_panics() {
        let eds = "\
[1800]
ParameterName=TPDO1 comm

[1800sub1]
ParameterName=COB-ID
DefaultValue=0x181

[1A00]
ParameterName=TPDO1 mapping

[1A00sub1]
ParameterName=mapped 1
DefaultValue=0x20000120
";
        let mut path = std::env::temp_dir();
        path.push("analyzer-core-processor-short-test.eds");
        std::fs::write(&path, eds).unwrap();
        let eds_map = Arc::new(EdsMap::load(path.to_str().unwrap()));
        std::fs::remove_file(&path).ok();

        let stats = StatsEngine::new(1_000_000);
        let processor = FrameProcessor::new(stats.clone(), eds_map);
        let (tx, mut rx_chan) = mpsc::unbounded_channel();
        // declared 32-bit entry but only 1 byte supplied: must not panic.
        processor.process(rx(0x181, &[0x01]), &tx);
        let frame = rx_chan.try_recv().unwrap();
        assert_eq!(frame.decoded, "1");
        stats.stop().await;
    }

    #[tokio::test]
    async fn boundary_cob_0x080_is_sync_not_emcy_b1() {
        let (stats, processor) = new_processor();
        let (tx, mut rx_chan) = mpsc::unbounded_channel();
        processor.process(rx(0x080, &[]), &tx);
        let frame = rx_chan.try_recv().unwrap();
        assert_eq!(frame.class, FrameClass::Sync);
        stats.stop().await;
    }

    #[tokio::test]
    async fn tx_frames_are_skipped_for_classification() {
        let (stats, processor) = new_processor();
        let (tx, mut rx_chan) = mpsc::unbounded_channel();
        let frame = RawFrame {
            timestamp: 0.0,
            direction: Direction::Tx,
            cob_id: 0x080,
            error: false,
            payload: vec![],
        };
        processor.process(frame, &tx);
        assert!(rx_chan.try_recv().is_err());
        assert_eq!(stats.get_snapshot().total, 0);
        stats.stop().await;
    }

    #[tokio::test]
    async fn emcy_ascii_safe_strips_trailing_dots() {
        let (stats, processor) = new_processor();
        let (tx, mut rx_chan) = mpsc::unbounded_channel();
        processor.process(rx(0x081, &[0x10, 0x20, 0x01, b'A', 0x00, 0x00]), &tx);
        let frame = rx_chan.try_recv().unwrap();
        assert!(frame.decoded.contains("manuf=A"));
        assert!(!frame.decoded.ends_with('.'));
        stats.stop().await;
    }
}
