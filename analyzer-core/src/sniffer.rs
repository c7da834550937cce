//! SocketCAN frontend: receives raw frames off the wire and dispatches outgoing SDO/PDO
//! requests. Algorithm grounded on `original_source/canopen_analyzer/canopen_sniffer.py`;
//! socket handling grounded on `cot/src/main.rs`'s `tokio_socketcan::CANSocket` usage.

use std::time::Duration;

use futures_util::StreamExt;
use log::{debug, error, warn};
use tokio::sync::mpsc;
use tokio_socketcan::{CANFrame, CANSocket};

use crate::error::AnalyzerError;
use crate::util::{cancellable_backoff, now_secs};
use crate::{Direction, RawFrame, StopSignal};

/// Receive-loop poll timeout: bounds how long a stalled bus can delay a stop check
/// (SPEC_FULL.md §4.3).
const RECEIVE_TIMEOUT: Duration = Duration::from_millis(100);

/// Backoff after a socket read error, cancellable via the stop signal.
const ERROR_BACKOFF: Duration = Duration::from_millis(200);

/// A request to transmit onto the bus, queued from outside the sniffer task
/// (SPEC_FULL.md §4.3).
#[derive(Debug, Clone, PartialEq)]
pub enum OutgoingRequest {
    /// Expedited SDO download (write). `size` must be 1, 2, or 4 bytes.
    SdoDownload {
        node: u8,
        index: u16,
        sub: u8,
        value: u32,
        size: u8,
    },
    /// SDO upload (read) request.
    SdoUpload { node: u8, index: u16, sub: u8 },
    /// A raw PDO to inject onto the bus.
    Pdo { cob_id: u16, data: Vec<u8> },
}

impl OutgoingRequest {
    fn encode(&self) -> Result<(u16, Vec<u8>), AnalyzerError> {
        match *self {
            OutgoingRequest::SdoDownload {
                node,
                index,
                sub,
                value,
                size,
            } => {
                if node == 0 || node > 0x7F {
                    return Err(AnalyzerError::InvalidNodeId(node));
                }
                let cmd = match size {
                    1 => 0x2F,
                    2 => 0x2B,
                    4 => 0x23,
                    other => return Err(AnalyzerError::InvalidSdoSize(other)),
                };
                let mut data = vec![
                    cmd,
                    (index & 0xFF) as u8,
                    (index >> 8) as u8,
                    sub,
                    0,
                    0,
                    0,
                    0,
                ];
                let bytes = value.to_le_bytes();
                data[4..4 + size as usize].copy_from_slice(&bytes[..size as usize]);
                Ok((0x600 + node as u16, data))
            }
            OutgoingRequest::SdoUpload { node, index, sub } => {
                if node == 0 || node > 0x7F {
                    return Err(AnalyzerError::InvalidNodeId(node));
                }
                let data = vec![0x40, (index & 0xFF) as u8, (index >> 8) as u8, sub, 0, 0, 0, 0];
                Ok((0x600 + node as u16, data))
            }
            OutgoingRequest::Pdo {
                cob_id,
                ref data,
            } => {
                if data.len() > 8 {
                    return Err(AnalyzerError::PayloadTooLarge(data.len()));
                }
                Ok((cob_id, data.clone()))
            }
        }
    }
}

/// Owns the SocketCAN handle. One sniffer task per analyzer session.
pub struct Sniffer {
    socket: CANSocket,
    interface: String,
}

impl Sniffer {
    pub fn open(interface: &str) -> Result<Self, AnalyzerError> {
        let socket = CANSocket::open(interface).map_err(|source| AnalyzerError::InterfaceOpen {
            interface: interface.to_string(),
            source,
        })?;
        Ok(Self {
            socket,
            interface: interface.to_string(),
        })
    }

    /// Runs the receive/dispatch loop until `stop` is signalled. Consumes `self`: one run per
    /// open socket.
    pub async fn run(
        mut self,
        ingress: mpsc::UnboundedSender<RawFrame>,
        mut requests: mpsc::UnboundedReceiver<OutgoingRequest>,
        stop: StopSignal,
    ) {
        debug!("sniffer listening on {}", self.interface);
        loop {
            if stop.is_set() {
                break;
            }

            while let Ok(request) = requests.try_recv() {
                if let Err(e) = self.dispatch(request, &ingress).await {
                    error!("failed to dispatch outgoing request: {e}");
                }
            }

            match tokio::time::timeout(RECEIVE_TIMEOUT, self.socket.next()).await {
                Ok(Some(Ok(frame))) => {
                    let raw = to_raw_frame(&frame);
                    if ingress.send(raw).is_err() {
                        warn!("ingress channel closed, sniffer stopping");
                        break;
                    }
                }
                Ok(Some(Err(e))) => {
                    error!("socket read error on {}: {e}", self.interface);
                    cancellable_backoff(&stop, ERROR_BACKOFF).await;
                }
                Ok(None) => {
                    warn!("{} stream closed, sniffer stopping", self.interface);
                    break;
                }
                Err(_timeout) => {}
            }
        }
        debug!("sniffer on {} stopped", self.interface);
    }

    async fn dispatch(
        &mut self,
        request: OutgoingRequest,
        ingress: &mpsc::UnboundedSender<RawFrame>,
    ) -> Result<(), AnalyzerError> {
        let (cob_id, data) = request.encode()?;
        let frame = CANFrame::new(cob_id as u32, &data, false, false)
            .map_err(|e| AnalyzerError::Write(e.to_string()))?;
        let result = match self.socket.write_frame(frame) {
            Ok(write_future) => write_future
                .await
                .map_err(|e| AnalyzerError::Write(e.to_string())),
            Err(e) => Err(AnalyzerError::Write(e.to_string())),
        };
        if result.is_ok() {
            // Also observed as transmitted traffic, so downstream accounting (and optional
            // export) sees locally-generated frames; the Processor skips TX on ingest.
            let _ = ingress.send(RawFrame {
                timestamp: now_secs(),
                direction: Direction::Tx,
                cob_id,
                error: false,
                payload: data,
            });
        }
        result
    }
}

fn to_raw_frame(frame: &CANFrame) -> RawFrame {
    RawFrame {
        timestamp: now_secs(),
        direction: Direction::Rx,
        cob_id: (frame.id() & 0x7FF) as u16,
        error: frame.is_error(),
        payload: frame.data().to_vec(),
    }
}
