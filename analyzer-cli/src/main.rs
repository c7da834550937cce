//! CLI entry point: wires the sniffer, frame processor, and statistics engine together and
//! prints decoded events to stdout until interrupted. Wiring grounded on
//! `original_source/canopen_analyzer/canopen_analyzer.py`; CLI surface and logger setup
//! grounded on `cot/src/main.rs`.

use std::sync::Arc;

use chrono::Local;
use clap::Parser;
use clap_verbosity_flag::Verbosity;
use log::{debug, error, info};
use std::io::Write;

use analyzer_core::{EdsMap, FrameProcessor, Sniffer, StatsEngine, StopSignal};

#[derive(Parser)]
#[clap(author, version, about = "CANopen bus analyzer", long_about = None)]
struct Cli {
    /// CAN interface to read from, write to
    #[clap(short, long, default_value_t = String::from("vcan0"))]
    interface: String,

    /// Nominal bus bitrate in bit/s, used only for utilization estimation
    #[clap(short, long, default_value_t = 1_000_000)]
    bitrate: u32,

    /// Path to an EDS (Electronic Data Sheet) file for name/PDO-mapping resolution
    #[clap(long)]
    eds: Option<String>,

    /// Write decoded events to this path in addition to stdout (format inferred from extension)
    #[clap(long)]
    export: Option<String>,

    #[clap(flatten)]
    verbose: Verbosity,
}

fn init_logging(verbosity: &Verbosity) {
    env_logger::Builder::new()
        .format_timestamp_millis()
        .format(|buf, record| {
            let level_style = buf.default_level_style(record.level());
            writeln!(
                buf,
                "{} {}: {}",
                Local::now().format("%H:%M:%S%.3f"),
                level_style.value(record.level()),
                record.args()
            )
        })
        .filter_level(verbosity.log_level_filter())
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(&cli.verbose);

    debug!("Verbose: {:?}", cli.verbose);
    info!("CAN interface: {}", cli.interface);
    if let Some(export) = &cli.export {
        info!("export requested to '{export}', but export sinks are out of scope for this build");
    }

    let eds = match &cli.eds {
        Some(path) => {
            info!("loading EDS from {path}");
            Arc::new(EdsMap::load(path))
        }
        None => {
            debug!("no EDS file supplied, names will fall back to 0x{{index}}:{{sub}}");
            Arc::new(EdsMap::empty())
        }
    };

    let sniffer = match Sniffer::open(&cli.interface) {
        Ok(sniffer) => sniffer,
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        }
    };

    let stats = StatsEngine::new(cli.bitrate);
    let processor = FrameProcessor::new(stats.clone(), eds);
    let stop = StopSignal::new();

    let (ingress_tx, ingress_rx) = tokio::sync::mpsc::unbounded_channel();
    let (egress_tx, mut egress_rx) = tokio::sync::mpsc::unbounded_channel();
    let (_requests_tx, requests_rx) = tokio::sync::mpsc::unbounded_channel();

    let sniffer_stop = stop.clone();
    let sniffer_task = tokio::spawn(sniffer.run(ingress_tx, requests_rx, sniffer_stop));

    let processor_stop = stop.clone();
    let processor_task = tokio::spawn(processor.run(ingress_rx, egress_tx, processor_stop));

    let print_task = tokio::spawn(async move {
        while let Some(frame) = egress_rx.recv().await {
            println!(
                "{} cob=0x{:03X} {:<8} {:<24} {}",
                frame.time, frame.cob_id, frame.class, frame.name, frame.decoded
            );
        }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown requested");
        }
    }

    stop.signal();
    let _ = sniffer_task.await;
    let _ = processor_task.await;
    drop(print_task);
    stats.stop().await;
    info!("shutdown complete");
}
