//! scanner - runs a capture session against a camera until interrupted
//!
//! This binary:
//! 1. Loads the capture configuration (CAPTURE_CONFIG file + CAPTURE_* env)
//! 2. Applies command line overrides
//! 3. Opens the camera (`stub://` synthetic, or a V4L2 node with device-v4l2)
//! 4. Feeds the newest preview frame to the selected detector
//! 5. Logs session statistics until Ctrl-C or --run-secs elapses

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use barcode_capture::{
    CameraDevice, CaptureConfig, CaptureSession, Detector, Facing, LoggingSink, StubDetector,
    SyntheticCamera,
};

const STATS_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(author, version, about = "Scan barcodes from a camera preview stream")]
struct Args {
    /// Camera device: `stub://<name>` or a V4L2 node such as /dev/video0.
    #[arg(long, env = "CAPTURE_DEVICE", default_value = "stub://camera0")]
    device: String,
    /// Requested preview frame rate.
    #[arg(long)]
    fps: Option<f32>,
    /// Requested preview width.
    #[arg(long)]
    width: Option<u32>,
    /// Requested preview height.
    #[arg(long)]
    height: Option<u32>,
    /// Camera facing: back or front.
    #[arg(long)]
    facing: Option<Facing>,
    /// Sensor mounting angle for V4L2 devices (0, 90, 180, 270).
    #[arg(long, default_value_t = 0)]
    sensor_orientation: u32,
    /// Detector backend: stub or qr.
    #[arg(long, default_value = "stub")]
    detector: String,
    /// Stop after this many seconds (0 runs until Ctrl-C).
    #[arg(long, default_value_t = 0)]
    run_secs: u64,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = CaptureConfig::load()?;
    if let Some(fps) = args.fps {
        config.requested_fps = fps;
    }
    if let Some(width) = args.width {
        config.preview_size.width = width;
    }
    if let Some(height) = args.height {
        config.preview_size.height = height;
    }
    if let Some(facing) = args.facing {
        config.facing = facing;
    }
    config.validate()?;

    let device = open_device(&args)?;
    let detector = build_detector(&args.detector)?;
    let session = CaptureSession::new(config, device, detector)?.with_sink(Arc::new(LoggingSink));

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .context("install Ctrl-C handler")?;

    session.start()?;
    if let Some(size) = session.preview_size() {
        log::info!(
            "scanner running: {} {} camera at {}",
            args.device,
            session.facing(),
            size
        );
    }

    let deadline = (args.run_secs > 0).then(|| Instant::now() + Duration::from_secs(args.run_secs));
    loop {
        let wait = match deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    log::info!("run time elapsed");
                    break;
                }
                remaining.min(STATS_INTERVAL)
            }
            None => STATS_INTERVAL,
        };
        match rx.recv_timeout(wait) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                log::info!("shutdown signal received, stopping capture...");
                break;
            }
            Err(RecvTimeoutError::Timeout) => {
                let stats = session.stats();
                log::info!(
                    "frames delivered={} processed={} evicted={} dropped={} detection_failures={}",
                    stats.delivered,
                    stats.processed,
                    stats.evicted,
                    stats.dropped,
                    stats.detection_failures
                );
            }
        }
    }

    session.stop()?;
    let stats = session.stats();
    session.release()?;
    log::info!(
        "scanner stopped: {} frames delivered, {} processed, {} buffers outstanding",
        stats.delivered,
        stats.processed,
        stats.outstanding
    );
    Ok(())
}

fn open_device(args: &Args) -> Result<Box<dyn CameraDevice>> {
    if args.device.starts_with("stub://") {
        return Ok(Box::new(SyntheticCamera::from_path(&args.device)?));
    }
    open_v4l2(args)
}

#[cfg(feature = "device-v4l2")]
fn open_v4l2(args: &Args) -> Result<Box<dyn CameraDevice>> {
    let orientation = barcode_capture::Rotation::from_degrees(args.sensor_orientation)
        .filter(|r| r.degrees() == args.sensor_orientation)
        .ok_or_else(|| anyhow!("invalid sensor orientation {}", args.sensor_orientation))?;
    let facing = args.facing.unwrap_or_default();
    Ok(Box::new(barcode_capture::V4l2Camera::new(
        args.device.clone(),
        facing,
        orientation,
    )))
}

#[cfg(not(feature = "device-v4l2"))]
fn open_v4l2(args: &Args) -> Result<Box<dyn CameraDevice>> {
    Err(anyhow!(
        "{} needs V4L2 support; rebuild with --features device-v4l2",
        args.device
    ))
}

fn build_detector(name: &str) -> Result<Box<dyn Detector>> {
    match name {
        "stub" => Ok(Box::new(StubDetector::new())),
        #[cfg(feature = "detect-qr")]
        "qr" => Ok(Box::new(barcode_capture::QrDetector::new())),
        #[cfg(not(feature = "detect-qr"))]
        "qr" => Err(anyhow!("qr detector needs --features detect-qr")),
        other => Err(anyhow!("unknown detector backend: {}", other)),
    }
}
