//! V4L2 capture device.
//!
//! Streams YUYV frames from a local device node (e.g. /dev/video0) through
//! mmap buffers on a dedicated capture thread. Each kernel frame is copied
//! into the next queued preview buffer; with none queued the frame is
//! dropped, the same contract a buffer-queue camera gives.
//!
//! V4L2 has no notion of facing or sensor mounting, so both are supplied by
//! the caller.

#![cfg(feature = "device-v4l2")]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use v4l::buffer::Type;
use v4l::frameinterval::FrameIntervalEnum;
use v4l::framesize::FrameSizeEnum;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::Capture;
use v4l::FourCC;

use super::{
    BufferRecycler, CameraDevice, CameraInfo, DeviceCapabilities, FpsRange, FrameSink,
    PreviewSettings,
};
use crate::frame::{Facing, PixelFormat, PreviewBuffer, Rotation, Size};

const KERNEL_BUFFERS: u32 = 4;
const YUYV: &[u8; 4] = b"YUYV";

#[derive(Default)]
struct Shared {
    queue: Mutex<VecDeque<PreviewBuffer>>,
    dropped: AtomicU64,
}

impl Shared {
    fn queue(&self) -> MutexGuard<'_, VecDeque<PreviewBuffer>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct QueueRecycler(Arc<Shared>);

impl BufferRecycler for QueueRecycler {
    fn requeue(&self, buffer: PreviewBuffer) {
        self.0.queue().push_back(buffer);
    }
}

struct CaptureThread {
    stop: Arc<AtomicBool>,
    // Hands the device back once streaming has ended.
    handle: JoinHandle<v4l::Device>,
}

pub struct V4l2Camera {
    path: String,
    facing: Facing,
    orientation: Rotation,
    device: Option<v4l::Device>,
    shared: Arc<Shared>,
    capture: Option<CaptureThread>,
}

impl V4l2Camera {
    pub fn new(path: impl Into<String>, facing: Facing, orientation: Rotation) -> Self {
        Self {
            path: path.into(),
            facing,
            orientation,
            device: None,
            shared: Arc::new(Shared::default()),
            capture: None,
        }
    }

    fn device(&self) -> Result<&v4l::Device> {
        self.device
            .as_ref()
            .ok_or_else(|| anyhow!("{} is not open (or is streaming)", self.path))
    }

    fn fps_ranges(&self, device: &v4l::Device, size: Size) -> Vec<FpsRange> {
        let intervals = match device.enum_frameintervals(FourCC::new(YUYV), size.width, size.height)
        {
            Ok(intervals) => intervals,
            Err(err) => {
                log::debug!(
                    "V4l2Camera: no frame intervals for {} on {}: {}",
                    size,
                    self.path,
                    err
                );
                return Vec::new();
            }
        };
        intervals
            .iter()
            .filter_map(|interval| match &interval.interval {
                FrameIntervalEnum::Discrete(fraction) => {
                    fps_from_interval(fraction.numerator, fraction.denominator).map(FpsRange::fixed)
                }
                // min interval is the max rate
                FrameIntervalEnum::Stepwise(step) => {
                    let max = fps_from_interval(step.min.numerator, step.min.denominator)?;
                    let min = fps_from_interval(step.max.numerator, step.max.denominator)?;
                    Some(FpsRange::new(
                        (min * 1000.0).round() as u32,
                        (max * 1000.0).round() as u32,
                    ))
                }
            })
            .collect()
    }
}

/// Frames per second for a V4L2 frame interval (seconds per frame).
fn fps_from_interval(numerator: u32, denominator: u32) -> Option<f32> {
    if numerator == 0 || denominator == 0 {
        return None;
    }
    Some(denominator as f32 / numerator as f32)
}

fn push_unique<T: PartialEq>(items: &mut Vec<T>, item: T) {
    if !items.contains(&item) {
        items.push(item);
    }
}

impl CameraDevice for V4l2Camera {
    fn name(&self) -> String {
        self.path.clone()
    }

    fn open(&mut self, facing: Facing) -> Result<CameraInfo> {
        if facing != self.facing {
            return Err(anyhow!(
                "could not find requested {} camera ({} is {})",
                facing,
                self.path,
                self.facing
            ));
        }
        if self.device.is_none() {
            let device = v4l::Device::with_path(&self.path)
                .with_context(|| format!("open v4l2 device {}", self.path))?;
            self.device = Some(device);
        }
        log::info!("V4l2Camera: opened {}", self.path);
        Ok(CameraInfo {
            id: self.path.clone(),
            facing: self.facing,
            orientation: self.orientation,
        })
    }

    fn capabilities(&self) -> Result<DeviceCapabilities> {
        let device = self.device()?;
        let sizes = device
            .enum_framesizes(FourCC::new(YUYV))
            .with_context(|| format!("enumerate YUYV frame sizes on {}", self.path))?;

        let mut preview_sizes = Vec::new();
        for frame_size in sizes {
            match frame_size.size {
                FrameSizeEnum::Discrete(d) => push_unique(&mut preview_sizes, Size::new(d.width, d.height)),
                FrameSizeEnum::Stepwise(s) => {
                    push_unique(&mut preview_sizes, Size::new(s.min_width, s.min_height));
                    push_unique(&mut preview_sizes, Size::new(s.max_width, s.max_height));
                }
            }
        }

        let mut fps_ranges = Vec::new();
        for size in &preview_sizes {
            for range in self.fps_ranges(device, *size) {
                push_unique(&mut fps_ranges, range);
            }
        }
        if preview_sizes.is_empty() {
            return Err(anyhow!("{} offers no YUYV frame sizes", self.path));
        }

        // Stills come off the same stream.
        Ok(DeviceCapabilities {
            picture_sizes: preview_sizes.clone(),
            preview_sizes,
            fps_ranges,
            pixel_format: PixelFormat::Yuyv,
            focus_modes: Vec::new(),
            flash_modes: Vec::new(),
        })
    }

    fn configure(&mut self, settings: &PreviewSettings) -> Result<()> {
        if settings.format != PixelFormat::Yuyv {
            return Err(anyhow!("{} only streams YUYV", self.path));
        }
        let device = self.device()?;
        let requested = v4l::Format::new(
            settings.preview_size.width,
            settings.preview_size.height,
            FourCC::new(YUYV),
        );
        let applied = device
            .set_format(&requested)
            .with_context(|| format!("set v4l2 format on {}", self.path))?;
        if applied.width != settings.preview_size.width
            || applied.height != settings.preview_size.height
            || applied.fourcc != FourCC::new(YUYV)
        {
            return Err(anyhow!(
                "{} negotiated {}x{} {} instead of {}",
                self.path,
                applied.width,
                applied.height,
                applied.fourcc,
                settings.preview_size
            ));
        }

        let fps = settings.fps_range.max_fps().round().max(1.0) as u32;
        let params = v4l::video::capture::Parameters::with_fps(fps);
        if let Err(err) = device.set_params(&params) {
            log::warn!("V4l2Camera: failed to set fps on {}: {}", self.path, err);
        }
        log::info!(
            "V4l2Camera: configured {} for {} at {} fps",
            self.path,
            settings.preview_size,
            fps
        );
        Ok(())
    }

    fn recycler(&self) -> Arc<dyn BufferRecycler> {
        Arc::new(QueueRecycler(self.shared.clone()))
    }

    fn start_preview(&mut self, sink: FrameSink, buffers: Vec<PreviewBuffer>) -> Result<()> {
        if self.capture.is_some() {
            return Err(anyhow!("{} is already streaming", self.path));
        }
        let device = self
            .device
            .take()
            .ok_or_else(|| anyhow!("{} is not open", self.path))?;
        self.shared.queue().extend(buffers);

        let stop = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = mpsc::sync_channel(1);
        let thread_stop = stop.clone();
        let shared = self.shared.clone();
        let path = self.path.clone();
        let handle = std::thread::Builder::new()
            .name("v4l2-capture".to_string())
            .spawn(move || capture_loop(device, &path, &thread_stop, &shared, &sink, ready_tx))
            .context("spawn v4l2 capture thread")?;

        let ready = ready_rx
            .recv()
            .map_err(|_| anyhow!("v4l2 capture thread exited during setup"));
        match ready.and_then(|r| r.context("create v4l2 buffer stream")) {
            Ok(()) => {
                self.capture = Some(CaptureThread { stop, handle });
                log::info!("V4l2Camera: streaming from {}", self.path);
                Ok(())
            }
            Err(err) => {
                if let Ok(device) = handle.join() {
                    self.device = Some(device);
                }
                Err(err)
            }
        }
    }

    fn stop_preview(&mut self) -> Result<Vec<PreviewBuffer>> {
        if let Some(capture) = self.capture.take() {
            capture.stop.store(true, Ordering::Release);
            match capture.handle.join() {
                Ok(device) => self.device = Some(device),
                Err(_) => log::error!("V4l2Camera: capture thread panicked on {}", self.path),
            }
        }
        let returned: Vec<PreviewBuffer> = self.shared.queue().drain(..).collect();
        log::info!(
            "V4l2Camera: stopped {} ({} buffers returned)",
            self.path,
            returned.len()
        );
        Ok(returned)
    }

    fn dropped_frames(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    fn release(&mut self) {
        if self.capture.is_some() {
            if let Err(err) = self.stop_preview() {
                log::warn!("V4l2Camera: stop on release failed: {:#}", err);
            }
        }
        if self.device.take().is_some() {
            log::info!("V4l2Camera: released {}", self.path);
        }
    }
}

impl Drop for V4l2Camera {
    fn drop(&mut self) {
        self.release();
    }
}

/// Runs on the capture thread until `stop` is set. Returns the device.
fn capture_loop(
    mut device: v4l::Device,
    path: &str,
    stop: &AtomicBool,
    shared: &Shared,
    sink: &FrameSink,
    ready: mpsc::SyncSender<std::io::Result<()>>,
) -> v4l::Device {
    let stream = MmapStream::with_buffers(&mut device, Type::VideoCapture, KERNEL_BUFFERS);
    match stream {
        Ok(mut stream) => {
            let _ = ready.send(Ok(()));
            let mut short_frames = 0u64;
            while !stop.load(Ordering::Acquire) {
                let data = match stream.next() {
                    Ok((data, _meta)) => data,
                    Err(err) => {
                        log::warn!("V4l2Camera: capture failed on {}: {}", path, err);
                        std::thread::sleep(Duration::from_millis(10));
                        continue;
                    }
                };

                let Some(mut buffer) = shared.queue().pop_front() else {
                    shared.dropped.fetch_add(1, Ordering::Relaxed);
                    log::trace!("V4l2Camera: no queued buffer, frame dropped");
                    continue;
                };
                let len = data.len().min(buffer.len());
                if len < data.len() {
                    short_frames += 1;
                    if short_frames == 1 {
                        log::warn!(
                            "V4l2Camera: {} byte frame truncated to {} byte buffer",
                            data.len(),
                            buffer.len()
                        );
                    }
                }
                buffer.as_mut_slice()[..len].copy_from_slice(&data[..len]);
                sink(buffer);
            }
        }
        Err(err) => {
            let _ = ready.send(Err(err));
        }
    }
    device
}
