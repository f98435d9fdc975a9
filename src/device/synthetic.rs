//! Synthetic capture device (`stub://` paths).
//!
//! Behaves like a buffer-queue camera: frames are only produced into buffers
//! that have been queued, and a frame is silently dropped when the queue is
//! empty. With `autorun` the device runs its own delivery thread at the
//! negotiated rate; without it, frames are delivered on demand through a
//! `SyntheticHandle`, which makes hand-off timing deterministic in tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};

use super::{
    BufferRecycler, CameraDevice, CameraInfo, DeviceCapabilities, FpsRange, FrameSink,
    PreviewSettings, ZoomState,
};
use crate::config::{FlashMode, FocusMode};
use crate::frame::{Facing, PixelFormat, PreviewBuffer, Rotation, Size};

#[derive(Clone, Debug)]
pub struct SyntheticConfig {
    /// Device path, e.g. "stub://camera0".
    pub device: String,
    /// Cameras on the device as (facing, sensor orientation).
    pub cameras: Vec<(Facing, Rotation)>,
    pub preview_sizes: Vec<Size>,
    pub picture_sizes: Vec<Size>,
    pub fps_ranges: Vec<FpsRange>,
    pub focus_modes: Vec<FocusMode>,
    pub flash_modes: Vec<FlashMode>,
    pub max_zoom: Option<u32>,
    /// Run a delivery thread at the negotiated frame rate.
    pub autorun: bool,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            device: "stub://camera0".to_string(),
            cameras: vec![(Facing::Back, Rotation::Deg90), (Facing::Front, Rotation::Deg270)],
            preview_sizes: vec![
                Size::new(176, 144),
                Size::new(320, 240),
                Size::new(640, 480),
                Size::new(1280, 720),
                Size::new(1920, 1080),
            ],
            picture_sizes: vec![
                Size::new(640, 480),
                Size::new(1280, 720),
                Size::new(1920, 1080),
                Size::new(2592, 1944),
            ],
            fps_ranges: vec![
                FpsRange::new(15000, 15000),
                FpsRange::new(7000, 30000),
                FpsRange::new(30000, 30000),
            ],
            focus_modes: vec![
                FocusMode::ContinuousPicture,
                FocusMode::ContinuousVideo,
                FocusMode::Auto,
                FocusMode::Fixed,
            ],
            flash_modes: vec![FlashMode::Off, FlashMode::On, FlashMode::Auto, FlashMode::Torch],
            max_zoom: Some(30),
            autorun: true,
        }
    }
}

impl SyntheticConfig {
    /// Manual delivery only, with small frames.
    pub fn manual() -> Self {
        Self {
            preview_sizes: vec![Size::new(64, 48), Size::new(128, 72)],
            picture_sizes: vec![Size::new(640, 480), Size::new(1280, 720)],
            autorun: false,
            ..Self::default()
        }
    }
}

// ----------------------------------------------------------------------------
// Shared queue state (device side)
// ----------------------------------------------------------------------------

#[derive(Default)]
struct Shared {
    queue: Mutex<VecDeque<PreviewBuffer>>,
    sink: Mutex<Option<FrameSink>>,
    applied: Mutex<Option<PreviewSettings>>,
    open: AtomicBool,
    frames: AtomicU64,
    dropped: AtomicU64,
}

impl Shared {
    fn queue(&self) -> MutexGuard<'_, VecDeque<PreviewBuffer>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_sink(&self, sink: Option<FrameSink>) {
        *self.sink.lock().unwrap_or_else(PoisonError::into_inner) = sink;
    }

    fn set_applied(&self, settings: Option<PreviewSettings>) {
        *self.applied.lock().unwrap_or_else(PoisonError::into_inner) = settings;
    }

    /// Fill the next queued buffer and hand it to the sink.
    ///
    /// The sink lock is held for the whole hand-off, so `set_sink(None)`
    /// waits out any delivery already in progress.
    fn deliver(&self) -> bool {
        let sink = self.sink.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(sink) = sink.as_ref() else {
            return false;
        };
        let Some(mut buffer) = self.queue().pop_front() else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            log::trace!("SyntheticCamera: no queued buffer, frame dropped");
            return false;
        };

        let frame = self.frames.fetch_add(1, Ordering::Relaxed) + 1;
        fill_pattern(buffer.as_mut_slice(), frame);
        sink(buffer);
        true
    }
}

/// Moving gradient with a little per-frame sensor noise.
fn fill_pattern(data: &mut [u8], frame: u64) {
    let noise = u64::from(rand::random::<u8>() >> 6);
    for (i, px) in data.iter_mut().enumerate() {
        *px = ((i as u64 + frame + noise) % 256) as u8;
    }
}

struct QueueRecycler(Arc<Shared>);

impl BufferRecycler for QueueRecycler {
    fn requeue(&self, buffer: PreviewBuffer) {
        self.0.queue().push_back(buffer);
    }
}

/// Test/demo access to a synthetic device owned by a session.
#[derive(Clone)]
pub struct SyntheticHandle {
    shared: Arc<Shared>,
}

impl SyntheticHandle {
    /// Deliver one frame on the calling thread. Returns false if the frame
    /// was dropped (no queued buffer) or preview is not running.
    pub fn deliver_now(&self) -> bool {
        self.shared.deliver()
    }

    /// Buffers currently queued on the device.
    pub fn queued(&self) -> usize {
        self.shared.queue().len()
    }

    pub fn frames_delivered(&self) -> u64 {
        self.shared.frames.load(Ordering::Relaxed)
    }

    pub fn dropped_frames(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    /// Settings applied by the last `configure`, cleared on release.
    pub fn settings(&self) -> Option<PreviewSettings> {
        self.shared
            .applied
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::Acquire)
    }
}

// ----------------------------------------------------------------------------
// SyntheticCamera
// ----------------------------------------------------------------------------

struct DeliveryThread {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

pub struct SyntheticCamera {
    config: SyntheticConfig,
    shared: Arc<Shared>,
    opened: Option<CameraInfo>,
    settings: Option<PreviewSettings>,
    delivery: Option<DeliveryThread>,
    zoom: u32,
}

impl SyntheticCamera {
    pub fn new(config: SyntheticConfig) -> Self {
        Self {
            config,
            shared: Arc::new(Shared::default()),
            opened: None,
            settings: None,
            delivery: None,
            zoom: 0,
        }
    }

    /// Build from a `stub://` path with default capabilities.
    pub fn from_path(path: &str) -> Result<Self> {
        if !path.starts_with("stub://") {
            return Err(anyhow!("not a synthetic device path: {}", path));
        }
        Ok(Self::new(SyntheticConfig {
            device: path.to_string(),
            ..SyntheticConfig::default()
        }))
    }

    pub fn handle(&self) -> SyntheticHandle {
        SyntheticHandle {
            shared: self.shared.clone(),
        }
    }

    /// Settings applied by the last `configure`.
    pub fn settings(&self) -> Option<&PreviewSettings> {
        self.settings.as_ref()
    }

    fn spawn_delivery(&mut self, fps_range: FpsRange) -> Result<()> {
        let fps = fps_range.max_fps().max(1.0);
        let interval = Duration::from_secs_f32(1.0 / fps);
        let stop = Arc::new(AtomicBool::new(false));
        let shared = self.shared.clone();
        let thread_stop = stop.clone();
        let handle = std::thread::Builder::new()
            .name("synthetic-camera".to_string())
            .spawn(move || {
                while !thread_stop.load(Ordering::Acquire) {
                    std::thread::sleep(interval);
                    shared.deliver();
                }
            })
            .context("spawn synthetic delivery thread")?;
        self.delivery = Some(DeliveryThread { stop, handle });
        Ok(())
    }
}

impl CameraDevice for SyntheticCamera {
    fn name(&self) -> String {
        self.config.device.clone()
    }

    fn open(&mut self, facing: Facing) -> Result<CameraInfo> {
        let (index, &(facing, orientation)) = self
            .config
            .cameras
            .iter()
            .enumerate()
            .find(|(_, (f, _))| *f == facing)
            .ok_or_else(|| anyhow!("could not find requested {} camera", facing))?;
        let info = CameraInfo {
            id: format!("{}#{}", self.config.device, index),
            facing,
            orientation,
        };
        log::info!("SyntheticCamera: opened {} (synthetic)", info.id);
        self.opened = Some(info.clone());
        self.shared.open.store(true, Ordering::Release);
        Ok(info)
    }

    fn capabilities(&self) -> Result<DeviceCapabilities> {
        if self.opened.is_none() {
            return Err(anyhow!("{} is not open", self.config.device));
        }
        Ok(DeviceCapabilities {
            preview_sizes: self.config.preview_sizes.clone(),
            picture_sizes: self.config.picture_sizes.clone(),
            fps_ranges: self.config.fps_ranges.clone(),
            pixel_format: PixelFormat::Nv21,
            focus_modes: self.config.focus_modes.clone(),
            flash_modes: self.config.flash_modes.clone(),
        })
    }

    fn configure(&mut self, settings: &PreviewSettings) -> Result<()> {
        if self.opened.is_none() {
            return Err(anyhow!("{} is not open", self.config.device));
        }
        if !self.config.preview_sizes.contains(&settings.preview_size) {
            return Err(anyhow!(
                "preview size {} not supported by {}",
                settings.preview_size,
                self.config.device
            ));
        }
        self.settings = Some(settings.clone());
        self.shared.set_applied(Some(settings.clone()));
        Ok(())
    }

    fn recycler(&self) -> Arc<dyn BufferRecycler> {
        Arc::new(QueueRecycler(self.shared.clone()))
    }

    fn start_preview(&mut self, sink: FrameSink, buffers: Vec<PreviewBuffer>) -> Result<()> {
        let settings = self
            .settings
            .as_ref()
            .ok_or_else(|| anyhow!("{} is not configured", self.config.device))?;
        let fps_range = settings.fps_range;

        self.shared.queue().extend(buffers);
        self.shared.set_sink(Some(sink));
        if self.config.autorun {
            if let Err(err) = self.spawn_delivery(fps_range) {
                self.shared.set_sink(None);
                return Err(err);
            }
        }
        log::info!(
            "SyntheticCamera: preview started on {} ({} buffers queued)",
            self.config.device,
            self.shared.queue().len()
        );
        Ok(())
    }

    fn stop_preview(&mut self) -> Result<Vec<PreviewBuffer>> {
        if let Some(delivery) = self.delivery.take() {
            delivery.stop.store(true, Ordering::Release);
            if delivery.handle.join().is_err() {
                log::error!("SyntheticCamera: delivery thread panicked");
            }
        }
        self.shared.set_sink(None);
        let returned: Vec<PreviewBuffer> = self.shared.queue().drain(..).collect();
        log::info!(
            "SyntheticCamera: preview stopped on {} ({} buffers returned)",
            self.config.device,
            returned.len()
        );
        Ok(returned)
    }

    fn zoom(&self) -> Option<ZoomState> {
        self.config.max_zoom.map(|max| ZoomState {
            current: self.zoom,
            max,
        })
    }

    fn set_zoom(&mut self, level: u32) -> Result<()> {
        let max = self
            .config
            .max_zoom
            .ok_or_else(|| anyhow!("zoom not supported by {}", self.config.device))?;
        self.zoom = level.min(max);
        Ok(())
    }

    fn dropped_frames(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    fn release(&mut self) {
        if let Some(info) = self.opened.take() {
            log::info!("SyntheticCamera: released {}", info.id);
        }
        self.shared.open.store(false, Ordering::Release);
        self.shared.set_applied(None);
        self.settings = None;
        self.zoom = 0;
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FrameBufferPool, PixelFormat};

    fn settings(size: Size) -> PreviewSettings {
        PreviewSettings {
            preview_size: size,
            picture_size: None,
            fps_range: FpsRange::new(30000, 30000),
            format: PixelFormat::Nv21,
            rotation: Rotation::Deg0,
            display_orientation: 0,
            focus_mode: None,
            flash_mode: None,
        }
    }

    #[test]
    fn open_requires_matching_facing() {
        let mut cam = SyntheticCamera::new(SyntheticConfig {
            cameras: vec![(Facing::Back, Rotation::Deg90)],
            ..SyntheticConfig::manual()
        });
        assert!(cam.open(Facing::Front).is_err());
        let info = cam.open(Facing::Back).unwrap();
        assert_eq!(info.orientation, Rotation::Deg90);
    }

    #[test]
    fn from_path_rejects_device_nodes() {
        assert!(SyntheticCamera::from_path("/dev/video0").is_err());
        assert_eq!(
            SyntheticCamera::from_path("stub://desk").unwrap().name(),
            "stub://desk"
        );
    }

    #[test]
    fn manual_delivery_consumes_queued_buffers_and_drops_when_empty() -> Result<()> {
        let mut cam = SyntheticCamera::new(SyntheticConfig::manual());
        cam.open(Facing::Back)?;
        cam.configure(&settings(Size::new(64, 48)))?;

        let mut pool = FrameBufferPool::new(cam.recycler());
        let buffers = pool.acquire_set(2, 64 * 48 * 3 / 2 + 1)?;
        let delivered = Arc::new(Mutex::new(Vec::new()));
        let sink_out = delivered.clone();
        let sink: FrameSink = Arc::new(move |buffer: PreviewBuffer| {
            sink_out.lock().unwrap().push(buffer);
        });
        cam.start_preview(sink, buffers)?;

        let handle = cam.handle();
        assert!(handle.deliver_now());
        assert!(handle.deliver_now());
        assert!(!handle.deliver_now(), "no buffer left to fill");
        assert_eq!(handle.dropped_frames(), 1);

        // Requeue one through the recycler and stop: it comes back.
        let buffer = delivered.lock().unwrap().pop().unwrap();
        cam.recycler().requeue(buffer);
        let returned = cam.stop_preview()?;
        assert_eq!(returned.len(), 1);
        assert!(!handle.deliver_now(), "sink detached after stop");
        Ok(())
    }

    #[test]
    fn configure_rejects_unsupported_size() {
        let mut cam = SyntheticCamera::new(SyntheticConfig::manual());
        cam.open(Facing::Back).unwrap();
        assert!(cam.configure(&settings(Size::new(999, 999))).is_err());
    }
}
