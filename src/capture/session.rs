//! Capture session state machine.
//!
//! ```text
//!   Idle --start--> Starting --> Running --stop--> Stopping --> Idle
//!     |                |                                         |
//!     |                +--(device/buffer/thread error)--> Idle   |
//!     +--release--> Released <--------------release--------------+
//! ```
//!
//! All transitions run under one session lock. The delivery callback and the
//! worker never take it; they only touch the run's pool and slot.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::capture::worker::{CaptureWorker, WorkerStats};
use crate::config::CaptureConfig;
use crate::detect::{DetectionSink, Detector};
use crate::device::{
    compute_rotation, compute_zoom, CameraDevice, CameraInfo, CameraRotation, FrameSink,
    PreviewSettings,
};
use crate::error::{CaptureError, CaptureResult};
use crate::frame::{
    BufferState, Facing, FrameBufferPool, FrameSlot, FrameTagger, PreviewBuffer, Size,
};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SessionState {
    #[default]
    Idle,
    Starting,
    Running,
    Stopping,
    Released,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Starting => "starting",
            SessionState::Running => "running",
            SessionState::Stopping => "stopping",
            SessionState::Released => "released",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counters for the current run, or the last completed one.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Frames the device handed to the delivery callback.
    pub delivered: u64,
    /// Frames overwritten in the slot before the worker took them.
    pub evicted: u64,
    /// Frames the worker took and recycled, whatever the detector did.
    pub processed: u64,
    pub detection_failures: u64,
    /// Frames the device skipped because no buffer was queued (device lifetime).
    pub dropped: u64,
    /// Buffers not yet released by the pool.
    pub outstanding: usize,
}

/// Everything that exists only between Starting and Stopping.
struct ActiveRun {
    camera: CameraInfo,
    preview_size: Size,
    rotation: CameraRotation,
    pool: Arc<FrameBufferPool>,
    slot: Arc<FrameSlot>,
    tagger: Arc<FrameTagger>,
}

impl ActiveRun {
    fn stats(&self, worker: WorkerStats, dropped: u64) -> SessionStats {
        let pool = self.pool.stats();
        SessionStats {
            delivered: self.tagger.delivered(),
            evicted: pool.evicted,
            processed: pool.processed,
            detection_failures: worker.failed,
            dropped,
            outstanding: pool.outstanding,
        }
    }
}

struct SessionInner {
    state: SessionState,
    device: Box<dyn CameraDevice>,
    worker: CaptureWorker,
    run: Option<ActiveRun>,
    preview_size: Option<Size>,
    last_stats: SessionStats,
}

/// Owns the camera device, the preview buffers and the detection worker.
pub struct CaptureSession {
    config: CaptureConfig,
    inner: Mutex<SessionInner>,
}

impl CaptureSession {
    /// Validate `config` and build an Idle session.
    pub fn new(
        config: CaptureConfig,
        device: Box<dyn CameraDevice>,
        detector: Box<dyn Detector>,
    ) -> CaptureResult<Self> {
        config.validate()?;
        let worker = CaptureWorker::new(detector).with_shutdown_warning(config.shutdown_warn_after);
        Ok(Self {
            config,
            inner: Mutex::new(SessionInner {
                state: SessionState::Idle,
                device,
                worker,
                run: None,
                preview_size: None,
                last_stats: SessionStats::default(),
            }),
        })
    }

    /// Forward successful detection results to `sink`.
    pub fn with_sink(mut self, sink: Arc<dyn DetectionSink>) -> Self {
        self.inner
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .worker
            .set_sink(sink);
        self
    }

    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    pub fn facing(&self) -> Facing {
        self.config.facing
    }

    /// Negotiated preview size of the current or most recent run.
    pub fn preview_size(&self) -> Option<Size> {
        self.lock().preview_size
    }

    /// Camera opened by the current run.
    pub fn camera(&self) -> Option<CameraInfo> {
        self.lock().run.as_ref().map(|run| run.camera.clone())
    }

    /// Rotation stamped into frames of the current run.
    pub fn rotation(&self) -> Option<CameraRotation> {
        self.lock().run.as_ref().map(|run| run.rotation)
    }

    pub fn stats(&self) -> SessionStats {
        let inner = self.lock();
        match inner.run.as_ref() {
            Some(run) => run.stats(inner.worker.stats(), inner.device.dropped_frames()),
            None => inner.last_stats,
        }
    }

    /// Open the camera, negotiate, prime buffers and launch the worker.
    ///
    /// A no-op while Running. Any failure releases the camera and leaves the
    /// session Idle.
    pub fn start(&self) -> CaptureResult<()> {
        let mut inner = self.lock();
        match inner.state {
            SessionState::Idle => {}
            SessionState::Running => {
                log::debug!("CaptureSession: start while running ignored");
                return Ok(());
            }
            other => return Err(CaptureError::InvalidState(other.as_str())),
        }

        inner.state = SessionState::Starting;
        match self.start_run(&mut inner) {
            Ok(run) => {
                log::info!(
                    "CaptureSession: running {} at {} (rotation {}, {} buffers of {} bytes)",
                    run.camera.id,
                    run.preview_size,
                    run.rotation.frame.degrees(),
                    run.pool.allocated(),
                    run.pool.buffer_len()
                );
                inner.preview_size = Some(run.preview_size);
                inner.run = Some(run);
                inner.state = SessionState::Running;
                Ok(())
            }
            Err(err) => {
                log::warn!("CaptureSession: start failed: {}", err);
                inner.state = SessionState::Idle;
                Err(err)
            }
        }
    }

    /// Cancel and join the worker, stop the device and free the buffers.
    ///
    /// A no-op unless Running. Device and worker failures are logged and
    /// teardown continues.
    pub fn stop(&self) -> CaptureResult<()> {
        let mut inner = self.lock();
        if inner.state != SessionState::Running {
            log::debug!("CaptureSession: stop while {} ignored", inner.state);
            return Ok(());
        }
        Self::stop_run(&mut inner);
        Ok(())
    }

    /// Stop if running, then release the detector. Terminal.
    ///
    /// Calling it again is a no-op.
    pub fn release(&self) -> CaptureResult<()> {
        let mut inner = self.lock();
        match inner.state {
            SessionState::Released => return Ok(()),
            SessionState::Running => Self::stop_run(&mut inner),
            _ => {}
        }
        inner.worker.release()?;
        inner.state = SessionState::Released;
        log::info!("CaptureSession: released");
        Ok(())
    }

    /// Apply a pinch `scale` to the camera zoom and return the new level.
    ///
    /// Returns 0 when the camera cannot zoom.
    pub fn zoom(&self, scale: f32) -> CaptureResult<u32> {
        let mut inner = self.lock();
        if inner.state != SessionState::Running {
            return Err(CaptureError::InvalidState(inner.state.as_str()));
        }
        let Some(state) = inner.device.zoom() else {
            log::warn!("CaptureSession: zoom is not supported on this camera");
            return Ok(0);
        };
        let level = compute_zoom(state.current, state.max, scale);
        inner
            .device
            .set_zoom(level)
            .map_err(CaptureError::device_from)?;
        Ok(level)
    }

    // ------------------------------------------------------------------------
    // Transitions
    // ------------------------------------------------------------------------

    fn start_run(&self, inner: &mut SessionInner) -> CaptureResult<ActiveRun> {
        let camera = inner
            .device
            .open(self.config.facing)
            .map_err(CaptureError::device_from)?;
        match self.prepare_run(inner, camera) {
            Ok(run) => Ok(run),
            Err(err) => {
                inner.device.release();
                Err(err)
            }
        }
    }

    fn prepare_run(&self, inner: &mut SessionInner, camera: CameraInfo) -> CaptureResult<ActiveRun> {
        let SessionInner { device, worker, .. } = inner;
        let cfg = &self.config;

        let caps = device.capabilities().map_err(CaptureError::device_from)?;
        let negotiated = device
            .negotiate(cfg.preview_size, cfg.requested_fps)
            .map_err(CaptureError::device_from)?;
        let preview_size = negotiated.sizes.preview;
        let rotation = compute_rotation(cfg.display_rotation, &camera);

        let settings = PreviewSettings {
            preview_size,
            picture_size: negotiated.sizes.picture,
            fps_range: negotiated.fps_range,
            format: caps.pixel_format,
            rotation: rotation.frame,
            display_orientation: rotation.display_orientation,
            focus_mode: supported("focus", cfg.focus_mode, &caps.focus_modes),
            flash_mode: supported("flash", cfg.flash_mode, &caps.flash_modes),
        };
        device
            .configure(&settings)
            .map_err(CaptureError::device_from)?;

        let buffer_len = caps.pixel_format.buffer_len(preview_size).ok_or_else(|| {
            CaptureError::BufferAllocation(format!(
                "{} {:?} frame does not fit in memory",
                preview_size, caps.pixel_format
            ))
        })?;
        let mut pool = FrameBufferPool::new(device.recycler());
        let buffers = pool.acquire_set(cfg.buffer_count, buffer_len)?;
        let pool = Arc::new(pool);
        let slot = Arc::new(FrameSlot::new(pool.clone()));
        let tagger = Arc::new(FrameTagger::new(preview_size, caps.pixel_format, rotation.frame));

        let sink = delivery_sink(pool.clone(), slot.clone(), tagger.clone());
        if let Err(err) = device.start_preview(sink, buffers) {
            let returned = device.stop_preview().unwrap_or_default();
            pool.teardown(returned);
            return Err(CaptureError::device_from(err.context("start preview")));
        }

        if let Err(err) = worker.start(slot.clone(), pool.clone()) {
            let mut returned = device.stop_preview().unwrap_or_default();
            returned.extend(slot.drain().map(|frame| frame.into_payload()));
            pool.teardown(returned);
            return Err(err);
        }

        Ok(ActiveRun {
            camera,
            preview_size,
            rotation,
            pool,
            slot,
            tagger,
        })
    }

    /// Running -> Stopping -> Idle. Never fails; problems are logged.
    fn stop_run(inner: &mut SessionInner) {
        inner.state = SessionState::Stopping;
        let Some(run) = inner.run.take() else {
            inner.state = SessionState::Idle;
            return;
        };

        if let Err(err) = inner.worker.stop() {
            log::error!("CaptureSession: {}", err);
        }

        let mut returned = match inner.device.stop_preview() {
            Ok(buffers) => buffers,
            Err(err) => {
                log::warn!("CaptureSession: stop preview failed: {:#}", err);
                Vec::new()
            }
        };
        if let Some(frame) = run.slot.drain() {
            returned.push(frame.into_payload());
        }
        let report = run.pool.teardown(returned);
        inner.last_stats = run.stats(inner.worker.stats(), inner.device.dropped_frames());
        inner.device.release();
        inner.state = SessionState::Idle;

        log::info!(
            "CaptureSession: stopped after {} frames ({} evicted, {} processed, {} buffers reclaimed)",
            inner.last_stats.delivered,
            inner.last_stats.evicted,
            inner.last_stats.processed,
            report.reclaimed
        );
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            log::error!("CaptureSession: release on drop failed: {}", err);
        }
    }
}

/// Delivery callback for one run: identify the buffer, tag it, publish it.
fn delivery_sink(
    pool: Arc<FrameBufferPool>,
    slot: Arc<FrameSlot>,
    tagger: Arc<FrameTagger>,
) -> FrameSink {
    Arc::new(move |buffer: PreviewBuffer| {
        let Some(info) = pool.lookup(&buffer) else {
            log::warn!(
                "CaptureSession: device delivered unknown buffer {:?}, dropped",
                buffer.id()
            );
            return;
        };
        if info.state != BufferState::Queued {
            log::warn!(
                "CaptureSession: buffer {:?} delivered while {:?}",
                info.id,
                info.state
            );
        }
        let frame = tagger.tag(buffer);
        log::trace!("CaptureSession: frame #{} delivered", frame.sequence_id());
        slot.publish(frame);
    })
}

/// Keep a requested mode only if the camera lists it.
fn supported<M>(what: &str, requested: Option<M>, available: &[M]) -> Option<M>
where
    M: Copy + PartialEq + fmt::Display,
{
    let mode = requested?;
    if available.contains(&mode) {
        Some(mode)
    } else {
        log::info!(
            "CaptureSession: camera {} mode \"{}\" is not supported on this device",
            what,
            mode
        );
        None
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FlashMode, FocusMode};
    use crate::detect::StubDetector;
    use crate::device::{SyntheticCamera, SyntheticConfig, SyntheticHandle};
    use crate::frame::Rotation;

    fn session(config: CaptureConfig, device: SyntheticConfig) -> (CaptureSession, SyntheticHandle) {
        let camera = SyntheticCamera::new(device);
        let handle = camera.handle();
        let session =
            CaptureSession::new(config, Box::new(camera), Box::new(StubDetector::new())).unwrap();
        (session, handle)
    }

    #[test]
    fn new_rejects_invalid_config() {
        let config = CaptureConfig {
            requested_fps: 0.0,
            ..CaptureConfig::default()
        };
        let result = CaptureSession::new(
            config,
            Box::new(SyntheticCamera::new(SyntheticConfig::manual())),
            Box::new(StubDetector::new()),
        );
        assert!(matches!(result, Err(CaptureError::Configuration(_))));
    }

    #[test]
    fn start_negotiates_and_applies_supported_modes() {
        let config = CaptureConfig::builder()
            .preview_size(120, 70)
            .display_rotation(Rotation::Deg90)
            .focus_mode(FocusMode::ContinuousPicture)
            .flash_mode(FlashMode::RedEye)
            .build()
            .unwrap();
        let (session, handle) = session(config, SyntheticConfig::manual());
        session.start().unwrap();

        assert_eq!(session.state(), SessionState::Running);
        assert_eq!(session.preview_size(), Some(Size::new(128, 72)));
        // Back camera mounted at 90 with the display at 90.
        assert_eq!(session.rotation().unwrap().frame, Rotation::Deg0);

        let applied = handle.settings().unwrap();
        assert_eq!(applied.focus_mode, Some(FocusMode::ContinuousPicture));
        assert_eq!(applied.flash_mode, None);
        assert_eq!(applied.picture_size, Some(Size::new(1280, 720)));

        session.stop().unwrap();
        assert_eq!(session.state(), SessionState::Idle);
        assert!(!handle.is_open());
    }

    #[test]
    fn front_camera_preview_orientation_is_mirrored() {
        let config = CaptureConfig::builder()
            .facing(Facing::Front)
            .display_rotation(Rotation::Deg90)
            .build()
            .unwrap();
        let (session, handle) = session(config, SyntheticConfig::manual());
        session.start().unwrap();

        // Front sensor at 270 plus display 90.
        assert_eq!(session.rotation().unwrap().frame, Rotation::Deg0);
        assert_eq!(handle.settings().unwrap().display_orientation, 0);
        session.release().unwrap();
    }

    #[test]
    fn zoom_requires_running_session() {
        let (session, _handle) = session(CaptureConfig::default(), SyntheticConfig::manual());
        assert!(matches!(
            session.zoom(2.0),
            Err(CaptureError::InvalidState("idle"))
        ));
        session.start().unwrap();
        assert_eq!(session.zoom(2.0).unwrap(), 6);
        assert_eq!(session.zoom(0.5).unwrap(), 3);
        session.stop().unwrap();
    }

    #[test]
    fn zoom_without_support_returns_zero() {
        let (session, _handle) = session(
            CaptureConfig::default(),
            SyntheticConfig {
                max_zoom: None,
                ..SyntheticConfig::manual()
            },
        );
        session.start().unwrap();
        assert_eq!(session.zoom(3.0).unwrap(), 0);
    }

    #[test]
    fn start_twice_keeps_the_running_session() {
        let (session, handle) = session(CaptureConfig::default(), SyntheticConfig::manual());
        session.start().unwrap();
        session.start().unwrap();
        assert_eq!(handle.queued(), 4);
        session.stop().unwrap();
        assert_eq!(handle.queued(), 0);
    }

    #[test]
    fn drop_stops_a_running_session() {
        let (session, handle) = session(CaptureConfig::default(), SyntheticConfig::manual());
        session.start().unwrap();
        drop(session);
        assert!(!handle.is_open());
        assert!(!handle.deliver_now());
    }
}
