//! Background detection worker.
//!
//! One dedicated thread per run waits on the `FrameSlot`, runs the detector
//! on the newest frame, and recycles the frame's buffer afterwards whatever
//! the detector did. The detector itself outlives runs and is released once,
//! after the last run's thread has exited.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::detect::{DetectionSink, Detections, Detector};
use crate::error::{CaptureError, CaptureResult};
use crate::frame::{FrameBufferPool, FrameDescriptor, FrameSlot, RecycleReason};

type SharedDetector = Arc<Mutex<Box<dyn Detector>>>;

#[derive(Default)]
struct WorkerCounters {
    processed: AtomicU64,
    failed: AtomicU64,
    last_sequence_id: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WorkerStats {
    /// Frames the detector completed successfully.
    pub processed: u64,
    /// Frames where the detector returned an error or panicked.
    pub failed: u64,
    /// Sequence id of the last frame handed to the detector.
    pub last_sequence_id: u64,
}

struct RunningWorker {
    slot: Arc<FrameSlot>,
    handle: JoinHandle<()>,
    // Disconnects when the thread exits, including by unwinding.
    exited: mpsc::Receiver<()>,
}

pub struct CaptureWorker {
    detector: SharedDetector,
    detector_name: &'static str,
    sink: Option<Arc<dyn DetectionSink>>,
    counters: Arc<WorkerCounters>,
    running: Option<RunningWorker>,
    released: bool,
    shutdown_warn_after: Duration,
}

impl CaptureWorker {
    pub fn new(detector: Box<dyn Detector>) -> Self {
        Self {
            detector_name: detector.name(),
            detector: Arc::new(Mutex::new(detector)),
            sink: None,
            counters: Arc::new(WorkerCounters::default()),
            running: None,
            released: false,
            shutdown_warn_after: Duration::from_secs(2),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn DetectionSink>) -> Self {
        self.set_sink(sink);
        self
    }

    /// Takes effect on the next `start`.
    pub fn set_sink(&mut self, sink: Arc<dyn DetectionSink>) {
        self.sink = Some(sink);
    }

    pub fn with_shutdown_warning(mut self, after: Duration) -> Self {
        self.shutdown_warn_after = after;
        self
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Counters for the current run, or the last one once stopped.
    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            processed: self.counters.processed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            last_sequence_id: self.counters.last_sequence_id.load(Ordering::Relaxed),
        }
    }

    /// Spawn the worker thread for one run. Counters restart from zero.
    pub fn start(&mut self, slot: Arc<FrameSlot>, pool: Arc<FrameBufferPool>) -> CaptureResult<()> {
        if self.released {
            return Err(CaptureError::InvalidState("released"));
        }
        if self.running.is_some() {
            return Err(CaptureError::InvalidState("running"));
        }

        self.counters = Arc::new(WorkerCounters::default());
        let (exit_tx, exited) = mpsc::channel::<()>();
        let detector = self.detector.clone();
        let sink = self.sink.clone();
        let counters = self.counters.clone();
        let thread_slot = slot.clone();
        let handle = std::thread::Builder::new()
            .name("frame-worker".to_string())
            .spawn(move || {
                let _exit = exit_tx;
                run_loop(&thread_slot, &pool, &detector, sink.as_deref(), &counters);
            })
            .map_err(|e| CaptureError::ThreadLifecycle(format!("spawn frame worker: {}", e)))?;

        log::debug!("CaptureWorker: started with detector {}", self.detector_name);
        self.running = Some(RunningWorker {
            slot,
            handle,
            exited,
        });
        Ok(())
    }

    /// Cancel the slot wait and join the thread. No-op when not running.
    ///
    /// An in-flight detection call is awaited, not interrupted.
    pub fn stop(&mut self) -> CaptureResult<()> {
        let Some(running) = self.running.take() else {
            return Ok(());
        };
        running.slot.cancel();

        let started = Instant::now();
        if let Err(RecvTimeoutError::Timeout) = running.exited.recv_timeout(self.shutdown_warn_after)
        {
            log::warn!(
                "CaptureWorker: detector {} still busy after {:?}, waiting",
                self.detector_name,
                self.shutdown_warn_after
            );
        }
        let joined = running.handle.join();
        log::debug!("CaptureWorker: joined after {:?}", started.elapsed());

        joined.map_err(|payload| {
            CaptureError::ThreadLifecycle(format!(
                "frame worker panicked: {}",
                panic_message(payload.as_ref())
            ))
        })
    }

    /// Release the detector. Only valid once the thread has been joined.
    ///
    /// Repeated calls are no-ops.
    pub fn release(&mut self) -> CaptureResult<()> {
        if self.running.is_some() {
            return Err(CaptureError::InvalidState("running"));
        }
        if self.released {
            return Ok(());
        }
        self.released = true;
        let mut detector = self.detector.lock().unwrap_or_else(PoisonError::into_inner);
        detector.release();
        log::info!("CaptureWorker: detector {} released", self.detector_name);
        Ok(())
    }
}

impl Drop for CaptureWorker {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            log::error!("CaptureWorker: {}", err);
        }
    }
}

// ----------------------------------------------------------------------------
// Worker loop
// ----------------------------------------------------------------------------

/// Owns a frame for the duration of one detection call and recycles its
/// buffer on drop, so every exit path returns the buffer to the device.
struct RecycleOnDrop<'a> {
    pool: &'a FrameBufferPool,
    frame: Option<FrameDescriptor>,
}

impl<'a> RecycleOnDrop<'a> {
    fn new(pool: &'a FrameBufferPool, frame: FrameDescriptor) -> Self {
        Self {
            pool,
            frame: Some(frame),
        }
    }

    fn frame(&self) -> Option<&FrameDescriptor> {
        self.frame.as_ref()
    }
}

impl Drop for RecycleOnDrop<'_> {
    fn drop(&mut self) {
        if let Some(frame) = self.frame.take() {
            self.pool.recycle(frame.into_payload(), RecycleReason::Processed);
        }
    }
}

fn run_loop(
    slot: &FrameSlot,
    pool: &FrameBufferPool,
    detector: &SharedDetector,
    sink: Option<&dyn DetectionSink>,
    counters: &WorkerCounters,
) {
    while let Some(frame) = slot.take_blocking() {
        let guard = RecycleOnDrop::new(pool, frame);
        let Some(frame) = guard.frame() else {
            continue;
        };
        let info = frame.info();
        counters
            .last_sequence_id
            .store(info.sequence_id, Ordering::Relaxed);

        match detect(detector, frame) {
            Ok(detections) => {
                counters.processed.fetch_add(1, Ordering::Relaxed);
                log::trace!(
                    "CaptureWorker: frame #{} -> {} detections",
                    info.sequence_id,
                    detections.len()
                );
                if let Some(sink) = sink {
                    let delivered = panic::catch_unwind(AssertUnwindSafe(|| {
                        sink.on_detections(&info, &detections)
                    }));
                    if let Err(payload) = delivered {
                        log::warn!(
                            "CaptureWorker: detection sink panicked on frame #{}: {}",
                            info.sequence_id,
                            panic_message(payload.as_ref())
                        );
                    }
                }
            }
            Err(err) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                log::warn!("CaptureWorker: {}", err);
            }
        }
    }
    log::debug!("CaptureWorker: cancelled, exiting");
}

/// One detection call. Errors and panics both come back as `CaptureError::Detection`.
fn detect(detector: &SharedDetector, frame: &FrameDescriptor) -> CaptureResult<Detections> {
    let sequence_id = frame.sequence_id();
    let mut detector = detector.lock().unwrap_or_else(PoisonError::into_inner);
    match panic::catch_unwind(AssertUnwindSafe(|| detector.process(frame))) {
        Ok(Ok(detections)) => Ok(detections),
        Ok(Err(err)) => Err(CaptureError::Detection {
            sequence_id,
            message: format!("{:#}", err),
        }),
        Err(payload) => Err(CaptureError::Detection {
            sequence_id,
            message: format!("detector panicked: {}", panic_message(payload.as_ref())),
        }),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::StubDetector;
    use crate::frame::pool::tests::CollectingRecycler;
    use crate::frame::{BufferState, FrameTagger, PixelFormat, PreviewBuffer, Rotation, Size};
    use anyhow::anyhow;
    use std::sync::mpsc::Receiver;

    struct Rig {
        recycler: Arc<CollectingRecycler>,
        pool: Arc<FrameBufferPool>,
        slot: Arc<FrameSlot>,
        buffers: Vec<PreviewBuffer>,
        tagger: FrameTagger,
    }

    fn rig(count: usize) -> Rig {
        let recycler = Arc::new(CollectingRecycler::default());
        let mut pool = FrameBufferPool::new(recycler.clone());
        let buffers = pool.acquire_set(count, 32).unwrap();
        let pool = Arc::new(pool);
        Rig {
            recycler,
            slot: Arc::new(FrameSlot::new(pool.clone())),
            pool,
            buffers,
            tagger: FrameTagger::new(Size::new(4, 4), PixelFormat::Nv21, Rotation::Deg0),
        }
    }

    impl Rig {
        fn publish(&mut self) {
            let buffer = self.buffers.remove(0);
            self.slot.publish(self.tagger.tag(buffer));
        }

        fn wait_for_recycled(&self, count: usize) {
            let deadline = Instant::now() + Duration::from_secs(5);
            while self.recycler.queue.lock().unwrap().len() < count {
                assert!(Instant::now() < deadline, "timed out waiting for recycle");
                std::thread::sleep(Duration::from_millis(2));
            }
        }
    }

    fn gate() -> (mpsc::Sender<()>, Arc<Mutex<Receiver<()>>>) {
        let (tx, rx) = mpsc::channel();
        (tx, Arc::new(Mutex::new(rx)))
    }

    #[test]
    fn processes_only_newest_of_a_burst() {
        let mut rig = rig(5);
        for _ in 0..5 {
            rig.publish();
        }
        let detector = StubDetector::new();
        let probe = detector.probe();
        let mut worker = CaptureWorker::new(Box::new(detector));
        worker.start(rig.slot.clone(), rig.pool.clone()).unwrap();

        rig.wait_for_recycled(5);
        worker.stop().unwrap();

        assert_eq!(probe.processed(), vec![5]);
        let stats = rig.pool.stats();
        assert_eq!(stats.evicted, 4);
        assert_eq!(stats.processed, 1);
        assert_eq!(rig.pool.count_in(BufferState::Queued), 5);
    }

    #[test]
    fn detection_errors_and_panics_do_not_stop_the_loop() {
        let mut rig = rig(3);
        let detector = StubDetector::new().with_script(|info| match info.sequence_id {
            1 => Err(anyhow!("decoder choked")),
            2 => panic!("detector bug"),
            _ => Ok(()),
        });
        let probe = detector.probe();
        let mut worker = CaptureWorker::new(Box::new(detector));
        worker.start(rig.slot.clone(), rig.pool.clone()).unwrap();

        for expected in 1..=3 {
            rig.publish();
            rig.wait_for_recycled(expected);
        }
        worker.stop().unwrap();

        assert_eq!(probe.processed(), vec![1, 2, 3]);
        assert_eq!(
            worker.stats(),
            WorkerStats {
                processed: 1,
                failed: 2,
                last_sequence_id: 3
            }
        );
        assert_eq!(rig.pool.stats().processed, 3);
    }

    #[test]
    fn stop_waits_for_in_flight_detection() {
        let mut rig = rig(1);
        let (open_gate, gate_rx) = gate();
        let (entered_tx, entered_rx) = mpsc::channel();
        let detector = StubDetector::new().with_script(move |_| {
            entered_tx.send(()).ok();
            gate_rx.lock().unwrap().recv().ok();
            Ok(())
        });
        let mut worker = CaptureWorker::new(Box::new(detector))
            .with_shutdown_warning(Duration::from_millis(10));
        worker.start(rig.slot.clone(), rig.pool.clone()).unwrap();

        rig.publish();
        entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let opener = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            open_gate.send(()).ok();
        });
        worker.stop().unwrap();
        opener.join().unwrap();

        // Buffer came back even though cancellation arrived mid-call.
        assert_eq!(rig.recycler.queue.lock().unwrap().len(), 1);
        assert!(!worker.is_running());
    }

    #[test]
    fn stop_twice_is_a_no_op() {
        let rig = rig(1);
        let mut worker = CaptureWorker::new(Box::new(StubDetector::new()));
        worker.start(rig.slot.clone(), rig.pool.clone()).unwrap();
        worker.stop().unwrap();
        worker.stop().unwrap();
    }

    #[test]
    fn release_requires_stopped_worker_and_runs_once() {
        let rig = rig(1);
        let detector = StubDetector::new();
        let probe = detector.probe();
        let mut worker = CaptureWorker::new(Box::new(detector));
        worker.start(rig.slot.clone(), rig.pool.clone()).unwrap();

        assert!(matches!(
            worker.release(),
            Err(CaptureError::InvalidState(_))
        ));
        worker.stop().unwrap();
        worker.release().unwrap();
        worker.release().unwrap();
        assert_eq!(probe.releases(), 1);
        assert!(matches!(
            worker.start(rig.slot.clone(), rig.pool.clone()),
            Err(CaptureError::InvalidState("released"))
        ));
    }
}
