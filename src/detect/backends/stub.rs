use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Result;

use crate::detect::backend::Detector;
use crate::detect::result::Detections;
use crate::frame::{FrameDescriptor, FrameInfo};

type Script = Box<dyn FnMut(&FrameInfo) -> Result<()> + Send>;

/// Sequence ids kept by default; older ids fall off the front.
pub const DEFAULT_HISTORY: usize = 1024;

/// Observable counters for a `StubDetector` that has been moved into a session.
#[derive(Clone)]
pub struct StubProbe {
    history: Arc<Mutex<VecDeque<u64>>>,
    limit: usize,
    total: Arc<AtomicU64>,
    releases: Arc<AtomicUsize>,
}

impl StubProbe {
    fn with_limit(limit: usize) -> Self {
        Self {
            history: Arc::new(Mutex::new(VecDeque::new())),
            limit,
            total: Arc::new(AtomicU64::new(0)),
            releases: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn record(&self, sequence_id: u64) {
        self.total.fetch_add(1, Ordering::SeqCst);
        if self.limit == 0 {
            return;
        }
        let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        if history.len() == self.limit {
            history.pop_front();
        }
        history.push_back(sequence_id);
    }

    /// Most recent sequence ids handed to `process`, in call order.
    pub fn processed(&self) -> Vec<u64> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .copied()
            .collect()
    }

    /// Frames handed to `process`, including those no longer in the history.
    pub fn frames_seen(&self) -> u64 {
        self.total.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }
}

/// Stub detector for testing and demos. Finds nothing; records what it saw.
///
/// An optional script runs before each frame is recorded and can fail,
/// panic or block to exercise the worker's error paths.
pub struct StubDetector {
    probe: StubProbe,
    script: Option<Script>,
}

impl StubDetector {
    pub fn new() -> Self {
        Self::with_history(DEFAULT_HISTORY)
    }

    /// Keep at most `limit` sequence ids; 0 keeps only the frame count.
    pub fn with_history(limit: usize) -> Self {
        Self {
            probe: StubProbe::with_limit(limit),
            script: None,
        }
    }

    pub fn with_script<F>(mut self, script: F) -> Self
    where
        F: FnMut(&FrameInfo) -> Result<()> + Send + 'static,
    {
        self.script = Some(Box::new(script));
        self
    }

    pub fn probe(&self) -> StubProbe {
        self.probe.clone()
    }
}

impl Default for StubDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl Detector for StubDetector {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn process(&mut self, frame: &FrameDescriptor) -> Result<Detections> {
        let info = frame.info();
        self.probe.record(info.sequence_id);
        if let Some(script) = self.script.as_mut() {
            script(&info)?;
        }
        Ok(Detections::default())
    }

    fn release(&mut self) {
        self.probe.releases.fetch_add(1, Ordering::SeqCst);
    }
}
