//! Cross-thread control of a running pipeline.

use crate::core::stage::StageMonitor;
use crossbeam_channel::{bounded, Receiver, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::debug;

/// Flags shared between a pipeline thread and its handle
#[derive(Debug)]
pub(crate) struct PipelineControl {
    stop: AtomicBool,
    paused: AtomicBool,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
}

impl PipelineControl {
    pub(crate) fn new() -> Self {
        let (wake_tx, wake_rx) = bounded(1);
        Self {
            stop: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            wake_tx,
            wake_rx,
        }
    }

    pub(crate) fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.wake();
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub(crate) fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
        if !paused {
            self.wake();
        }
    }

    pub(crate) fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Wait up to `duration`, returning early on stop or resume.
    pub(crate) fn idle(&self, duration: Duration) {
        let _ = self.wake_rx.recv_timeout(duration);
    }

    fn wake(&self) {
        let _ = self.wake_tx.try_send(());
    }
}

/// Handle to a pipeline running on its own thread
#[derive(Debug)]
pub struct PipelineHandle {
    name: String,
    control: Arc<PipelineControl>,
    monitors: Vec<Arc<StageMonitor>>,
    thread: Option<JoinHandle<()>>,
}

impl PipelineHandle {
    pub(crate) fn new(
        name: String,
        control: Arc<PipelineControl>,
        monitors: Vec<Arc<StageMonitor>>,
        thread: JoinHandle<()>,
    ) -> Self {
        Self {
            name,
            control,
            monitors,
            thread: Some(thread),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ask the pipeline to stop after the object in flight.
    pub fn stop(&self) {
        debug!(pipeline = %self.name, "Stop requested");
        self.control.stop();
    }

    /// Pausing takes effect between objects.
    pub fn set_paused(&self, paused: bool) {
        self.control.set_paused(paused);
    }

    pub fn is_paused(&self) -> bool {
        self.control.is_paused()
    }

    /// The pipeline thread has exited
    pub fn is_terminated(&self) -> bool {
        self.thread.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// The thread has exited and every stage reports down
    pub fn is_down(&self) -> bool {
        self.is_terminated() && self.monitors.iter().all(|m| m.is_down())
    }

    pub fn monitors(&self) -> &[Arc<StageMonitor>] {
        &self.monitors
    }

    /// Wait for the pipeline thread to exit.
    pub fn join(mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
