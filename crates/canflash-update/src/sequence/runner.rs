//! Background execution of update phases

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use super::UpdateOrchestrator;
use crate::device_info::DeviceInfos;
use crate::error::{UpdateError, UpdateResult};

/// One phase to run in the background
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sequence {
    ActivateFlashloader,
    ReadDeviceInfo,
    /// Update in the given node order
    Update(Vec<usize>),
    ResetSystem,
}

/// Clears the running flag when the sequence task ends, panics included
struct RunningGuard(Arc<AtomicBool>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Runs one sequence at a time on a tokio task
///
/// Must be used from within a tokio runtime.
pub struct SequenceRunner {
    orchestrator: Arc<UpdateOrchestrator>,
    task: Mutex<Option<JoinHandle<UpdateResult<()>>>>,
    running: Arc<AtomicBool>,
    last_result: Arc<Mutex<Option<UpdateResult<()>>>>,
}

impl SequenceRunner {
    pub fn new(orchestrator: Arc<UpdateOrchestrator>) -> Self {
        Self {
            orchestrator,
            task: Mutex::new(None),
            running: Arc::new(AtomicBool::new(false)),
            last_result: Arc::new(Mutex::new(None)),
        }
    }

    pub fn orchestrator(&self) -> &Arc<UpdateOrchestrator> {
        &self.orchestrator
    }

    pub fn start_activate_flashloader(&self) -> UpdateResult<()> {
        self.start(Sequence::ActivateFlashloader)
    }

    pub fn start_read_device_info(&self) -> UpdateResult<()> {
        self.start(Sequence::ReadDeviceInfo)
    }

    pub fn start_update(&self, order: Vec<usize>) -> UpdateResult<()> {
        self.start(Sequence::Update(order))
    }

    pub fn start_reset(&self) -> UpdateResult<()> {
        self.start(Sequence::ResetSystem)
    }

    /// Start `sequence`; fails with [`UpdateError::Busy`] while one is running
    pub fn start(&self, sequence: Sequence) -> UpdateResult<()> {
        let mut task = self.task.lock();
        if self.running.load(Ordering::SeqCst) {
            return Err(UpdateError::Busy);
        }
        // Drop an abort left over from the previous run
        self.orchestrator.clear_abort()?;
        self.running.store(true, Ordering::SeqCst);
        *self.last_result.lock() = None;

        let orchestrator = Arc::clone(&self.orchestrator);
        let last_result = Arc::clone(&self.last_result);
        let running = RunningGuard(Arc::clone(&self.running));
        debug!(?sequence, "Starting sequence");
        *task = Some(tokio::spawn(async move {
            let _running = running;
            let result = match &sequence {
                Sequence::ActivateFlashloader => orchestrator.activate_flashloader().await,
                Sequence::ReadDeviceInfo => orchestrator.read_device_info().await,
                Sequence::Update(order) => orchestrator.update(order).await,
                Sequence::ResetSystem => orchestrator.reset_system().await,
            };
            if let Err(e) = &result {
                error!(?sequence, error = %e, "Sequence failed");
            }
            *last_result.lock() = Some(result.clone());
            result
        }));
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Outcome of the last sequence
    ///
    /// [`UpdateError::Busy`] while a sequence is running; `Ok` if none ran.
    pub fn result(&self) -> UpdateResult<()> {
        if self.is_running() {
            return Err(UpdateError::Busy);
        }
        self.last_result.lock().clone().unwrap_or(Ok(()))
    }

    /// Wait for the running sequence to end
    ///
    /// [`is_running`](Self::is_running) and [`result`](Self::result) keep
    /// reporting the running sequence while a join is pending.
    pub async fn join(&self) -> UpdateResult<()> {
        let task = self.task.lock().take();
        match task {
            Some(handle) => match handle.await {
                Ok(result) => result,
                Err(e) => Err(UpdateError::Communication(format!(
                    "Sequence task failed: {}",
                    e
                ))),
            },
            None => self.result(),
        }
    }

    pub fn abort(&self) {
        self.orchestrator.abort();
    }

    pub fn take_device_infos(&self) -> DeviceInfos {
        self.orchestrator.take_device_infos()
    }
}
