//! Background sweep: periodically finalizes ready jobs nobody signalled.

use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, error, warn};

use super::Coordinator;
use crate::error::{PipelineError, PipelineResult};

pub struct Sweeper;

impl Sweeper {
    /// Run [`Coordinator::sweep`] every `interval` on its own thread.
    pub fn spawn(coordinator: Arc<Coordinator>, interval: Duration) -> PipelineResult<SweeperHandle> {
        let (stop, stopped) = mpsc::channel::<()>();
        let join = thread::Builder::new()
            .name("docbatch-sweeper".to_string())
            .spawn(move || {
                debug!(interval_ms = interval.as_millis() as u64, "sweeper started");
                loop {
                    match stopped.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            if let Err(e) = coordinator.sweep() {
                                error!(error = %e, "sweep failed");
                            }
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                debug!("sweeper stopped");
            })
            .map_err(|e| PipelineError::system(format!("failed to spawn sweeper: {e}")))?;
        Ok(SweeperHandle { stop, join })
    }
}

#[derive(Debug)]
pub struct SweeperHandle {
    stop: Sender<()>,
    join: thread::JoinHandle<()>,
}

impl SweeperHandle {
    /// Stop the sweeper, waiting for a sweep in progress to finish.
    pub fn shutdown(self) {
        let _ = self.stop.send(());
        if self.join.join().is_err() {
            warn!("sweeper thread panicked");
        }
    }
}
