//! Fixed-interval background tasks.

use crate::error::SyncResult;
use std::fmt;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error};

/// A named thread running a closure every `interval` until stopped.
///
/// The first run happens one interval after spawning. Errors returned by the
/// closure are logged and the task keeps running.
pub struct PeriodicTask {
    name: String,
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl PeriodicTask {
    /// Spawns the task.
    pub fn spawn<F>(name: impl Into<String>, interval: Duration, mut f: F) -> SyncResult<Self>
    where
        F: FnMut() -> SyncResult<()> + Send + 'static,
    {
        let name = name.into();
        let (stop, stopped) = mpsc::channel::<()>();
        let task_name = name.clone();

        let handle = thread::Builder::new()
            .name(format!("tablesync-{name}"))
            .spawn(move || loop {
                match stopped.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        debug!(task = %task_name, "periodic task tick");
                        if let Err(e) = f() {
                            error!(task = %task_name, error = %e, "periodic task failed");
                        }
                    }
                    // Explicit stop, or the owner was dropped.
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })?;

        Ok(Self {
            name,
            stop: Some(stop),
            handle: Some(handle),
        })
    }

    /// The task's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Signals the task and waits for its current run to finish.
    pub fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!(task = %self.name, "periodic task panicked");
            }
        }
    }
}

impl fmt::Debug for PeriodicTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeriodicTask")
            .field("name", &self.name)
            .field("running", &self.handle.is_some())
            .finish()
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.stop();
    }
}
