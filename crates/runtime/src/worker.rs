//! Periodic background workers.

use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use tracing::{debug, error, info};

/// Handle to control and join a background worker.
#[derive(Debug)]
pub struct WorkerHandle {
    name: String,
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Request shutdown and wait for the in-flight tick to finish.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}

/// Spawn a thread that runs `tick` every `interval` until shut down.
///
/// The first tick happens one interval after the start. A panicking tick is
/// logged and the loop keeps going.
pub fn spawn_periodic<F>(name: &str, interval: Duration, mut tick: F) -> std::io::Result<WorkerHandle>
where
    F: FnMut() + Send + 'static,
{
    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
    let worker = name.to_string();

    let join = thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            info!(worker = %worker, interval_ms = interval.as_millis() as u64, "worker started");
            loop {
                match shutdown_rx.recv_timeout(interval) {
                    Err(mpsc::RecvTimeoutError::Timeout) => {
                        if panic::catch_unwind(AssertUnwindSafe(&mut tick)).is_err() {
                            error!(worker = %worker, "worker tick panicked");
                        } else {
                            debug!(worker = %worker, "tick complete");
                        }
                    }
                    Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
                }
            }
            info!(worker = %worker, "worker stopped");
        })?;

    Ok(WorkerHandle {
        name: name.to_string(),
        shutdown: shutdown_tx,
        join: Some(join),
    })
}
