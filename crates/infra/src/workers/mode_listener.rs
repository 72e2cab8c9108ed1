use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::jobs::ModeChange;

/// Handle to control and join a background worker.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl WorkerHandle {
    /// Request graceful shutdown and wait for the worker to stop.
    ///
    /// Called from the worker thread itself, only the request is sent.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            if j.thread().id() != thread::current().id() {
                let _ = j.join();
            }
        }
    }
}

/// Control loop relaying operational mode changes.
///
/// - Receives `ModeChange` notifications from a channel
/// - Calls the handler for each one, in order
/// - Stops on shutdown or when every sender is gone
#[derive(Debug)]
pub struct ModeListener;

impl ModeListener {
    pub fn spawn<H>(
        name: &'static str,
        changes: mpsc::Receiver<ModeChange>,
        mut handler: H,
    ) -> std::io::Result<WorkerHandle>
    where
        H: FnMut(ModeChange) + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        let join = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || listener_loop(name, changes, shutdown_rx, &mut handler))?;

        Ok(WorkerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
        })
    }
}

fn listener_loop<H>(
    name: &'static str,
    changes: mpsc::Receiver<ModeChange>,
    shutdown_rx: mpsc::Receiver<()>,
    handler: &mut H,
) where
    H: FnMut(ModeChange),
{
    let tick = Duration::from_millis(250);

    loop {
        // Shutdown check (non-blocking)
        if shutdown_rx.try_recv().is_ok() {
            break;
        }

        match changes.recv_timeout(tick) {
            Ok(change) => {
                debug!(worker = name, previous = ?change.previous, current = ?change.current, "mode change received");
                handler(change);
            }
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                warn!(worker = name, "mode change channel closed");
                break;
            }
        }
    }
}
