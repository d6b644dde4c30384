//! Adaptive sync polling.
//!
//! The kernel does not emit uevents while a sync operation makes progress,
//! so arrays with an active sync action are polled instead. A single timer
//! thread ticks at 1 Hz and synthesizes a change event for every array
//! currently registered for polling; registration is flipped by the
//! reconciler, so the timer runs exactly while some array needs it.

use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Weak;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::daemon::Daemon;

const POLL_INTERVAL: Duration = Duration::from_secs(1);

enum PollerMessage {
    Quit,
}

/// The 1 Hz poller thread.
pub struct SyncPoller {
    tx: Sender<PollerMessage>,
    thread: Option<JoinHandle<()>>,
}

impl SyncPoller {
    /// Spawns the timer thread. Each tick synthesizes a change event for
    /// every array registered with [`Daemon::ensure_polling`].
    pub fn spawn(daemon: Weak<Daemon>) -> Self {
        let (tx, rx) = mpsc::channel();
        let thread = std::thread::spawn(move || loop {
            match rx.recv_timeout(POLL_INTERVAL) {
                Ok(PollerMessage::Quit) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {}
            }
            let Some(daemon) = daemon.upgrade() else {
                break;
            };
            for object_path in daemon.polled_arrays() {
                daemon.array_changed(&object_path);
            }
        });
        Self {
            tx,
            thread: Some(thread),
        }
    }

    /// Stops the timer thread and waits for it to exit.
    pub fn shutdown(&mut self) {
        let _ = self.tx.send(PollerMessage::Quit);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for SyncPoller {
    fn drop(&mut self) {
        self.shutdown();
    }
}
