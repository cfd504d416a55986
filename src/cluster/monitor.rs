//! Heartbeat silence watchdog.
//!
//! A cancellable scheduled task re-armed on every observed heartbeat or data
//! message, rather than a free-running interval: repeated connect/disconnect
//! cycles can never stack duplicate timers, and the missing signal fires at
//! most once per armed period.

use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

/// Watchdog declaring a connection's remote side missing after a fixed
/// silence window.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    timeout: Duration,
    touch_tx: watch::Sender<Instant>,
    // kept so `touch` works while no watchdog task is subscribed
    _touch_rx: watch::Receiver<Instant>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HeartbeatMonitor {
    pub fn new(timeout: Duration) -> Self {
        let (touch_tx, touch_rx) = watch::channel(Instant::now());
        Self {
            timeout,
            touch_tx,
            _touch_rx: touch_rx,
            task: Mutex::new(None),
        }
    }

    /// Record activity, pushing the deadline out by the full timeout.
    pub fn touch(&self) {
        let _ = self.touch_tx.send(Instant::now());
    }

    /// Arm the watchdog. Idempotent: while a watchdog task is running,
    /// further calls are no-ops. `on_missing` runs once when the silence
    /// window elapses, after which the watchdog disarms itself.
    pub fn start<F>(&self, on_missing: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut task = self.task.lock().expect("monitor state poisoned");
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }

        self.touch();
        let timeout = self.timeout;
        let mut touch_rx = self.touch_tx.subscribe();
        *task = Some(tokio::spawn(async move {
            loop {
                let deadline = *touch_rx.borrow() + timeout;
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => {
                        debug!("silence window elapsed");
                        on_missing();
                        return;
                    }
                    changed = touch_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }
            }
        }));
    }

    /// Disarm the watchdog. Idempotent.
    pub fn stop(&self) {
        if let Some(task) = self.task.lock().expect("monitor state poisoned").take() {
            task.abort();
        }
    }
}

impl Drop for HeartbeatMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}
