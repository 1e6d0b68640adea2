//! Resettable idle timer
//!
//! While armed, fires its callback once no activity has been recorded for
//! the configured window. Disarmed timers ignore activity entirely.

use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::types::ActivityKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct IdleState {
    armed: bool,
    timeout: Duration,
    last_activity: Instant,
}

pub struct IdleTimer {
    tx: watch::Sender<IdleState>,
    task: JoinHandle<()>,
}

impl IdleTimer {
    /// Spawns the timer task on the current tokio runtime.
    pub fn spawn<F>(timeout: Duration, on_expire: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        let (tx, mut rx) = watch::channel(IdleState {
            armed: false,
            timeout,
            last_activity: Instant::now(),
        });

        let task = tokio::spawn(async move {
            loop {
                let state = *rx.borrow_and_update();
                let deadline = if state.armed {
                    state.last_activity.checked_add(state.timeout)
                } else {
                    None
                };

                match deadline {
                    Some(deadline) => {
                        tokio::select! {
                            changed = rx.changed() => {
                                if changed.is_err() {
                                    break;
                                }
                            }
                            _ = tokio::time::sleep_until(deadline) => {
                                log::debug!("Idle timeout of {:?} elapsed", state.timeout);
                                on_expire();
                                // Wait for the callback (or anyone) to re-arm or disarm
                                if rx.changed().await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    None => {
                        if rx.changed().await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Self { tx, task }
    }

    /// Start counting from now.
    pub fn arm(&self) {
        self.tx.send_modify(|state| {
            state.armed = true;
            state.last_activity = Instant::now();
        });
    }

    pub fn disarm(&self) {
        self.tx.send_if_modified(|state| {
            let was_armed = state.armed;
            state.armed = false;
            was_armed
        });
    }

    pub fn is_armed(&self) -> bool {
        self.tx.borrow().armed
    }

    /// Resets the countdown when armed; inert otherwise.
    pub fn record_activity(&self, kind: ActivityKind) {
        self.tx.send_if_modified(|state| {
            if !state.armed {
                return false;
            }
            log::trace!("Activity {:?} resets idle timer", kind);
            state.last_activity = Instant::now();
            true
        });
    }

    pub fn set_timeout(&self, timeout: Duration) {
        self.tx.send_if_modified(|state| {
            if state.timeout == timeout {
                return false;
            }
            state.timeout = timeout;
            true
        });
    }

    pub fn timeout(&self) -> Duration {
        self.tx.borrow().timeout
    }
}

impl Drop for IdleTimer {
    fn drop(&mut self) {
        self.task.abort();
    }
}
