//! Engine runner seam - what a backend needs from a supervised engine
//!
//! A runner wraps a [`ProcessController`](super::process::ProcessController)
//! with engine-family specifics: command line construction, config
//! delivery, readiness detection and version queries. It also exposes a
//! [`StopEvent`] so the backend can observe the engine leaving the running
//! state regardless of who caused it.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};

use crate::error::Result;

/// Engine-family adapter over a process controller.
#[async_trait]
pub trait Runner: Send + Sync {
    /// Engine version, from `<exe> version`.
    async fn version(&self) -> Result<String>;

    /// Launch the engine with the given config JSON.
    async fn start(&self, config: &str) -> Result<()>;

    fn is_running(&self) -> bool;

    /// Stop, then start again with the given config. Serialized against
    /// concurrent restarts by the controller.
    async fn restart(&self, config: &str) -> Result<()>;

    /// Ask the engine to re-read its config, where supported.
    async fn reload(&self) -> Result<()>;

    async fn stop(&self) -> Result<()>;

    /// Live log lines; the channel ends when the engine exits.
    fn subscribe_logs(&self) -> mpsc::Receiver<String>;

    /// Recent log lines, oldest first.
    fn get_buffer(&self) -> Vec<String>;

    /// The one-shot signal fired when the engine leaves the running state.
    fn stop_event(&self) -> Arc<StopEvent>;
}

/// One-shot observable for "the supervised process is no longer running".
///
/// Triggering is idempotent; `reset` arms a fresh un-fired signal. Waiters
/// parked before a reset keep waiting on the signal they grabbed, exactly
/// like swapping out a closed channel.
pub struct StopEvent {
    inner: Mutex<StopEventState>,
}

struct StopEventState {
    fired: bool,
    notify: Arc<Notify>,
}

impl StopEvent {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(StopEventState {
                fired: false,
                notify: Arc::new(Notify::new()),
            }),
        }
    }

    pub fn trigger(&self) {
        let mut state = self.inner.lock();
        if !state.fired {
            state.fired = true;
            state.notify.notify_waiters();
        }
    }

    pub fn reset(&self) {
        let mut state = self.inner.lock();
        state.fired = false;
        state.notify = Arc::new(Notify::new());
    }

    pub fn is_fired(&self) -> bool {
        self.inner.lock().fired
    }

    pub async fn wait(&self) {
        loop {
            let notify = {
                let state = self.inner.lock();
                if state.fired {
                    return;
                }
                state.notify.clone()
            };
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inner.lock().fired {
                return;
            }
            notified.await;
        }
    }
}

impl Default for StopEvent {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_wait_returns_after_trigger() {
        let event = Arc::new(StopEvent::new());
        let waiter = {
            let event = event.clone();
            tokio::spawn(async move { event.wait().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        event.trigger();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should complete")
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_on_fired_event_returns_immediately() {
        let event = StopEvent::new();
        event.trigger();
        tokio::time::timeout(Duration::from_millis(100), event.wait())
            .await
            .expect("fired event should not block");
    }

    #[tokio::test]
    async fn test_trigger_is_idempotent() {
        let event = StopEvent::new();
        event.trigger();
        event.trigger();
        assert!(event.is_fired());
    }

    #[tokio::test]
    async fn test_reset_arms_a_fresh_signal() {
        let event = StopEvent::new();
        event.trigger();
        event.reset();
        assert!(!event.is_fired());
        let pending = tokio::time::timeout(Duration::from_millis(100), event.wait()).await;
        assert!(pending.is_err());
        event.trigger();
        tokio::time::timeout(Duration::from_millis(100), event.wait())
            .await
            .expect("fresh trigger should fire");
    }
}
