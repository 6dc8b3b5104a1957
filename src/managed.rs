//! ==============================================================================
//! managed.rs - background task plumbing
//! ==============================================================================
//!
//! purpose:
//!     the small scheduling kit every background loop in the host shares:
//!     - UpdateGate: "has my interval elapsed?" without a timer per task
//!     - StopFlag: cooperative stop signal checked once per cycle
//!     - ManagedTask: a named tokio task with bounded-time shutdown
//!
//! relationships:
//!     - used by: listener.rs (udp receive loops)
//!     - used by: registry.rs (amortized stale sweep)
//!     - used by: market.rs, firmware.rs (pollers)
//!
//! ==============================================================================

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// tracks whether a fixed interval has elapsed since the last update
#[derive(Debug)]
pub struct UpdateGate {
    interval: Duration,
    last: Option<Instant>,
}

impl UpdateGate {
    /// the first check always fires
    pub fn new(interval: Duration) -> Self {
        Self { interval, last: None }
    }

    pub fn needs_update(&mut self) -> bool {
        self.needs_update_at(Instant::now())
    }

    /// true (and resets the clock) when `interval` has passed since the last true
    pub fn needs_update_at(&mut self, now: Instant) -> bool {
        let due = match self.last {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.interval,
        };
        if due {
            self.last = Some(now);
        }
        due
    }
}

/// shared cooperative stop signal
#[derive(Clone, Debug, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// sleep up to `duration`, waking early once stopped
    pub async fn sleep(&self, duration: Duration) {
        let tick = Duration::from_millis(100);
        let deadline = Instant::now() + duration;
        while !self.is_stopped() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            tokio::time::sleep(tick.min(deadline - now)).await;
        }
    }
}

/// a named background task that can be stopped within a bounded time
pub struct ManagedTask {
    name: String,
    stop: StopFlag,
    handle: Option<JoinHandle<()>>,
}

impl ManagedTask {
    /// spawn `body` on the tokio runtime; it gets the task's stop flag
    pub fn spawn<F, Fut>(name: impl Into<String>, body: F) -> Self
    where
        F: FnOnce(StopFlag) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let stop = StopFlag::new();
        let handle = tokio::spawn(body(stop.clone()));
        debug!(task = %name, "task spawned");
        Self {
            name,
            stop,
            handle: Some(handle),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    /// signal stop and wait up to `timeout` for the task to exit
    ///
    /// returns false if the task had to be aborted. abort drops the task's
    /// future, so any socket it owns is closed either way.
    pub async fn stop(&mut self, timeout: Duration) -> bool {
        let Some(mut handle) = self.handle.take() else {
            return true;
        };

        info!(task = %self.name, "shutting down task...");
        self.stop.stop();

        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) if e.is_panic() => {
                error!(task = %self.name, "task panicked: {e}");
                true
            }
            Ok(Err(e)) => {
                warn!(task = %self.name, "task ended abnormally: {e}");
                true
            }
            Err(_) => {
                warn!(task = %self.name, ?timeout, "task did not stop within timeout, aborting");
                handle.abort();
                let _ = handle.await;
                false
            }
        }
    }
}

impl Drop for ManagedTask {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.stop.stop();
            handle.abort();
        }
    }
}
