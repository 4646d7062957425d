use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// ShutdownSignal
// ---------------------------------------------------------------------------

/// Cooperative shutdown coordinator shared by workers and background loops.
///
/// Unlike a broadcast channel, the trigger is level-based: a receiver created
/// after [`trigger`](ShutdownSignal::trigger) still observes the shutdown.
///
/// ```ignore
/// let shutdown = ShutdownSignal::new();
/// let mut rx = shutdown.subscribe();
/// tokio::select! {
///     _ = rx.wait() => { /* drain */ }
///     _ = do_work() => {}
/// }
/// ```
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    trigger: Arc<watch::Sender<bool>>,
    in_flight: Arc<watch::Sender<usize>>,
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (trigger, _) = watch::channel(false);
        let (in_flight, _) = watch::channel(0);
        Self {
            trigger: Arc::new(trigger),
            in_flight: Arc::new(in_flight),
        }
    }

    pub fn subscribe(&self) -> ShutdownReceiver {
        ShutdownReceiver {
            rx: self.trigger.subscribe(),
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.trigger.borrow()
    }

    pub fn trigger(&self) {
        let first = self.trigger.send_if_modified(|flag| {
            if *flag {
                false
            } else {
                *flag = true;
                true
            }
        });
        if first {
            info!("shutdown signal triggered");
        } else {
            warn!("shutdown already triggered");
        }
    }

    /// Mark a unit of work as in flight until the guard is dropped.
    pub fn guard(&self) -> InFlightGuard {
        self.in_flight.send_modify(|n| *n += 1);
        InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    pub fn in_flight(&self) -> usize {
        *self.in_flight.borrow()
    }

    /// Wait until every outstanding [`InFlightGuard`] is dropped, or the
    /// timeout elapses.
    pub async fn drain(&self, timeout: Duration) -> DrainResult {
        let mut rx = self.in_flight.subscribe();
        let waited = tokio::time::timeout(timeout, rx.wait_for(|n| *n == 0)).await;
        match waited {
            Ok(_) => {
                info!("all in-flight work drained");
                DrainResult::Complete
            }
            Err(_) => {
                let remaining = *self.in_flight.borrow();
                warn!(remaining, "drain timeout, abandoning in-flight work");
                DrainResult::Timeout { remaining }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ShutdownReceiver {
    rx: watch::Receiver<bool>,
}

impl ShutdownReceiver {
    /// Resolve once shutdown has been triggered.
    pub async fn wait(&mut self) {
        // An Err means the signal itself was dropped, which we treat as shutdown.
        let _ = self.rx.wait_for(|flag| *flag).await;
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }
}

/// Decrements the in-flight counter on drop.
#[derive(Debug)]
pub struct InFlightGuard {
    in_flight: Arc<watch::Sender<usize>>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.send_modify(|n| *n = n.saturating_sub(1));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainResult {
    Complete,
    Timeout { remaining: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn late_subscriber_sees_trigger() {
        let signal = ShutdownSignal::new();
        signal.trigger();
        let mut rx = signal.subscribe();
        assert!(rx.is_triggered());
        tokio::time::timeout(Duration::from_millis(100), rx.wait())
            .await
            .expect("wait should resolve immediately");
    }

    #[tokio::test]
    async fn drain_waits_for_guards() {
        let signal = ShutdownSignal::new();
        let guard = signal.guard();
        assert_eq!(signal.in_flight(), 1);

        let s = signal.clone();
        let handle = tokio::spawn(async move { s.drain(Duration::from_secs(2)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(guard);

        assert_eq!(handle.await.unwrap(), DrainResult::Complete);
        assert_eq!(signal.in_flight(), 0);
    }

    #[tokio::test]
    async fn drain_times_out_with_outstanding_work() {
        let signal = ShutdownSignal::new();
        let _guard = signal.guard();
        let result = signal.drain(Duration::from_millis(20)).await;
        assert_eq!(result, DrainResult::Timeout { remaining: 1 });
    }
}
