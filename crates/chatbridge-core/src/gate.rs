//! Single-flight access to the one shared automation session.

use chatbridge_browser::UiSurface;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::error::{BridgeError, Result};

/// Owns the session and lends it to one turn at a time.
///
/// The surface has no thread safety of its own; the only way to reach it is
/// through a [`SessionLease`], and at most one lease exists at any instant.
pub struct SessionGate {
    permit: Arc<Semaphore>,
    surface: Arc<dyn UiSurface>,
}

/// Exclusive, temporary access to the session. Dropping it releases the
/// permit, whatever path the holder leaves by.
pub struct SessionLease {
    surface: Arc<dyn UiSurface>,
    _permit: OwnedSemaphorePermit,
}

impl SessionLease {
    pub fn surface(&self) -> &dyn UiSurface {
        self.surface.as_ref()
    }
}

impl SessionGate {
    pub fn new(surface: Arc<dyn UiSurface>) -> Self {
        Self {
            permit: Arc::new(Semaphore::new(1)),
            surface,
        }
    }

    /// Wait up to `timeout` for the session to be free.
    pub async fn acquire(&self, timeout: Duration) -> Result<SessionLease> {
        let permit = match tokio::time::timeout(timeout, self.permit.clone().acquire_owned()).await
        {
            Ok(Ok(permit)) => permit,
            // The semaphore is never closed; treat it like a busy session anyway.
            Ok(Err(_)) => return Err(BridgeError::SessionBusy),
            Err(_) => {
                debug!("Session still held after {}s", timeout.as_secs());
                return Err(BridgeError::SessionBusy);
            }
        };

        Ok(SessionLease {
            surface: self.surface.clone(),
            _permit: permit,
        })
    }

    /// Whether a turn currently holds the session.
    pub fn is_busy(&self) -> bool {
        self.permit.available_permits() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Selectors;
    use crate::testing::ScriptedSurface;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn gate() -> Arc<SessionGate> {
        Arc::new(SessionGate::new(Arc::new(ScriptedSurface::new(
            Selectors::default(),
        ))))
    }

    #[tokio::test(start_paused = true)]
    async fn second_acquire_times_out_while_held() {
        let gate = gate();
        let _held = gate.acquire(Duration::from_secs(1)).await.unwrap();
        assert!(gate.is_busy());

        let second = gate.acquire(Duration::from_secs(300)).await;
        assert!(matches!(second, Err(BridgeError::SessionBusy)));
    }

    #[tokio::test(start_paused = true)]
    async fn waiter_proceeds_after_release() {
        let gate = gate();
        let held = gate.acquire(Duration::from_secs(1)).await.unwrap();

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.acquire(Duration::from_secs(300)).await.is_ok() })
        };
        tokio::time::sleep(Duration::from_secs(10)).await;
        drop(held);

        assert!(waiter.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn at_most_one_holder_at_a_time() {
        let gate = gate();
        let inside = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let gate = gate.clone();
            let inside = inside.clone();
            let peak = peak.clone();
            tasks.push(tokio::spawn(async move {
                let _lease = gate.acquire(Duration::from_secs(300)).await.unwrap();
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert!(!gate.is_busy());
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_holder_still_releases() {
        let gate = gate();
        let holder = {
            let gate = gate.clone();
            tokio::spawn(async move {
                let _lease = gate.acquire(Duration::from_secs(1)).await.unwrap();
                panic!("turn blew up");
            })
        };
        assert!(holder.await.is_err());

        assert!(!gate.is_busy());
        assert!(gate.acquire(Duration::from_millis(10)).await.is_ok());
    }
}
