//! Lifecycle phase and shutdown-state controller with in-flight request
//! tracking.
//!
//! Uses `ArcSwap` for lock-free phase reads, a `watch` channel to publish
//! [`ShutdownState`] changes, and an atomic counter with RAII guards for
//! in-flight requests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use keel_core::{LifecyclePhase, ShutdownState};
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::info;

use crate::error::LifecycleError;

/// Owns the process lifecycle phase.
///
/// One instance per orchestrator, shared by `Arc` with handlers,
/// middleware and background tasks. The phase only ever moves forward and
/// the derived [`ShutdownState`] follows it:
///
/// | phase | shutdown state |
/// |---|---|
/// | Starting, Initializing, Running | Running |
/// | Draining, ShuttingDown | Draining |
/// | Stopped | Terminated |
#[derive(Debug)]
pub struct LifecycleController {
    phase: ArcSwap<LifecyclePhase>,
    transition: Mutex<()>,
    shutdown_tx: watch::Sender<ShutdownState>,
    in_flight: Arc<AtomicU64>,
}

impl LifecycleController {
    /// Creates a controller in the `Starting` phase.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ShutdownState::Running);
        Self {
            phase: ArcSwap::from_pointee(LifecyclePhase::Starting),
            transition: Mutex::new(()),
            shutdown_tx: tx,
            in_flight: Arc::new(AtomicU64::new(0)),
        }
    }

    #[must_use]
    pub fn phase(&self) -> LifecyclePhase {
        **self.phase.load()
    }

    /// Moves to `next`, returning the previous phase.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::InvalidTransition`] if `next` is not
    /// strictly after the current phase.
    pub(crate) fn advance(&self, next: LifecyclePhase) -> Result<LifecyclePhase, LifecycleError> {
        let _guard = self.transition.lock();
        let current = self.phase();
        if !current.can_advance_to(next) {
            return Err(LifecycleError::InvalidTransition {
                from: current,
                to: next,
            });
        }
        self.phase.store(Arc::new(next));

        let state = shutdown_state_for(next);
        if *self.shutdown_tx.borrow() != state {
            self.shutdown_tx.send_replace(state);
        }

        info!(from = current.as_str(), to = next.as_str(), "lifecycle transition");
        Ok(current)
    }

    #[must_use]
    pub fn shutdown_state(&self) -> ShutdownState {
        *self.shutdown_tx.borrow()
    }

    /// Returns a receiver notified on every shutdown-state change.
    ///
    /// Long-running handlers select on this to stop taking new work once
    /// the service drains.
    #[must_use]
    pub fn shutdown_receiver(&self) -> watch::Receiver<ShutdownState> {
        self.shutdown_tx.subscribe()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.phase() == LifecyclePhase::Running
    }

    /// Creates an RAII guard that tracks an in-flight request.
    ///
    /// The counter is decremented when the guard drops, including during
    /// unwinding.
    #[must_use]
    pub fn in_flight_guard(&self) -> InFlightGuard {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    #[must_use]
    pub fn in_flight_count(&self) -> u64 {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Waits until no request is in flight, up to `timeout`.
    ///
    /// Returns `true` if the count reached zero.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if self.in_flight.load(Ordering::Relaxed) == 0 {
                return true;
            }

            if tokio::time::Instant::now() >= deadline {
                return false;
            }

            // Poll at 10ms intervals to avoid busy-waiting
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Default for LifecycleController {
    fn default() -> Self {
        Self::new()
    }
}

fn shutdown_state_for(phase: LifecyclePhase) -> ShutdownState {
    match phase {
        LifecyclePhase::Starting | LifecyclePhase::Initializing | LifecyclePhase::Running => {
            ShutdownState::Running
        }
        LifecyclePhase::Draining | LifecyclePhase::ShuttingDown => ShutdownState::Draining,
        LifecyclePhase::Stopped => ShutdownState::Terminated,
    }
}

/// RAII guard that decrements the in-flight counter when dropped.
#[derive(Debug)]
pub struct InFlightGuard {
    in_flight: Arc<AtomicU64>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_phase_is_starting() {
        let controller = LifecycleController::new();
        assert_eq!(controller.phase(), LifecyclePhase::Starting);
        assert_eq!(controller.shutdown_state(), ShutdownState::Running);
        assert_eq!(controller.in_flight_count(), 0);
    }

    #[test]
    fn full_forward_walk_updates_shutdown_state() {
        let controller = LifecycleController::new();

        controller.advance(LifecyclePhase::Initializing).unwrap();
        controller.advance(LifecyclePhase::Running).unwrap();
        assert!(controller.is_running());
        assert_eq!(controller.shutdown_state(), ShutdownState::Running);

        controller.advance(LifecyclePhase::Draining).unwrap();
        assert_eq!(controller.shutdown_state(), ShutdownState::Draining);

        controller.advance(LifecyclePhase::ShuttingDown).unwrap();
        assert_eq!(controller.shutdown_state(), ShutdownState::Draining);

        controller.advance(LifecyclePhase::Stopped).unwrap();
        assert_eq!(controller.shutdown_state(), ShutdownState::Terminated);
    }

    #[test]
    fn backwards_and_repeated_transitions_are_rejected() {
        let controller = LifecycleController::new();
        controller.advance(LifecyclePhase::Initializing).unwrap();
        controller.advance(LifecyclePhase::Running).unwrap();

        assert!(matches!(
            controller.advance(LifecyclePhase::Running),
            Err(LifecycleError::InvalidTransition { .. })
        ));
        assert!(controller.advance(LifecyclePhase::Initializing).is_err());
        assert_eq!(controller.phase(), LifecyclePhase::Running);
    }

    #[test]
    fn advance_returns_previous_phase() {
        let controller = LifecycleController::new();
        let previous = controller.advance(LifecyclePhase::Stopped).unwrap();
        assert_eq!(previous, LifecyclePhase::Starting);
    }

    #[test]
    fn in_flight_guard_increments_and_decrements() {
        let controller = LifecycleController::new();

        let guard1 = controller.in_flight_guard();
        let guard2 = controller.in_flight_guard();
        assert_eq!(controller.in_flight_count(), 2);

        drop(guard1);
        assert_eq!(controller.in_flight_count(), 1);

        drop(guard2);
        assert_eq!(controller.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn shutdown_receiver_notified_on_drain() {
        let controller = LifecycleController::new();
        let mut rx = controller.shutdown_receiver();
        assert_eq!(*rx.borrow(), ShutdownState::Running);

        controller.advance(LifecyclePhase::Draining).unwrap();

        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), ShutdownState::Draining);
    }

    #[tokio::test]
    async fn wait_for_drain_immediate_success() {
        let controller = LifecycleController::new();
        assert!(controller.wait_for_drain(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn wait_for_drain_with_active_requests() {
        let controller = LifecycleController::new();
        let guard = controller.in_flight_guard();

        let guard_handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            drop(guard);
        });

        assert!(controller.wait_for_drain(Duration::from_secs(2)).await);
        guard_handle.await.unwrap();
    }

    #[tokio::test]
    async fn wait_for_drain_timeout() {
        let controller = LifecycleController::new();
        let _guard = controller.in_flight_guard();

        assert!(!controller.wait_for_drain(Duration::from_millis(50)).await);
    }
}
