//! Per-execution sandbox context

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::capture::OutputTarget;
use crate::model::{Capability, ResourceLimits};

/// Why the engine was interrupted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptReason {
    Timeout,
    Cancelled,
}

const NOT_INTERRUPTED: u8 = 0;
const TIMED_OUT: u8 = 1;
const CANCELLED: u8 = 2;

/// Flags shared between the engine's interrupt handler, the bindings and the
/// coordinator.
#[derive(Debug, Default)]
pub struct InterruptState {
    reason: AtomicU8,
    output_limit_hit: AtomicBool,
}

impl InterruptState {
    /// Returns true when execution must stop. The first reason observed sticks.
    pub fn poll(&self, deadline: Instant, cancel: &CancellationToken) -> bool {
        if self.reason().is_some() {
            return true;
        }
        let reason = if cancel.is_cancelled() {
            CANCELLED
        } else if Instant::now() >= deadline {
            TIMED_OUT
        } else {
            return false;
        };
        let _ = self.reason.compare_exchange(
            NOT_INTERRUPTED,
            reason,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        true
    }

    pub fn reason(&self) -> Option<InterruptReason> {
        match self.reason.load(Ordering::SeqCst) {
            TIMED_OUT => Some(InterruptReason::Timeout),
            CANCELLED => Some(InterruptReason::Cancelled),
            _ => None,
        }
    }

    pub fn mark_output_limit(&self) {
        self.output_limit_hit.store(true, Ordering::SeqCst);
    }

    pub fn output_limit_hit(&self) -> bool {
        self.output_limit_hit.load(Ordering::SeqCst)
    }
}

/// Isolated evaluation environment for one request. Never reused.
#[derive(Clone)]
pub struct SandboxContext {
    pub sink: Arc<dyn OutputTarget>,
    pub capabilities: Vec<Capability>,
    pub limits: ResourceLimits,
    pub timeout: Duration,
    pub deadline: Instant,
    pub cancel: CancellationToken,
    pub interrupt: Arc<InterruptState>,
}

impl SandboxContext {
    /// Fresh context; the deadline starts counting now
    pub fn new(
        sink: Arc<dyn OutputTarget>,
        capabilities: Vec<Capability>,
        limits: ResourceLimits,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            sink,
            capabilities,
            limits,
            timeout,
            deadline: Instant::now() + timeout,
            cancel,
            interrupt: Arc::new(InterruptState::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poll_before_deadline() {
        let state = InterruptState::default();
        let cancel = CancellationToken::new();

        assert!(!state.poll(Instant::now() + Duration::from_secs(60), &cancel));
        assert_eq!(state.reason(), None);
    }

    #[test]
    fn test_poll_after_deadline() {
        let state = InterruptState::default();
        let cancel = CancellationToken::new();

        assert!(state.poll(Instant::now() - Duration::from_millis(1), &cancel));
        assert_eq!(state.reason(), Some(InterruptReason::Timeout));
    }

    #[test]
    fn test_first_reason_sticks() {
        let state = InterruptState::default();
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert!(state.poll(Instant::now() + Duration::from_secs(60), &cancel));
        assert!(state.poll(Instant::now() - Duration::from_millis(1), &cancel));
        assert_eq!(state.reason(), Some(InterruptReason::Cancelled));
    }
}
