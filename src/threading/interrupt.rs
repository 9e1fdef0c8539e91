//! Asynchronous interrupt delivery.
//!
//! A preemptive suspend needs a way to stop a thread that is not polling. On a
//! real platform that is a signal whose handler runs `finish_async_suspend` in
//! the target's context and parks it. Here the capability is a trait, with an
//! in-process implementation that defers the handler to the target's next poll
//! point.
use crate::threading::thread::ManagedThread;
use enum_dispatch::enum_dispatch;

#[enum_dispatch]
pub trait AsyncInterrupt {
    /// Arrange for `thread` to run its interrupt handler. Returns `false` if
    /// the interrupt cannot be delivered.
    fn request_async_interrupt(&self, thread: &ManagedThread) -> bool;

    /// Wake a thread parked by its interrupt handler.
    fn request_async_resume(&self, thread: &ManagedThread) -> bool;
}

#[enum_dispatch(AsyncInterrupt)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptMechanism {
    DeferredInterrupt,
    Unsupported,
}

impl InterruptMechanism {
    pub fn name(&self) -> &'static str {
        match self {
            InterruptMechanism::DeferredInterrupt(_) => "deferred",
            InterruptMechanism::Unsupported(_) => "unsupported",
        }
    }
}

impl Default for InterruptMechanism {
    fn default() -> Self {
        DeferredInterrupt.into()
    }
}

/// Marks the interrupt pending on the target; the thread runs the handler the
/// next time it polls, leaves a blocking region, or detaches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeferredInterrupt;

impl AsyncInterrupt for DeferredInterrupt {
    fn request_async_interrupt(&self, thread: &ManagedThread) -> bool {
        if !thread.is_live() {
            return false;
        }
        thread.raise_interrupt();
        true
    }

    fn request_async_resume(&self, thread: &ManagedThread) -> bool {
        thread.signal_resume();
        true
    }
}

/// Refuses every interrupt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Unsupported;

impl AsyncInterrupt for Unsupported {
    fn request_async_interrupt(&self, _thread: &ManagedThread) -> bool {
        false
    }

    fn request_async_resume(&self, _thread: &ManagedThread) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::DefectPolicy,
        threading::{barrier::SuspendBarrier, state::ThreadState},
        utils::{sync::Arc, ManagedThreadId},
    };

    fn thread() -> ManagedThread {
        ManagedThread::new(
            ManagedThreadId::new(1),
            "target".to_string(),
            Arc::new(SuspendBarrier::new()),
            DefectPolicy::Propagate,
        )
    }

    #[test]
    fn test_deferred_requires_live_thread() {
        let mechanism = InterruptMechanism::default();
        let t = thread();
        assert!(!mechanism.request_async_interrupt(&t));
        assert!(!t.interrupt_pending());

        t.attach().unwrap();
        assert_eq!(t.snapshot().unwrap().state, ThreadState::Running);
        assert!(mechanism.request_async_interrupt(&t));
        assert!(t.interrupt_pending());
    }

    #[test]
    fn test_unsupported_refuses() {
        let mechanism: InterruptMechanism = Unsupported.into();
        let t = thread();
        t.attach().unwrap();
        assert!(!mechanism.request_async_interrupt(&t));
        assert!(!mechanism.request_async_resume(&t));
        assert!(!t.interrupt_pending());
        assert_eq!(mechanism.name(), "unsupported");
    }
}
