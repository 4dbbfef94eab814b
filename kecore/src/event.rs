//! Single-waiter events.
//!
//! A [`SchedEvent`] parks the thread that waits on it until somebody signals
//! it. Only one thread may wait at a time. The set flag is consumed by the
//! wait, so a signal that arrives before the wait is not lost.

use crate::{
    percpu::PcpuId,
    sched::{Scheduler, ThreadObject},
};
use alloc::sync::Arc;
use spin_lock::SpinLock;

struct EventInner {
    set: bool,
    waiting: Option<Arc<ThreadObject>>,
}

/// An event with at most one waiter.
pub struct SchedEvent {
    inner: SpinLock<EventInner>,
}

impl Default for SchedEvent {
    fn default() -> Self {
        Self::new()
    }
}

impl SchedEvent {
    /// An event that is not set.
    pub const fn new() -> Self {
        Self {
            inner: SpinLock::new(EventInner {
                set: false,
                waiting: None,
            }),
        }
    }

    /// Clear the set flag.
    pub fn reset(&self) {
        self.inner.lock().set = false;
    }

    /// Returns true if the event is set.
    pub fn is_set(&self) -> bool {
        self.inner.lock().set
    }

    /// Block the thread running on `pcpu` until the event is set, then clear
    /// it.
    pub fn wait(&self, sched: &Scheduler, pcpu: PcpuId) {
        let mut inner = self.inner.lock();
        debug_assert!(inner.waiting.is_none(), "second waiter on an event");
        // A wake may race with the switch away; check again after each one.
        while !inner.set {
            let current = match sched.current(pcpu) {
                Some(current) => current,
                None => {
                    log::error!("pCPU{} waits on an event without a thread", pcpu);
                    return;
                }
            };
            inner.waiting = Some(current.clone());
            sched.sleep_thread(&current, pcpu);
            drop(inner);
            sched.schedule(pcpu);
            inner = self.inner.lock();
        }
        inner.set = false;
        inner.waiting = None;
    }

    /// Set the event and wake its waiter. `local` is the signalling pCPU.
    pub fn signal(&self, sched: &Scheduler, local: PcpuId) {
        let mut inner = self.inner.lock();
        inner.set = true;
        if let Some(waiting) = inner.waiting.as_ref() {
            sched.wake_thread(waiting, local);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::{tests::noop_scheduler, ThreadState};
    use abyss::platform::mock::MockPlatform;

    #[test]
    fn signal_before_wait_is_consumed() {
        let platform = Arc::new(MockPlatform::new());
        let (sched, _) = noop_scheduler(&platform, 1);
        let event = SchedEvent::new();
        event.signal(&sched, 0);
        assert!(event.is_set());
        event.wait(&sched, 0);
        assert!(!event.is_set());
        assert!(platform.switches().is_empty());
    }

    #[test]
    fn waiter_blocks_until_signalled() {
        let platform = Arc::new(MockPlatform::new());
        let (sched, idles) = noop_scheduler(&platform, 2);
        let sched = Arc::new(sched);
        let event = Arc::new(SchedEvent::new());
        let vcpu = ThreadObject::new("vcpu0", 0);
        sched.wake_thread(&vcpu, 0);
        sched.schedule(0);

        // While the waiter is switched out, pCPU1 signals the event.
        // Only the first switch (vcpu -> idle) signals; the switch back must not.
        let mut pending = Some((sched.clone(), event.clone(), vcpu.clone()));
        platform.on_switch(move |_, _| {
            if let Some((s, e, v)) = pending.take() {
                assert_eq!(v.state(), ThreadState::Blocked);
                e.signal(&s, 1);
                assert_eq!(v.state(), ThreadState::Runnable);
            }
        });
        event.wait(&sched, 0);

        assert!(!event.is_set());
        assert_eq!(platform.take_ipis().len(), 1);
        // The waiter switched to idle; idle now switches back to it.
        assert!(Arc::ptr_eq(&sched.current(0).unwrap(), &idles[0]));
        assert!(sched.need_reschedule(0));
        sched.run_idle_once(0);
        assert!(Arc::ptr_eq(&sched.current(0).unwrap(), &vcpu));
        assert_eq!(vcpu.state(), ThreadState::Running);
        assert_eq!(platform.switches().len(), 3);
    }
}
