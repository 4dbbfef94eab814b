//! The per-pCPU scheduler.
//!
//! Threads of execution (the idle thread of a pCPU or the thread of a vCPU)
//! are [`ThreadObject`]s pinned to one pCPU. Each pCPU has a scheduler control
//! block with the current thread, its idle thread and a [`SchedPolicy`] that
//! decides what runs next. Scheduling is cooperative: a thread leaves the pCPU
//! only in [`Scheduler::schedule`].
//!
//! ## Thread states
//! ```text
//!            wake            schedule
//!  BLOCKED -------> RUNNABLE --------> RUNNING
//!     ^                ^                  |
//!     |                +---- schedule ----+
//!     +------------- sleep ---------------+
//! ```
//! A running thread that is put to sleep keeps running until the next
//! [`Scheduler::schedule`] and becomes blocked there. A wake in that window
//! cancels the sleep.

mod noop;

pub use noop::NoopPolicy;

use crate::percpu::{PcpuId, PerCpu};
use abyss::{
    context::SwitchFrame,
    platform::{Platform, NOTIFY_VECTOR},
};
use alloc::{boxed::Box, string::String, sync::Arc};
use core::{
    cell::UnsafeCell,
    sync::atomic::{AtomicBool, AtomicU8, Ordering},
};
use spin_lock::SpinLock;

/// A possible state of a thread object.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, num_enum::TryFromPrimitive)]
pub enum ThreadState {
    /// Waiting for a wake.
    Blocked = 0,
    /// Ready, waiting for the pCPU.
    Runnable = 1,
    /// Owns the pCPU.
    Running = 2,
}

/// A thread of execution.
pub struct ThreadObject {
    name: String,
    pcpu: PcpuId,
    state: AtomicU8,
    // Set while a sleep of the running thread is not yet effective.
    be_blocking: AtomicBool,
    frame: UnsafeCell<SwitchFrame>,
    _stack: Option<Box<[u8]>>,
}

// The frame is only touched by the owning pCPU during a switch.
unsafe impl Sync for ThreadObject {}
unsafe impl Send for ThreadObject {}

impl ThreadObject {
    /// A thread object for a context that already runs, such as the boot
    /// context turned into the idle thread. Its frame is filled by the first
    /// switch away from it.
    pub fn new(name: impl Into<String>, pcpu: PcpuId) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            pcpu,
            state: AtomicU8::new(ThreadState::Blocked as u8),
            be_blocking: AtomicBool::new(false),
            frame: UnsafeCell::new(SwitchFrame::new()),
            _stack: None,
        })
    }

    /// A thread that starts `entry(arg)` on a fresh stack of `stack_size`
    /// bytes when first switched to.
    #[cfg(target_arch = "x86_64")]
    pub fn spawn(
        name: impl Into<String>,
        pcpu: PcpuId,
        stack_size: usize,
        entry: abyss::context::ThreadEntry,
        arg: usize,
    ) -> Arc<Self> {
        let mut stack = alloc::vec![0u8; stack_size].into_boxed_slice();
        // Safety: the stack is owned by the thread object and lives as long
        // as the thread can run.
        let frame = unsafe { SwitchFrame::prepare(&mut stack, entry, arg) };
        Arc::new(Self {
            name: name.into(),
            pcpu,
            state: AtomicU8::new(ThreadState::Blocked as u8),
            be_blocking: AtomicBool::new(false),
            frame: UnsafeCell::new(frame),
            _stack: Some(stack),
        })
    }

    /// Name of the thread.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The pCPU the thread is pinned to.
    pub fn pcpu(&self) -> PcpuId {
        self.pcpu
    }

    /// Current state.
    pub fn state(&self) -> ThreadState {
        ThreadState::try_from(self.state.load(Ordering::SeqCst)).unwrap_or(ThreadState::Blocked)
    }

    fn set_state(&self, state: ThreadState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    fn frame(&self) -> *mut SwitchFrame {
        self.frame.get()
    }
}

impl core::fmt::Debug for ThreadObject {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ThreadObject")
            .field("name", &self.name)
            .field("pcpu", &self.pcpu)
            .field("state", &self.state())
            .finish()
    }
}

/// A scheduling policy of one pCPU.
///
/// The policy is chosen when the scheduler is built and never swapped.
pub trait SchedPolicy: Send {
    /// Called once when the control block of `pcpu` is set up.
    fn init(&mut self, pcpu: PcpuId);
    /// Next thread to run; `None` runs the idle thread.
    fn pick_next(&mut self) -> Option<Arc<ThreadObject>>;
    /// `obj` goes to sleep.
    fn sleep(&mut self, obj: &Arc<ThreadObject>);
    /// `obj` wakes up.
    fn wake(&mut self, obj: &Arc<ThreadObject>);
}

struct SchedInner {
    curr: Option<Arc<ThreadObject>>,
    idle: Option<Arc<ThreadObject>>,
    policy: Box<dyn SchedPolicy>,
}

struct SchedControl {
    inner: SpinLock<SchedInner>,
    need_resched: AtomicBool,
}

/// The scheduler of every pCPU.
pub struct Scheduler {
    platform: Arc<dyn Platform>,
    ctl: PerCpu<SchedControl>,
}

impl Scheduler {
    /// Scheduler for `nr_pcpus` pCPUs, with the policy of each pCPU built by
    /// `policy(pcpu)`.
    pub fn new(
        platform: Arc<dyn Platform>,
        nr_pcpus: usize,
        mut policy: impl FnMut(PcpuId) -> Box<dyn SchedPolicy>,
    ) -> Self {
        Self {
            platform,
            ctl: PerCpu::new(nr_pcpus, |pcpu| {
                let mut policy = policy(pcpu);
                policy.init(pcpu);
                SchedControl {
                    inner: SpinLock::new(SchedInner {
                        curr: None,
                        idle: None,
                        policy,
                    }),
                    need_resched: AtomicBool::new(false),
                }
            }),
        }
    }

    /// Number of pCPUs.
    pub fn nr_pcpus(&self) -> usize {
        self.ctl.len()
    }

    /// Make `idle` the idle thread of `pcpu` and the thread running there.
    pub fn init_idle(&self, pcpu: PcpuId, idle: Arc<ThreadObject>) {
        debug_assert_eq!(idle.pcpu(), pcpu);
        idle.set_state(ThreadState::Running);
        let mut inner = self.ctl[pcpu].inner.lock();
        inner.curr = Some(idle.clone());
        inner.idle = Some(idle);
    }

    /// The thread running on `pcpu`.
    pub fn current(&self, pcpu: PcpuId) -> Option<Arc<ThreadObject>> {
        self.ctl[pcpu].inner.lock().curr.clone()
    }

    /// Returns true if `obj` is the idle thread of its pCPU.
    pub fn is_idle(&self, obj: &Arc<ThreadObject>) -> bool {
        self.ctl[obj.pcpu()]
            .inner
            .lock()
            .idle
            .as_ref()
            .map(|idle| Arc::ptr_eq(idle, obj))
            .unwrap_or(false)
    }

    /// Returns true if `pcpu` has to reschedule.
    pub fn need_reschedule(&self, pcpu: PcpuId) -> bool {
        self.ctl[pcpu].need_resched.load(Ordering::SeqCst)
    }

    /// Ask `pcpu` to reschedule. A remote pCPU is kicked with the notification
    /// IPI so that it leaves the guest or the halt.
    pub fn make_reschedule_request(&self, pcpu: PcpuId, local: PcpuId) {
        self.ctl[pcpu].need_resched.store(true, Ordering::SeqCst);
        if pcpu != local {
            self.platform.send_ipi(pcpu, NOTIFY_VECTOR);
        }
    }

    /// Put `obj` to sleep.
    ///
    /// If `obj` is running, it keeps running until its pCPU reschedules.
    pub fn sleep_thread(&self, obj: &Arc<ThreadObject>, local: PcpuId) {
        let pcpu = obj.pcpu();
        let state = self.platform.irq_save();
        let mut inner = self.ctl[pcpu].inner.lock();
        inner.policy.sleep(obj);
        if obj.state() == ThreadState::Running {
            obj.be_blocking.store(true, Ordering::SeqCst);
            self.make_reschedule_request(pcpu, local);
        } else {
            obj.set_state(ThreadState::Blocked);
        }
        drop(inner);
        self.platform.irq_restore(state);
    }

    /// Wake `obj` up, cancelling a sleep that has not taken effect yet.
    pub fn wake_thread(&self, obj: &Arc<ThreadObject>, local: PcpuId) {
        let pcpu = obj.pcpu();
        let state = self.platform.irq_save();
        let mut inner = self.ctl[pcpu].inner.lock();
        let blocking = obj.be_blocking.swap(false, Ordering::SeqCst);
        if obj.state() == ThreadState::Blocked || blocking {
            inner.policy.wake(obj);
            if obj.state() == ThreadState::Blocked {
                obj.set_state(ThreadState::Runnable);
                self.make_reschedule_request(pcpu, local);
            }
        }
        drop(inner);
        self.platform.irq_restore(state);
    }

    /// Wake `obj` from another pCPU; same as [`Scheduler::wake_thread`].
    pub fn kick_thread(&self, obj: &Arc<ThreadObject>, local: PcpuId) {
        self.wake_thread(obj, local)
    }

    /// Pick the next thread of `pcpu` and switch to it if it is not the
    /// current one.
    ///
    /// Returns after some later switch resumes the calling thread.
    pub fn schedule(&self, pcpu: PcpuId) {
        let ctl = &self.ctl[pcpu];
        let state = self.platform.irq_save();
        let mut inner = ctl.inner.lock();
        let next = inner.policy.pick_next().or_else(|| inner.idle.clone());
        ctl.need_resched.store(false, Ordering::SeqCst);

        let (prev, next) = match (inner.curr.clone(), next) {
            (Some(prev), Some(next)) if !Arc::ptr_eq(&prev, &next) => (prev, next),
            (None, Some(next)) => {
                log::warn!("pCPU{} schedules without a current thread", pcpu);
                next.set_state(ThreadState::Running);
                inner.curr = Some(next);
                drop(inner);
                self.platform.irq_restore(state);
                return;
            }
            _ => {
                drop(inner);
                self.platform.irq_restore(state);
                return;
            }
        };

        if prev.be_blocking.swap(false, Ordering::SeqCst) {
            prev.set_state(ThreadState::Blocked);
        } else {
            prev.set_state(ThreadState::Runnable);
        }
        next.set_state(ThreadState::Running);
        inner.curr = Some(next.clone());
        log::trace!("pCPU{}: {} -> {}", pcpu, prev.name(), next.name());
        // Never switch with the lock held.
        drop(inner);
        self.platform.irq_restore(state);
        // Safety: both frames belong to threads pinned to this pCPU; `prev`
        // is the running context and `next` was saved by an earlier switch
        // or prepared at spawn.
        unsafe { self.platform.switch_context(prev.frame(), next.frame()) };
    }

    /// Give up the pCPU voluntarily.
    pub fn yield_current(&self, pcpu: PcpuId) {
        self.make_reschedule_request(pcpu, pcpu);
        self.schedule(pcpu);
    }

    /// One iteration of the idle loop of `pcpu`.
    ///
    /// Halts unless a reschedule is already pending. The check and the halt
    /// happen with interrupts disabled and the halt re-enables them
    /// atomically, so a wake cannot slip in between.
    pub fn run_idle_once(&self, pcpu: PcpuId) {
        let state = self.platform.irq_save();
        if self.need_reschedule(pcpu) {
            self.platform.irq_restore(state);
        } else {
            self.platform.wait_for_interrupt();
        }
        if self.need_reschedule(pcpu) {
            self.schedule(pcpu);
        }
    }
}
