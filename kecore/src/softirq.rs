//! Software interrupts.
//!
//! Work raised from hard interrupt context is deferred to a softirq line and
//! drained later with interrupts enabled, at a safe point after the interrupt
//! returns. Each line has exactly one handler, installed once through
//! [`SoftirqBuilder`].

use crate::percpu::{PcpuId, PerCpu};
use abyss::platform::Platform;
use alloc::{boxed::Box, sync::Arc};
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Softirq lines, lowest index serviced first.
#[repr(usize)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, num_enum::TryFromPrimitive)]
pub enum SoftirqLine {
    /// Expired timers.
    Timer = 0,
    /// Interrupts of passthrough devices.
    Ptdev = 1,
    /// Thermal events.
    Thermal = 2,
}

/// Number of softirq lines.
pub const NR_SOFTIRQS: usize = 3;

/// Handler of a softirq line, called with the servicing pCPU.
pub type SoftirqHandler = Box<dyn Fn(&Softirq, PcpuId) + Send + Sync>;

/// Collects the handlers before the softirq layer goes live.
#[derive(Default)]
pub struct SoftirqBuilder {
    handlers: [Option<SoftirqHandler>; NR_SOFTIRQS],
}

impl SoftirqBuilder {
    /// Builder without handlers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `handler` for `line`, replacing any earlier one.
    pub fn register(
        mut self,
        line: SoftirqLine,
        handler: impl Fn(&Softirq, PcpuId) + Send + Sync + 'static,
    ) -> Self {
        self.handlers[line as usize] = Some(Box::new(handler));
        self
    }

    /// Finish the table for `nr_pcpus` pCPUs.
    pub fn build(self, platform: Arc<dyn Platform>, nr_pcpus: usize) -> Softirq {
        Softirq {
            platform,
            handlers: self.handlers,
            cpus: PerCpu::new(nr_pcpus, |_| SoftirqCpu {
                pending: AtomicU64::new(0),
                servicing: AtomicBool::new(false),
            }),
        }
    }
}

struct SoftirqCpu {
    pending: AtomicU64,
    servicing: AtomicBool,
}

/// The softirq layer.
pub struct Softirq {
    platform: Arc<dyn Platform>,
    handlers: [Option<SoftirqHandler>; NR_SOFTIRQS],
    cpus: PerCpu<SoftirqCpu>,
}

impl Softirq {
    /// Mark `line` pending on `pcpu`.
    pub fn raise(&self, pcpu: PcpuId, line: SoftirqLine) {
        self.cpus[pcpu]
            .pending
            .fetch_or(1 << line as usize, Ordering::SeqCst);
    }

    /// Bitmap of pending lines on `pcpu`.
    pub fn pending(&self, pcpu: PcpuId) -> u64 {
        self.cpus[pcpu].pending.load(Ordering::SeqCst)
    }

    fn drain(&self, pcpu: PcpuId) {
        let pending = &self.cpus[pcpu].pending;
        loop {
            let bits = pending.load(Ordering::SeqCst);
            let nr = bits.trailing_zeros() as usize;
            if nr >= NR_SOFTIRQS {
                break;
            }
            pending.fetch_and(!(1 << nr), Ordering::SeqCst);
            match &self.handlers[nr] {
                Some(handler) => handler(self, pcpu),
                None => log::warn!("softirq {} raised without a handler", nr),
            }
        }
    }

    /// Service every pending line of `pcpu`.
    ///
    /// Called with interrupts disabled and returns with interrupts disabled.
    /// Nested calls while servicing return immediately.
    pub fn do_softirq(&self, pcpu: PcpuId) {
        let cpu = &self.cpus[pcpu];
        if cpu.servicing.swap(true, Ordering::SeqCst) {
            return;
        }
        self.platform.irq_enable();
        self.drain(pcpu);
        // Catch what was raised while interrupts were on.
        let _ = self.platform.irq_save();
        self.drain(pcpu);
        cpu.servicing.store(false, Ordering::SeqCst);
    }
}
