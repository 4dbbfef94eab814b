//! Cross-pCPU function calls.
//!
//! Each pCPU has a single call slot. [`SmpCall::call_function`] posts a
//! function into the slots of the targeted pCPUs and sends them the
//! notification IPI; the notification handler of each target runs the
//! function in interrupt context. Calls are fire-and-forget: completion has to
//! be built on top, for example with an [`event`](crate::event).

use crate::{
    error::{HvError, HvResult},
    percpu::{PcpuId, PerCpu},
};
use abyss::platform::{Platform, NOTIFY_VECTOR};
use alloc::{sync::Arc, vec::Vec};
use spin_lock::SpinLock;

/// Function run on a remote pCPU, called with that pCPU's id.
pub type SmpCallFn = Arc<dyn Fn(PcpuId) + Send + Sync>;

/// The per-pCPU call slots.
pub struct SmpCall {
    platform: Arc<dyn Platform>,
    slots: PerCpu<SpinLock<Option<SmpCallFn>>>,
}

impl SmpCall {
    /// Call slots for `nr_pcpus` pCPUs.
    pub fn new(platform: Arc<dyn Platform>, nr_pcpus: usize) -> Self {
        Self {
            platform,
            slots: PerCpu::new(nr_pcpus, |_| SpinLock::new(None)),
        }
    }

    /// Run `func` on every pCPU in `mask`.
    ///
    /// Either every target gets the call or none does: if a slot still holds
    /// an unserviced call, nothing is posted and `Busy` is returned.
    pub fn call_function(
        &self,
        mask: u64,
        func: impl Fn(PcpuId) + Send + Sync + 'static,
    ) -> HvResult {
        if mask == 0 || (self.slots.len() < 64 && mask >> self.slots.len() != 0) {
            return Err(HvError::InvalidArgument);
        }
        let func: SmpCallFn = Arc::new(func);
        let targets: Vec<PcpuId> = (0..self.slots.len())
            .filter(|pcpu| mask & (1 << pcpu) != 0)
            .collect();

        // Slots are locked in ascending pCPU order.
        let mut guards = Vec::with_capacity(targets.len());
        for &pcpu in targets.iter() {
            let guard = self.slots[pcpu].lock();
            if guard.is_some() {
                log::debug!("smp call: pCPU{} slot busy", pcpu);
                return Err(HvError::Busy);
            }
            guards.push(guard);
        }
        for guard in guards.iter_mut() {
            **guard = Some(func.clone());
        }
        drop(guards);

        for pcpu in targets {
            self.platform.send_ipi(pcpu, NOTIFY_VECTOR);
        }
        Ok(())
    }

    /// Notification IPI handler of `pcpu`.
    pub fn handle_notification(&self, pcpu: PcpuId) {
        let func = self.slots[pcpu].lock().take();
        if let Some(func) = func {
            func(pcpu);
        }
    }

    /// Send the bare notification IPI to `pcpu`, forcing it out of the guest
    /// or the halt.
    pub fn kick_pcpu(&self, pcpu: PcpuId) {
        self.platform.send_ipi(pcpu, NOTIFY_VECTOR);
    }
}
