//! The no-op policy.
//!
//! A pCPU runs at most one assigned thread, the vCPU thread pinned to it; the
//! idle thread runs whenever nothing is assigned.

use super::{SchedPolicy, ThreadObject};
use crate::percpu::PcpuId;
use alloc::sync::Arc;

/// Single-assignment scheduling policy.
#[derive(Default)]
pub struct NoopPolicy {
    assigned: Option<Arc<ThreadObject>>,
}

impl NoopPolicy {
    /// Policy with nothing assigned.
    pub fn new() -> Self {
        Self::default()
    }

    /// The assigned thread, if any.
    pub fn assigned(&self) -> Option<&Arc<ThreadObject>> {
        self.assigned.as_ref()
    }
}

impl SchedPolicy for NoopPolicy {
    fn init(&mut self, _pcpu: PcpuId) {
        self.assigned = None;
    }

    fn pick_next(&mut self) -> Option<Arc<ThreadObject>> {
        self.assigned.clone()
    }

    fn sleep(&mut self, obj: &Arc<ThreadObject>) {
        if self
            .assigned
            .as_ref()
            .map(|a| Arc::ptr_eq(a, obj))
            .unwrap_or(false)
        {
            self.assigned = None;
        }
    }

    fn wake(&mut self, obj: &Arc<ThreadObject>) {
        match &self.assigned {
            None => self.assigned = Some(obj.clone()),
            Some(a) if Arc::ptr_eq(a, obj) => (),
            // A second thread on the same pCPU stays unassigned.
            Some(a) => log::warn!(
                "pCPU{}: {} woken while {} is assigned; ignored",
                obj.pcpu(),
                obj.name(),
                a.name()
            ),
        }
    }
}
