//! Deadline timers.
//!
//! Every pCPU keeps the timers armed on it in a list sorted by deadline and
//! programs its hardware one-shot deadline to the earliest one. The hardware
//! interrupt only raises [`SoftirqLine::Timer`]; expired timers fire from the
//! timer softirq with interrupts enabled.
//!
//! A timer callback must not add or delete its own timer.

use crate::{
    error::{HvError, HvResult},
    percpu::{PcpuId, PerCpu},
    softirq::{Softirq, SoftirqLine},
};
use abyss::platform::Platform;
use alloc::{boxed::Box, sync::Arc, vec::Vec};
use spin_lock::SpinLock;

/// Maximum number of timers fired in a single softirq pass.
pub const MAX_TIMER_ACTIONS: usize = 32;

/// How a timer behaves after it fires.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TimerMode {
    /// Fire once.
    OneShot,
    /// Fire again `period` ticks after each deadline.
    Periodic(u64),
}

struct TimerState {
    deadline: u64,
    mode: TimerMode,
    armed_on: Option<PcpuId>,
}

/// A deadline timer.
pub struct Timer {
    state: SpinLock<TimerState>,
    callback: Box<dyn Fn() + Send + Sync>,
}

impl Timer {
    /// A stopped timer running `callback` when it fires.
    pub fn new(mode: TimerMode, callback: impl Fn() + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            state: SpinLock::new(TimerState {
                deadline: 0,
                mode,
                armed_on: None,
            }),
            callback: Box::new(callback),
        })
    }

    /// Deadline of the last arming, 0 if never armed.
    pub fn deadline(&self) -> u64 {
        self.state.lock().deadline
    }

    /// Current mode.
    pub fn mode(&self) -> TimerMode {
        self.state.lock().mode
    }

    /// Returns true if the timer is armed on some pCPU.
    pub fn is_started(&self) -> bool {
        self.state.lock().armed_on.is_some()
    }

    /// Change mode and deadline of a stopped timer.
    pub fn update(&self, deadline: u64, mode: TimerMode) -> HvResult {
        let mut state = self.state.lock();
        if state.armed_on.is_some() {
            return Err(HvError::Busy);
        }
        state.deadline = deadline;
        state.mode = mode;
        Ok(())
    }
}

struct Armed {
    deadline: u64,
    timer: Arc<Timer>,
}

/// The per-pCPU timer lists.
pub struct TimerService {
    platform: Arc<dyn Platform>,
    lists: PerCpu<SpinLock<Vec<Armed>>>,
}

impl TimerService {
    /// Timer lists for `nr_pcpus` pCPUs.
    pub fn new(platform: Arc<dyn Platform>, nr_pcpus: usize) -> Self {
        Self {
            platform,
            lists: PerCpu::new(nr_pcpus, |_| SpinLock::new(Vec::new())),
        }
    }

    // Insert after every entry with an equal or earlier deadline; program the
    // hardware if the timer became the earliest.
    fn insert(&self, pcpu: PcpuId, list: &mut Vec<Armed>, deadline: u64, timer: Arc<Timer>) {
        let pos = list.partition_point(|a| a.deadline <= deadline);
        list.insert(pos, Armed { deadline, timer });
        if pos == 0 {
            self.platform.set_deadline(pcpu, deadline);
        }
    }

    fn reprogram(&self, pcpu: PcpuId, list: &[Armed]) {
        self.platform
            .set_deadline(pcpu, list.first().map(|a| a.deadline).unwrap_or(0));
    }

    /// Arm `timer` on `pcpu` at `deadline`.
    ///
    /// Only the owning pCPU arms its timers; arming on another pCPU goes
    /// through an SMP call.
    pub fn add_timer(&self, pcpu: PcpuId, timer: &Arc<Timer>, deadline: u64) -> HvResult {
        if pcpu >= self.lists.len() || deadline == 0 {
            return Err(HvError::InvalidArgument);
        }
        let mut state = timer.state.lock();
        if matches!(state.mode, TimerMode::Periodic(0)) {
            return Err(HvError::InvalidArgument);
        }
        if state.armed_on.is_some() {
            return Err(HvError::Busy);
        }
        state.deadline = deadline;
        state.armed_on = Some(pcpu);
        drop(state);

        let mut list = self.lists[pcpu].lock();
        self.insert(pcpu, &mut list, deadline, timer.clone());
        Ok(())
    }

    /// Disarm `timer`. Returns false if it was not armed.
    pub fn del_timer(&self, timer: &Arc<Timer>) -> bool {
        let pcpu = match timer.state.lock().armed_on.take() {
            Some(pcpu) => pcpu,
            None => return false,
        };
        let mut list = self.lists[pcpu].lock();
        if let Some(pos) = list.iter().position(|a| Arc::ptr_eq(&a.timer, timer)) {
            list.remove(pos);
            if pos == 0 {
                self.reprogram(pcpu, &list);
            }
        }
        true
    }

    /// Number of timers armed on `pcpu`.
    pub fn armed(&self, pcpu: PcpuId) -> usize {
        self.lists[pcpu].lock().len()
    }

    /// Hardware deadline interrupt of `pcpu`.
    pub fn handle_timer_irq(&self, pcpu: PcpuId, softirq: &Softirq) {
        softirq.raise(pcpu, SoftirqLine::Timer);
    }

    /// Fire the expired timers of `pcpu` in deadline order.
    ///
    /// At most [`MAX_TIMER_ACTIONS`] timers fire per call. Returns true if
    /// expired timers are left over.
    pub fn run_expired(&self, pcpu: PcpuId) -> bool {
        let now = self.platform.now();
        let expired: Vec<Armed> = {
            let mut list = self.lists[pcpu].lock();
            let n = list
                .iter()
                .take(MAX_TIMER_ACTIONS)
                .take_while(|a| a.deadline <= now)
                .count();
            list.drain(..n).collect()
        };

        for Armed { deadline, timer } in expired {
            let rearm = {
                let mut state = timer.state.lock();
                state.armed_on = None;
                match state.mode {
                    TimerMode::Periodic(period) => {
                        let next = deadline.checked_add(period);
                        if next.is_none() {
                            log::warn!("periodic timer at {:#x} overflows, not re-armed", deadline);
                        }
                        next
                    }
                    TimerMode::OneShot => None,
                }
            };
            (timer.callback)();
            if let Some(next) = rearm {
                let mut state = timer.state.lock();
                // Skip if the timer was re-armed or retuned meanwhile.
                if state.armed_on.is_none() && state.deadline == deadline {
                    state.deadline = next;
                    state.armed_on = Some(pcpu);
                    drop(state);
                    let mut list = self.lists[pcpu].lock();
                    let pos = list.partition_point(|a| a.deadline <= next);
                    list.insert(pos, Armed { deadline: next, timer });
                }
            }
        }

        let list = self.lists[pcpu].lock();
        self.reprogram(pcpu, &list);
        list.first().map(|a| a.deadline <= now).unwrap_or(false)
    }

    /// Handler of [`SoftirqLine::Timer`].
    pub fn softirq_handler(self: Arc<Self>) -> impl Fn(&Softirq, PcpuId) + Send + Sync {
        move |softirq, pcpu| {
            if self.run_expired(pcpu) {
                softirq.raise(pcpu, SoftirqLine::Timer);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::softirq::SoftirqBuilder;
    use abyss::platform::mock::MockPlatform;
    use std::sync::Mutex;

    fn recorder(log: &Arc<Mutex<Vec<&'static str>>>, name: &'static str) -> impl Fn() {
        let log = log.clone();
        move || log.lock().unwrap().push(name)
    }

    #[test]
    fn only_expired_timer_fires_and_deadline_moves_on() {
        let platform = Arc::new(MockPlatform::new());
        let timers = TimerService::new(platform.clone(), 1);
        let log = Arc::new(Mutex::new(Vec::new()));
        let t1 = Timer::new(TimerMode::OneShot, recorder(&log, "t1"));
        let t2 = Timer::new(TimerMode::OneShot, recorder(&log, "t2"));

        timers.add_timer(0, &t1, 100).unwrap();
        assert_eq!(platform.deadline(0), Some(100));
        timers.add_timer(0, &t2, 50).unwrap();
        assert_eq!(platform.deadline(0), Some(50));

        platform.set_now(50);
        assert!(!timers.run_expired(0));
        assert_eq!(*log.lock().unwrap(), vec!["t2"]);
        assert_eq!(platform.deadline(0), Some(100));
        assert!(!t2.is_started());
        assert!(t1.is_started());
    }

    #[test]
    fn timers_fire_in_deadline_order() {
        let platform = Arc::new(MockPlatform::new());
        let timers = TimerService::new(platform.clone(), 1);
        let log = Arc::new(Mutex::new(Vec::new()));
        let names = ["a", "b", "c", "d"];
        let deadlines = [40, 10, 30, 20];
        let armed: Vec<_> = names
            .iter()
            .zip(deadlines)
            .map(|(name, deadline)| {
                let t = Timer::new(TimerMode::OneShot, recorder(&log, name));
                timers.add_timer(0, &t, deadline).unwrap();
                t
            })
            .collect();
        platform.set_now(35);
        timers.run_expired(0);
        platform.set_now(1000);
        timers.run_expired(0);
        assert_eq!(*log.lock().unwrap(), vec!["b", "d", "c", "a"]);
        assert_eq!(platform.deadline(0), None);
        assert!(armed.iter().all(|t| !t.is_started()));
    }

    #[test]
    fn periodic_timer_rearms_from_its_deadline() {
        let platform = Arc::new(MockPlatform::new());
        let timers = TimerService::new(platform.clone(), 1);
        let log = Arc::new(Mutex::new(Vec::new()));
        let t = Timer::new(TimerMode::Periodic(100), recorder(&log, "tick"));
        timers.add_timer(0, &t, 100).unwrap();

        // Serviced late; the next deadline does not drift.
        platform.set_now(130);
        timers.run_expired(0);
        assert_eq!(t.deadline(), 200);
        assert_eq!(platform.deadline(0), Some(200));

        platform.set_now(200);
        timers.run_expired(0);
        assert_eq!(t.deadline(), 300);
        assert_eq!(log.lock().unwrap().len(), 2);

        assert!(timers.del_timer(&t));
        assert!(!timers.del_timer(&t));
        assert_eq!(platform.deadline(0), None);
    }

    #[test]
    fn periodic_timer_at_end_of_time_stops() {
        let platform = Arc::new(MockPlatform::new());
        let timers = TimerService::new(platform.clone(), 1);
        let log = Arc::new(Mutex::new(Vec::new()));
        let t = Timer::new(TimerMode::Periodic(1000), recorder(&log, "tick"));
        timers.add_timer(0, &t, u64::MAX - 10).unwrap();

        platform.set_now(u64::MAX);
        assert!(!timers.run_expired(0));
        assert_eq!(log.lock().unwrap().len(), 1);
        assert!(!t.is_started());
        assert_eq!(timers.armed(0), 0);
        assert_eq!(platform.deadline(0), None);
    }

    #[test]
    fn arming_rules() {
        let platform = Arc::new(MockPlatform::new());
        let timers = TimerService::new(platform, 2);
        let t = Timer::new(TimerMode::OneShot, || ());
        assert_eq!(timers.add_timer(0, &t, 0), Err(HvError::InvalidArgument));
        assert_eq!(timers.add_timer(2, &t, 10), Err(HvError::InvalidArgument));
        timers.add_timer(1, &t, 10).unwrap();
        assert_eq!(timers.add_timer(1, &t, 20), Err(HvError::Busy));
        assert_eq!(t.update(20, TimerMode::Periodic(5)), Err(HvError::Busy));
        assert!(timers.del_timer(&t));
        t.update(20, TimerMode::Periodic(0)).unwrap();
        assert_eq!(timers.add_timer(1, &t, 20), Err(HvError::InvalidArgument));
        assert_eq!(timers.armed(1), 0);
    }

    #[test]
    fn softirq_drains_in_bounded_batches() {
        let platform = Arc::new(MockPlatform::new());
        let timers = Arc::new(TimerService::new(platform.clone(), 1));
        let softirq = SoftirqBuilder::new()
            .register(SoftirqLine::Timer, timers.clone().softirq_handler())
            .build(platform.clone(), 1);
        let fired = Arc::new(Mutex::new(0usize));
        let armed: Vec<_> = (0..MAX_TIMER_ACTIONS + 8)
            .map(|i| {
                let fired = fired.clone();
                let t = Timer::new(TimerMode::OneShot, move || *fired.lock().unwrap() += 1);
                timers.add_timer(0, &t, 1 + i as u64).unwrap();
                t
            })
            .collect();

        platform.set_now(1000);
        assert!(timers.run_expired(0));
        assert_eq!(*fired.lock().unwrap(), MAX_TIMER_ACTIONS);

        timers.handle_timer_irq(0, &softirq);
        softirq.do_softirq(0);
        assert_eq!(*fired.lock().unwrap(), MAX_TIMER_ACTIONS + 8);
        assert_eq!(timers.armed(0), 0);
        drop(armed);
    }
}
