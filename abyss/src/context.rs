//! The context-switch primitive.
//!
//! This is the only place where control flow moves between threads of
//! execution. [`save_and_switch_context`] pushes the callee-saved registers of
//! the caller on its own stack, stores the stack pointer into `prev`, loads the
//! stack pointer from `next` and pops the callee-saved registers of the next
//! thread. Everything else the System V ABI considers caller-saved is already
//! spilled by the compiler around the call.
//!
//! A fresh thread is started by [`SwitchFrame::prepare`], which lays out a
//! frame whose return address is the thread trampoline. The trampoline calls
//! the entry function with its argument and traps if the entry returns.

/// Saved stack pointer of a switched-out thread.
#[repr(C)]
#[derive(Debug, Default)]
pub struct SwitchFrame {
    rsp: usize,
}

/// Callee-saved registers pushed by the switch routine, in stack order.
#[cfg(target_arch = "x86_64")]
#[repr(C)]
struct InitialFrame {
    r15: usize,
    r14: usize,
    // Entry argument.
    r13: usize,
    // Entry function.
    r12: usize,
    rbx: usize,
    rbp: usize,
    ret: usize,
}

/// Thread entry function.
pub type ThreadEntry = extern "C" fn(usize);

impl SwitchFrame {
    /// An empty frame, filled by the first switch away from the thread.
    pub const fn new() -> Self {
        Self { rsp: 0 }
    }

    /// Stack pointer recorded in this frame.
    pub fn rsp(&self) -> usize {
        self.rsp
    }

    /// Prepare a frame that starts `entry(arg)` on the stack `stack`.
    ///
    /// # Safety
    /// `stack` must stay alive and unused by anybody else until the thread
    /// started from this frame has finished.
    #[cfg(target_arch = "x86_64")]
    pub unsafe fn prepare(stack: &mut [u8], entry: ThreadEntry, arg: usize) -> Self {
        extern "C" {
            fn abyss_thread_trampoline();
        }
        let top = (stack.as_mut_ptr() as usize + stack.len()) & !0xf;
        // After popping the frame and returning into the trampoline, rsp is
        // 16-byte aligned right before the call to `entry`.
        let frame = top - core::mem::size_of::<InitialFrame>() - 16;
        debug_assert!(frame >= stack.as_ptr() as usize);
        (frame as *mut InitialFrame).write(InitialFrame {
            r15: 0,
            r14: 0,
            r13: arg,
            r12: entry as usize,
            rbx: 0,
            rbp: 0,
            ret: abyss_thread_trampoline as usize,
        });
        Self { rsp: frame }
    }
}

#[cfg(target_arch = "x86_64")]
core::arch::global_asm!(
    ".text",
    ".global abyss_switch_context",
    "abyss_switch_context:",
    "push rbp",
    "push rbx",
    "push r12",
    "push r13",
    "push r14",
    "push r15",
    "mov [rdi], rsp",
    "mov rsp, rsi",
    "pop r15",
    "pop r14",
    "pop r13",
    "pop r12",
    "pop rbx",
    "pop rbp",
    "ret",
    ".global abyss_thread_trampoline",
    "abyss_thread_trampoline:",
    "mov rdi, r13",
    "call r12",
    "ud2",
);

/// Save the running context into `prev` and resume the context of `next`.
///
/// Returns when some other thread switches back to `prev`.
///
/// # Safety
/// `next` must hold a frame saved by a previous switch or produced by
/// [`SwitchFrame::prepare`], and its stack must still be alive. No spinlock may
/// be held across this call.
#[cfg(target_arch = "x86_64")]
pub unsafe fn save_and_switch_context(prev: *mut SwitchFrame, next: *const SwitchFrame) {
    extern "C" {
        fn abyss_switch_context(prev_rsp: *mut usize, next_rsp: usize);
    }
    abyss_switch_context(core::ptr::addr_of_mut!((*prev).rsp), (*next).rsp);
}

#[cfg(all(test, target_arch = "x86_64", target_os = "linux"))]
mod tests {
    use super::{save_and_switch_context, SwitchFrame};

    struct Pair {
        main: SwitchFrame,
        child: SwitchFrame,
        log: Vec<u64>,
    }

    extern "C" fn child_entry(arg: usize) {
        let pair = unsafe { &mut *(arg as *mut Pair) };
        let local = 0x5eed_u64;
        pair.log.push(1);
        unsafe { save_and_switch_context(&mut pair.child, &pair.main) };
        // Resumed by the second switch from the main thread.
        pair.log.push(local + 2);
        unsafe { save_and_switch_context(&mut pair.child, &pair.main) };
        unreachable!();
    }

    #[test]
    fn switch_away_and_back_preserves_state() {
        let mut stack = vec![0u8; 64 * 1024];
        let pair = Box::into_raw(Box::new(Pair {
            main: SwitchFrame::new(),
            child: SwitchFrame::new(),
            log: Vec::new(),
        }));
        unsafe {
            (*pair).child = SwitchFrame::prepare(&mut stack, child_entry, pair as usize);
            save_and_switch_context(&mut (*pair).main, &(*pair).child);
            assert_eq!((*pair).log, vec![1]);
            save_and_switch_context(&mut (*pair).main, &(*pair).child);
            assert_eq!((*pair).log, vec![1, 0x5eed + 2]);
            assert_ne!((*pair).child.rsp(), 0);
            drop(Box::from_raw(pair));
        }
        drop(stack);
    }
}
