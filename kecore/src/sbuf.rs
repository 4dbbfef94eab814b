//! Shared ring buffers.
//!
//! A shared buffer exports fixed-size records from the hypervisor to a
//! consumer outside of it (trace and log readers in the service VM). The
//! buffer lives in memory both sides can reach and starts with a 64-byte
//! [`SbufHeader`]; the records follow it. The hypervisor produces and advances
//! `tail`, the consumer advances `head`. The buffer is empty when
//! `head == tail` and full when advancing `tail` would make it equal to
//! `head`, so it holds at most `ele_num - 1` records.

use crate::{
    error::{HvError, HvResult},
    percpu::{PcpuId, PerCpu},
};
use abyss::addressing::Va;
use core::{
    ptr::NonNull,
    sync::atomic::{AtomicU32, Ordering},
};
use spin_lock::SpinLock;

/// Magic of an initialized shared buffer.
pub const SBUF_MAGIC: u64 = 0x5aa5_7aa7_1aa1_3aa3;
/// Upper bound of the record area.
pub const SBUF_MAX_SIZE: usize = 1 << 22;
/// Header size.
pub const SBUF_HEAD_SIZE: usize = 64;

/// Count records dropped because the buffer was full.
pub const OVERRUN_CNT_EN: u64 = 1 << 0;
/// Overwrite the oldest record when the buffer is full.
pub const OVERWRITE_EN: u64 = 1 << 1;

/// Users of per-pCPU shared buffers.
#[repr(u32)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, num_enum::TryFromPrimitive)]
pub enum SbufId {
    /// Hypervisor trace events.
    Trace = 0,
    /// Hypervisor log.
    HvLog = 1,
    /// Sampling profiler.
    Sep = 2,
    /// Power and performance monitor.
    SocWatch = 3,
}

/// Number of buffer ids.
pub const SBUF_ID_MAX: usize = 4;

/// Layout of the buffer header.
#[repr(C)]
pub struct SbufHeader {
    pub magic: u64,
    pub ele_num: u32,
    pub ele_size: u32,
    pub head: AtomicU32,
    pub tail: AtomicU32,
    pub flags: u64,
    pub overrun_cnt: AtomicU32,
    pub size: u32,
    _padding: [u32; 6],
}

const _: () = assert!(core::mem::size_of::<SbufHeader>() == SBUF_HEAD_SIZE);

/// The producer side of a shared buffer.
///
/// The geometry is read once, when the handle is made. `head` and `tail` are
/// checked against it on every access since the consumer may scribble on
/// them at any time.
pub struct SharedBuffer {
    hdr: NonNull<SbufHeader>,
    ele_size: u32,
    size: u32,
    flags: u64,
}

// The header fields moved by both sides are atomics; the record area is only
// written by the single producer.
unsafe impl Send for SharedBuffer {}

impl SharedBuffer {
    /// Initialize a buffer of `ele_num` records of `ele_size` bytes at `va`.
    ///
    /// # Safety
    /// `va` must point to `SBUF_HEAD_SIZE + ele_num * ele_size` writable bytes,
    /// 8-byte aligned, that outlive the returned handle.
    pub unsafe fn init(va: Va, ele_num: u32, ele_size: u32, flags: u64) -> HvResult<Self> {
        let size = (ele_num as usize)
            .checked_mul(ele_size as usize)
            .ok_or(HvError::InvalidArgument)?;
        if ele_num < 2 || ele_size == 0 || size > SBUF_MAX_SIZE {
            return Err(HvError::InvalidArgument);
        }
        let hdr = NonNull::new(va.as_mut_ptr::<SbufHeader>()).ok_or(HvError::InvalidArgument)?;
        hdr.as_ptr().write(SbufHeader {
            magic: SBUF_MAGIC,
            ele_num,
            ele_size,
            head: AtomicU32::new(0),
            tail: AtomicU32::new(0),
            flags,
            overrun_cnt: AtomicU32::new(0),
            size: size as u32,
            _padding: [0; 6],
        });
        Ok(Self {
            hdr,
            ele_size,
            size: size as u32,
            flags,
        })
    }

    /// Attach to a buffer the consumer initialized at `va`, of which `len`
    /// bytes are reachable.
    ///
    /// # Safety
    /// `va` must point to `len` readable and writable bytes, 8-byte aligned,
    /// that outlive the returned handle.
    pub unsafe fn attach(va: Va, len: usize) -> HvResult<Self> {
        if len < SBUF_HEAD_SIZE {
            return Err(HvError::InvalidArgument);
        }
        let hdr = NonNull::new(va.as_mut_ptr::<SbufHeader>()).ok_or(HvError::InvalidArgument)?;
        let p = hdr.as_ptr();
        let magic = core::ptr::addr_of!((*p).magic).read_volatile();
        let ele_num = core::ptr::addr_of!((*p).ele_num).read_volatile();
        let ele_size = core::ptr::addr_of!((*p).ele_size).read_volatile();
        let size = core::ptr::addr_of!((*p).size).read_volatile();
        let flags = core::ptr::addr_of!((*p).flags).read_volatile();
        if magic != SBUF_MAGIC
            || ele_size == 0
            || ele_num < 2
            || size as usize > SBUF_MAX_SIZE
            || size as u64 != ele_num as u64 * ele_size as u64
            || SBUF_HEAD_SIZE + size as usize > len
        {
            return Err(HvError::InvalidArgument);
        }
        let sbuf = Self {
            hdr,
            ele_size,
            size,
            flags,
        };
        let h = sbuf.header();
        let (head, tail) = (h.head.load(Ordering::Acquire), h.tail.load(Ordering::Acquire));
        if !sbuf.valid(head) || !sbuf.valid(tail) {
            log::warn!("sbuf: bad head 0x{:x} or tail 0x{:x}", head, tail);
            return Err(HvError::InvalidArgument);
        }
        Ok(sbuf)
    }

    fn header(&self) -> &SbufHeader {
        // Safety: valid for the lifetime of the handle, see init and attach.
        unsafe { self.hdr.as_ref() }
    }

    // Offsets the producer may use: the start of a record in the area.
    fn valid(&self, offset: u32) -> bool {
        offset < self.size && offset % self.ele_size == 0
    }

    fn record(&self, offset: u32) -> *mut u8 {
        debug_assert!(self.valid(offset));
        // Safety: valid offsets start a record inside the record area.
        unsafe {
            (self.hdr.as_ptr() as *mut u8).add(SBUF_HEAD_SIZE + offset as usize)
        }
    }

    fn next(&self, offset: u32) -> u32 {
        match offset.checked_add(self.ele_size) {
            Some(next) if next < self.size => next,
            _ => 0,
        }
    }

    // Current `(head, tail)`, if the consumer left them sane.
    fn cursors(&self) -> Option<(u32, u32)> {
        let h = self.header();
        let head = h.head.load(Ordering::Acquire);
        let tail = h.tail.load(Ordering::Acquire);
        if self.valid(head) && self.valid(tail) {
            Some((head, tail))
        } else {
            log::warn!("sbuf: corrupt head 0x{:x} or tail 0x{:x}", head, tail);
            None
        }
    }

    /// Size of one record.
    pub fn ele_size(&self) -> u32 {
        self.ele_size
    }

    /// Returns true if no record is pending.
    pub fn is_empty(&self) -> bool {
        let h = self.header();
        h.head.load(Ordering::Acquire) == h.tail.load(Ordering::Acquire)
    }

    /// Number of records dropped so far, if counting is enabled.
    pub fn overrun_cnt(&self) -> u32 {
        self.header().overrun_cnt.load(Ordering::Relaxed)
    }

    /// Append the first `ele_size` bytes of `data`.
    ///
    /// Returns the number of bytes written: `ele_size`, or 0 if the buffer is
    /// full and overwriting is disabled, `data` is shorter than a record, or
    /// the cursors are corrupt.
    pub fn put(&self, data: &[u8]) -> u32 {
        let ele_size = self.ele_size;
        if data.len() < ele_size as usize {
            return 0;
        }
        let (head, tail) = match self.cursors() {
            Some(cursors) => cursors,
            None => return 0,
        };
        let h = self.header();
        let next_tail = self.next(tail);
        let mut overwrite = false;
        if next_tail == head {
            h.overrun_cnt
                .fetch_add((self.flags & OVERRUN_CNT_EN) as u32, Ordering::Relaxed);
            if self.flags & OVERWRITE_EN == 0 {
                return 0;
            }
            overwrite = true;
        }
        // Safety: the slot at `tail` is owned by the producer.
        unsafe {
            core::ptr::copy_nonoverlapping(data.as_ptr(), self.record(tail), ele_size as usize)
        };
        if overwrite {
            // The consumer may have moved on meanwhile.
            let _ = h.head.compare_exchange(
                head,
                self.next(head),
                Ordering::AcqRel,
                Ordering::Relaxed,
            );
        }
        h.tail.store(next_tail, Ordering::Release);
        ele_size
    }

    /// Consume the oldest record into `out`.
    ///
    /// Returns `ele_size`, or 0 if the buffer is empty, `out` is too short or
    /// the cursors are corrupt.
    pub fn get(&self, out: &mut [u8]) -> u32 {
        let ele_size = self.ele_size;
        if out.len() < ele_size as usize {
            return 0;
        }
        let (head, tail) = match self.cursors() {
            Some(cursors) => cursors,
            None => return 0,
        };
        if head == tail {
            return 0;
        }
        // Safety: records between head and tail are published by the producer.
        unsafe {
            core::ptr::copy_nonoverlapping(self.record(head), out.as_mut_ptr(), ele_size as usize)
        };
        self.header().head.store(self.next(head), Ordering::Release);
        ele_size
    }
}

/// Memory handed over for a shared buffer.
#[derive(Clone, Copy, Debug)]
pub struct SbufMemory {
    /// Host address of the header.
    pub va: Va,
    /// Bytes reachable from `va`.
    pub len: usize,
    /// Whoever the memory belongs to, see [`SbufRegistry::release_owner`].
    pub owner: usize,
}

struct Registered {
    owner: usize,
    sbuf: SharedBuffer,
}

/// The shared buffers registered for each pCPU.
pub struct SbufRegistry {
    slots: PerCpu<SpinLock<[Option<Registered>; SBUF_ID_MAX]>>,
}

impl SbufRegistry {
    /// Empty registry for `nr_pcpus` pCPUs.
    pub fn new(nr_pcpus: usize) -> Self {
        Self {
            slots: PerCpu::new(nr_pcpus, |_| SpinLock::new([None, None, None, None])),
        }
    }

    /// Register the buffer in `mem` as buffer `sbuf_id` of `pcpu`, or drop the
    /// registration if `mem` is `None`.
    ///
    /// # Safety
    /// The memory must stay valid until the registration is dropped, either
    /// here or by [`Self::release_owner`]. See [`SharedBuffer::attach`].
    pub unsafe fn share_setup(
        &self,
        pcpu: PcpuId,
        sbuf_id: u32,
        mem: Option<SbufMemory>,
    ) -> HvResult {
        let slots = self.slots.get(pcpu).ok_or(HvError::InvalidArgument)?;
        let id = SbufId::try_from(sbuf_id).map_err(|_| HvError::InvalidArgument)?;
        let registered = match mem {
            Some(mem) => Some(Registered {
                owner: mem.owner,
                sbuf: SharedBuffer::attach(mem.va, mem.len)?,
            }),
            None => None,
        };
        slots.lock()[id as usize] = registered;
        log::info!("sbuf {:?} of pCPU{} {}", id, pcpu, if mem.is_some() { "set" } else { "cleared" });
        Ok(())
    }

    /// Drop every registration whose memory belongs to `owner`. Returns the
    /// number dropped.
    ///
    /// Must run before the owner's memory is reused.
    pub fn release_owner(&self, owner: usize) -> usize {
        let mut released = 0;
        for (pcpu, slots) in self.slots.iter() {
            for (id, slot) in slots.lock().iter_mut().enumerate() {
                if matches!(slot, Some(r) if r.owner == owner) {
                    *slot = None;
                    released += 1;
                    log::info!("sbuf {} of pCPU{} released", id, pcpu);
                }
            }
        }
        released
    }

    /// Append a record to buffer `id` of `pcpu`. Returns 0 if none is
    /// registered.
    pub fn put(&self, pcpu: PcpuId, id: SbufId, data: &[u8]) -> u32 {
        match self.slots.get(pcpu) {
            Some(slots) => slots.lock()[id as usize]
                .as_ref()
                .map(|r| r.sbuf.put(data))
                .unwrap_or(0),
            None => 0,
        }
    }

    /// Returns true if buffer `id` of `pcpu` is registered.
    pub fn is_registered(&self, pcpu: PcpuId, id: SbufId) -> bool {
        self.slots
            .get(pcpu)
            .map(|slots| slots.lock()[id as usize].is_some())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backing(ele_num: usize, ele_size: usize) -> Vec<u64> {
        vec![0u64; (SBUF_HEAD_SIZE + ele_num * ele_size + 7) / 8]
    }

    #[test]
    fn records_come_out_in_order() {
        let mut mem = backing(4, 8);
        let sbuf = unsafe { SharedBuffer::init(Va::from_ptr(mem.as_mut_ptr()), 4, 8, 0) }.unwrap();
        for i in 0..3u64 {
            assert_eq!(sbuf.put(&i.to_le_bytes()), 8);
        }
        // Capacity is ele_num - 1.
        assert_eq!(sbuf.put(&9u64.to_le_bytes()), 0);
        assert_eq!(sbuf.overrun_cnt(), 0);

        let mut out = [0u8; 8];
        for i in 0..3u64 {
            assert_eq!(sbuf.get(&mut out), 8);
            assert_eq!(u64::from_le_bytes(out), i);
        }
        assert_eq!(sbuf.get(&mut out), 0);
        assert!(sbuf.is_empty());
    }

    #[test]
    fn overwrite_drops_oldest() {
        let mut mem = backing(3, 4);
        let sbuf = unsafe {
            SharedBuffer::init(
                Va::from_ptr(mem.as_mut_ptr()),
                3,
                4,
                OVERWRITE_EN | OVERRUN_CNT_EN,
            )
        }
        .unwrap();
        for i in 0..4u32 {
            assert_eq!(sbuf.put(&i.to_le_bytes()), 4);
        }
        assert_eq!(sbuf.overrun_cnt(), 2);
        let mut out = [0u8; 4];
        sbuf.get(&mut out);
        assert_eq!(u32::from_le_bytes(out), 2);
        sbuf.get(&mut out);
        assert_eq!(u32::from_le_bytes(out), 3);
        assert!(sbuf.is_empty());
    }

    fn memory(mem: &mut [u64], owner: usize) -> SbufMemory {
        SbufMemory {
            va: Va::from_ptr(mem.as_mut_ptr()),
            len: mem.len() * 8,
            owner,
        }
    }

    #[test]
    fn registry_validates_and_routes() {
        let mut mem = backing(4, 8);
        let m = memory(&mut mem, 0);
        let reg = SbufRegistry::new(2);
        assert_eq!(
            unsafe { reg.share_setup(0, 1, Some(m)) },
            Err(HvError::InvalidArgument)
        );
        unsafe { SharedBuffer::init(m.va, 4, 8, 0) }.unwrap();
        assert_eq!(unsafe { reg.share_setup(2, 1, Some(m)) }, Err(HvError::InvalidArgument));
        assert_eq!(unsafe { reg.share_setup(0, 4, Some(m)) }, Err(HvError::InvalidArgument));
        // The records must fit in the memory handed over.
        let short = SbufMemory { len: m.len - 8, ..m };
        assert_eq!(unsafe { reg.share_setup(1, 1, Some(short)) }, Err(HvError::InvalidArgument));
        unsafe { reg.share_setup(1, 1, Some(m)) }.unwrap();
        assert!(reg.is_registered(1, SbufId::HvLog));
        assert_eq!(reg.put(1, SbufId::HvLog, &[7; 8]), 8);
        assert_eq!(reg.put(0, SbufId::HvLog, &[7; 8]), 0);
        unsafe { reg.share_setup(1, 1, None) }.unwrap();
        assert!(!reg.is_registered(1, SbufId::HvLog));
    }

    #[test]
    fn releasing_an_owner_drops_only_its_buffers() {
        let (mut a, mut b) = (backing(4, 8), backing(4, 8));
        let (ma, mb) = (memory(&mut a, 1), memory(&mut b, 2));
        unsafe {
            SharedBuffer::init(ma.va, 4, 8, 0).unwrap();
            SharedBuffer::init(mb.va, 4, 8, 0).unwrap();
        }
        let reg = SbufRegistry::new(2);
        unsafe {
            reg.share_setup(0, SbufId::Trace as u32, Some(ma)).unwrap();
            reg.share_setup(1, SbufId::HvLog as u32, Some(ma)).unwrap();
            reg.share_setup(1, SbufId::Trace as u32, Some(mb)).unwrap();
        }
        assert_eq!(reg.release_owner(1), 2);
        assert_eq!(reg.release_owner(1), 0);
        assert!(!reg.is_registered(0, SbufId::Trace));
        assert_eq!(reg.put(1, SbufId::HvLog, &[7; 8]), 0);
        assert!(reg.is_registered(1, SbufId::Trace));
        assert_eq!(reg.put(1, SbufId::Trace, &[7; 8]), 8);
    }

    #[test]
    fn consumer_cannot_steer_writes_out_of_the_buffer() {
        // One spare word after the record area.
        let mut mem = backing(4, 8);
        mem.push(0x600d);
        let guard = mem.len() - 1;
        let va = Va::from_ptr(mem.as_mut_ptr());
        let len = SBUF_HEAD_SIZE + 32;
        unsafe { SharedBuffer::init(va, 4, 8, 0) }.unwrap();
        let hdr = unsafe { &*va.as_ptr::<SbufHeader>() };

        // A tail at the end of the area, set before the handover.
        hdr.head.store(8, Ordering::SeqCst);
        hdr.tail.store(32, Ordering::SeqCst);
        assert!(unsafe { SharedBuffer::attach(va, len) }.is_err());

        // The same after the handover, and a tail that is not a record start.
        hdr.tail.store(0, Ordering::SeqCst);
        let attached = unsafe { SharedBuffer::attach(va, len) }.unwrap();
        hdr.tail.store(32, Ordering::SeqCst);
        assert_eq!(attached.put(&0xdead_beefu64.to_le_bytes()), 0);
        hdr.tail.store(12, Ordering::SeqCst);
        assert_eq!(attached.put(&0xdead_beefu64.to_le_bytes()), 0);
        hdr.tail.store(u32::MAX - 3, Ordering::SeqCst);
        assert_eq!(attached.put(&0xdead_beefu64.to_le_bytes()), 0);
        let mut out = [0u8; 8];
        assert_eq!(attached.get(&mut out), 0);
        assert_eq!(mem[guard], 0x600d);

        // Rewriting the geometry after the handover changes nothing.
        let ele_size = unsafe { core::ptr::addr_of_mut!((*va.as_mut_ptr::<SbufHeader>()).ele_size) };
        unsafe { ele_size.write_volatile(64) };
        hdr.head.store(8, Ordering::SeqCst);
        hdr.tail.store(24, Ordering::SeqCst);
        assert_eq!(attached.ele_size(), 8);
        assert_eq!(attached.put(&[1; 64]), 8);
        assert_eq!(hdr.tail.load(Ordering::SeqCst), 0);
        assert_eq!(mem[guard], 0x600d);
    }

    #[test]
    fn init_rejects_bad_geometry() {
        let mut mem = backing(2, 8);
        let va = Va::from_ptr(mem.as_mut_ptr());
        assert!(unsafe { SharedBuffer::init(va, 0, 8, 0) }.is_err());
        assert!(unsafe { SharedBuffer::init(va, 2, 0, 0) }.is_err());
        assert!(unsafe { SharedBuffer::init(va, 2, SBUF_MAX_SIZE as u32, 0) }.is_err());
    }
}
