//! Port mapped io interface

/// A Port-mapped io.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Pio(u16);

impl Pio {
    /// Create a new port mapped io interface.
    #[inline(always)]
    pub const fn new(port: u16) -> Self {
        Pio(port)
    }

    /// Port number.
    #[inline(always)]
    pub const fn port(self) -> u16 {
        self.0
    }

    /// Port `n` bytes after this one.
    #[inline(always)]
    pub const fn offset(self, n: u16) -> Self {
        Pio(self.0 + n)
    }
}

#[cfg(target_os = "none")]
impl Pio {
    /// Read u8 from port.
    #[inline(always)]
    pub fn read_u8(self) -> u8 {
        let ret: u8;
        unsafe {
            core::arch::asm!("in al, dx", lateout("al") ret, in("dx") self.0, options(nomem, nostack));
        }
        ret
    }

    /// Write u8 to port.
    #[inline(always)]
    pub fn write_u8(self, data: u8) {
        unsafe {
            core::arch::asm!("out dx, al", in("al") data, in("dx") self.0, options(nomem, nostack));
        }
    }
}

// Hosted builds have no port space: reads float high and writes vanish.
#[cfg(not(target_os = "none"))]
impl Pio {
    /// Read u8 from port.
    #[inline(always)]
    pub fn read_u8(self) -> u8 {
        0xff
    }

    /// Write u8 to port.
    #[inline(always)]
    pub fn write_u8(self, _data: u8) {}
}
