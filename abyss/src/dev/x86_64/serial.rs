//! 16550 serial device driver.
use crate::x86_64::pio::Pio;

/// Legacy COM1 port.
pub const COM1: u16 = 0x3f8;

/// A 16550-compatible UART on the port space.
pub struct Serial {
    base: Option<Pio>,
}

impl Serial {
    /// Create a serial device interface on COM1.
    pub const fn new() -> Self {
        Serial {
            base: Some(Pio::new(COM1)),
        }
    }

    /// Serial on the given port base.
    pub const fn on_port(port: u16) -> Self {
        Serial {
            base: Some(Pio::new(port)),
        }
    }

    /// A serial that swallows every byte.
    pub const fn disabled() -> Self {
        Serial { base: None }
    }

    /// Returns true if output goes to a device.
    pub fn is_enabled(&self) -> bool {
        self.base.is_some()
    }

    /// Program 115200 8N1 and enable the FIFO.
    pub fn init(&self) {
        if let Some(base) = self.base {
            base.offset(1).write_u8(0);
            base.offset(3).write_u8(0x80);
            // Divisor 1: 115200 baud.
            base.write_u8(1);
            base.offset(1).write_u8(0);
            base.offset(3).write_u8(0x03);
            base.offset(2).write_u8(0xc7);
            base.offset(4).write_u8(0x0b);
        }
    }

    fn put(&self, base: Pio, b: u8) {
        for _ in 0..12800 {
            if base.offset(5).read_u8() & 0x20 != 0 {
                break;
            }
            core::hint::spin_loop();
        }
        base.write_u8(b);
    }
}

impl Default for Serial {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Write for Serial {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        if let Some(base) = self.base {
            for b in s.bytes() {
                if b == b'\n' {
                    self.put(base, b'\r');
                }
                self.put(base, b);
            }
        }
        Ok(())
    }
}
