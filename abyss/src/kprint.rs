//! Kernel print utilities.
//!
//! The console is a 16550 serial device behind a spinlock. [`Logger`] forwards
//! records of the [`log`] facade to the same console.

use crate::{boot::cmdline::UartConfig, dev::x86_64::serial::Serial};
use core::fmt::Write;
use spin_lock::SpinLock;

static SERIAL: SpinLock<Serial> = SpinLock::new(Serial::new());

#[doc(hidden)]
pub fn _print(fmt: core::fmt::Arguments<'_>) {
    let _ = write!(&mut *SERIAL.lock(), "{}", fmt);
}

/// Reconfigure the console from the boot command line.
///
/// Returns false if the requested device cannot be driven; the console is then
/// disabled.
pub fn configure_console(config: UartConfig) -> bool {
    let (serial, ok) = match config {
        UartConfig::Disabled => (Serial::disabled(), true),
        UartConfig::Port(port) => (Serial::on_port(port), true),
        // PCI UARTs are MMIO-mapped; only port-mapped consoles are driven.
        UartConfig::Pci { .. } => (Serial::disabled(), false),
    };
    serial.init();
    *SERIAL.lock() = serial;
    ok
}

/// Returns true if console output reaches a device.
pub fn console_enabled() -> bool {
    SERIAL.lock().is_enabled()
}

/// Prints out the message.
///
/// Use the format! syntax to write data to the standard output.
/// This first holds the lock for console device.
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => ($crate::kprint::_print(format_args!($($arg)*)));
}

/// Prints out the message with a newline.
///
/// Use the format! syntax to write data to the standard output.
/// This first holds the lock for console device.
#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}

/// [`log`] sink writing to the kernel console.
pub struct Logger;

static LOGGER: Logger = Logger;

impl log::Log for Logger {
    fn enabled(&self, metadata: &log::Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &log::Record<'_>) {
        if self.enabled(record.metadata()) {
            _print(format_args!(
                "[{:<5}] {}: {}\n",
                record.level(),
                record.target(),
                record.args()
            ));
        }
    }

    fn flush(&self) {}
}

/// Install [`Logger`] as the global logger.
///
/// Calling it again only updates the maximum level.
pub fn init_logger(max_level: log::LevelFilter) {
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(max_level);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn console_follows_cmdline() {
        assert!(configure_console(UartConfig::Disabled));
        assert!(!console_enabled());
        assert!(!configure_console(UartConfig::Pci {
            bus: 0,
            dev: 0x18,
            func: 2
        }));
        assert!(!console_enabled());
        // Output to a disabled console is swallowed.
        println!("dropped {}", 1);
        init_logger(log::LevelFilter::Info);
        log::info!("dropped too");
    }
}
