//! Debug options from the hypervisor command line.
//!
//! The command line is a whitespace separated list of tokens. Each token is
//! matched against a fixed table by the longest prefix; whatever follows the
//! prefix is the token argument.

use alloc::vec::Vec;

/// Where the hypervisor console goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UartConfig {
    /// No console.
    Disabled,
    /// A port-mapped 16550 at the given base.
    Port(u16),
    /// A PCI UART.
    Pci { bus: u8, dev: u8, func: u8 },
}

impl Default for UartConfig {
    fn default() -> Self {
        UartConfig::Port(crate::dev::x86_64::serial::COM1)
    }
}

/// A virtual UART exposed to the service VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VuartConfig {
    /// `n` of `ttyS<n>`.
    pub index: u8,
    /// Interrupt line of the device.
    pub irq: u8,
}

/// Options parsed from the command line.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DebugOptions {
    pub uart: UartConfig,
    pub vuarts: Vec<VuartConfig>,
}

type TokenHandler = fn(&mut DebugOptions, &str) -> Option<()>;

const TOKENS: &[(&str, TokenHandler)] = &[
    ("uart=disabled", uart_disabled),
    ("uart=port@", uart_port),
    ("uart=bdf@", uart_bdf),
    ("vuart=ttyS", vuart),
];

fn uart_disabled(opts: &mut DebugOptions, arg: &str) -> Option<()> {
    arg.is_empty().then(|| opts.uart = UartConfig::Disabled)
}

fn uart_port(opts: &mut DebugOptions, arg: &str) -> Option<()> {
    opts.uart = UartConfig::Port(u16::try_from(parse_hex(arg)?).ok()?);
    Some(())
}

fn uart_bdf(opts: &mut DebugOptions, arg: &str) -> Option<()> {
    let (bus, rest) = arg.split_once(':')?;
    let (dev, func) = rest.split_once('.')?;
    opts.uart = UartConfig::Pci {
        bus: u8::try_from(parse_hex(bus)?).ok()?,
        dev: u8::try_from(parse_hex(dev)?).ok()?,
        func: u8::try_from(parse_hex(func)?).ok()?,
    };
    Some(())
}

fn vuart(opts: &mut DebugOptions, arg: &str) -> Option<()> {
    let (index, irq) = arg.split_once("@irq")?;
    opts.vuarts.push(VuartConfig {
        index: index.parse().ok()?,
        irq: irq.parse().ok()?,
    });
    Some(())
}

fn parse_hex(s: &str) -> Option<u32> {
    let s = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    u32::from_str_radix(s, 16).ok()
}

impl DebugOptions {
    /// Parse the debug options out of `cmdline`.
    ///
    /// Tokens that match no entry or carry a malformed argument are skipped.
    pub fn parse(cmdline: &str) -> Self {
        let mut opts = Self::default();
        for token in cmdline.split_whitespace() {
            let handled = TOKENS
                .iter()
                .filter(|(prefix, _)| token.starts_with(prefix))
                .max_by_key(|(prefix, _)| prefix.len())
                .and_then(|(prefix, handler)| handler(&mut opts, &token[prefix.len()..]));
            if handled.is_none() {
                log::debug!("cmdline: ignoring token {:?}", token);
            }
        }
        opts
    }
}
