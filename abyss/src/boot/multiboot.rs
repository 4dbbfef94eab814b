//! Multiboot2 information parsing.
//!
//! The information block is a sequence of 8-byte aligned tags, each starting
//! with a `(type, size)` header and terminated by a tag of type 0.

use super::{normalize_regions, BootInfo, Module, Region};
use crate::addressing::Pa;
use alloc::{string::String, vec::Vec};

/// Value of `eax` when a multiboot2 loader enters the kernel.
pub const MULTIBOOT2_MAGIC: u32 = 0x36d7_6289;

const TAG_END: u32 = 0;
const TAG_CMDLINE: u32 = 1;
const TAG_MODULE: u32 = 3;
const TAG_MMAP: u32 = 6;

const MMAP_AVAILABLE: u32 = 1;

/// Why a multiboot2 information block was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MultibootError {
    /// The loader magic does not match.
    BadMagic(u32),
    /// The block or one of its tags runs past the end of the image.
    Truncated,
    /// A tag is malformed.
    BadTag(u32),
}

fn read_u32(bytes: &[u8], off: usize) -> Result<u32, MultibootError> {
    bytes
        .get(off..off + 4)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_le_bytes)
        .ok_or(MultibootError::Truncated)
}

fn read_u64(bytes: &[u8], off: usize) -> Result<u64, MultibootError> {
    bytes
        .get(off..off + 8)
        .and_then(|b| b.try_into().ok())
        .map(u64::from_le_bytes)
        .ok_or(MultibootError::Truncated)
}

fn read_cstr(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

fn pa(v: u64) -> Result<Pa, MultibootError> {
    Pa::new(v as usize).ok_or(MultibootError::BadTag(TAG_MMAP))
}

/// Parse the information block `image` handed over with `magic`.
pub fn parse(magic: u32, image: &[u8]) -> Result<BootInfo, MultibootError> {
    if magic != MULTIBOOT2_MAGIC {
        return Err(MultibootError::BadMagic(magic));
    }
    let total_size = read_u32(image, 0)? as usize;
    let image = image.get(..total_size).ok_or(MultibootError::Truncated)?;

    let mut info = BootInfo::default();
    let mut regions = Vec::new();
    let mut pos = 8;
    while pos + 8 <= image.len() {
        let ty = read_u32(image, pos)?;
        let size = read_u32(image, pos + 4)? as usize;
        if size < 8 {
            return Err(MultibootError::BadTag(ty));
        }
        let tag = image.get(pos..pos + size).ok_or(MultibootError::Truncated)?;
        match ty {
            TAG_END => break,
            TAG_CMDLINE => info.cmdline = read_cstr(&tag[8..]),
            TAG_MODULE => {
                let start = read_u32(tag, 8)? as u64;
                let end = read_u32(tag, 12)? as u64;
                if end < start {
                    return Err(MultibootError::BadTag(ty));
                }
                info.modules.push(Module {
                    addr: pa(start)?..pa(end)?,
                    name: read_cstr(tag.get(16..).unwrap_or(&[])),
                });
            }
            TAG_MMAP => {
                let stride = read_u32(tag, 8)? as usize;
                if stride < 20 {
                    return Err(MultibootError::BadTag(ty));
                }
                let mut off = 16;
                while off + stride <= tag.len() {
                    let base = read_u64(tag, off)?;
                    let length = read_u64(tag, off + 8)?;
                    let kind = read_u32(tag, off + 16)?;
                    let end = base.checked_add(length).ok_or(MultibootError::BadTag(ty))?;
                    regions.push(Region {
                        addr: pa(base)?..pa(end)?,
                        usable: kind == MMAP_AVAILABLE,
                    });
                    off += stride;
                }
            }
            _ => (),
        }
        pos += (size + 7) & !7;
    }
    info.regions = normalize_regions(regions);
    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Builder(Vec<u8>);

    impl Builder {
        fn new() -> Self {
            Self(vec![0; 8])
        }

        fn tag(mut self, ty: u32, body: &[u8]) -> Self {
            self.0.extend_from_slice(&ty.to_le_bytes());
            self.0
                .extend_from_slice(&(8 + body.len() as u32).to_le_bytes());
            self.0.extend_from_slice(body);
            while self.0.len() % 8 != 0 {
                self.0.push(0);
            }
            self
        }

        fn finish(self) -> Vec<u8> {
            let mut v = self.tag(TAG_END, &[]).0;
            let len = v.len() as u32;
            v[..4].copy_from_slice(&len.to_le_bytes());
            v
        }
    }

    fn mmap(entries: &[(u64, u64, u32)]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&24u32.to_le_bytes());
        body.extend_from_slice(&0u32.to_le_bytes());
        for (base, len, ty) in entries {
            body.extend_from_slice(&base.to_le_bytes());
            body.extend_from_slice(&len.to_le_bytes());
            body.extend_from_slice(&ty.to_le_bytes());
            body.extend_from_slice(&0u32.to_le_bytes());
        }
        body
    }

    #[test]
    fn parses_cmdline_modules_and_memory() {
        let mut module = Vec::new();
        module.extend_from_slice(&0x100_0000u32.to_le_bytes());
        module.extend_from_slice(&0x180_0000u32.to_le_bytes());
        module.extend_from_slice(b"bzImage\0");

        let image = Builder::new()
            .tag(TAG_CMDLINE, b"uart=port@3f8 vuart=ttyS0@irq4\0")
            .tag(TAG_MODULE, &module)
            .tag(
                TAG_MMAP,
                &mmap(&[
                    (0x10_0000, 0x10_0000, 1),
                    (0x0, 0x9_f000, 1),
                    (0x20_0000, 0x20_0000, 1),
                    (0xfee0_0000, 0x1000, 2),
                ]),
            )
            .finish();

        let info = parse(MULTIBOOT2_MAGIC, &image).unwrap();
        assert_eq!(info.cmdline, "uart=port@3f8 vuart=ttyS0@irq4");
        assert_eq!(info.modules.len(), 1);
        assert_eq!(info.modules[0].name, "bzImage");
        assert_eq!(info.modules[0].addr.start, Pa::new(0x100_0000).unwrap());

        let usable: Vec<_> = info.usable().map(|r| r.size()).collect();
        assert_eq!(usable, vec![0x9_f000, 0x30_0000]);
        assert_eq!(info.regions.len(), 3);
        assert!(!info.regions[2].usable);
    }

    #[test]
    fn rejects_bad_images() {
        assert_eq!(
            parse(0x2bad_b002, &Builder::new().finish()),
            Err(MultibootError::BadMagic(0x2bad_b002))
        );
        let mut image = Builder::new().tag(TAG_CMDLINE, b"x\0").finish();
        image[0..4].copy_from_slice(&0x100u32.to_le_bytes());
        assert_eq!(
            parse(MULTIBOOT2_MAGIC, &image),
            Err(MultibootError::Truncated)
        );
    }
}
