//! Virtual CPUID.
//!
//! The CPUID view of a vcpu is computed once when the vcpu is created: the
//! host leaves are read through the platform, the bits hidden by the vm
//! configuration are cleared, and the bits describing virtualization itself
//! are rewritten. Exits on CPUID only look the table up.
use crate::config::VmConfig;
use abyss::{
    platform::Platform,
    x86_64::{cpuid::*, Cr4},
};
use alloc::collections::BTreeMap;

/// Leaves whose output depends on the subleaf, with the subleaves kept.
const SUBLEAF_LEAVES: [(u32, u32); 4] = [(0x4, 8), (0x7, 2), (0xb, 2), (LEAF_XSAVE, 4)];

/// Highest basic leaf exposed to guests.
const MAX_BASIC_LEAF: u32 = 0x1f;
/// Highest extended leaf exposed to guests.
const MAX_EXTENDED_LEAF: u32 = 0x8000_0008;

/// "KEHVKEHVKEHV"
const HV_SIGNATURE: [u32; 3] = [0x5648_454b, 0x5648_454b, 0x5648_454b];

fn is_subleaf_indexed(leaf: u32) -> bool {
    SUBLEAF_LEAVES.iter().any(|(l, _)| *l == leaf)
}

/// The CPUID table of one vcpu.
#[derive(Debug, Clone, Default)]
pub struct VcpuidTable {
    entries: BTreeMap<(u32, u32), CpuidResult>,
}

impl VcpuidTable {
    /// Build the table of vcpu `apic_id` of the vm described by `config`.
    pub fn build(platform: &dyn Platform, config: &VmConfig, apic_id: u8) -> Self {
        let mut entries = BTreeMap::new();
        let max_basic = platform.cpuid(LEAF_BASIC, 0).eax.min(MAX_BASIC_LEAF);
        for leaf in 0..=max_basic {
            match SUBLEAF_LEAVES.iter().find(|(l, _)| *l == leaf) {
                Some((_, count)) => {
                    for subleaf in 0..*count {
                        entries.insert((leaf, subleaf), platform.cpuid(leaf, subleaf));
                    }
                }
                None => {
                    entries.insert((leaf, 0), platform.cpuid(leaf, 0));
                }
            }
        }
        let max_ext = platform.cpuid(LEAF_EXTENDED_MAX, 0).eax.min(MAX_EXTENDED_LEAF);
        if max_ext >= LEAF_EXTENDED_MAX {
            for leaf in LEAF_EXTENDED_MAX..=max_ext {
                entries.insert((leaf, 0), platform.cpuid(leaf, 0));
            }
        }
        if let Some(basic) = entries.get_mut(&(LEAF_BASIC, 0)) {
            basic.eax = max_basic;
        }
        if let Some(ext) = entries.get_mut(&(LEAF_EXTENDED_MAX, 0)) {
            ext.eax = max_ext;
        }

        if let Some(features) = entries.get_mut(&(LEAF_FEATURES, 0)) {
            features.ecx &= !(FEAT_1_ECX_VMX | FEAT_1_ECX_SMX);
            features.ecx |= FEAT_1_ECX_HYPERVISOR;
            features.ebx = (features.ebx & 0x00ff_ffff) | ((apic_id as u32) << 24);
        }
        if let Some(ext) = entries.get_mut(&(LEAF_EXTENDED_FEATURES, 0)) {
            ext.ebx &= !(FEAT_7_EBX_SGX | FEAT_7_EBX_PT);
        }
        entries.insert(
            (LEAF_HYPERVISOR, 0),
            CpuidResult::new(LEAF_HYPERVISOR, HV_SIGNATURE[0], HV_SIGNATURE[1], HV_SIGNATURE[2]),
        );

        for mask in config.cpuid_masks.iter() {
            let subleaf = if is_subleaf_indexed(mask.leaf) {
                mask.subleaf
            } else {
                0
            };
            match entries.get_mut(&(mask.leaf, subleaf)) {
                Some(r) => {
                    r.eax &= !mask.eax;
                    r.ebx &= !mask.ebx;
                    r.ecx &= !mask.ecx;
                    r.edx &= !mask.edx;
                }
                None => log::debug!(
                    "VM{}: cpuid mask for absent leaf {:#x}.{}",
                    config.id,
                    mask.leaf,
                    subleaf
                ),
            }
        }
        Self { entries }
    }

    /// CPUID output for `leaf`/`subleaf` as seen by a guest with `cr4`.
    ///
    /// Leaves outside the table read as zero.
    pub fn guest_cpuid(&self, leaf: u32, subleaf: u32, cr4: Cr4) -> CpuidResult {
        let subleaf = if is_subleaf_indexed(leaf) { subleaf } else { 0 };
        let mut r = self.entries.get(&(leaf, subleaf)).copied().unwrap_or_default();
        if leaf == LEAF_FEATURES && r.ecx & FEAT_1_ECX_XSAVE != 0 {
            // OSXSAVE mirrors the guest's CR4.
            r.ecx &= !FEAT_1_ECX_OSXSAVE;
            if cr4.contains(Cr4::OSXSAVE) {
                r.ecx |= FEAT_1_ECX_OSXSAVE;
            }
        }
        r
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{tests::small_vm, CpuidMask};
    use abyss::platform::mock::MockPlatform;

    fn host() -> MockPlatform {
        let platform = MockPlatform::new();
        platform.set_cpuid(LEAF_BASIC, 0, CpuidResult::new(0xd, 0x756e_6547, 0x6c65_746e, 0x4965_6e69));
        platform.set_cpuid(
            LEAF_FEATURES,
            0,
            CpuidResult::new(
                0x906ea,
                0x0a10_0800,
                FEAT_1_ECX_VMX | FEAT_1_ECX_XSAVE | FEAT_1_ECX_OSXSAVE | FEAT_1_ECX_X2APIC,
                FEAT_1_EDX_MTRR | FEAT_1_EDX_MCA,
            ),
        );
        platform.set_cpuid(LEAF_EXTENDED_FEATURES, 0, CpuidResult::new(0, FEAT_7_EBX_SGX | 1, 0, 0));
        platform.set_cpuid(LEAF_EXTENDED_FEATURES, 1, CpuidResult::new(0, 0, 0, 0x10));
        platform.set_cpuid(LEAF_EXTENDED_MAX, 0, CpuidResult::new(0x8000_0008, 0, 0, 0));
        platform
    }

    #[test]
    fn masked_feature_is_hidden() {
        let platform = host();
        let mut config = small_vm(0, 1);
        config.cpuid_masks.push(CpuidMask {
            leaf: LEAF_FEATURES,
            subleaf: 7,
            eax: 0,
            ebx: 0,
            ecx: FEAT_1_ECX_X2APIC,
            edx: FEAT_1_EDX_MCA,
        });
        let table = VcpuidTable::build(&platform, &config, 3);
        let r = table.guest_cpuid(LEAF_FEATURES, 0, Cr4::empty());
        assert_eq!(r.ecx & FEAT_1_ECX_X2APIC, 0);
        assert_eq!(r.edx, FEAT_1_EDX_MTRR);
        assert_eq!(r.ecx & FEAT_1_ECX_VMX, 0);
        assert_ne!(r.ecx & FEAT_1_ECX_HYPERVISOR, 0);
        assert_eq!(r.ebx >> 24, 3);

        // Unmasked vm keeps the host bit.
        let table = VcpuidTable::build(&platform, &small_vm(1, 1), 0);
        let r = table.guest_cpuid(LEAF_FEATURES, 0, Cr4::empty());
        assert_ne!(r.ecx & FEAT_1_ECX_X2APIC, 0);
    }

    #[test]
    fn virtualization_leaves() {
        let platform = host();
        let table = VcpuidTable::build(&platform, &small_vm(0, 1), 0);
        let r = table.guest_cpuid(LEAF_FEATURES, 0, Cr4::empty());
        assert_eq!(r.ecx & FEAT_1_ECX_OSXSAVE, 0);
        let r = table.guest_cpuid(LEAF_FEATURES, 0, Cr4::OSXSAVE);
        assert_ne!(r.ecx & FEAT_1_ECX_OSXSAVE, 0);

        let r = table.guest_cpuid(LEAF_EXTENDED_FEATURES, 0, Cr4::empty());
        assert_eq!(r.ebx, 1);
        assert_eq!(table.guest_cpuid(LEAF_EXTENDED_FEATURES, 1, Cr4::empty()).edx, 0x10);
        assert_eq!(table.guest_cpuid(LEAF_HYPERVISOR, 0, Cr4::empty()).ebx, HV_SIGNATURE[0]);
        assert_eq!(table.guest_cpuid(0x4000_0100, 0, Cr4::empty()), CpuidResult::default());
        // Subleaf is ignored on flat leaves.
        assert_eq!(
            table.guest_cpuid(LEAF_BASIC, 5, Cr4::empty()),
            table.guest_cpuid(LEAF_BASIC, 0, Cr4::empty())
        );
    }
}
