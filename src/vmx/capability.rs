//! VMX capability masks and their per-VM cache.

use numeric_enum_macro::numeric_enum;
use spin::Mutex;

use crate::error::HvError;
use crate::hal::HvPlatform;
use crate::{Result, VmmError};

numeric_enum! {
    #[repr(u32)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    /// Control categories whose legal values the platform reports
    /// (`hv_vmx_capability_t` numbering).
    pub enum VmxCapability {
        PinBased = 0,
        ProcBased = 1,
        ProcBased2 = 2,
        Entry = 3,
        Exit = 4,
        PreemptionTimer = 32,
    }
}

impl VmxCapability {
    /// Categories the monitor programs, each with a cache slot.
    const CACHED: [VmxCapability; 4] = [
        Self::PinBased,
        Self::ProcBased,
        Self::ProcBased2,
        Self::Entry,
    ];

    fn slot(self) -> Option<usize> {
        Self::CACHED.iter().position(|&c| c == self)
    }
}

/// Allowed and required settings of one control field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapabilityMask {
    /// Bits that may be 1.
    pub allowed: u32,
    /// Bits that must be 1.
    pub required: u32,
}

impl CapabilityMask {
    /// Splits a raw capability value: required-1 bits in the low half,
    /// allowed-1 bits in the high half.
    pub const fn from_raw(raw: u64) -> Self {
        Self {
            allowed: (raw >> 32) as u32,
            required: raw as u32,
        }
    }

    /// The legal control value closest to `desired`: every required bit set,
    /// nothing outside the allowed set.
    pub const fn legalize(&self, desired: u32) -> u32 {
        (self.required | desired) & self.allowed
    }

    /// Whether `value` may be written to the control field.
    pub const fn permits(&self, value: u32) -> bool {
        value & !self.allowed == 0 && value & self.required == self.required
    }
}

/// Capability masks read once per VM.
///
/// Masks are a property of the host, not of a vCPU, so every vCPU of the VM
/// shares the same cache.
#[derive(Debug, Default)]
pub struct CapabilityCache {
    masks: Mutex<[Option<CapabilityMask>; VmxCapability::CACHED.len()]>,
}

impl CapabilityCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the mask of `category`, reading it from `platform` on first use.
    pub fn query<P: HvPlatform + ?Sized>(
        &self,
        platform: &P,
        category: VmxCapability,
    ) -> Result<CapabilityMask> {
        let slot = category.slot().ok_or_else(|| VmmError::HardwareUnsupported {
            category,
            detail: "no control field of this category is programmed".into(),
        })?;
        let mut masks = self.masks.lock();
        if let Some(mask) = masks[slot] {
            return Ok(mask);
        }
        let raw = platform
            .read_capability(category)
            .map_err(|err: HvError| VmmError::HardwareUnsupported {
                category,
                detail: format!("capability not reported: {err}"),
            })?;
        let mask = CapabilityMask::from_raw(raw);
        if mask.required & !mask.allowed != 0 {
            warn!(
                "[HV] {:?}: required bits {:#x} outside allowed {:#x}",
                category, mask.required, mask.allowed
            );
        }
        trace!("[HV] capability {:?}: {:#x?}", category, mask);
        masks[slot] = Some(mask);
        Ok(mask)
    }
}
