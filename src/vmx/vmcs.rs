//! VMCS field encodings and typed accessors.
//!
//! Fields are read and written through a [`VmcsAccess`] implementor (the
//! vCPU), which forwards to the platform's VMCS primitives. Encodings follow
//! SDM Vol. 3D, Appendix B.

#![allow(non_camel_case_types)]

use bit_field::BitField;
use numeric_enum_macro::numeric_enum;

use super::capability::CapabilityMask;
use super::definitions::{VmxExitReason, VmxInstructionError};
use crate::Result;

pub use x86::vmx::vmcs::control as controls;

/// Raw VMCS field access of one vCPU.
pub trait VmcsAccess {
    fn vmread(&self, field: u32) -> Result<u64>;
    fn vmwrite(&self, field: u32, value: u64) -> Result;
}

macro_rules! vmcs_read {
    ($field_enum: ident, u64) => {
        impl $field_enum {
            pub fn read(self, vmcs: &impl VmcsAccess) -> Result<u64> {
                vmcs.vmread(self as u32)
            }
        }
    };
    ($field_enum: ident, $ux: ty) => {
        impl $field_enum {
            pub fn read(self, vmcs: &impl VmcsAccess) -> Result<$ux> {
                vmcs.vmread(self as u32).map(|v| v as $ux)
            }
        }
    };
}

macro_rules! vmcs_write {
    ($field_enum: ident, $ux: ty) => {
        impl $field_enum {
            pub fn write(self, vmcs: &impl VmcsAccess, value: $ux) -> Result {
                vmcs.vmwrite(self as u32, value as u64)
            }
        }
    };
}

numeric_enum! {
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// 32-Bit Control Fields. (SDM Vol. 3D, Appendix B.3.1)
pub enum VmcsControl32 {
    PINBASED_EXEC_CONTROLS = 0x4000,
    PRIMARY_PROCBASED_EXEC_CONTROLS = 0x4002,
    EXCEPTION_BITMAP = 0x4004,
    VMENTRY_CONTROLS = 0x4012,
    SECONDARY_PROCBASED_EXEC_CONTROLS = 0x401E,
}
}
vmcs_read!(VmcsControl32, u32);
vmcs_write!(VmcsControl32, u32);

numeric_enum! {
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Natural-Width Control Fields. (SDM Vol. 3D, Appendix B.4.1)
pub enum VmcsControlNW {
    CR0_GUEST_HOST_MASK = 0x6000,
    CR4_GUEST_HOST_MASK = 0x6002,
    CR0_READ_SHADOW = 0x6004,
    CR4_READ_SHADOW = 0x6006,
}
}
vmcs_read!(VmcsControlNW, usize);
vmcs_write!(VmcsControlNW, usize);

numeric_enum! {
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// 16-Bit Guest-State Fields. (SDM Vol. 3D, Appendix B.1.2)
pub enum VmcsGuest16 {
    ES_SELECTOR = 0x800,
    CS_SELECTOR = 0x802,
    SS_SELECTOR = 0x804,
    DS_SELECTOR = 0x806,
    FS_SELECTOR = 0x808,
    GS_SELECTOR = 0x80a,
    LDTR_SELECTOR = 0x80c,
    TR_SELECTOR = 0x80e,
}
}
vmcs_read!(VmcsGuest16, u16);
vmcs_write!(VmcsGuest16, u16);

numeric_enum! {
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// 64-Bit Guest-State Fields. (SDM Vol. 3D, Appendix B.2.3)
pub enum VmcsGuest64 {
    LINK_PTR = 0x2800,
    IA32_DEBUGCTL = 0x2802,
    IA32_EFER = 0x2806,
}
}
vmcs_read!(VmcsGuest64, u64);
vmcs_write!(VmcsGuest64, u64);

numeric_enum! {
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// 32-Bit Guest-State Fields. (SDM Vol. 3D, Appendix B.3.3)
pub enum VmcsGuest32 {
    ES_LIMIT = 0x4800,
    CS_LIMIT = 0x4802,
    SS_LIMIT = 0x4804,
    DS_LIMIT = 0x4806,
    FS_LIMIT = 0x4808,
    GS_LIMIT = 0x480a,
    LDTR_LIMIT = 0x480c,
    TR_LIMIT = 0x480e,
    GDTR_LIMIT = 0x4810,
    IDTR_LIMIT = 0x4812,
    ES_ACCESS_RIGHTS = 0x4814,
    CS_ACCESS_RIGHTS = 0x4816,
    SS_ACCESS_RIGHTS = 0x4818,
    DS_ACCESS_RIGHTS = 0x481a,
    FS_ACCESS_RIGHTS = 0x481c,
    GS_ACCESS_RIGHTS = 0x481e,
    LDTR_ACCESS_RIGHTS = 0x4820,
    TR_ACCESS_RIGHTS = 0x4822,
    INTERRUPTIBILITY_STATE = 0x4824,
    ACTIVITY_STATE = 0x4826,
}
}
vmcs_read!(VmcsGuest32, u32);
vmcs_write!(VmcsGuest32, u32);

numeric_enum! {
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Natural-Width Guest-State Fields. (SDM Vol. 3D, Appendix B.4.3)
pub enum VmcsGuestNW {
    CR0 = 0x6800,
    CR3 = 0x6802,
    CR4 = 0x6804,
    ES_BASE = 0x6806,
    CS_BASE = 0x6808,
    SS_BASE = 0x680a,
    DS_BASE = 0x680c,
    FS_BASE = 0x680e,
    GS_BASE = 0x6810,
    LDTR_BASE = 0x6812,
    TR_BASE = 0x6814,
    GDTR_BASE = 0x6816,
    IDTR_BASE = 0x6818,
    DR7 = 0x681a,
    RSP = 0x681c,
    RIP = 0x681e,
    RFLAGS = 0x6820,
    PENDING_DBG_EXCEPTIONS = 0x6822,
}
}
vmcs_read!(VmcsGuestNW, usize);
vmcs_write!(VmcsGuestNW, usize);

numeric_enum! {
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// 32-Bit Read-Only Data Fields. (SDM Vol. 3D, Appendix B.3.2)
pub enum VmcsReadOnly32 {
    VM_INSTRUCTION_ERROR = 0x4400,
    EXIT_REASON = 0x4402,
    VMEXIT_INSTRUCTION_LEN = 0x440c,
}
}
vmcs_read!(VmcsReadOnly32, u32);

numeric_enum! {
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// 64-Bit Read-Only Data Fields. (SDM Vol. 3D, Appendix B.2.2)
pub enum VmcsReadOnly64 {
    GUEST_PHYSICAL_ADDR = 0x2400,
}
}
vmcs_read!(VmcsReadOnly64, u64);

numeric_enum! {
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Natural-Width Read-Only Data Fields. (SDM Vol. 3D, Appendix B.4.2)
pub enum VmcsReadOnlyNW {
    EXIT_QUALIFICATION = 0x6400,
}
}
vmcs_read!(VmcsReadOnlyNW, usize);

/// VM-Exit Informations. (SDM Vol. 3C, Section 24.9.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmxExitInfo {
    /// VM-entry failure. (0 = true VM exit; 1 = VM-entry failure)
    pub entry_failure: bool,
    /// Basic exit reason, if it is one this crate knows.
    pub exit_reason: Option<VmxExitReason>,
    /// Basic exit reason as read from the VMCS.
    pub raw_exit_reason: u32,
    /// For VM exits resulting from instruction execution, this field receives
    /// the length in bytes of the instruction whose execution led to the VM exit.
    pub exit_instruction_length: u32,
    /// Guest `RIP` where the VM exit occurs.
    pub guest_rip: usize,
}

impl VmxExitInfo {
    /// Splits a full exit-reason field into its parts.
    pub fn from_raw(full_reason: u32, exit_instruction_length: u32, guest_rip: usize) -> Self {
        let raw_exit_reason = full_reason.get_bits(0..16);
        Self {
            entry_failure: full_reason.get_bit(31),
            exit_reason: VmxExitReason::try_from(raw_exit_reason).ok(),
            raw_exit_reason,
            exit_instruction_length,
            guest_rip,
        }
    }
}

/// Exit Qualification for I/O Instructions. (SDM Vol. 3C, Section 27.2.1, Table 27-5)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmxIoExitInfo {
    /// Size of access in bytes.
    pub access_size: u8,
    /// Direction of the attempted access (0 = OUT, 1 = IN).
    pub is_in: bool,
    /// String instruction (INS/OUTS).
    pub is_string: bool,
    /// REP prefixed.
    pub is_repeat: bool,
    /// Port number taken from an immediate operand rather than DX.
    pub is_immediate: bool,
    /// Port number of the access.
    pub port: u16,
}

impl VmxIoExitInfo {
    pub fn from_qualification(qualification: usize) -> Self {
        Self {
            access_size: qualification.get_bits(0..3) as u8 + 1,
            is_in: qualification.get_bit(3),
            is_string: qualification.get_bit(4),
            is_repeat: qualification.get_bit(5),
            is_immediate: qualification.get_bit(6),
            port: qualification.get_bits(16..32) as u16,
        }
    }
}

pub fn exit_info(vmcs: &impl VmcsAccess) -> Result<VmxExitInfo> {
    let full_reason = VmcsReadOnly32::EXIT_REASON.read(vmcs)?;
    Ok(VmxExitInfo::from_raw(
        full_reason,
        VmcsReadOnly32::VMEXIT_INSTRUCTION_LEN.read(vmcs)?,
        VmcsGuestNW::RIP.read(vmcs)?,
    ))
}

pub fn io_exit_info(vmcs: &impl VmcsAccess) -> Result<VmxIoExitInfo> {
    let qualification = VmcsReadOnlyNW::EXIT_QUALIFICATION.read(vmcs)?;
    Ok(VmxIoExitInfo::from_qualification(qualification))
}

pub fn instruction_error(vmcs: &impl VmcsAccess) -> Result<VmxInstructionError> {
    VmcsReadOnly32::VM_INSTRUCTION_ERROR
        .read(vmcs)
        .map(VmxInstructionError::from)
}

/// Writes `desired` to a control field after legalizing it against `mask`.
///
/// Returns the value actually written.
pub fn set_control(
    vmcs: &impl VmcsAccess,
    control: VmcsControl32,
    mask: CapabilityMask,
    desired: u32,
) -> Result<u32> {
    let dropped = desired & !mask.allowed;
    if dropped != 0 {
        warn!(
            "[HV] {:?}: bits {:#x} not allowed by hardware, dropped",
            control, dropped
        );
    }
    let value = mask.legalize(desired);
    debug!(
        "[HV] set {:?}: {:#x} (required {:#x}, allowed {:#x}, desired {:#x})",
        control, value, mask.required, mask.allowed, desired
    );
    control.write(vmcs, value)?;
    Ok(value)
}
