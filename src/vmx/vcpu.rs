use alloc::sync::Arc;
use core::fmt::{Debug, Formatter, Result as FmtResult};
use core::marker::PhantomData;

use x86_64::registers::control::{Cr0Flags, Cr4Flags};

use super::capability::{CapabilityMask, VmxCapability};
use super::definitions::VmxInstructionError;
use super::vmcs::{
    self, VmcsAccess, VmcsControl32, VmcsControlNW, VmcsGuest16, VmcsGuest32, VmcsGuest64,
    VmcsGuestNW, VmcsReadOnly64, VmxExitInfo, VmxIoExitInfo,
};
use crate::error::HvResult;
use crate::hal::{GuestReg, HvPlatform, VcpuId};
use crate::mem::GuestPhysAddr;
use crate::vm::VmShared;
use crate::{Result, VmmError};

/// Limit of every real-mode segment.
const REAL_MODE_SEGMENT_LIMIT: u32 = 0xffff;
/// Limit of the real-mode interrupt vector table.
const REAL_MODE_IVT_LIMIT: u32 = 0x3ff;
/// `RFLAGS` bit 1 is reserved and always set.
const RFLAGS_RESERVED: usize = 1 << 1;

const AR_DATA: u32 = 0x93; // 16-bit, present, data, read/write, accessed
const AR_CODE: u32 = 0x9b; // 16-bit, present, code, exec/read, accessed
const AR_TSS_BUSY: u32 = 0x8b; // present, system, 32-bit TSS busy
const AR_LDT: u32 = 0x82; // present, system, LDT

/// A virtual CPU of a [`VirtualMachine`](crate::VirtualMachine).
///
/// The platform binds a vCPU to the thread that created it, so this handle is
/// neither `Send` nor `Sync`.
pub struct VirtualCpu<P: HvPlatform> {
    vm: Arc<VmShared<P>>,
    id: VcpuId,
    _thread_bound: PhantomData<*const ()>,
}

impl<P: HvPlatform> VirtualCpu<P> {
    pub(crate) fn new(vm: Arc<VmShared<P>>) -> Result<Self> {
        let id = vm
            .platform
            .vcpu_create()
            .map_err(|source| VmmError::PlatformUnavailable {
                context: "create vCPU",
                source,
            })?;
        debug!("[HV] created vCPU {}", id);
        Ok(Self {
            vm,
            id,
            _thread_bound: PhantomData,
        })
    }

    /// Platform identifier of this vCPU.
    pub fn id(&self) -> VcpuId {
        self.id
    }

    fn platform(&self) -> &P {
        &self.vm.platform
    }

    fn capability(&self, category: VmxCapability) -> Result<CapabilityMask> {
        self.vm.caps.query(&self.vm.platform, category)
    }

    /// Programs the VM-execution and VM-entry controls for a real-mode guest.
    pub fn setup_vmcs_control(&self) -> Result {
        use vmcs::controls::*;

        // Exit on external interrupts so the host keeps its timer ticks.
        use PinbasedControls as PinCtrl;
        self.program(
            VmcsControl32::PINBASED_EXEC_CONTROLS,
            VmxCapability::PinBased,
            PinCtrl::EXTERNAL_INTERRUPT_EXITING.bits(),
            0,
        )?;

        // Exit on HLT and on every I/O instruction, activate secondary controls.
        use PrimaryControls as CpuCtrl;
        let needed =
            (CpuCtrl::HLT_EXITING | CpuCtrl::UNCOND_IO_EXITING | CpuCtrl::SECONDARY_CONTROLS)
                .bits();
        self.program(
            VmcsControl32::PRIMARY_PROCBASED_EXEC_CONTROLS,
            VmxCapability::ProcBased,
            needed,
            needed,
        )?;

        // Unrestricted guest, to run real-mode code directly.
        use SecondaryControls as CpuCtrl2;
        let needed = CpuCtrl2::UNRESTRICTED_GUEST.bits();
        self.program(
            VmcsControl32::SECONDARY_PROCBASED_EXEC_CONTROLS,
            VmxCapability::ProcBased2,
            needed,
            needed,
        )?;

        // Real-mode guest: only what the hardware insists on.
        self.program(
            VmcsControl32::VMENTRY_CONTROLS,
            VmxCapability::Entry,
            0,
            0,
        )?;

        // Deliver every exception through the guest's own IVT.
        VmcsControl32::EXCEPTION_BITMAP.write(self, 0)?;
        Ok(())
    }

    /// Writes the legalized `desired` bits and fails if any bit of `needed`
    /// did not survive.
    fn program(
        &self,
        control: VmcsControl32,
        category: VmxCapability,
        desired: u32,
        needed: u32,
    ) -> Result<u32> {
        let mask = self.capability(category)?;
        let written = vmcs::set_control(self, control, mask, desired)?;
        let missing = needed & !written;
        if missing != 0 {
            return Err(VmmError::HardwareUnsupported {
                category,
                detail: format!("{control:?} lacks required bits {missing:#x}"),
            });
        }
        Ok(written)
    }

    /// Sets the guest entry state: 16-bit real mode, flat zero-based segments,
    /// `RIP = entry`, `RSP = stack_top`, interrupts disabled.
    pub fn setup_vmcs_guest(&self, entry: GuestPhysAddr, stack_top: usize) -> Result {
        let cr0_val =
            Cr0Flags::NOT_WRITE_THROUGH | Cr0Flags::CACHE_DISABLE | Cr0Flags::EXTENSION_TYPE;
        self.set_cr0(cr0_val.bits())?;
        self.set_cr4(0)?;

        macro_rules! set_guest_segment {
            ($seg: ident, $access_rights: expr) => {{
                paste::paste! {
                    VmcsGuest16::[<$seg _SELECTOR>].write(self, 0)?;
                    VmcsGuestNW::[<$seg _BASE>].write(self, 0)?;
                    VmcsGuest32::[<$seg _LIMIT>].write(self, REAL_MODE_SEGMENT_LIMIT)?;
                    VmcsGuest32::[<$seg _ACCESS_RIGHTS>].write(self, $access_rights)?;
                }
            }};
        }

        set_guest_segment!(ES, AR_DATA);
        set_guest_segment!(CS, AR_CODE);
        set_guest_segment!(SS, AR_DATA);
        set_guest_segment!(DS, AR_DATA);
        set_guest_segment!(FS, AR_DATA);
        set_guest_segment!(GS, AR_DATA);
        set_guest_segment!(TR, AR_TSS_BUSY);
        set_guest_segment!(LDTR, AR_LDT);

        VmcsGuestNW::GDTR_BASE.write(self, 0)?;
        VmcsGuest32::GDTR_LIMIT.write(self, REAL_MODE_SEGMENT_LIMIT)?;
        VmcsGuestNW::IDTR_BASE.write(self, 0)?;
        VmcsGuest32::IDTR_LIMIT.write(self, REAL_MODE_IVT_LIMIT)?;

        self.set_cr3(0)?;
        VmcsGuestNW::DR7.write(self, 0x400)?;
        VmcsGuestNW::RSP.write(self, stack_top)?;
        VmcsGuestNW::RIP.write(self, entry.as_usize())?;
        VmcsGuestNW::RFLAGS.write(self, RFLAGS_RESERVED)?;
        VmcsGuestNW::PENDING_DBG_EXCEPTIONS.write(self, 0)?;

        VmcsGuest32::INTERRUPTIBILITY_STATE.write(self, 0)?;
        VmcsGuest32::ACTIVITY_STATE.write(self, 0)?;

        VmcsGuest64::LINK_PTR.write(self, u64::MAX)?; // SDM Vol. 3C, Section 24.4.2
        VmcsGuest64::IA32_DEBUGCTL.write(self, 0)?;
        VmcsGuest64::IA32_EFER.write(self, 0)?;

        self.verify_guest_state(entry, stack_top)
    }

    /// Reads back the fields a VM entry checks first.
    fn verify_guest_state(&self, entry: GuestPhysAddr, stack_top: usize) -> Result {
        let expect = |field: u32, expected: u64, actual: u64| {
            if expected == actual {
                Ok(())
            } else {
                Err(VmmError::GuestStateMismatch {
                    field,
                    expected,
                    actual,
                })
            }
        };

        expect(
            VmcsGuestNW::RIP as u32,
            entry.as_usize() as u64,
            VmcsGuestNW::RIP.read(self)? as u64,
        )?;
        expect(
            VmcsGuestNW::RSP as u32,
            stack_top as u64,
            VmcsGuestNW::RSP.read(self)? as u64,
        )?;

        let paged_or_protected = Cr0Flags::PROTECTED_MODE_ENABLE | Cr0Flags::PAGING;
        let cr0 = Cr0Flags::from_bits_truncate(VmcsGuestNW::CR0.read(self)? as u64);
        expect(VmcsGuestNW::CR0 as u32, 1, !cr0.intersects(paged_or_protected) as u64)?;
        let shadow =
            Cr0Flags::from_bits_truncate(VmcsControlNW::CR0_READ_SHADOW.read(self)? as u64);
        expect(
            VmcsControlNW::CR0_READ_SHADOW as u32,
            1,
            !shadow.intersects(paged_or_protected) as u64,
        )?;

        let cr4 = Cr4Flags::from_bits_truncate(VmcsGuestNW::CR4.read(self)? as u64);
        expect(
            VmcsGuestNW::CR4 as u32,
            1,
            cr4.contains(Cr4Flags::VIRTUAL_MACHINE_EXTENSIONS) as u64,
        )?;

        expect(
            VmcsGuest16::CS_SELECTOR as u32,
            0,
            VmcsGuest16::CS_SELECTOR.read(self)? as u64,
        )?;
        expect(
            VmcsGuest32::CS_ACCESS_RIGHTS as u32,
            AR_CODE as u64,
            VmcsGuest32::CS_ACCESS_RIGHTS.read(self)? as u64,
        )?;
        expect(
            VmcsGuest32::SS_ACCESS_RIGHTS as u32,
            AR_DATA as u64,
            VmcsGuest32::SS_ACCESS_RIGHTS.read(self)? as u64,
        )?;
        expect(
            VmcsGuest64::LINK_PTR as u32,
            u64::MAX,
            VmcsGuest64::LINK_PTR.read(self)?,
        )
    }

    /// Enters the guest once. Returns when the guest exits.
    pub fn run(&self) -> HvResult {
        self.platform().vcpu_run(self.id)
    }

    /// Basic information about the last VM exit.
    pub fn exit_info(&self) -> Result<VmxExitInfo> {
        vmcs::exit_info(self)
    }

    /// Information for VM exits due to I/O instructions.
    pub fn io_exit_info(&self) -> Result<VmxIoExitInfo> {
        vmcs::io_exit_info(self)
    }

    /// The VM-instruction error field.
    pub fn instruction_error(&self) -> Result<VmxInstructionError> {
        vmcs::instruction_error(self)
    }

    /// Guest-physical address of the access that caused an EPT violation.
    pub fn ept_violation_gpa(&self) -> Result<GuestPhysAddr> {
        VmcsReadOnly64::GUEST_PHYSICAL_ADDR
            .read(self)
            .map(|gpa| GuestPhysAddr::from_usize(gpa as usize))
    }

    /// Guest rip. (`RIP`)
    pub fn rip(&self) -> Result<usize> {
        VmcsGuestNW::RIP.read(self)
    }

    /// Advance guest `RIP` by `instr_len` bytes, wrapping inside the code segment.
    pub fn advance_rip(&self, instr_len: u32) -> Result {
        let rip = (self.rip()? + instr_len as usize) & REAL_MODE_SEGMENT_LIMIT as usize;
        VmcsGuestNW::RIP.write(self, rip)
    }

    pub fn read_reg(&self, reg: GuestReg) -> Result<u64> {
        self.platform()
            .read_register(self.id, reg)
            .map_err(|source| VmmError::RegisterAccess { reg, source })
    }

    pub fn write_reg(&self, reg: GuestReg, value: u64) -> Result {
        self.platform()
            .write_register(self.id, reg, value)
            .map_err(|source| VmmError::RegisterAccess { reg, source })
    }

    /// NE is fixed to 1 in VMX operation; it is hidden from the guest. PE and
    /// PG are free under unrestricted guest.
    fn set_cr0(&self, val: u64) -> Result {
        let ne = Cr0Flags::NUMERIC_ERROR.bits();
        VmcsGuestNW::CR0.write(self, (val | ne) as _)?;
        VmcsControlNW::CR0_READ_SHADOW.write(self, val as _)?;
        VmcsControlNW::CR0_GUEST_HOST_MASK.write(self, ne as _)
    }

    fn set_cr3(&self, val: u64) -> Result {
        VmcsGuestNW::CR3.write(self, val as _)
    }

    /// VMXE must be set while in VMX operation; it is hidden from the guest.
    fn set_cr4(&self, val: u64) -> Result {
        let vmxe = Cr4Flags::VIRTUAL_MACHINE_EXTENSIONS.bits();
        VmcsGuestNW::CR4.write(self, (val | vmxe) as _)?;
        VmcsControlNW::CR4_READ_SHADOW.write(self, (val & !vmxe) as _)?;
        VmcsControlNW::CR4_GUEST_HOST_MASK.write(self, vmxe as _)
    }
}

impl<P: HvPlatform> VmcsAccess for VirtualCpu<P> {
    fn vmread(&self, field: u32) -> Result<u64> {
        self.platform()
            .read_vmcs(self.id, field)
            .map_err(|source| VmmError::VmcsAccess { field, source })
    }

    fn vmwrite(&self, field: u32, value: u64) -> Result {
        self.platform()
            .write_vmcs(self.id, field, value)
            .map_err(|source| VmmError::ControlWriteRejected {
                field,
                value,
                source,
            })
    }
}

impl<P: HvPlatform> Drop for VirtualCpu<P> {
    fn drop(&mut self) {
        match self.platform().vcpu_destroy(self.id) {
            Ok(()) => debug!("[HV] destroyed vCPU {}", self.id),
            Err(err) => error!("[HV] failed to destroy vCPU {}: {err}", self.id),
        }
    }
}

impl<P: HvPlatform> Debug for VirtualCpu<P> {
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        let field = |value: Result<usize>| value.map_or_else(|e| e.to_string(), |v| format!("{v:#x}"));
        f.debug_struct("VirtualCpu")
            .field("id", &self.id)
            .field("rip", &field(VmcsGuestNW::RIP.read(self)))
            .field("rsp", &field(VmcsGuestNW::RSP.read(self)))
            .field("rflags", &field(VmcsGuestNW::RFLAGS.read(self)))
            .field("cr0", &field(VmcsGuestNW::CR0.read(self)))
            .field("cr4", &field(VmcsGuestNW::CR4.read(self)))
            .field("cs_base", &field(VmcsGuestNW::CS_BASE.read(self)))
            .field(
                "primary_controls",
                &field(
                    VmcsControl32::PRIMARY_PROCBASED_EXEC_CONTROLS
                        .read(self)
                        .map(|v| v as usize),
                ),
            )
            .field(
                "cs_access_rights",
                &field(VmcsGuest32::CS_ACCESS_RIGHTS.read(self).map(|v| v as usize)),
            )
            .finish()
    }
}
