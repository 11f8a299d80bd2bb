//! The hypervisor platform the monitor runs on.
//!
//! [`HvPlatform`] is the whole surface the monitor consumes: VM and vCPU
//! lifecycle, guest-physical mappings, VMCS field access, capability reads and
//! the blocking run call. The macOS backend lives in [`crate::hvf`]; tests use
//! a scripted mock.

use bitflags::bitflags;
use numeric_enum_macro::numeric_enum;

use crate::error::HvResult;
use crate::vmx::VmxCapability;

/// Platform identifier of a virtual CPU.
pub type VcpuId = u32;

bitflags! {
    /// Access permissions of a guest-physical mapping.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MemoryFlags: u64 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
    }
}

numeric_enum! {
    #[repr(u32)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    #[allow(non_camel_case_types)]
    /// Guest registers living outside the VMCS (`hv_x86_reg_t` numbering).
    pub enum GuestReg {
        RIP = 0,
        RFLAGS = 1,
        RAX = 2,
        RCX = 3,
        RDX = 4,
        RBX = 5,
        RSI = 6,
        RDI = 7,
        RSP = 8,
        RBP = 9,
    }
}

/// The hypervisor API consumed by the monitor.
///
/// All calls are synchronous. `vcpu_run` blocks the calling thread until the
/// guest exits; the exit reason is read from the VMCS afterwards.
pub trait HvPlatform {
    /// Creates the VM of this process.
    fn vm_create(&self) -> HvResult;

    /// Destroys the VM of this process.
    fn vm_destroy(&self) -> HvResult;

    /// Creates a vCPU bound to the calling thread.
    fn vcpu_create(&self) -> HvResult<VcpuId>;

    fn vcpu_destroy(&self, vcpu: VcpuId) -> HvResult;

    /// Maps `size` bytes at `host` into guest-physical space at `gpa`.
    ///
    /// # Safety
    ///
    /// `host` must point to `size` valid bytes that stay allocated until the
    /// range is unmapped.
    unsafe fn vm_map(&self, host: *mut u8, gpa: u64, size: usize, flags: MemoryFlags)
    -> HvResult;

    fn vm_unmap(&self, gpa: u64, size: usize) -> HvResult;

    /// Reads the raw capability value: required-1 bits in the low half,
    /// allowed-1 bits in the high half.
    fn read_capability(&self, cap: VmxCapability) -> HvResult<u64>;

    fn read_vmcs(&self, vcpu: VcpuId, field: u32) -> HvResult<u64>;

    fn write_vmcs(&self, vcpu: VcpuId, field: u32, value: u64) -> HvResult;

    fn read_register(&self, vcpu: VcpuId, reg: GuestReg) -> HvResult<u64>;

    fn write_register(&self, vcpu: VcpuId, reg: GuestReg, value: u64) -> HvResult;

    /// Enters the guest and returns on the next VM exit.
    fn vcpu_run(&self, vcpu: VcpuId) -> HvResult;
}
