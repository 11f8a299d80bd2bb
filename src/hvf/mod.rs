//! [`HvPlatform`] on macOS Hypervisor.framework.

mod bindings;

use core::sync::atomic::{AtomicBool, Ordering};

use self::bindings::*;
use crate::error::{HvError, HvResult};
use crate::hal::{GuestReg, HvPlatform, MemoryFlags, VcpuId};
use crate::vmx::VmxCapability;

/// Hypervisor.framework allows one VM per process.
static VM_CREATED: AtomicBool = AtomicBool::new(false);

fn check(ret: hv_return_t) -> HvResult {
    match HvError::from_raw(ret as u32) {
        None => Ok(()),
        Some(err) => Err(err),
    }
}

/// The Hypervisor.framework backend.
#[derive(Debug, Default, Clone, Copy)]
pub struct Hvf;

impl Hvf {
    pub fn new() -> Self {
        Self
    }
}

impl HvPlatform for Hvf {
    fn vm_create(&self) -> HvResult {
        if VM_CREATED.swap(true, Ordering::AcqRel) {
            return Err(HvError::Busy);
        }
        let ret = check(unsafe { hv_vm_create(HV_VM_DEFAULT) });
        if ret.is_err() {
            VM_CREATED.store(false, Ordering::Release);
        }
        ret
    }

    fn vm_destroy(&self) -> HvResult {
        check(unsafe { hv_vm_destroy() })?;
        VM_CREATED.store(false, Ordering::Release);
        Ok(())
    }

    fn vcpu_create(&self) -> HvResult<VcpuId> {
        let mut vcpu: hv_vcpuid_t = 0;
        check(unsafe { hv_vcpu_create(&mut vcpu, HV_VCPU_DEFAULT) })?;
        Ok(vcpu)
    }

    fn vcpu_destroy(&self, vcpu: VcpuId) -> HvResult {
        check(unsafe { hv_vcpu_destroy(vcpu) })
    }

    unsafe fn vm_map(&self, host: *mut u8, gpa: u64, size: usize, flags: MemoryFlags) -> HvResult {
        check(unsafe { hv_vm_map(host.cast(), gpa, size, flags.bits()) })
    }

    fn vm_unmap(&self, gpa: u64, size: usize) -> HvResult {
        check(unsafe { hv_vm_unmap(gpa, size) })
    }

    fn read_capability(&self, cap: VmxCapability) -> HvResult<u64> {
        let mut value = 0;
        check(unsafe { hv_vmx_read_capability(cap.into(), &mut value) })?;
        Ok(value)
    }

    fn read_vmcs(&self, vcpu: VcpuId, field: u32) -> HvResult<u64> {
        let mut value = 0;
        check(unsafe { hv_vmx_vcpu_read_vmcs(vcpu, field, &mut value) })?;
        Ok(value)
    }

    fn write_vmcs(&self, vcpu: VcpuId, field: u32, value: u64) -> HvResult {
        check(unsafe { hv_vmx_vcpu_write_vmcs(vcpu, field, value) })
    }

    fn read_register(&self, vcpu: VcpuId, reg: GuestReg) -> HvResult<u64> {
        let mut value = 0;
        check(unsafe { hv_vcpu_read_register(vcpu, reg.into(), &mut value) })?;
        Ok(value)
    }

    fn write_register(&self, vcpu: VcpuId, reg: GuestReg, value: u64) -> HvResult {
        check(unsafe { hv_vcpu_write_register(vcpu, reg.into(), value) })
    }

    fn vcpu_run(&self, vcpu: VcpuId) -> HvResult {
        check(unsafe { hv_vcpu_run(vcpu) })
    }
}
