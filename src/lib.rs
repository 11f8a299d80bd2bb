#![doc = include_str!("../README.md")]

#[macro_use]
extern crate log;

extern crate alloc;

mod config;
mod device;
mod error;
mod exec;
mod hal;
mod mem;
mod monitor;
mod vm;
mod vmx;

#[cfg(test)]
mod test_utils;
#[cfg(test)]
mod tests;

cfg_if::cfg_if! {
    if #[cfg(all(feature = "hvf", target_os = "macos", target_arch = "x86_64"))] {
        mod hvf;
        pub use hvf::Hvf;

        /// Hypervisor backend of this host.
        pub fn host_platform() -> Result<Hvf> {
            Ok(Hvf::new())
        }
    } else {
        /// Hypervisor backend of this host. None is built for this target.
        pub fn host_platform() -> Result<Unavailable> {
            Err(VmmError::PlatformUnavailable {
                context: "no hypervisor backend for this target",
                source: HvError::Unsupported,
            })
        }

        /// Placeholder backend of targets without a hypervisor API.
        /// [`host_platform`] never returns one.
        pub enum Unavailable {}

        impl HvPlatform for Unavailable {
            fn vm_create(&self) -> error::HvResult { match *self {} }
            fn vm_destroy(&self) -> error::HvResult { match *self {} }
            fn vcpu_create(&self) -> error::HvResult<VcpuId> { match *self {} }
            fn vcpu_destroy(&self, _: VcpuId) -> error::HvResult { match *self {} }
            unsafe fn vm_map(&self, _: *mut u8, _: u64, _: usize, _: MemoryFlags) -> error::HvResult {
                match *self {}
            }
            fn vm_unmap(&self, _: u64, _: usize) -> error::HvResult { match *self {} }
            fn read_capability(&self, _: VmxCapability) -> error::HvResult<u64> { match *self {} }
            fn read_vmcs(&self, _: VcpuId, _: u32) -> error::HvResult<u64> { match *self {} }
            fn write_vmcs(&self, _: VcpuId, _: u32, _: u64) -> error::HvResult { match *self {} }
            fn read_register(&self, _: VcpuId, _: GuestReg) -> error::HvResult<u64> { match *self {} }
            fn write_register(&self, _: VcpuId, _: GuestReg, _: u64) -> error::HvResult { match *self {} }
            fn vcpu_run(&self, _: VcpuId) -> error::HvResult { match *self {} }
        }
    }
}

pub use config::{UnhandledIoPolicy, VmmConfig};
pub use device::{AccessWidth, DEBUG_CONSOLE_PORT, DebugConsole, IoBus, PortIoDevice};
pub use error::{HvError, HvResult, VmmError};
pub use exec::{ExecutionLoop, ExitStats, RunSummary, VcpuState, VmExit};
pub use hal::{GuestReg, HvPlatform, MemoryFlags, VcpuId};
pub use mem::{GuestAddressSpace, GuestLayout, GuestPhysAddr, REAL_MODE_SEGMENT_SIZE};
pub use monitor::Monitor;
pub use vm::VirtualMachine;
pub use vmx::{
    CapabilityMask, VirtualCpu, VmxCapability, VmxExitInfo, VmxExitReason, VmxInstructionError,
    VmxIoExitInfo, has_hardware_support,
};

/// Result type of the monitor.
pub type Result<T = ()> = core::result::Result<T, VmmError>;
