mod capability;
mod definitions;
mod vcpu;
pub(crate) mod vmcs;

pub use self::capability::{CapabilityCache, CapabilityMask, VmxCapability};
pub use self::definitions::{VmxExitReason, VmxInstructionError};
pub use self::vcpu::VirtualCpu;
pub use self::vmcs::{VmxExitInfo, VmxIoExitInfo};

/// Return if current platform support virtualization extension.
pub fn has_hardware_support() -> bool {
    if let Some(feature) = raw_cpuid::CpuId::new().get_feature_info() {
        feature.has_vmx()
    } else {
        false
    }
}
