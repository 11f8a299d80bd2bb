use alloc::sync::Arc;

use crate::hal::HvPlatform;
use crate::mem::{GuestAddressSpace, GuestLayout};
use crate::vmx::{CapabilityCache, CapabilityMask, VirtualCpu, VmxCapability};
use crate::{Result, VmmError};

/// State shared by a VM and everything created from it.
///
/// The platform VM is destroyed when the last vCPU, mapping and VM handle are
/// gone.
pub(crate) struct VmShared<P: HvPlatform> {
    pub(crate) platform: P,
    pub(crate) caps: CapabilityCache,
}

impl<P: HvPlatform> Drop for VmShared<P> {
    fn drop(&mut self) {
        match self.platform.vm_destroy() {
            Ok(()) => info!("[HV] destroyed VM"),
            Err(err) => error!("[HV] failed to destroy VM: {err}"),
        }
    }
}

/// Handle of the hardware-backed VM of this process.
pub struct VirtualMachine<P: HvPlatform> {
    shared: Arc<VmShared<P>>,
}

impl<P: HvPlatform> VirtualMachine<P> {
    /// Creates the VM. The platform refuses a second VM per process.
    pub fn create(platform: P) -> Result<Self> {
        platform
            .vm_create()
            .map_err(|source| VmmError::PlatformUnavailable {
                context: "create VM",
                source,
            })?;
        info!("[HV] created VM");
        Ok(Self {
            shared: Arc::new(VmShared {
                platform,
                caps: CapabilityCache::new(),
            }),
        })
    }

    pub fn platform(&self) -> &P {
        &self.shared.platform
    }

    /// Capability mask of `category`, cached for the lifetime of the VM.
    pub fn capability(&self, category: VmxCapability) -> Result<CapabilityMask> {
        self.shared.caps.query(&self.shared.platform, category)
    }

    /// Creates a vCPU bound to the calling thread.
    pub fn create_vcpu(&self) -> Result<VirtualCpu<P>> {
        VirtualCpu::new(self.shared.clone())
    }

    /// Maps a fresh guest segment at guest-physical 0 and copies `image` into
    /// it at the layout's load offset.
    pub fn load_guest(&self, image: &[u8], layout: &GuestLayout) -> Result<GuestAddressSpace<P>> {
        GuestAddressSpace::load(self.shared.clone(), image, layout)
    }
}
