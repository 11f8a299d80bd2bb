use alloc::boxed::Box;

use crate::config::VmmConfig;
use crate::device::{IoBus, PortIoDevice};
use crate::exec::{ExecutionLoop, RunSummary};
use crate::hal::HvPlatform;
use crate::vm::VirtualMachine;
use crate::vmx::has_hardware_support;
use crate::Result;

/// A VM with one vCPU, a port I/O bus and one real-mode segment of memory.
pub struct Monitor<P: HvPlatform> {
    vm: VirtualMachine<P>,
    bus: IoBus,
    config: VmmConfig,
}

impl<P: HvPlatform> Monitor<P> {
    /// Creates the VM on `platform`.
    pub fn new(platform: P, config: VmmConfig) -> Result<Self> {
        if !has_hardware_support() {
            warn!("[RMV] CPUID reports no VMX, the platform will likely refuse the VM");
        }
        Ok(Self {
            vm: VirtualMachine::create(platform)?,
            bus: IoBus::new(),
            config,
        })
    }

    pub fn vm(&self) -> &VirtualMachine<P> {
        &self.vm
    }

    pub fn config(&self) -> &VmmConfig {
        &self.config
    }

    pub fn bus(&self) -> &IoBus {
        &self.bus
    }

    /// Attaches a port I/O device. Returns it back if its ports are taken.
    pub fn add_device(
        &self,
        device: Box<dyn PortIoDevice>,
    ) -> core::result::Result<(), Box<dyn PortIoDevice>> {
        self.bus.register(device)
    }

    /// Boots `image` and runs it until it halts, shuts down or fails.
    ///
    /// The vCPU and guest memory live for this call only. The image and the
    /// layout are checked before the platform is touched.
    pub fn run(&self, image: &[u8]) -> Result<RunSummary> {
        let layout = &self.config.layout;
        layout.check(image)?;

        let vcpu = self.vm.create_vcpu()?;
        vcpu.setup_vmcs_control()?;
        vcpu.setup_vmcs_guest(layout.entry(), layout.stack_top)?;
        let memory = self.vm.load_guest(image, layout)?;

        match vcpu.instruction_error() {
            Ok(err) => debug!("[RMV] before first entry: {err}"),
            Err(err) => debug!("[RMV] before first entry: {err}"),
        }
        info!(
            "[RMV] starting guest @ {:?}, stack {:#x}",
            layout.entry(),
            layout.stack_top
        );

        ExecutionLoop::new(&vcpu, &memory, &self.bus, self.config.unhandled_io).run()
    }
}
