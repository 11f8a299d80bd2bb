//! Scenario tests: whole guests run against the mock platform.


use crate::test_utils::SharedBuf;
use crate::test_utils::mock::MockPlatform;
use crate::{
    DebugConsole, ExecutionLoop, GuestLayout, IoBus, Monitor, RunSummary, UnhandledIoPolicy,
    VirtualCpu, VirtualMachine, VmmConfig,
};

/// A monitor on a fresh mock with a debug console attached.
fn monitor_with_console(policy: UnhandledIoPolicy) -> (MockPlatform, Monitor<MockPlatform>, SharedBuf) {
    let mock = MockPlatform::new();
    let monitor = Monitor::new(
        mock.clone(),
        VmmConfig::default().with_unhandled_io(policy),
    )
    .unwrap();
    let console = SharedBuf::default();
    assert!(monitor
        .add_device(Box::new(DebugConsole::new(console.clone())))
        .is_ok());
    (mock, monitor, console)
}

/// Pieces of a monitor kept apart so a test can look at the vCPU after the run.
struct Harness {
    mock: MockPlatform,
    vm: VirtualMachine<MockPlatform>,
    bus: IoBus,
}

impl Harness {
    fn new() -> Self {
        let mock = MockPlatform::new();
        let vm = VirtualMachine::create(mock.clone()).unwrap();
        let bus = IoBus::new();
        assert!(bus
            .register(Box::new(DebugConsole::new(std::io::sink())))
            .is_ok());
        Self { mock, vm, bus }
    }

    fn vcpu(&self, layout: &GuestLayout) -> VirtualCpu<MockPlatform> {
        let vcpu = self.vm.create_vcpu().unwrap();
        vcpu.setup_vmcs_control().unwrap();
        vcpu.setup_vmcs_guest(layout.entry(), layout.stack_top).unwrap();
        vcpu
    }

    /// Runs `image` at the default layout and hands back the stopped vCPU.
    fn run(
        &self,
        image: &[u8],
        policy: UnhandledIoPolicy,
    ) -> (VirtualCpu<MockPlatform>, crate::Result<RunSummary>) {
        let layout = GuestLayout::default();
        let vcpu = self.vcpu(&layout);
        let memory = self.vm.load_guest(image, &layout).unwrap();
        let result = ExecutionLoop::new(&vcpu, &memory, &self.bus, policy).run();
        (vcpu, result)
    }
}
