//! The run loop: resume the vCPU, classify the exit, handle or stop.

use bit_field::BitField;

use crate::config::UnhandledIoPolicy;
use crate::device::{AccessWidth, IoBus};
use crate::error::HvError;
use crate::hal::{GuestReg, HvPlatform};
use crate::mem::{GuestAddressSpace, GuestPhysAddr};
use crate::vmx::{VirtualCpu, VmxExitInfo, VmxExitReason, VmxIoExitInfo};
use crate::{Result, VmmError};

/// Port of the QEMU `isa-debug-exit`-style shutdown device.
const QEMU_EXIT_PORT: u16 = 0x604;
/// Word written to [`QEMU_EXIT_PORT`] to request shutdown.
const QEMU_EXIT_MAGIC: u32 = 0x2000;

/// Where the vCPU is in its run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VcpuState {
    /// Initialized or returned from a handled exit; will be resumed.
    Ready,
    /// Inside the guest.
    Running,
    /// Executed `HLT`. Nothing can wake it.
    Halted,
    /// An I/O exit was handled; will be resumed.
    IoPending,
    /// Entry failed or the exit could not be handled.
    Faulted,
    /// Stopped by guest shutdown or by the unhandled-port policy.
    Terminated,
}

impl VcpuState {
    /// Whether the vCPU may never be resumed again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Halted | Self::Faulted | Self::Terminated)
    }
}

/// Closed classification of a VM exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmExit {
    Halt,
    Io,
    Cpuid,
    /// Asynchronous exits that need no handling.
    Continue(VmxExitReason),
    /// The entry-failure bit was set.
    EntryFailure,
    /// A reason the monitor has no handler for, as a raw basic reason.
    Unhandled(u32),
}

impl VmExit {
    pub fn classify(info: &VmxExitInfo) -> Self {
        if info.entry_failure {
            return Self::EntryFailure;
        }
        match info.exit_reason {
            Some(VmxExitReason::HLT) => Self::Halt,
            Some(VmxExitReason::IO_INSTRUCTION) => Self::Io,
            Some(VmxExitReason::CPUID) => Self::Cpuid,
            Some(
                reason @ (VmxExitReason::EXTERNAL_INTERRUPT
                | VmxExitReason::INTERRUPT_WINDOW
                | VmxExitReason::PREEMPTION_TIMER),
            ) => Self::Continue(reason),
            _ => Self::Unhandled(info.raw_exit_reason),
        }
    }
}

/// Exit counters of one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExitStats {
    pub halt: u64,
    pub io: u64,
    pub cpuid: u64,
    pub continued: u64,
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    /// [`VcpuState::Halted`] or [`VcpuState::Terminated`].
    pub state: VcpuState,
    /// Number of platform run calls.
    pub resumes: u64,
    pub exits: ExitStats,
}

/// Drives one vCPU until it halts, shuts down or faults.
pub struct ExecutionLoop<'a, P: HvPlatform> {
    vcpu: &'a VirtualCpu<P>,
    memory: &'a GuestAddressSpace<P>,
    bus: &'a IoBus,
    policy: UnhandledIoPolicy,
    state: VcpuState,
    resumes: u64,
    stats: ExitStats,
}

impl<'a, P: HvPlatform> ExecutionLoop<'a, P> {
    pub fn new(
        vcpu: &'a VirtualCpu<P>,
        memory: &'a GuestAddressSpace<P>,
        bus: &'a IoBus,
        policy: UnhandledIoPolicy,
    ) -> Self {
        Self {
            vcpu,
            memory,
            bus,
            policy,
            state: VcpuState::Ready,
            resumes: 0,
            stats: ExitStats::default(),
        }
    }

    pub fn state(&self) -> VcpuState {
        self.state
    }

    pub fn resumes(&self) -> u64 {
        self.resumes
    }

    pub fn stats(&self) -> ExitStats {
        self.stats
    }

    /// Runs until a terminal state. Halt and shutdown are successes.
    pub fn run(&mut self) -> Result<RunSummary> {
        while !self.step()?.is_terminal() {}
        info!(
            "[RMV] vCPU {} stopped: {:?} after {} resumes",
            self.vcpu.id(),
            self.state,
            self.resumes
        );
        Ok(RunSummary {
            state: self.state,
            resumes: self.resumes,
            exits: self.stats,
        })
    }

    /// Resumes the guest once and handles the exit.
    pub fn step(&mut self) -> Result<VcpuState> {
        if self.state.is_terminal() {
            return Err(VmmError::VcpuTerminated);
        }
        self.state = VcpuState::Running;
        match self.resume_and_handle() {
            Ok(next) => {
                self.state = next;
                Ok(next)
            }
            Err(err) => {
                self.state = match err {
                    VmmError::UnhandledIoPort { .. } => VcpuState::Terminated,
                    _ => VcpuState::Faulted,
                };
                Err(err)
            }
        }
    }

    fn resume_and_handle(&mut self) -> Result<VcpuState> {
        self.resumes += 1;
        if let Err(err) = self.vcpu.run() {
            return Err(self.fault(None, Some(err)));
        }

        let exit_info = self.vcpu.exit_info()?;
        trace!("[RMV] VM exit: {:#x?}", exit_info);

        match VmExit::classify(&exit_info) {
            VmExit::Halt => {
                self.stats.halt += 1;
                debug!("[RMV] HLT @ {:#x}", exit_info.guest_rip);
                Ok(VcpuState::Halted)
            }
            VmExit::Io => {
                self.stats.io += 1;
                self.handle_io(&exit_info)
            }
            VmExit::Cpuid => {
                self.stats.cpuid += 1;
                self.handle_cpuid(&exit_info)?;
                Ok(VcpuState::Ready)
            }
            VmExit::Continue(reason) => {
                self.stats.continued += 1;
                trace!("[RMV] {:?}, resuming", reason);
                Ok(VcpuState::Ready)
            }
            VmExit::EntryFailure | VmExit::Unhandled(_) => {
                error!("[RMV] unhandled VM exit: {:#x?}", exit_info);
                Err(self.fault(Some(exit_info.raw_exit_reason), None))
            }
        }
    }

    fn handle_io(&mut self, exit_info: &VmxExitInfo) -> Result<VcpuState> {
        let io_info = self.vcpu.io_exit_info()?;
        let port = io_info.port;
        trace!("[RMV] I/O exit: {:#x?}", io_info);

        if io_info.is_string || io_info.is_repeat {
            warn!("[RMV] unsupported string I/O: {:#x?}", io_info);
            return Err(VmmError::UnhandledIoPort {
                port,
                detail: "string or REP I/O",
            });
        }
        let width = AccessWidth::try_from(io_info.access_size as usize).map_err(|_| {
            VmmError::UnhandledIoPort {
                port,
                detail: "invalid access size",
            }
        })?;

        let rax = self.vcpu.read_reg(GuestReg::RAX)?;
        if io_info.is_in {
            let value = match self.bus.read(port, width) {
                Some(value) => value,
                None => {
                    self.unhandled_port(&io_info)?;
                    width.mask()
                }
            };
            let mut rax = rax;
            rax.set_bits(width.bits_range(), value as u64);
            self.vcpu.write_reg(GuestReg::RAX, rax)?;
        } else {
            let data = rax.get_bits(width.bits_range()) as u32;
            if port == QEMU_EXIT_PORT && width == AccessWidth::Word && data == QEMU_EXIT_MAGIC {
                info!("[RMV] guest requested shutdown");
                self.vcpu.advance_rip(exit_info.exit_instruction_length)?;
                return Ok(VcpuState::Terminated);
            }
            if !self.bus.write(port, width, data) {
                self.unhandled_port(&io_info)?;
            }
        }

        self.vcpu.advance_rip(exit_info.exit_instruction_length)?;
        Ok(VcpuState::IoPending)
    }

    fn unhandled_port(&self, io_info: &VmxIoExitInfo) -> Result {
        let detail = if io_info.is_in {
            "no device for IN"
        } else {
            "no device for OUT"
        };
        match self.policy {
            UnhandledIoPolicy::Skip => {
                warn!("[RMV] port {:#x}: {detail}, skipped", io_info.port);
                Ok(())
            }
            UnhandledIoPolicy::Terminate => Err(VmmError::UnhandledIoPort {
                port: io_info.port,
                detail,
            }),
        }
    }

    /// Answers `CPUID` from the host with VMX hidden and the hypervisor bit set.
    fn handle_cpuid(&self, exit_info: &VmxExitInfo) -> Result {
        use raw_cpuid::cpuid;

        const LEAF_FEATURE_INFO: u32 = 0x1;
        const FEATURE_VMX: u32 = 1 << 5;
        const FEATURE_HYPERVISOR: u32 = 1 << 31;

        let leaf = self.vcpu.read_reg(GuestReg::RAX)? as u32;
        let subleaf = self.vcpu.read_reg(GuestReg::RCX)? as u32;
        let mut res = cpuid!(leaf, subleaf);
        if leaf == LEAF_FEATURE_INFO {
            res.ecx &= !FEATURE_VMX;
            res.ecx |= FEATURE_HYPERVISOR;
        }
        trace!("[RMV] CPUID({:#x}, {:#x}): {:?}", leaf, subleaf, res);

        self.vcpu.write_reg(GuestReg::RAX, res.eax as u64)?;
        self.vcpu.write_reg(GuestReg::RBX, res.ebx as u64)?;
        self.vcpu.write_reg(GuestReg::RCX, res.ecx as u64)?;
        self.vcpu.write_reg(GuestReg::RDX, res.edx as u64)?;
        self.vcpu.advance_rip(exit_info.exit_instruction_length)
    }

    /// Builds the fault report. The VM-instruction error is read first and
    /// left out if the field cannot be read.
    fn fault(&self, exit_reason: Option<u32>, platform: Option<HvError>) -> VmmError {
        let instruction_error = match self.vcpu.instruction_error() {
            Ok(err) => Some(err),
            Err(err) => {
                warn!("[RMV] cannot read VM-instruction error: {err}");
                None
            }
        };
        if exit_reason == Some(VmxExitReason::EPT_VIOLATION as u32) {
            match self.vcpu.ept_violation_gpa() {
                Ok(gpa) => error!("[RMV] EPT violation @ {:?}", gpa),
                Err(err) => warn!("[RMV] cannot read faulting guest-physical address: {err}"),
            }
        }
        if let Ok(rip) = self.vcpu.rip() {
            match self.memory.read(GuestPhysAddr::from_usize(rip), 4) {
                Some(bytes) => error!("[RMV] guest bytes @ {:#x}: {:02x?}", rip, bytes),
                None => error!("[RMV] guest RIP {:#x} outside guest memory", rip),
            }
        }
        error!("[RMV] vCPU {:#x?}", self.vcpu);
        VmmError::VmxEntryFailure {
            exit_reason,
            instruction_error,
            platform,
        }
    }
}
