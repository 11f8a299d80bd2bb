//! A scripted [`HvPlatform`].
//!
//! VMCS fields and guest registers are plain maps. `vcpu_run` interprets a
//! handful of real-mode instructions from mapped guest memory: the moves
//! `mov al/ax/dx, imm` run inline, while `hlt`, port I/O and `cpuid` produce
//! the exits real hardware would report for them with the controls the
//! monitor programs. Anything else ends in a triple fault.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use crate::error::{HvError, HvResult};
use crate::hal::{GuestReg, HvPlatform, MemoryFlags, VcpuId};
use crate::vmx::vmcs::{VmcsControl32, VmcsGuestNW, VmcsReadOnly32, VmcsReadOnly64, VmcsReadOnlyNW};
use crate::vmx::{CapabilityMask, VmxCapability, VmxExitReason};

/// Inline instructions executed before the mock reports a preemption-timer exit.
const MAX_INLINE_STEPS: usize = 0x1_0000;

const EXIT_HLT: u32 = VmxExitReason::HLT as u32;
const EXIT_IO: u32 = VmxExitReason::IO_INSTRUCTION as u32;
const EXIT_CPUID: u32 = VmxExitReason::CPUID as u32;
const EXIT_TRIPLE_FAULT: u32 = VmxExitReason::TRIPLE_FAULT as u32;
const EXIT_EPT_VIOLATION: u32 = VmxExitReason::EPT_VIOLATION as u32;
const EXIT_PREEMPTION_TIMER: u32 = VmxExitReason::PREEMPTION_TIMER as u32;

/// Capability values of a recent Intel Mac.
fn default_caps() -> HashMap<VmxCapability, CapabilityMask> {
    [
        (VmxCapability::PinBased, 0x0000_007f_0000_0016),
        (VmxCapability::ProcBased, 0xfff9_fffe_0401_e172),
        (VmxCapability::ProcBased2, 0x0000_00ff_0000_0000),
        (VmxCapability::Entry, 0x0000_f3ff_0000_11ff),
    ]
    .into_iter()
    .map(|(cap, raw)| (cap, CapabilityMask::from_raw(raw)))
    .collect()
}

fn control_category(field: u32) -> Option<VmxCapability> {
    Some(match VmcsControl32::try_from(field).ok()? {
        VmcsControl32::PINBASED_EXEC_CONTROLS => VmxCapability::PinBased,
        VmcsControl32::PRIMARY_PROCBASED_EXEC_CONTROLS => VmxCapability::ProcBased,
        VmcsControl32::SECONDARY_PROCBASED_EXEC_CONTROLS => VmxCapability::ProcBased2,
        VmcsControl32::VMENTRY_CONTROLS => VmxCapability::Entry,
        _ => return None,
    })
}

struct Mapping {
    gpa: u64,
    size: usize,
    host: usize,
    flags: MemoryFlags,
}

#[derive(Default)]
struct State {
    vm_alive: bool,
    next_vcpu: VcpuId,
    vcpus: HashSet<VcpuId>,
    vmcs: HashMap<(VcpuId, u32), u64>,
    regs: HashMap<(VcpuId, GuestReg), u64>,
    caps: HashMap<VmxCapability, CapabilityMask>,
    cap_reads: HashMap<VmxCapability, usize>,
    rejected_fields: HashSet<u32>,
    unreadable_fields: HashSet<u32>,
    clobbered_fields: HashMap<u32, u64>,
    mappings: Vec<Mapping>,
    map_calls: usize,
    map_error: Option<HvError>,
    run_calls: usize,
    run_error: Option<HvError>,
    entry_failure: Option<u32>,
    instruction_error: u32,
}

impl State {
    fn byte_at(&self, gpa: u64) -> Option<u8> {
        let m = self
            .mappings
            .iter()
            .find(|m| gpa >= m.gpa && gpa - m.gpa < m.size as u64)?;
        // SAFETY: the mapping's owner keeps the buffer alive until unmapped.
        Some(unsafe { *((m.host + (gpa - m.gpa) as usize) as *const u8) })
    }

    fn reg(&self, vcpu: VcpuId, reg: GuestReg) -> u64 {
        match reg {
            GuestReg::RIP => self.field(vcpu, VmcsGuestNW::RIP as u32),
            _ => self.regs.get(&(vcpu, reg)).copied().unwrap_or(0),
        }
    }

    fn set_reg(&mut self, vcpu: VcpuId, reg: GuestReg, value: u64) {
        match reg {
            GuestReg::RIP => {
                self.vmcs.insert((vcpu, VmcsGuestNW::RIP as u32), value);
            }
            _ => {
                self.regs.insert((vcpu, reg), value);
            }
        }
    }

    fn set_reg_low(&mut self, vcpu: VcpuId, reg: GuestReg, bytes: u32, value: u64) {
        let mask = (1u64 << (bytes * 8)) - 1;
        let old = self.reg(vcpu, reg);
        self.set_reg(vcpu, reg, (old & !mask) | (value & mask));
    }

    fn field(&self, vcpu: VcpuId, field: u32) -> u64 {
        if let Some(&value) = self.clobbered_fields.get(&field) {
            return value;
        }
        self.vmcs.get(&(vcpu, field)).copied().unwrap_or(0)
    }

    fn report_exit(&mut self, vcpu: VcpuId, reason: u32, len: u32, qualification: u64) {
        self.vmcs
            .insert((vcpu, VmcsReadOnly32::EXIT_REASON as u32), reason as u64);
        self.vmcs
            .insert((vcpu, VmcsReadOnly32::VMEXIT_INSTRUCTION_LEN as u32), len as u64);
        self.vmcs
            .insert((vcpu, VmcsReadOnlyNW::EXIT_QUALIFICATION as u32), qualification);
    }

    fn io_exit(&mut self, vcpu: VcpuId, len: u32, size: u64, is_in: bool, port: u16, imm: bool) {
        let mut qualification = (size - 1) | (port as u64) << 16;
        if is_in {
            qualification |= 1 << 3;
        }
        if imm {
            qualification |= 1 << 6;
        }
        self.report_exit(vcpu, EXIT_IO, len, qualification);
    }

    /// Interprets guest code at `RIP` up to the next exiting instruction.
    fn execute(&mut self, vcpu: VcpuId) {
        for _ in 0..MAX_INLINE_STEPS {
            let rip = self.reg(vcpu, GuestReg::RIP);
            let fetch = |off: u64| self.byte_at((rip + off) & 0xffff);
            let Some(opcode) = fetch(0) else {
                self.vmcs
                    .insert((vcpu, VmcsReadOnly64::GUEST_PHYSICAL_ADDR as u32), rip);
                return self.report_exit(vcpu, EXIT_EPT_VIOLATION, 0, 0);
            };
            let imm8 = fetch(1).unwrap_or(0);
            let imm16 = u16::from_le_bytes([imm8, fetch(2).unwrap_or(0)]);
            let dx = self.reg(vcpu, GuestReg::RDX) as u16;
            let next = fetch(1);

            match opcode {
                0xf4 => return self.report_exit(vcpu, EXIT_HLT, 1, 0),
                // mov al, imm8
                0xb0 => {
                    self.set_reg_low(vcpu, GuestReg::RAX, 1, imm8 as u64);
                    self.set_reg(vcpu, GuestReg::RIP, (rip + 2) & 0xffff);
                }
                // mov ax, imm16 / mov dx, imm16
                0xb8 | 0xba => {
                    let reg = if opcode == 0xb8 {
                        GuestReg::RAX
                    } else {
                        GuestReg::RDX
                    };
                    self.set_reg_low(vcpu, reg, 2, imm16 as u64);
                    self.set_reg(vcpu, GuestReg::RIP, (rip + 3) & 0xffff);
                }
                0xe4 => return self.io_exit(vcpu, 2, 1, true, imm8 as u16, true),
                0xe5 => return self.io_exit(vcpu, 2, 2, true, imm8 as u16, true),
                0xe6 => return self.io_exit(vcpu, 2, 1, false, imm8 as u16, true),
                0xe7 => return self.io_exit(vcpu, 2, 2, false, imm8 as u16, true),
                0xec => return self.io_exit(vcpu, 1, 1, true, dx, false),
                0xed => return self.io_exit(vcpu, 1, 2, true, dx, false),
                0xee => return self.io_exit(vcpu, 1, 1, false, dx, false),
                0xef => return self.io_exit(vcpu, 1, 2, false, dx, false),
                // operand-size prefix: 32-bit in/out via dx
                0x66 if next == Some(0xed) => return self.io_exit(vcpu, 2, 4, true, dx, false),
                0x66 if next == Some(0xef) => return self.io_exit(vcpu, 2, 4, false, dx, false),
                // rep outsb
                0xf3 if next == Some(0x6e) => {
                    let qualification = (dx as u64) << 16 | 1 << 4 | 1 << 5;
                    return self.report_exit(vcpu, EXIT_IO, 2, qualification);
                }
                0x0f if next == Some(0xa2) => return self.report_exit(vcpu, EXIT_CPUID, 2, 0),
                _ => return self.report_exit(vcpu, EXIT_TRIPLE_FAULT, 0, 0),
            }
        }
        self.report_exit(vcpu, EXIT_PREEMPTION_TIMER, 0, 0);
    }
}

/// A scripted hypervisor. Clones share state, so a test keeps one clone to
/// inspect what the monitor did with the other.
#[derive(Clone)]
pub(crate) struct MockPlatform {
    state: Arc<Mutex<State>>,
}

impl MockPlatform {
    pub(crate) fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                caps: default_caps(),
                ..Default::default()
            })),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    pub(crate) fn vm_alive(&self) -> bool {
        self.with(|s| s.vm_alive)
    }

    pub(crate) fn live_vcpus(&self) -> usize {
        self.with(|s| s.vcpus.len())
    }

    /// vCPUs created over the mock's lifetime, destroyed ones included.
    pub(crate) fn created_vcpus(&self) -> usize {
        self.with(|s| s.next_vcpu as usize)
    }

    pub(crate) fn capability_reads(&self, cap: VmxCapability) -> usize {
        self.with(|s| s.cap_reads.get(&cap).copied().unwrap_or(0))
    }

    pub(crate) fn capability_mask(&self, cap: VmxCapability) -> CapabilityMask {
        self.with(|s| s.caps[&cap])
    }

    pub(crate) fn set_capability_mask(&self, cap: VmxCapability, mask: CapabilityMask) {
        self.with(|s| s.caps.insert(cap, mask));
    }

    pub(crate) fn remove_capability(&self, cap: VmxCapability) {
        self.with(|s| s.caps.remove(&cap));
    }

    /// Fails every later write to `field` with `HV_BAD_ARGUMENT`.
    pub(crate) fn reject_writes_to(&self, field: u32) {
        self.with(|s| s.rejected_fields.insert(field));
    }

    /// Makes every read of `field` return `value`.
    pub(crate) fn clobber_field(&self, field: u32, value: u64) {
        self.with(|s| s.clobbered_fields.insert(field, value));
    }

    pub(crate) fn vmcs(&self, vcpu: VcpuId, field: u32) -> Option<u64> {
        self.with(|s| s.vmcs.get(&(vcpu, field)).copied())
    }

    pub(crate) fn register(&self, vcpu: VcpuId, reg: GuestReg) -> u64 {
        self.with(|s| s.reg(vcpu, reg))
    }

    pub(crate) fn set_register(&self, vcpu: VcpuId, reg: GuestReg, value: u64) {
        self.with(|s| s.set_reg(vcpu, reg, value));
    }

    pub(crate) fn fail_map(&self, err: HvError) {
        self.with(|s| s.map_error = Some(err));
    }

    pub(crate) fn map_calls(&self) -> usize {
        self.with(|s| s.map_calls)
    }

    /// Size and flag bits of the mapping at `gpa`.
    pub(crate) fn mapping(&self, gpa: u64) -> Option<(usize, u64)> {
        self.with(|s| {
            s.mappings
                .iter()
                .find(|m| m.gpa == gpa)
                .map(|m| (m.size, m.flags.bits()))
        })
    }

    pub(crate) fn guest_bytes(&self, gpa: u64, len: usize) -> Option<Vec<u8>> {
        self.with(|s| (0..len as u64).map(|i| s.byte_at(gpa + i)).collect())
    }

    pub(crate) fn run_calls(&self) -> usize {
        self.with(|s| s.run_calls)
    }

    pub(crate) fn fail_run(&self, err: HvError) {
        self.with(|s| s.run_error = Some(err));
    }

    /// Reports a VM-entry failure with basic reason `reason` on the next run.
    pub(crate) fn fail_entry(&self, reason: u32, instruction_error: u32) {
        self.with(|s| {
            s.entry_failure = Some(reason);
            s.instruction_error = instruction_error;
        });
    }

    /// Makes every read of `field` fail with `HV_BAD_ARGUMENT`.
    pub(crate) fn fail_reads_of(&self, field: u32) {
        self.with(|s| {
            s.unreadable_fields.insert(field);
        });
    }

    pub(crate) fn set_instruction_error(&self, code: u32) {
        self.with(|s| s.instruction_error = code);
    }
}

impl HvPlatform for MockPlatform {
    fn vm_create(&self) -> HvResult {
        self.with(|s| {
            if s.vm_alive {
                return Err(HvError::Busy);
            }
            s.vm_alive = true;
            Ok(())
        })
    }

    fn vm_destroy(&self) -> HvResult {
        self.with(|s| {
            if !s.vm_alive || !s.vcpus.is_empty() || !s.mappings.is_empty() {
                return Err(HvError::Busy);
            }
            s.vm_alive = false;
            s.cap_reads.clear();
            Ok(())
        })
    }

    fn vcpu_create(&self) -> HvResult<VcpuId> {
        self.with(|s| {
            if !s.vm_alive {
                return Err(HvError::NoDevice);
            }
            let id = s.next_vcpu;
            s.next_vcpu += 1;
            s.vcpus.insert(id);
            Ok(id)
        })
    }

    fn vcpu_destroy(&self, vcpu: VcpuId) -> HvResult {
        self.with(|s| {
            if !s.vcpus.remove(&vcpu) {
                return Err(HvError::BadArgument);
            }
            s.vmcs.retain(|&(id, _), _| id != vcpu);
            s.regs.retain(|&(id, _), _| id != vcpu);
            Ok(())
        })
    }

    unsafe fn vm_map(&self, host: *mut u8, gpa: u64, size: usize, flags: MemoryFlags) -> HvResult {
        self.with(|s| {
            s.map_calls += 1;
            if let Some(err) = s.map_error {
                return Err(err);
            }
            let end = gpa + size as u64;
            let overlaps = s
                .mappings
                .iter()
                .any(|m| gpa < m.gpa + m.size as u64 && m.gpa < end);
            if !s.vm_alive || size == 0 || size % 0x1000 != 0 || gpa % 0x1000 != 0 || overlaps {
                return Err(HvError::BadArgument);
            }
            s.mappings.push(Mapping {
                gpa,
                size,
                host: host as usize,
                flags,
            });
            Ok(())
        })
    }

    fn vm_unmap(&self, gpa: u64, size: usize) -> HvResult {
        self.with(|s| {
            let idx = s
                .mappings
                .iter()
                .position(|m| m.gpa == gpa && m.size == size)
                .ok_or(HvError::BadArgument)?;
            s.mappings.remove(idx);
            Ok(())
        })
    }

    fn read_capability(&self, cap: VmxCapability) -> HvResult<u64> {
        self.with(|s| {
            *s.cap_reads.entry(cap).or_default() += 1;
            let mask = s.caps.get(&cap).ok_or(HvError::Unsupported)?;
            Ok(((mask.allowed as u64) << 32) | mask.required as u64)
        })
    }

    fn read_vmcs(&self, vcpu: VcpuId, field: u32) -> HvResult<u64> {
        self.with(|s| {
            if !s.vcpus.contains(&vcpu) {
                return Err(HvError::BadArgument);
            }
            if s.unreadable_fields.contains(&field) {
                return Err(HvError::BadArgument);
            }
            if field == VmcsReadOnly32::VM_INSTRUCTION_ERROR as u32 {
                return Ok(s.instruction_error as u64);
            }
            Ok(s.field(vcpu, field))
        })
    }

    fn write_vmcs(&self, vcpu: VcpuId, field: u32, value: u64) -> HvResult {
        self.with(|s| {
            if !s.vcpus.contains(&vcpu) || s.rejected_fields.contains(&field) {
                return Err(HvError::BadArgument);
            }
            if let Some(cap) = control_category(field) {
                let legal = s.caps.get(&cap).is_some_and(|m| {
                    value <= u32::MAX as u64 && m.permits(value as u32)
                });
                if !legal {
                    return Err(HvError::BadArgument);
                }
            }
            s.vmcs.insert((vcpu, field), value);
            Ok(())
        })
    }

    fn read_register(&self, vcpu: VcpuId, reg: GuestReg) -> HvResult<u64> {
        self.with(|s| {
            if !s.vcpus.contains(&vcpu) {
                return Err(HvError::BadArgument);
            }
            Ok(s.reg(vcpu, reg))
        })
    }

    fn write_register(&self, vcpu: VcpuId, reg: GuestReg, value: u64) -> HvResult {
        self.with(|s| {
            if !s.vcpus.contains(&vcpu) {
                return Err(HvError::BadArgument);
            }
            s.set_reg(vcpu, reg, value);
            Ok(())
        })
    }

    fn vcpu_run(&self, vcpu: VcpuId) -> HvResult {
        self.with(|s| {
            s.run_calls += 1;
            if !s.vcpus.contains(&vcpu) {
                return Err(HvError::BadArgument);
            }
            if let Some(err) = s.run_error {
                return Err(err);
            }
            if let Some(reason) = s.entry_failure.take() {
                s.report_exit(vcpu, (1 << 31) | reason, 0, 0);
                return Ok(());
            }
            s.execute(vcpu);
            Ok(())
        })
    }
}
