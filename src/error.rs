use thiserror::Error;

use crate::hal::GuestReg;
use crate::vmx::{VmxCapability, VmxInstructionError};

/// A non-success return code of the platform hypervisor API.
///
/// The known codes use the Hypervisor.framework encoding (`hv_return_t`), any
/// other value is kept verbatim in [`HvError::Unknown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HvError {
    #[error("HV_ERROR")]
    Error,
    #[error("HV_BUSY")]
    Busy,
    #[error("HV_BAD_ARGUMENT")]
    BadArgument,
    #[error("HV_ILLEGAL_GUEST_STATE")]
    IllegalGuestState,
    #[error("HV_NO_RESOURCES")]
    NoResources,
    #[error("HV_NO_DEVICE")]
    NoDevice,
    #[error("HV_DENIED")]
    Denied,
    #[error("HV_UNSUPPORTED")]
    Unsupported,
    #[error("unknown hypervisor error {0:#x}")]
    Unknown(u32),
}

impl HvError {
    const BASE: u32 = 0xfae9_4000;

    /// Converts a raw `hv_return_t`. Returns `None` for `HV_SUCCESS`.
    pub fn from_raw(code: u32) -> Option<Self> {
        Some(match code {
            0 => return None,
            c if c == Self::BASE | 0x01 => Self::Error,
            c if c == Self::BASE | 0x02 => Self::Busy,
            c if c == Self::BASE | 0x03 => Self::BadArgument,
            c if c == Self::BASE | 0x04 => Self::IllegalGuestState,
            c if c == Self::BASE | 0x05 => Self::NoResources,
            c if c == Self::BASE | 0x06 => Self::NoDevice,
            c if c == Self::BASE | 0x07 => Self::Denied,
            c if c == Self::BASE | 0x0f => Self::Unsupported,
            other => Self::Unknown(other),
        })
    }

    /// The raw `hv_return_t` value.
    pub fn code(self) -> u32 {
        match self {
            Self::Error => Self::BASE | 0x01,
            Self::Busy => Self::BASE | 0x02,
            Self::BadArgument => Self::BASE | 0x03,
            Self::IllegalGuestState => Self::BASE | 0x04,
            Self::NoResources => Self::BASE | 0x05,
            Self::NoDevice => Self::BASE | 0x06,
            Self::Denied => Self::BASE | 0x07,
            Self::Unsupported => Self::BASE | 0x0f,
            Self::Unknown(code) => code,
        }
    }
}

/// Result of a raw platform call.
pub type HvResult<T = ()> = core::result::Result<T, HvError>;

/// Errors of the monitor. Every variant is fatal for the current run.
#[derive(Debug, Error)]
pub enum VmmError {
    #[error("hypervisor platform unavailable: {context}: {source}")]
    PlatformUnavailable {
        context: &'static str,
        #[source]
        source: HvError,
    },

    #[error("hardware does not support {category:?}: {detail}")]
    HardwareUnsupported {
        category: VmxCapability,
        detail: String,
    },

    #[error("VMCS write of {value:#x} to field {field:#06x} rejected: {source}")]
    ControlWriteRejected {
        field: u32,
        value: u64,
        #[source]
        source: HvError,
    },

    #[error("guest state field {field:#06x} reads back {actual:#x}, expected {expected:#x}")]
    GuestStateMismatch {
        field: u32,
        expected: u64,
        actual: u64,
    },

    #[error("cannot allocate {size:#x} bytes of guest memory: {detail}")]
    AllocationFailed { size: usize, detail: &'static str },

    #[error("cannot map {size:#x} bytes at guest physical {gpa:#x}: {source}")]
    MappingFailed {
        gpa: usize,
        size: usize,
        #[source]
        source: HvError,
    },

    #[error("guest image of {len:#x} bytes at offset {offset:#x} exceeds the {capacity:#x}-byte segment")]
    ImageTooLarge {
        len: usize,
        offset: usize,
        capacity: usize,
    },

    #[error("guest image is empty")]
    EmptyImage,

    #[error("guest layout {field} = {value:#x} is {detail}")]
    InvalidLayout {
        field: &'static str,
        value: usize,
        detail: &'static str,
    },

    #[error(
        "VM entry failed (exit reason {exit_reason:?}, platform {platform:?}): {}",
        describe_instruction_error(.instruction_error)
    )]
    VmxEntryFailure {
        exit_reason: Option<u32>,
        /// `None` if the VM-instruction error field could not be read.
        instruction_error: Option<VmxInstructionError>,
        platform: Option<HvError>,
    },

    #[error("unhandled I/O port {port:#x} ({detail})")]
    UnhandledIoPort { port: u16, detail: &'static str },

    #[error("vCPU already reached a terminal state")]
    VcpuTerminated,

    #[error("VMCS access to field {field:#06x} failed: {source}")]
    VmcsAccess {
        field: u32,
        #[source]
        source: HvError,
    },

    #[error("guest register {reg:?} access failed: {source}")]
    RegisterAccess {
        reg: GuestReg,
        #[source]
        source: HvError,
    },
}

fn describe_instruction_error(err: &Option<VmxInstructionError>) -> String {
    match err {
        Some(err) => err.to_string(),
        None => "instruction error unreadable".into(),
    }
}

impl VmmError {
    /// Process exit status for this error category.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::PlatformUnavailable { .. } => 10,
            Self::HardwareUnsupported { .. } => 11,
            Self::ControlWriteRejected { .. } | Self::GuestStateMismatch { .. } => 12,
            Self::AllocationFailed { .. } => 13,
            Self::MappingFailed { .. } => 14,
            Self::ImageTooLarge { .. } | Self::EmptyImage | Self::InvalidLayout { .. } => 15,
            Self::VmxEntryFailure { .. }
            | Self::VmcsAccess { .. }
            | Self::RegisterAccess { .. } => 16,
            Self::UnhandledIoPort { .. } => 17,
            Self::VcpuTerminated => 18,
        }
    }

    /// Short name of the error category.
    pub fn category(&self) -> &'static str {
        match self {
            Self::PlatformUnavailable { .. } => "PlatformUnavailable",
            Self::HardwareUnsupported { .. } => "HardwareUnsupported",
            Self::ControlWriteRejected { .. } | Self::GuestStateMismatch { .. } => {
                "ControlWriteRejected"
            }
            Self::AllocationFailed { .. } => "AllocationFailed",
            Self::MappingFailed { .. } => "MappingFailed",
            Self::ImageTooLarge { .. } | Self::EmptyImage | Self::InvalidLayout { .. } => {
                "ImageTooLarge"
            }
            Self::VmxEntryFailure { .. }
            | Self::VmcsAccess { .. }
            | Self::RegisterAccess { .. } => "VmxEntryFailure",
            Self::UnhandledIoPort { .. } => "UnhandledIoPort",
            Self::VcpuTerminated => "VcpuTerminated",
        }
    }
}
