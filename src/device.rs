//! Port I/O devices and the bus the exit handler dispatches to.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::ops::Range;
use std::io::Write;

use spin::Mutex;

/// Width of a port access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessWidth {
    Byte,
    Word,
    Dword,
}

impl TryFrom<usize> for AccessWidth {
    type Error = usize;

    fn try_from(size: usize) -> core::result::Result<Self, usize> {
        match size {
            1 => Ok(Self::Byte),
            2 => Ok(Self::Word),
            4 => Ok(Self::Dword),
            _ => Err(size),
        }
    }
}

impl AccessWidth {
    /// Access size in bytes.
    pub const fn size(self) -> usize {
        match self {
            Self::Byte => 1,
            Self::Word => 2,
            Self::Dword => 4,
        }
    }

    /// Bits of `RAX` carrying the data.
    pub const fn bits_range(self) -> Range<usize> {
        0..self.size() * 8
    }

    /// All ones in the low `size` bytes.
    pub const fn mask(self) -> u32 {
        match self {
            Self::Byte => 0xff,
            Self::Word => 0xffff,
            Self::Dword => 0xffff_ffff,
        }
    }
}

/// A device answering a contiguous range of I/O ports.
pub trait PortIoDevice: Send {
    /// Ports this device claims, end exclusive.
    fn port_range(&self) -> Range<u16>;

    fn read(&mut self, port: u16, width: AccessWidth) -> u32;

    fn write(&mut self, port: u16, width: AccessWidth, value: u32);
}

/// The set of port I/O devices of a VM.
#[derive(Default)]
pub struct IoBus {
    devices: Mutex<Vec<Box<dyn PortIoDevice>>>,
}

impl IoBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `device`, handing it back if its ports overlap a registered one.
    pub fn register(
        &self,
        device: Box<dyn PortIoDevice>,
    ) -> core::result::Result<(), Box<dyn PortIoDevice>> {
        let range = device.port_range();
        let mut devices = self.devices.lock();
        let overlaps = devices.iter().any(|d| {
            let other = d.port_range();
            range.start < other.end && other.start < range.end
        });
        if range.is_empty() || overlaps {
            warn!("[RMV] ports {:#x?} already claimed or empty", range);
            return Err(device);
        }
        debug!("[RMV] registered port device at {:#x?}", range);
        devices.push(device);
        Ok(())
    }

    /// Forwards an `IN` to the device owning `port`. `None` if no device does.
    pub fn read(&self, port: u16, width: AccessWidth) -> Option<u32> {
        let mut devices = self.devices.lock();
        let device = devices.iter_mut().find(|d| d.port_range().contains(&port))?;
        Some(device.read(port, width) & width.mask())
    }

    /// Forwards an `OUT` to the device owning `port`. `false` if no device does.
    pub fn write(&self, port: u16, width: AccessWidth, value: u32) -> bool {
        let mut devices = self.devices.lock();
        match devices.iter_mut().find(|d| d.port_range().contains(&port)) {
            Some(device) => {
                device.write(port, width, value & width.mask());
                true
            }
            None => false,
        }
    }
}

/// Bochs/QEMU debug console port.
pub const DEBUG_CONSOLE_PORT: u16 = 0xe9;

/// Byte sink at port `0xE9`. Reads return `0xE9`, which guests use to probe
/// for the console.
pub struct DebugConsole<W: Write + Send> {
    out: W,
}

impl<W: Write + Send> DebugConsole<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write + Send> PortIoDevice for DebugConsole<W> {
    fn port_range(&self) -> Range<u16> {
        DEBUG_CONSOLE_PORT..DEBUG_CONSOLE_PORT + 1
    }

    fn read(&mut self, _port: u16, _width: AccessWidth) -> u32 {
        DEBUG_CONSOLE_PORT as u32
    }

    fn write(&mut self, _port: u16, width: AccessWidth, value: u32) {
        let bytes = value.to_le_bytes();
        if let Err(err) = self
            .out
            .write_all(&bytes[..width.size()])
            .and_then(|()| self.out.flush())
        {
            warn!("[RMV] debug console write failed: {err}");
        }
    }
}
