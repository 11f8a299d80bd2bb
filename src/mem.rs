use alloc::alloc::{Layout, alloc_zeroed, dealloc};
use alloc::sync::Arc;
use core::ptr::NonNull;

use memory_addr::{PAGE_SIZE_4K as PAGE_SIZE, def_usize_addr, def_usize_addr_formatter};

use crate::hal::{HvPlatform, MemoryFlags};
use crate::vm::VmShared;
use crate::{Result, VmmError};

/// Bytes addressable through one real-mode segment.
pub const REAL_MODE_SEGMENT_SIZE: usize = 0x1_0000;

def_usize_addr! {
    /// Guest physical address.
    pub type GuestPhysAddr;
}

def_usize_addr_formatter! {
    GuestPhysAddr = "GPA:{}";
}

/// Placement of the guest inside its single real-mode segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuestLayout {
    /// Size of the backing buffer mapped at guest-physical 0.
    pub segment_size: usize,
    /// Offset the image is copied to, also the entry point.
    pub load_offset: usize,
    /// Initial `RSP`.
    pub stack_top: usize,
}

impl Default for GuestLayout {
    fn default() -> Self {
        Self {
            segment_size: REAL_MODE_SEGMENT_SIZE,
            load_offset: 0x100,
            stack_top: 0xfffe,
        }
    }
}

impl GuestLayout {
    /// Guest-physical address of the first instruction.
    pub fn entry(&self) -> GuestPhysAddr {
        GuestPhysAddr::from_usize(self.load_offset)
    }

    /// Checks the layout and `image` against it. Runs before any platform call.
    pub(crate) fn check(&self, image: &[u8]) -> Result {
        if image.is_empty() {
            return Err(VmmError::EmptyImage);
        }
        if self.segment_size == 0 || self.segment_size % PAGE_SIZE != 0 {
            return Err(VmmError::AllocationFailed {
                size: self.segment_size,
                detail: "segment size must be a non-zero multiple of the page size",
            });
        }
        if self.segment_size > REAL_MODE_SEGMENT_SIZE {
            return Err(VmmError::InvalidLayout {
                field: "segment_size",
                value: self.segment_size,
                detail: "larger than one real-mode segment",
            });
        }
        let fits = self
            .load_offset
            .checked_add(image.len())
            .is_some_and(|end| end <= self.segment_size);
        if !fits {
            return Err(VmmError::ImageTooLarge {
                len: image.len(),
                offset: self.load_offset,
                capacity: self.segment_size,
            });
        }
        if self.stack_top > self.segment_size {
            return Err(VmmError::InvalidLayout {
                field: "stack_top",
                value: self.stack_top,
                detail: "outside the mapped segment",
            });
        }
        Ok(())
    }
}

/// One guest-physical range backed by a page-aligned host buffer.
///
/// The range is unmapped from the guest before the buffer is freed.
pub struct GuestAddressSpace<P: HvPlatform> {
    vm: Arc<VmShared<P>>,
    host: NonNull<u8>,
    layout: Layout,
    gpa: GuestPhysAddr,
}

impl<P: HvPlatform> GuestAddressSpace<P> {
    pub(crate) fn load(vm: Arc<VmShared<P>>, image: &[u8], guest: &GuestLayout) -> Result<Self> {
        guest.check(image)?;

        let size = guest.segment_size;
        let layout =
            Layout::from_size_align(size, PAGE_SIZE).map_err(|_| VmmError::AllocationFailed {
                size,
                detail: "invalid buffer layout",
            })?;
        // SAFETY: `layout` has a non-zero size.
        let host = NonNull::new(unsafe { alloc_zeroed(layout) }).ok_or(
            VmmError::AllocationFailed {
                size,
                detail: "host allocator returned null",
            },
        )?;

        let gpa = GuestPhysAddr::from_usize(0);
        let flags = MemoryFlags::READ | MemoryFlags::WRITE | MemoryFlags::EXEC;
        // SAFETY: `host` points to `size` bytes that are freed only after the
        // range is unmapped in `drop`.
        let mapped = unsafe {
            vm.platform
                .vm_map(host.as_ptr(), gpa.as_usize() as u64, size, flags)
        };
        if let Err(source) = mapped {
            // SAFETY: allocated above with `layout` and never mapped.
            unsafe { dealloc(host.as_ptr(), layout) };
            return Err(VmmError::MappingFailed {
                gpa: gpa.as_usize(),
                size,
                source,
            });
        }

        let mut space = Self {
            vm,
            host,
            layout,
            gpa,
        };
        space.as_mut_slice()[guest.load_offset..guest.load_offset + image.len()]
            .copy_from_slice(image);
        info!(
            "[RMV] loaded {:#x} bytes at {:?} ({:#x}-byte segment)",
            image.len(),
            guest.entry(),
            size
        );
        Ok(space)
    }

    /// Guest-physical base of the range.
    pub fn gpa(&self) -> GuestPhysAddr {
        self.gpa
    }

    pub fn size(&self) -> usize {
        self.layout.size()
    }

    /// Guest memory as seen from the host.
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: `host` is valid for `size` bytes while `self` lives.
        unsafe { core::slice::from_raw_parts(self.host.as_ptr(), self.size()) }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as in `as_slice`, and `&mut self` makes the borrow unique.
        unsafe { core::slice::from_raw_parts_mut(self.host.as_ptr(), self.size()) }
    }

    /// Reads `len` bytes at `gpa`, or `None` if the range is not mapped here.
    pub fn read(&self, gpa: GuestPhysAddr, len: usize) -> Option<&[u8]> {
        let start = gpa.as_usize().checked_sub(self.gpa.as_usize())?;
        self.as_slice().get(start..start.checked_add(len)?)
    }
}

impl<P: HvPlatform> core::fmt::Debug for GuestAddressSpace<P> {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("GuestAddressSpace")
            .field("host", &self.host)
            .field("size", &self.layout.size())
            .field("gpa", &self.gpa)
            .finish()
    }
}

impl<P: HvPlatform> Drop for GuestAddressSpace<P> {
    fn drop(&mut self) {
        let size = self.size();
        match self.vm.platform.vm_unmap(self.gpa.as_usize() as u64, size) {
            Ok(()) => {
                debug!("[RMV] unmapped {:?} ({:#x} bytes)", self.gpa, size);
                // SAFETY: the guest no longer sees the buffer.
                unsafe { dealloc(self.host.as_ptr(), self.layout) };
            }
            // The guest may still reach the buffer, leak it rather than free it.
            Err(err) => error!("[RMV] failed to unmap {:?}: {err}", self.gpa),
        }
    }
}
