//! Memory mapping abstraction used by the image mapper.
//!
//! All address-space manipulation goes through the [`Mmap`] trait so the
//! engine itself stays independent of the syscall backend. The default
//! implementation, [`MmapImpl`], is libc-backed.

mod unix;

pub use unix::MmapImpl;

use crate::Result;
use core::ffi::c_void;
use core::ptr::NonNull;

bitflags::bitflags! {
    /// Memory protection of a mapping.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct ProtFlags: i32 {
        /// Pages may not be accessed.
        const PROT_NONE = 0;
        /// Pages may be read.
        const PROT_READ = 1;
        /// Pages may be written.
        const PROT_WRITE = 2;
        /// Pages may be executed.
        const PROT_EXEC = 4;
    }
}

bitflags::bitflags! {
    /// Mapping configuration flags.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct MapFlags: i32 {
        /// Share changes.
        const MAP_SHARED = 0x01;
        /// Changes are private to this process.
        const MAP_PRIVATE = 0x02;
        /// Interpret the address argument exactly.
        const MAP_FIXED = 0x10;
        /// The mapping is not backed by any file.
        const MAP_ANONYMOUS = 0x20;
    }
}

/// A trait for the low-level address-space operations the mapper needs.
///
/// # Safety
/// All methods manipulate the process's virtual address space. Improper use
/// can corrupt memory that other code is already using.
pub trait Mmap {
    /// Map `len` bytes of the file referenced by `fd` at page-aligned file
    /// `offset`, optionally at a fixed address.
    unsafe fn mmap_file(
        addr: Option<usize>,
        len: usize,
        prot: ProtFlags,
        flags: MapFlags,
        fd: i32,
        offset: usize,
    ) -> Result<NonNull<c_void>>;

    /// Create an anonymous mapping.
    unsafe fn mmap_anonymous(
        addr: Option<usize>,
        len: usize,
        prot: ProtFlags,
        flags: MapFlags,
    ) -> Result<NonNull<c_void>>;

    /// Remove a mapping created by either of the mapping methods.
    unsafe fn munmap(addr: NonNull<c_void>, len: usize) -> Result<()>;

    /// Change the protection of an existing mapping.
    unsafe fn mprotect(addr: NonNull<c_void>, len: usize, prot: ProtFlags) -> Result<()>;

    /// Reserve an address span without making it accessible. The reservation
    /// is later carved up with `MAP_FIXED` mappings.
    unsafe fn reserve(addr: Option<usize>, len: usize) -> Result<NonNull<c_void>> {
        unsafe {
            Self::mmap_anonymous(
                addr,
                len,
                ProtFlags::PROT_NONE,
                MapFlags::MAP_PRIVATE
                    | if addr.is_some() {
                        MapFlags::MAP_FIXED
                    } else {
                        MapFlags::empty()
                    },
            )
        }
    }
}
