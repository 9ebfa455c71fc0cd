//! The ELF image mapper.
//!
//! Maps one file into the address space: one read-only and one read-write
//! PT_LOAD, a PT_DYNAMIC inside the latter, zero-fill of the bss tail and
//! anonymous pages beyond it. The address span is reserved in a single
//! PROT_NONE mapping first so the two segments land contiguously, then the
//! pieces are remapped over it with MAP_FIXED.

use crate::arch::{self, ElfDyn, ElfEhdr, ElfPhdr, EHDR_SIZE, PHDR_SIZE};
use crate::dynamic::ElfDynamic;
use crate::engine::Rtld;
use crate::error::{malformed_error, map_error, unsupported_error};
use crate::file::{ContextId, ElfImage, Event, GcColor, ImageId, LookupPolicy};
use crate::mmap::{MapFlags, Mmap, ProtFlags};
use crate::os::RawFile;
use crate::segment::FileMap;
use crate::symbol::SymbolTable;
use crate::Result;
use alloc::borrow::ToOwned;
use alloc::vec;
use alloc::vec::Vec;
use core::ffi::{c_void, CStr};
use core::ptr::NonNull;
use elf::abi::{ET_DYN, ET_EXEC, PF_W, PT_DYNAMIC, PT_LOAD};

/// Unmaps the reserved span unless the mapping completed.
struct Reservation<M: Mmap> {
    addr: NonNull<c_void>,
    len: usize,
    armed: bool,
    _marker: core::marker::PhantomData<M>,
}

impl<M: Mmap> Drop for Reservation<M> {
    fn drop(&mut self) {
        if self.armed {
            unsafe {
                let _ = M::munmap(self.addr, self.len);
            }
        }
    }
}

fn validate_ehdr(buf: &[u8]) -> Result<ElfEhdr> {
    let ehdr = unsafe { (buf.as_ptr() as *const ElfEhdr).read_unaligned() };
    if ehdr.e_ident[..4] != [0x7f, b'E', b'L', b'F'] {
        return Err(malformed_error("bad elf magic"));
    }
    if ehdr.e_ident[arch::EI_CLASS_IDX] != arch::E_CLASS {
        return Err(unsupported_error("elf class mismatch"));
    }
    if ehdr.e_machine != arch::EM_ARCH {
        return Err(unsupported_error("elf machine mismatch"));
    }
    if ehdr.e_ehsize as usize != EHDR_SIZE {
        return Err(malformed_error("unexpected elf header size"));
    }
    if ehdr.e_type != ET_EXEC && ehdr.e_type != ET_DYN {
        return Err(unsupported_error("not an executable or shared object"));
    }
    if ehdr.e_phentsize as usize != PHDR_SIZE {
        return Err(malformed_error("unexpected program header size"));
    }
    Ok(ehdr)
}

/// The two loadable segments plus the dynamic header of a conforming
/// image.
struct LoadLayout<'p> {
    ro: &'p ElfPhdr,
    rw: &'p ElfPhdr,
    dynamic: &'p ElfPhdr,
}

/// Enforce the segment shape the engine relies on: exactly one read-only
/// and one writable PT_LOAD, program headers inside the former, PT_DYNAMIC
/// inside the latter.
fn classify_phdrs(phdrs: &[ElfPhdr]) -> Result<LoadLayout<'_>> {
    let mut ro = None;
    let mut rw = None;
    let mut dynamic = None;
    for phdr in phdrs {
        match phdr.p_type {
            PT_LOAD => {
                let slot = if phdr.p_flags & PF_W != 0 { &mut rw } else { &mut ro };
                if slot.is_some() {
                    return Err(unsupported_error("more than two PT_LOAD segments"));
                }
                *slot = Some(phdr);
            }
            PT_DYNAMIC => dynamic = Some(phdr),
            _ => {}
        }
    }
    let ro = ro.ok_or(malformed_error("no read-only PT_LOAD"))?;
    let rw = rw.ok_or(malformed_error("no read-write PT_LOAD"))?;
    let dynamic = dynamic.ok_or(malformed_error("no PT_DYNAMIC"))?;

    if ro.p_offset != 0 {
        return Err(malformed_error("read-only load does not start at offset zero"));
    }
    if (ro.p_filesz as usize) < EHDR_SIZE {
        return Err(malformed_error("read-only load too small for the elf header"));
    }
    if ro.p_align != rw.p_align {
        return Err(malformed_error("load segments disagree on alignment"));
    }
    if dynamic.p_offset < rw.p_offset
        || dynamic.p_offset + dynamic.p_filesz > rw.p_offset + rw.p_filesz
    {
        return Err(malformed_error("PT_DYNAMIC not inside the read-write load"));
    }
    Ok(LoadLayout { ro, rw, dynamic })
}

/// Map `path` into memory and register it on the link map of `context`.
///
/// The new file starts with a zero reference count; whatever caused the
/// load pins it afterwards.
pub(crate) fn map_single<M: Mmap>(
    rtld: &mut Rtld,
    context: ContextId,
    path: &CStr,
    name: &CStr,
) -> Result<ImageId> {
    log::debug!("mapping {:?} as {:?}", path, name);
    let file = RawFile::open(path)?;

    let mut ehdr_buf = [0u8; EHDR_SIZE];
    file.read_at(&mut ehdr_buf, 0)?;
    let ehdr = validate_ehdr(&ehdr_buf)?;

    let mut phdr_buf: Vec<u8> = vec![0; ehdr.e_phnum as usize * PHDR_SIZE];
    file.read_at(&mut phdr_buf, ehdr.e_phoff as usize)?;
    let phdrs: &[ElfPhdr] = unsafe {
        core::slice::from_raw_parts(phdr_buf.as_ptr().cast(), ehdr.e_phnum as usize)
    };

    let layout = classify_phdrs(phdrs)?;
    let ro = FileMap::from_phdr(layout.ro);
    let rw = FileMap::from_phdr(layout.rw);
    if ro.mem_end() != rw.mem_start {
        return Err(malformed_error("load segments are not contiguous"));
    }

    // Reserve the whole span in one go; everything below lands inside it
    // with MAP_FIXED. ET_EXEC images must get their linked address.
    let span = rw.mem_end() - ro.mem_start;
    let fixed = ehdr.e_type == ET_EXEC;
    let want = fixed.then_some(ro.mem_start);
    let reserved = unsafe { M::reserve(want, span) }?;
    let mut reservation = Reservation::<M> {
        addr: reserved,
        len: span,
        armed: true,
        _marker: core::marker::PhantomData,
    };
    if fixed && reserved.as_ptr() as usize != ro.mem_start {
        return Err(map_error("cannot map executable at its linked address"));
    }
    let load_base = reserved.as_ptr() as usize - ro.mem_start;

    let fixed_flags = MapFlags::MAP_PRIVATE | MapFlags::MAP_FIXED;
    let ro_prot = ProtFlags::PROT_READ | ProtFlags::PROT_EXEC;
    let rw_prot = ProtFlags::PROT_READ | ProtFlags::PROT_WRITE;
    unsafe {
        M::mmap_file(
            Some(load_base + ro.mem_start),
            ro.file_size,
            ro_prot,
            fixed_flags,
            file.fd(),
            ro.file_start,
        )?;
        if ro.mem_zero_size > 0 {
            // zero-fill inside a read-only page: open it up briefly
            let page = NonNull::new_unchecked((load_base + ro.mem_start) as *mut c_void);
            M::mprotect(page, ro.file_size, rw_prot)?;
            core::ptr::write_bytes(
                (load_base + ro.mem_zero_start) as *mut u8,
                0,
                ro.mem_zero_size,
            );
            M::mprotect(page, ro.file_size, ro_prot)?;
        }
        if rw.file_size > 0 {
            M::mmap_file(
                Some(load_base + rw.mem_start),
                rw.file_size,
                rw_prot,
                fixed_flags,
                file.fd(),
                rw.file_start,
            )?;
        }
        if rw.mem_zero_size > 0 {
            core::ptr::write_bytes(
                (load_base + rw.mem_zero_start) as *mut u8,
                0,
                rw.mem_zero_size,
            );
        }
        if rw.mem_anon_size > 0 {
            M::mmap_anonymous(
                Some(load_base + rw.mem_anon_start),
                rw.mem_anon_size,
                rw_prot,
                fixed_flags,
            )?;
        }
    }

    let (dev, ino) = file.dev_ino()?;

    let dyn_ptr = (load_base + layout.dynamic.p_vaddr as usize) as *const ElfDyn;
    let dynamic = ElfDynamic::parse(dyn_ptr, load_base)?;
    let symbols = SymbolTable::from_dynamic(&dynamic);

    // The program headers are in the read-only load because its file range
    // starts at offset zero.
    let phdrs_mapped: &'static [ElfPhdr] = unsafe {
        core::slice::from_raw_parts(
            (load_base + layout.ro.p_vaddr as usize + ehdr.e_phoff as usize) as *const ElfPhdr,
            ehdr.e_phnum as usize,
        )
    };

    let image = ElfImage {
        load_base,
        path: path.to_owned(),
        name: name.to_owned(),
        dev,
        ino,
        dyn_ptr,
        dynamic,
        symbols,
        phdrs: phdrs_mapped,
        entry: ehdr.e_entry as usize,
        ro,
        rw,
        refcount: 0,
        deps_resolved: false,
        tls_initialized: false,
        init_called: false,
        fini_called: false,
        relocated: false,
        patched: false,
        is_executable: false,
        lookup_policy: LookupPolicy::GlobalThenLocal,
        gc_color: GcColor::White,
        deps: Vec::new(),
        local_scope: Vec::new(),
        symbols_resolved_in: Vec::new(),
        depth: 0,
        tls: None,
        context,
        debug_node: core::ptr::null_mut(),
    };

    // past this point the image owns its mapping
    reservation.armed = false;
    let id = rtld.insert_file(image);
    rtld.notify(id, Event::Mapped);
    log::debug!(
        "mapped {:?} at base 0x{:x}",
        name,
        rtld.file(id).load_base
    );
    Ok(id)
}

/// Tear one file's mapping down. Called by the collector after destructors
/// have run and the file has left every scope.
pub(crate) fn unmap_single<M: Mmap>(file: &ElfImage) {
    let start = file.load_base + file.ro.mem_start;
    let len = file.rw.mem_end() - file.ro.mem_start;
    unsafe {
        if let Some(ptr) = NonNull::new(start as *mut c_void) {
            let _ = M::munmap(ptr, len);
        }
    }
}
