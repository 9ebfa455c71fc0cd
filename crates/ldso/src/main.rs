//! The program interpreter binary.
//!
//! Stage 1 runs before any global of this binary is usable: it locates
//! the load base from the aux vector (or from our own program headers),
//! applies our relative-only relocations, and brings up the allocator.
//! Stage 2 is the engine's [`elf_rtld::bootstrap`], after which control
//! jumps to the loaded program.

#![no_std]
#![no_main]
extern crate alloc;

mod arch;

use core::ffi::c_int;
use core::fmt;
use core::panic::PanicInfo;
use linked_list_allocator::LockedHeap;
use syscalls::{raw_syscall, Sysno};

/// No kernel handoff block was found on the stack.
const EXIT_NO_HANDOFF: c_int = -3;
/// Our own image carries no PT_DYNAMIC.
const EXIT_NO_DYNAMIC: c_int = -4;
/// Our own image carries no relocation table.
const EXIT_NO_RELOC_TABLE: c_int = -5;
/// Stage 2 failed; nothing can be recovered.
const EXIT_STAGE2_FAILED: c_int = -6;

const AT_NULL: usize = 0;
const AT_PHDR: usize = 3;
const AT_PHNUM: usize = 5;
const AT_BASE: usize = 7;

const DT_NULL: isize = 0;

const PT_DYNAMIC: u32 = 2;

#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

/// Engine arena. Static so it lives in .bss, which the kernel maps before
/// stage 1 runs.
const HEAP_SIZE: usize = 4 << 20;
static mut HEAP: [u8; HEAP_SIZE] = [0; HEAP_SIZE];

fn exit(status: c_int) -> ! {
    unsafe {
        let _ = raw_syscall!(Sysno::exit, status as usize);
    }
    unreachable!()
}

fn write_stderr(msg: &str) {
    unsafe {
        let _ = raw_syscall!(Sysno::write, 2, msg.as_ptr(), msg.len());
    }
}

struct Stderr;

impl fmt::Write for Stderr {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        write_stderr(s);
        Ok(())
    }
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    use fmt::Write;
    let _ = writeln!(Stderr, "ldso: panic: {}", info.message());
    exit(EXIT_STAGE2_FAILED);
}

/// A dynamic entry, spelled out locally: stage 1 must not depend on
/// anything that needs relocation.
#[repr(C)]
struct Dyn {
    d_tag: isize,
    d_un: usize,
}

#[repr(C)]
struct Aux {
    a_type: usize,
    a_val: usize,
}

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        #[repr(C)]
        struct Rel {
            r_offset: usize,
            r_info: usize,
            r_addend: isize,
        }
        const DT_RELTAB: isize = 7; // DT_RELA
        const DT_RELTABSZ: isize = 8; // DT_RELASZ
        const REL_RELATIVE: usize = 8; // R_X86_64_RELATIVE
        const REL_TYPE_MASK: usize = 0xffff_ffff;

        impl Rel {
            #[inline(always)]
            unsafe fn apply(&self, base: usize) {
                let slot = (base + self.r_offset) as *mut usize;
                unsafe { slot.write(base.wrapping_add_signed(self.r_addend)) };
            }
        }
    } else if #[cfg(target_arch = "x86")] {
        #[repr(C)]
        struct Rel {
            r_offset: usize,
            r_info: usize,
        }
        const DT_RELTAB: isize = 17; // DT_REL
        const DT_RELTABSZ: isize = 18; // DT_RELSZ
        const REL_RELATIVE: usize = 8; // R_386_RELATIVE
        const REL_TYPE_MASK: usize = 0xff;

        impl Rel {
            #[inline(always)]
            unsafe fn apply(&self, base: usize) {
                let slot = (base + self.r_offset) as *mut usize;
                unsafe { slot.write(slot.read().wrapping_add(base)) };
            }
        }
    }
}

use elf_rtld::arch::ElfPhdr;

/// Find the aux vector on the raw handoff block without touching any
/// global.
unsafe fn find_auxv(sp: *mut usize) -> *const Aux {
    unsafe {
        let argc = sp.read();
        // skip argv and its terminator
        let mut cur = sp.add(1 + argc + 1);
        // skip envp and its terminator
        while cur.read() != 0 {
            cur = cur.add(1);
        }
        cur.add(1) as *const Aux
    }
}

unsafe fn aux_get(auxv: *const Aux, tag: usize) -> Option<usize> {
    let mut cur = auxv;
    unsafe {
        loop {
            if (*cur).a_type == AT_NULL {
                return None;
            }
            if (*cur).a_type == tag {
                return Some((*cur).a_val);
            }
            cur = cur.add(1);
        }
    }
}

/// Stage 1 entry, called from the `_start` stub with the handoff block
/// and the unrelocated address of our own `_DYNAMIC`.
#[unsafe(no_mangle)]
unsafe extern "C" fn rust_main(sp: *mut usize, dynv: *mut Dyn) -> ! {
    if sp.is_null() || unsafe { sp.read() } == 0 {
        exit(EXIT_NO_HANDOFF);
    }
    if dynv.is_null() {
        exit(EXIT_NO_DYNAMIC);
    }
    let auxv = unsafe { find_auxv(sp) };

    // Our load base: handed over directly when we run as an interpreter;
    // recomputed from our own program headers when invoked as a program.
    let base = match unsafe { aux_get(auxv, AT_BASE) } {
        Some(base) if base != 0 => base,
        _ => {
            let phdr = unsafe { aux_get(auxv, AT_PHDR) }.unwrap_or(0);
            let phnum = unsafe { aux_get(auxv, AT_PHNUM) }.unwrap_or(0);
            if phdr == 0 {
                exit(EXIT_NO_HANDOFF);
            }
            let phdrs =
                unsafe { core::slice::from_raw_parts(phdr as *const ElfPhdr, phnum) };
            let Some(dyn_phdr) = phdrs.iter().find(|p| p.p_type == PT_DYNAMIC) else {
                exit(EXIT_NO_DYNAMIC);
            };
            (dynv as usize).wrapping_sub(dyn_phdr.p_vaddr as usize)
        }
    };

    // Walk our own dynamic section. Only relative relocations can exist
    // in the interpreter; apply them all, then globals work.
    let mut rel_off = None;
    let mut rel_size = None;
    let mut cur = dynv;
    unsafe {
        loop {
            match (*cur).d_tag {
                DT_NULL => break,
                tag if tag == DT_RELTAB => rel_off = Some((*cur).d_un),
                tag if tag == DT_RELTABSZ => rel_size = Some((*cur).d_un),
                _ => {}
            }
            cur = cur.add(1);
        }
    }
    let (Some(rel_off), Some(rel_size)) = (rel_off, rel_size) else {
        exit(EXIT_NO_RELOC_TABLE);
    };
    let rels = unsafe {
        core::slice::from_raw_parts(
            (base + rel_off) as *const Rel,
            rel_size / core::mem::size_of::<Rel>(),
        )
    };
    for rel in rels {
        if rel.r_info & REL_TYPE_MASK != REL_RELATIVE {
            // nothing else is resolvable this early
            continue;
        }
        unsafe { rel.apply(base) };
    }

    // Self-relocation done; globals and the allocator are fair game now.
    unsafe {
        ALLOCATOR
            .lock()
            .init(&raw mut HEAP as *mut u8, HEAP_SIZE);
    }

    match unsafe { elf_rtld::bootstrap::stage2(sp, base) } {
        Ok(startup) => unsafe { arch::jump_to_entry(startup.entry, startup.sp) },
        Err(err) => {
            use fmt::Write;
            let _ = writeln!(Stderr, "ldso: {}", err);
            exit(EXIT_STAGE2_FAILED);
        }
    }
}
