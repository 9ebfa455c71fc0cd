//! The C-library compatibility layer.
//!
//! A loaded libc expects the dynamic loader to export a handful of hook
//! symbols (TLS entry points, loader globals) and keeps private copies of
//! the dl-functions which must be redirected into the engine. Redirection
//! is done by overwriting the start of each libc-internal function with a
//! direct jump; the jump must fit inside the patched symbol.

// the exported names are the libc's, not ours to rename
#![allow(non_upper_case_globals)]

use crate::api;
use crate::arch;
use crate::engine::{Rtld, RTLD};
use crate::file::ImageId;
use crate::init_fini::{self, destructor_order};
use crate::lookup::lookup_local;
use crate::segment::PAGE_SIZE;
use crate::tls;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::ffi::{c_char, c_int, c_void};

/// The structure `__tls_get_addr` receives: module index plus offset.
#[repr(C)]
pub struct TlsIndex {
    pub ti_module: usize,
    pub ti_offset: usize,
}

/// The TLS access entry point the compiler emits calls to.
///
/// The fast path is lock-free; only a stale DTV or an unmaterialized
/// block takes the engine lock.
#[cfg_attr(feature = "export-abi", unsafe(no_mangle))]
pub extern "C" fn __tls_get_addr(ti: *const TlsIndex) -> *mut c_void {
    let (module, offset) = unsafe { ((*ti).ti_module, (*ti).ti_offset) };
    let addr = tls::get_addr_fast(module, offset);
    if addr != 0 {
        return addr as *mut c_void;
    }
    let mut rtld = RTLD.lock();
    tls::get_addr_slow(&mut rtld, module, offset) as *mut c_void
}

/// The GNU i386 TLS ABI passes the tls_index pointer in %eax. This stub
/// adapts that convention onto the portable entry point.
#[cfg(target_arch = "x86")]
#[cfg_attr(feature = "export-abi", unsafe(no_mangle))]
#[unsafe(naked)]
pub extern "C" fn ___tls_get_addr() {
    core::arch::naked_asm!(
        "
    push eax
    call {0}
    add esp, 4
    ret
    ",
        sym __tls_get_addr,
    )
}

/// Reports the per-thread TLS footprint to the pthread library, which
/// sizes new thread stacks with it. Must not be called before the static
/// layout is computed.
#[cfg_attr(feature = "export-abi", unsafe(no_mangle))]
pub extern "C" fn _dl_get_tls_static_info(sizep: *mut usize, alignp: *mut usize) {
    let rtld = RTLD.lock();
    let (size, align) = tls::static_info(&rtld);
    unsafe {
        sizep.write(size);
        alignp.write(align);
    }
}

/// Called from pthread_create to fill a new thread's DTV before the
/// thread starts.
#[cfg_attr(feature = "export-abi", unsafe(no_mangle))]
pub extern "C" fn _dl_allocate_tls_init(tcb: *mut c_void) -> *mut c_void {
    if tcb.is_null() {
        return core::ptr::null_mut();
    }
    let rtld = RTLD.lock();
    tls::dtv_initialize(&rtld, tcb as usize);
    tcb
}

/// Called from pthread_create to allocate a thread's TLS area; the caller
/// may supply the memory or delegate the allocation.
#[cfg_attr(feature = "export-abi", unsafe(no_mangle))]
pub extern "C" fn _dl_allocate_tls(mem: *mut c_void) -> *mut c_void {
    let rtld = RTLD.lock();
    let tcb = if mem.is_null() {
        tls::tcb_allocate(&rtld)
    } else {
        mem as usize
    };
    tls::dtv_allocate(&rtld, tcb);
    tls::dtv_initialize(&rtld, tcb);
    tcb as *mut c_void
}

#[cfg_attr(feature = "export-abi", unsafe(no_mangle))]
pub extern "C" fn _dl_deallocate_tls(tcb: *mut c_void, dealloc_tcb: bool) {
    let rtld = RTLD.lock();
    tls::dtv_deallocate(tcb as usize);
    if dealloc_tcb {
        tls::tcb_deallocate(&rtld, tcb as usize);
    }
}

/// Executable stacks are not supported; pretend success the way the
/// reference loader does.
#[cfg_attr(feature = "export-abi", unsafe(no_mangle))]
pub extern "C" fn _dl_make_stack_executable(_stack_endp: *mut *mut c_void) -> c_int {
    0
}

#[repr(transparent)]
pub struct LibcGlobal<T>(pub UnsafeCell<T>);

// written once during startup, read by libc afterwards
unsafe impl<T> Sync for LibcGlobal<T> {}

/// Zero until just before the program entry is jumped to; libc .init code
/// reads it.
#[cfg_attr(feature = "export-abi", unsafe(no_mangle))]
pub static _dl_starting_up: LibcGlobal<c_int> = LibcGlobal(UnsafeCell::new(0));

/// End of the kernel-allocated main stack. libc and libpthread both read
/// this.
#[cfg_attr(feature = "export-abi", unsafe(no_mangle))]
pub static __libc_stack_end: LibcGlobal<usize> = LibcGlobal(UnsafeCell::new(0));

/// Non-zero would make libc enable set-uid hardening and the engine
/// ignore LD_LIBRARY_PATH. Never set here, unlike the reference libc.
#[cfg_attr(feature = "export-abi", unsafe(no_mangle))]
pub static __libc_enable_secure: LibcGlobal<c_int> = LibcGlobal(UnsafeCell::new(0));

/// The program argv, as libc imports it.
#[cfg_attr(feature = "export-abi", unsafe(no_mangle))]
pub static _dl_argv: LibcGlobal<*const *const c_char> =
    LibcGlobal(UnsafeCell::new(core::ptr::null()));

/// Size of the libc's `rtld_global` image. Only a few offsets inside are
/// ever read by the libc build this loader targets.
const RTLD_GLOBAL_SIZE: usize = 4096;
const RTLD_GLOBAL_RO_SIZE: usize = 1024;
/// Offset of `_dl_pagesize` inside `_rtld_global_ro`.
const DL_PAGESIZE_OFFSET: usize = 0x68;

#[cfg_attr(feature = "export-abi", unsafe(no_mangle))]
pub static _rtld_global: LibcGlobal<[u8; RTLD_GLOBAL_SIZE]> =
    LibcGlobal(UnsafeCell::new([0; RTLD_GLOBAL_SIZE]));

#[cfg_attr(feature = "export-abi", unsafe(no_mangle))]
pub static _rtld_global_ro: LibcGlobal<[u8; RTLD_GLOBAL_RO_SIZE]> =
    LibcGlobal(UnsafeCell::new([0; RTLD_GLOBAL_RO_SIZE]));

/// Fill the parts of the rtld globals the libc actually reads.
pub(crate) fn initialize() {
    unsafe {
        let ro = _rtld_global_ro.0.get() as *mut u8;
        let pagesize = PAGE_SIZE as c_int;
        core::ptr::copy_nonoverlapping(
            (&raw const pagesize).cast::<u8>(),
            ro.add(DL_PAGESIZE_OFFSET),
            core::mem::size_of::<c_int>(),
        );
    }
}

/// Flip `_dl_starting_up`, just before the jump to the program entry.
pub(crate) fn startup_finished() {
    unsafe {
        *_dl_starting_up.0.get() = 1;
    }
}

extern "C" fn dl_addr_hook(
    address: *const c_void,
    info: *mut api::DlInfo,
    mapp: *mut *mut crate::gdb::LinkMapNode,
    symbolp: *mut *const c_void,
) -> c_int {
    let node = {
        let rtld = RTLD.lock();
        rtld.find_by_addr(address as usize)
            .map(|id| rtld.file(id).debug_node)
    };
    let ret = api::dladdr(address, info);
    if ret != 0 {
        unsafe {
            if !mapp.is_null() {
                (*mapp) = node.unwrap_or(core::ptr::null_mut());
            }
            if !symbolp.is_null() {
                (*symbolp) = core::ptr::null();
            }
        }
    }
    ret
}

extern "C" fn libc_dlopen_mode_hook(filename: *const c_char, mode: c_int) -> *mut c_void {
    api::dlopen(filename, mode)
}

extern "C" fn libc_dlsym_hook(handle: *mut c_void, symbol: *const c_char) -> *mut c_void {
    api::dlsym(handle, symbol)
}

extern "C" fn libc_dlclose_hook(handle: *mut c_void) -> c_int {
    api::dlclose(handle)
}

/// libc calls `__libc_freeres` while tearing the process down; use that
/// moment to run every pending destructor.
extern "C" fn libc_freeres_hook() {
    shutdown();
}

/// Run destructors for everything still alive, in dependency order.
pub(crate) fn shutdown() {
    let order = {
        let rtld = RTLD.lock();
        let all: Vec<ImageId> = rtld.link_map.clone();
        destructor_order(&rtld, &all)
    };
    init_fini::run_destructors(&order);
}

const PATCHES: &[(&core::ffi::CStr, fn() -> usize)] = &[
    (c"_dl_addr", || dl_addr_hook as usize),
    (c"__libc_dlopen_mode", || libc_dlopen_mode_hook as usize),
    (c"__libc_dlsym", || libc_dlsym_hook as usize),
    (c"__libc_dlclose", || libc_dlclose_hook as usize),
    (c"__libc_freeres", || libc_freeres_hook as usize),
];

/// Redirect one file's libc-internal dl entry points into the engine.
///
/// Each hook symbol found in the file gets an absolute jump written over
/// its first bytes; a symbol smaller than the jump sequence cannot be
/// patched and is left alone, with a diagnostic.
pub(crate) fn patch_file(rtld: &mut Rtld, id: ImageId) {
    if rtld.file(id).patched {
        return;
    }
    rtld.file_mut(id).patched = true;

    for &(name, target) in PATCHES {
        let Some(sym) = lookup_local(rtld, id, name) else {
            continue;
        };
        let from = rtld.file(id).load_base + sym.st_value();
        if !arch::insert_jump_trampoline(from, target(), sym.st_size()) {
            log::warn!(
                "cannot intercept {:?} in {:?}: symbol too small for a jump",
                name,
                rtld.file(id).name
            );
        }
    }
}

/// Patch every file of a freshly loaded batch.
pub(crate) fn patch_files(rtld: &mut Rtld, files: &[ImageId]) {
    for &id in files {
        patch_file(rtld, id);
    }
}
