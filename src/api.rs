//! The runtime load/unload API: open, close, sym, vsym, addr, error and
//! phdr iteration, plus the libc-compatible `dl*` entry points.
//!
//! Every operation takes the engine lock; constructors and destructors run
//! outside it because user code may re-enter the API from them.

use crate::deps;
use crate::engine::{Rtld, RTLD};
use crate::error::{find_symbol_error, not_found_error, static_tls_error};
use crate::file::{ContextId, ImageId, LookupPolicy};
use crate::gc;
use crate::gdb;
use crate::hash::Hashes;
use crate::init_fini::{self, constructor_order, deps_breadth_first, destructor_order};
use crate::lookup::{lookup_in_scope, LookupFlags};
use crate::map;
use crate::mmap::MmapImpl;
use crate::os;
use crate::reloc;
use crate::tls;
use crate::version::VersionRef;
use crate::Result;
use alloc::ffi::CString;
use alloc::format;
use alloc::vec::Vec;
use core::ffi::{c_char, c_int, c_void, CStr};

pub const RTLD_LAZY: c_int = 1;
pub const RTLD_NOW: c_int = 2;
pub const RTLD_DEEPBIND: c_int = 8;
pub const RTLD_GLOBAL: c_int = 0x100;
pub const RTLD_LOCAL: c_int = 0;

bitflags::bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct OpenFlags: u32 {
        const LAZY = RTLD_LAZY as u32;
        const NOW = RTLD_NOW as u32;
        const DEEPBIND = RTLD_DEEPBIND as u32;
        const GLOBAL = RTLD_GLOBAL as u32;
    }
}

/// Open a shared object at runtime and return its handle.
///
/// `None` asks for the main executable, the way `dlopen(NULL)` does.
pub fn dl_open(filename: Option<&CStr>, flags: OpenFlags) -> Result<ImageId> {
    let (root, ctor_order) = {
        let mut rtld = RTLD.lock();
        match open_locked(&mut rtld, filename, flags) {
            Ok(done) => done,
            Err(err) => {
                let msg = CString::new(format!("{err}")).unwrap_or_default();
                rtld.set_error(msg);
                return Err(err);
            }
        }
    };
    // user constructors run unlocked
    init_fini::run_constructors(&ctor_order);
    Ok(root)
}

fn open_locked(
    rtld: &mut Rtld,
    filename: Option<&CStr>,
    flags: OpenFlags,
) -> Result<(ImageId, Vec<ImageId>)> {
    let exec = rtld
        .executable()
        .ok_or(not_found_error("no main executable on the link map"))?;
    let context = rtld.file(exec).context;

    let Some(name) = filename else {
        rtld.file_mut(exec).refcount += 1;
        return Ok((exec, Vec::new()));
    };

    gdb::set_state(gdb::RT_ADD);
    let mut newly: Vec<ImageId> = Vec::new();
    match open_inner(rtld, context, name, flags, &mut newly) {
        Ok(root) => {
            rtld.file_mut(root).refcount += 1;
            gdb::notify(rtld);
            let order = constructor_order(rtld, &newly);
            Ok((root, order))
        }
        Err(err) => {
            // tear the freshly mapped subtree down, deepest first
            for &id in newly.iter().rev() {
                tls::file_deinitialize(rtld, id);
                gc::detach(rtld, id);
                let node = rtld.file(id).debug_node;
                map::unmap_single::<MmapImpl>(rtld.file(id));
                gdb::drop_node(node);
                rtld.remove_file(id);
            }
            gdb::notify(rtld);
            Err(err)
        }
    }
}

fn open_inner(
    rtld: &mut Rtld,
    context: ContextId,
    name: &CStr,
    flags: OpenFlags,
    newly: &mut Vec<ImageId>,
) -> Result<ImageId> {
    log::debug!("dlopen {:?} flags {:?}", name, flags);

    let root = if let Some(existing) = rtld.find_by_name(context, name) {
        existing
    } else {
        let path = deps::search_file(rtld, name, None, &[])
            .ok_or_else(|| not_found_error(format!("{:?}: cannot open shared object", name)))?;
        let reused = os::stat_dev_ino(&path)
            .and_then(|(dev, ino)| rtld.find_by_dev_ino(context, dev, ino));
        match reused {
            Some(existing) => existing,
            None => {
                let id = map::map_single::<MmapImpl>(rtld, context, &path, name)?;
                newly.push(id);
                id
            }
        }
    };

    deps::resolve_deps::<MmapImpl>(rtld, root, newly)?;

    // every newly mapped file gets its breadth-first closure as local
    // scope and the policy the open asked for
    let policy = if flags.contains(OpenFlags::DEEPBIND) {
        LookupPolicy::LocalThenGlobal
    } else {
        LookupPolicy::GlobalThenLocal
    };
    for &id in newly.iter() {
        let scope = deps_breadth_first(rtld, id);
        let file = rtld.file_mut(id);
        file.local_scope = scope;
        file.lookup_policy = policy;
    }

    if flags.contains(OpenFlags::GLOBAL) {
        let closure = deps_breadth_first(rtld, root);
        let ns = rtld.context_mut(context);
        for id in closure {
            if !ns.global_scope.contains(&id) {
                ns.global_scope.push(id);
            }
        }
    }

    tls::files_initialize(rtld, newly);
    // the static area is sealed once the program runs
    if rtld.startup_done && tls::any_static_tls(rtld, newly) {
        return Err(static_tls_error(format!(
            "{:?} needs a static tls block",
            name
        )));
    }

    reloc::relocate_files(rtld, newly, flags.contains(OpenFlags::NOW))?;
    Ok(root)
}

/// Drop one reference to a handle and unload whatever became unreachable.
pub fn dl_close(handle: ImageId) -> Result<()> {
    let (unreachable, dtor_order) = {
        let mut rtld = RTLD.lock();
        let Some(file) = rtld.try_file(handle) else {
            rtld.set_error(c"invalid handle".into());
            return Err(not_found_error("invalid handle"));
        };
        if file.refcount == 0 {
            rtld.set_error(c"handle is not open".into());
            return Err(not_found_error("handle is not open"));
        }
        gdb::set_state(gdb::RT_DELETE);
        rtld.file_mut(handle).refcount -= 1;
        let unreachable = gc::collect_unreachable(&mut rtld);
        let order = destructor_order(&rtld, &unreachable);
        (unreachable, order)
    };

    // destructors run unlocked; the files are already off every scope
    init_fini::run_destructors(&dtor_order);

    let mut rtld = RTLD.lock();
    tls::files_deinitialize(&mut rtld, &unreachable);
    for &id in &unreachable {
        let node = rtld.file(id).debug_node;
        map::unmap_single::<MmapImpl>(rtld.file(id));
        gdb::drop_node(node);
        let context = rtld.file(id).context;
        rtld.remove_file(id);
        rtld.delete_context_if_empty(context);
    }
    gdb::notify(&mut rtld);
    Ok(())
}

/// Resolve `name` in the handle's local scope.
pub fn dl_sym(handle: ImageId, name: &CStr) -> Option<usize> {
    let mut rtld = RTLD.lock();
    sym_locked(&mut rtld, handle, name, None)
}

/// Resolve `name` with an explicit version requirement.
pub fn dl_vsym(handle: ImageId, name: &CStr, version: &CStr) -> Option<usize> {
    let mut rtld = RTLD.lock();
    let ver = VersionRef::new(version, None);
    sym_locked(&mut rtld, handle, name, Some(&ver))
}

fn sym_locked(
    rtld: &mut Rtld,
    handle: ImageId,
    name: &CStr,
    ver: Option<&VersionRef<'_>>,
) -> Option<usize> {
    let Some(file) = rtld.try_file(handle) else {
        rtld.set_error(c"invalid handle".into());
        return None;
    };
    let scope = file.local_scope.clone();
    let hashes = Hashes::of(name.to_bytes());
    match lookup_in_scope(rtld, None, name, ver, &hashes, LookupFlags::empty(), &scope) {
        Ok(Some(found)) => Some(found.address(rtld)),
        Ok(None) => {
            let err = find_symbol_error(format!("undefined symbol: {:?}", name));
            rtld.set_error(CString::new(format!("{err}")).unwrap_or_default());
            None
        }
        Err(err) => {
            rtld.set_error(CString::new(format!("{err}")).unwrap_or_default());
            None
        }
    }
}

/// What `dl_addr` reports about an address.
pub struct AddrInfo {
    pub file_name: *const c_char,
    pub file_base: usize,
    pub sym_name: *const c_char,
    pub sym_addr: usize,
}

/// Identify the file (and nearest preceding defined symbol) covering an
/// address.
pub fn dl_addr(addr: usize) -> Option<AddrInfo> {
    let rtld = RTLD.lock();
    let id = rtld.find_by_addr(addr)?;
    let file = rtld.file(id);
    let mut info = AddrInfo {
        file_name: file.path.as_ptr(),
        file_base: file.load_base,
        sym_name: core::ptr::null(),
        sym_addr: 0,
    };
    // nearest defined symbol at or below the address
    let count = file.symbols.count_syms();
    let mut best = 0usize;
    for idx in 1..count {
        let sym = file.symbols.symbol(idx);
        if sym.is_undef() || sym.st_value() == 0 {
            continue;
        }
        let val = file.load_base + sym.st_value();
        if val <= addr && val > best {
            best = val;
            info.sym_name = file.symbols.symbol_name(idx).as_ptr();
            info.sym_addr = val;
        }
    }
    Some(info)
}

/// One entry reported by [`dl_iterate_phdr`].
#[repr(C)]
pub struct DlPhdrInfo {
    pub dlpi_addr: usize,
    pub dlpi_name: *const c_char,
    pub dlpi_phdr: *const crate::arch::ElfPhdr,
    pub dlpi_phnum: u16,
    /// Incremented on every load; callers cache against these two.
    pub dlpi_adds: u64,
    /// Incremented on every unload.
    pub dlpi_subs: u64,
}

/// Enumerate the link map, with the libc `dl_iterate_phdr` ABI. The
/// callback runs without the engine lock, on a snapshot taken under it.
#[cfg_attr(feature = "export-abi", unsafe(no_mangle))]
pub extern "C" fn dl_iterate_phdr(
    callback: extern "C" fn(*mut DlPhdrInfo, usize, *mut c_void) -> c_int,
    data: *mut c_void,
) -> c_int {
    let entries: Vec<DlPhdrInfo> = {
        let rtld = RTLD.lock();
        rtld.link_map
            .iter()
            .map(|id| {
                let file = rtld.file(*id);
                DlPhdrInfo {
                    dlpi_addr: file.load_base,
                    dlpi_name: file.path.as_ptr(),
                    dlpi_phdr: file.phdrs.as_ptr(),
                    dlpi_phnum: file.phdrs.len() as u16,
                    dlpi_adds: rtld.n_added,
                    dlpi_subs: rtld.n_removed,
                }
            })
            .collect()
    };
    for mut entry in entries {
        let ret = callback(&mut entry, core::mem::size_of::<DlPhdrInfo>(), data);
        if ret != 0 {
            return ret;
        }
    }
    0
}

/// Return-and-clear the calling thread's last error string.
pub fn dl_error() -> Option<*const c_char> {
    let mut rtld = RTLD.lock();
    rtld.consume_error()
}

fn handle_to_id(handle: *mut c_void) -> ImageId {
    ImageId(handle as usize as u32)
}

fn id_to_handle(id: ImageId) -> *mut c_void {
    id.0 as usize as *mut c_void
}

/// `dlopen` with the libc ABI.
#[cfg_attr(feature = "export-abi", unsafe(no_mangle))]
pub extern "C" fn dlopen(filename: *const c_char, flags: c_int) -> *mut c_void {
    let name = if filename.is_null() {
        None
    } else {
        Some(unsafe { CStr::from_ptr(filename) })
    };
    let flags = OpenFlags::from_bits_truncate(flags as u32);
    match dl_open(name, flags) {
        Ok(id) => id_to_handle(id),
        Err(_) => core::ptr::null_mut(),
    }
}

/// `dlclose` with the libc ABI.
#[cfg_attr(feature = "export-abi", unsafe(no_mangle))]
pub extern "C" fn dlclose(handle: *mut c_void) -> c_int {
    match dl_close(handle_to_id(handle)) {
        Ok(()) => 0,
        Err(_) => -1,
    }
}

/// `dlsym` with the libc ABI.
#[cfg_attr(feature = "export-abi", unsafe(no_mangle))]
pub extern "C" fn dlsym(handle: *mut c_void, symbol: *const c_char) -> *mut c_void {
    if symbol.is_null() {
        return core::ptr::null_mut();
    }
    let name = unsafe { CStr::from_ptr(symbol) };
    dl_sym(handle_to_id(handle), name)
        .map(|addr| addr as *mut c_void)
        .unwrap_or(core::ptr::null_mut())
}

/// `dlvsym` with the libc ABI.
#[cfg_attr(feature = "export-abi", unsafe(no_mangle))]
pub extern "C" fn dlvsym(
    handle: *mut c_void,
    symbol: *const c_char,
    version: *const c_char,
) -> *mut c_void {
    if symbol.is_null() || version.is_null() {
        return core::ptr::null_mut();
    }
    let name = unsafe { CStr::from_ptr(symbol) };
    let version = unsafe { CStr::from_ptr(version) };
    dl_vsym(handle_to_id(handle), name, version)
        .map(|addr| addr as *mut c_void)
        .unwrap_or(core::ptr::null_mut())
}

/// `dlerror` with the libc ABI.
#[cfg_attr(feature = "export-abi", unsafe(no_mangle))]
pub extern "C" fn dlerror() -> *mut c_char {
    dl_error()
        .map(|ptr| ptr as *mut c_char)
        .unwrap_or(core::ptr::null_mut())
}

/// The libc `Dl_info` layout.
#[repr(C)]
pub struct DlInfo {
    pub dli_fname: *const c_char,
    pub dli_fbase: *mut c_void,
    pub dli_sname: *const c_char,
    pub dli_saddr: *mut c_void,
}

/// `dladdr` with the libc ABI.
#[cfg_attr(feature = "export-abi", unsafe(no_mangle))]
pub extern "C" fn dladdr(addr: *const c_void, info: *mut DlInfo) -> c_int {
    let Some(found) = dl_addr(addr as usize) else {
        return 0;
    };
    unsafe {
        (*info).dli_fname = found.file_name;
        (*info).dli_fbase = found.file_base as *mut c_void;
        (*info).dli_sname = found.sym_name;
        (*info).dli_saddr = found.sym_addr as *mut c_void;
    }
    1
}

