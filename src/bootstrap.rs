//! Stage 2 of startup: everything after the interpreter has relocated
//! itself.
//!
//! Parses the kernel handoff block, decides between interpreter mode (the
//! kernel mapped both the program and the loader) and program mode (the
//! loader was invoked directly with the program as argv[1]), builds the
//! main namespace, loads the dependency closure, lays out static TLS,
//! relocates, installs the main thread's TCB, wires up the debugger and
//! the libc hooks, runs constructors and hands back the program entry
//! point.

use crate::arch::{self, ElfDyn, ElfEhdr, ElfPhdr};
use crate::context::{LibRemap, Namespace};
use crate::deps;
use crate::dynamic::ElfDynamic;
use crate::engine::{Rtld, RTLD};
use crate::error::malformed_error;
use crate::file::{ContextId, ElfImage, Event, GcColor, ImageId, LookupPolicy};
use crate::gdb;
use crate::glibc;
use crate::init_fini::{self, constructor_order, deps_breadth_first};
use crate::ldlog;
use crate::map;
use crate::mmap::MmapImpl;
use crate::os;
use crate::reloc;
use crate::segment::FileMap;
use crate::symbol::SymbolTable;
use crate::tls;
use crate::Result;
use alloc::borrow::ToOwned;
use alloc::vec::Vec;
use core::ffi::{c_char, CStr};
use elf::abi::{PF_W, PT_DYNAMIC, PT_LOAD, PT_PHDR};

pub const AT_NULL: usize = 0;
pub const AT_PHDR: usize = 3;
pub const AT_PHENT: usize = 4;
pub const AT_PHNUM: usize = 5;
pub const AT_BASE: usize = 7;
pub const AT_ENTRY: usize = 9;
pub const AT_EXECFN: usize = 31;
#[cfg(target_arch = "x86")]
pub const AT_SYSINFO: usize = 32;

/// One aux vector entry.
#[repr(C)]
pub struct AuxEntry {
    pub a_type: usize,
    pub a_val: usize,
}

/// The kernel handoff block, as found on the initial stack.
pub struct KernelHandoff {
    pub sp: *mut usize,
    pub argc: usize,
    pub argv: *mut *const c_char,
    pub envp: *const *const c_char,
    pub auxv: *mut AuxEntry,
}

impl KernelHandoff {
    /// Walk the initial stack: `argc :: argv... :: NULL :: envp... ::
    /// NULL :: auxv`.
    pub unsafe fn parse(sp: *mut usize) -> Option<KernelHandoff> {
        if sp.is_null() {
            return None;
        }
        unsafe {
            let argc = sp.read();
            let argv = sp.add(1) as *mut *const c_char;
            let envp = sp.add(argc + 2) as *const *const c_char;
            let mut cur = envp;
            while !(*cur).is_null() {
                cur = cur.add(1);
            }
            let auxv = cur.add(1) as *mut AuxEntry;
            Some(KernelHandoff {
                sp,
                argc,
                argv,
                envp,
                auxv,
            })
        }
    }

    pub fn aux(&self, tag: usize) -> Option<usize> {
        let mut cur = self.auxv;
        unsafe {
            loop {
                let entry = &*cur;
                if entry.a_type == AT_NULL {
                    return None;
                }
                if entry.a_type == tag {
                    return Some(entry.a_val);
                }
                cur = cur.add(1);
            }
        }
    }

    fn aux_set(&self, tag: usize, val: usize) {
        let mut cur = self.auxv;
        unsafe {
            loop {
                let entry = &mut *cur;
                if entry.a_type == AT_NULL {
                    return;
                }
                if entry.a_type == tag {
                    entry.a_val = val;
                    return;
                }
                cur = cur.add(1);
            }
        }
    }

    pub unsafe fn env(&self, name: &str) -> Option<&'static CStr> {
        unsafe { os::env_get(self.envp, name) }
    }

    /// Drop `argv[0]` from the block, in place: everything from `argv[1]`
    /// to the end of the aux vector moves down one slot and argc shrinks.
    /// Used in program mode so the loaded program sees its own name first.
    unsafe fn trim_argv(&mut self) {
        unsafe {
            let mut end = self.auxv;
            while (*end).a_type != AT_NULL {
                end = end.add(1);
            }
            let end = end.add(1) as *mut usize;
            let src = self.sp.add(1);
            let count = end.offset_from(src) as usize;
            core::ptr::copy(src, self.sp, count);
            self.sp.write(self.argc - 1);
        }
        // reparse our own pointers against the shifted block
        let reparsed = unsafe { KernelHandoff::parse(self.sp) }.unwrap();
        *self = reparsed;
    }
}

/// Register an image that is already mapped (the main executable in
/// interpreter mode, or the loader itself) without mapping anything.
fn register_mapped_image(
    rtld: &mut Rtld,
    context: ContextId,
    phdrs: &'static [ElfPhdr],
    load_base: usize,
    path: &CStr,
    name: &CStr,
    entry: usize,
) -> Result<ImageId> {
    let mut ro = None;
    let mut rw = None;
    let mut dyn_vaddr = None;
    for phdr in phdrs {
        match phdr.p_type {
            PT_LOAD => {
                if phdr.p_flags & PF_W != 0 {
                    if rw.is_none() {
                        rw = Some(FileMap::from_phdr(phdr));
                    }
                } else if phdr.p_offset == 0 {
                    ro = Some(FileMap::from_phdr(phdr));
                }
            }
            PT_DYNAMIC => dyn_vaddr = Some(phdr.p_vaddr as usize),
            _ => {}
        }
    }
    let ro = ro.ok_or(malformed_error("no read-only PT_LOAD in pre-mapped image"))?;
    let rw = rw.ok_or(malformed_error("no read-write PT_LOAD in pre-mapped image"))?;
    let dyn_vaddr = dyn_vaddr.ok_or(malformed_error("no PT_DYNAMIC in pre-mapped image"))?;

    let dyn_ptr = (load_base + dyn_vaddr) as *const ElfDyn;
    let dynamic = ElfDynamic::parse(dyn_ptr, load_base)?;
    let symbols = SymbolTable::from_dynamic(&dynamic);
    let (dev, ino) = os::stat_dev_ino(path).unwrap_or((0, 0));

    let image = ElfImage {
        load_base,
        path: path.to_owned(),
        name: name.to_owned(),
        dev,
        ino,
        dyn_ptr,
        dynamic,
        symbols,
        phdrs,
        entry,
        ro,
        rw,
        refcount: 1,
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
    let id = rtld.insert_file(image);
    rtld.notify(id, Event::Mapped);
    Ok(id)
}

/// Names the namespace remaps onto the loader itself: asking for the
/// dl library or for the system interpreter must land here.
fn interpreter_remaps(namespace: &mut Namespace) {
    let aliases: &[&CStr] = &[
        c"libdl.so.2",
        c"libdl.so",
        c"/lib64/ld-linux-x86-64.so.2",
        c"/lib/ld-linux.so.2",
    ];
    for alias in aliases {
        namespace.lib_remaps.push(LibRemap {
            src: (*alias).into(),
            dst: c"ldso".into(),
        });
    }
}

/// Everything stage 2 produces: where to jump, and the (possibly
/// shifted) stack pointer to hand over.
pub struct Startup {
    pub entry: usize,
    pub sp: *mut usize,
}

/// Run stage 2. `ldso_base` is the interpreter's own load base found in
/// stage 1.
///
/// On failure there is nothing to clean up; the process exits with the
/// stage-2 code.
pub unsafe fn stage2(sp: *mut usize, ldso_base: usize) -> Result<Startup> {
    let mut handoff = unsafe { KernelHandoff::parse(sp) }
        .ok_or(malformed_error("empty kernel handoff block"))?;

    let ld_log = unsafe { handoff.env("LD_LOG") };
    ldlog::initialize(ld_log.and_then(|spec| spec.to_str().ok()));
    log::debug!("stage2 running, loader base 0x{ldso_base:x}");

    let bind_now = unsafe { handoff.env("LD_BIND_NOW") }
        .map(|val| !val.to_bytes().is_empty())
        .unwrap_or(false);
    let ld_library_path = unsafe { handoff.env("LD_LIBRARY_PATH") };
    let ld_preload = unsafe { handoff.env("LD_PRELOAD") };

    // Program mode (no AT_BASE): map the program ourselves and drop our
    // own name from the block.
    let program_mode = handoff.aux(AT_BASE).unwrap_or(0) == 0;
    if program_mode {
        if handoff.argc < 2 {
            return Err(malformed_error("no program to load"));
        }
        unsafe { handoff.trim_argv() };
    }

    RTLD.init(Rtld::new());
    let entry;
    let ctor_order;
    {
        let mut rtld = RTLD.lock();
        rtld.bind_now = bind_now;
        rtld.ld_library_path = ld_library_path.map(|val| val.to_owned());
        rtld.ldso_base = ldso_base;
        rtld.stack_end = sp as usize;
        #[cfg(target_arch = "x86")]
        {
            rtld.sysinfo = handoff.aux(AT_SYSINFO).unwrap_or(0);
        }

        let mut namespace = Namespace::new(
            handoff.argc as i32,
            handoff.argv as *const *const c_char,
            handoff.envp,
        );
        interpreter_remaps(&mut namespace);
        let context = rtld.new_context(namespace);

        // The executable first: it must be the head of the link map.
        let exec_path = unsafe { CStr::from_ptr(handoff.argv.read()) };
        let exec = if program_mode {
            let id = map::map_single::<MmapImpl>(&mut rtld, context, exec_path, exec_path)?;
            rtld.file_mut(id).refcount = 1;
            id
        } else {
            let phdr_addr = handoff
                .aux(AT_PHDR)
                .ok_or(malformed_error("no AT_PHDR in the aux vector"))?;
            let phnum = handoff
                .aux(AT_PHNUM)
                .ok_or(malformed_error("no AT_PHNUM in the aux vector"))?;
            let phdrs: &'static [ElfPhdr] =
                unsafe { core::slice::from_raw_parts(phdr_addr as *const ElfPhdr, phnum) };
            // AT_PHDR is the mapped program header table; PT_PHDR gives
            // its link-time address, and the difference is the load base.
            let load_base = phdrs
                .iter()
                .find(|phdr| phdr.p_type == PT_PHDR)
                .map(|phdr| phdr_addr - phdr.p_vaddr as usize)
                .unwrap_or(0);
            let entry = handoff.aux(AT_ENTRY).unwrap_or(0).wrapping_sub(load_base);
            register_mapped_image(
                &mut rtld, context, phdrs, load_base, exec_path, exec_path, entry,
            )?
        };
        rtld.file_mut(exec).is_executable = true;
        rtld.file_mut(exec).lookup_policy = LookupPolicy::GlobalOnly;

        // The loader itself is part of every process: it defines the
        // dlopen family and the TLS entry points.
        let ldso = {
            let ehdr = unsafe { &*(ldso_base as *const ElfEhdr) };
            let phdrs: &'static [ElfPhdr] = unsafe {
                core::slice::from_raw_parts(
                    (ldso_base + ehdr.e_phoff as usize) as *const ElfPhdr,
                    ehdr.e_phnum as usize,
                )
            };
            register_mapped_image(
                &mut rtld,
                context,
                phdrs,
                ldso_base,
                c"ldso",
                c"ldso",
                ehdr.e_entry as usize,
            )?
        };
        rtld.ldso = Some(ldso);
        rtld.file_mut(ldso).deps_resolved = true;
        rtld.file_mut(ldso).relocated = true;

        // LD_PRELOAD object, pinned like the executable, inserted into
        // the global scope right after it.
        let preload = match ld_preload {
            Some(name) if !name.to_bytes().is_empty() => {
                let path = deps::search_file(&rtld, name, None, &[])
                    .ok_or(malformed_error("cannot find LD_PRELOAD object"))?;
                let id = map::map_single::<MmapImpl>(&mut rtld, context, &path, name)?;
                rtld.file_mut(id).refcount = 1;
                Some(id)
            }
            _ => None,
        };

        // Dependency closure of everything pinned so far.
        let mut newly: Vec<ImageId> = Vec::new();
        deps::resolve_deps::<MmapImpl>(&mut rtld, exec, &mut newly)?;
        if let Some(preload) = preload {
            deps::resolve_deps::<MmapImpl>(&mut rtld, preload, &mut newly)?;
        }

        // Global scope: the executable, then the preload, then the
        // executable's closure, then the loader.
        let mut global: Vec<ImageId> = Vec::new();
        global.push(exec);
        if let Some(preload) = preload {
            global.push(preload);
        }
        for id in deps_breadth_first(&rtld, exec) {
            if !global.contains(&id) {
                global.push(id);
            }
        }
        if let Some(preload) = preload {
            for id in deps_breadth_first(&rtld, preload) {
                if !global.contains(&id) {
                    global.push(id);
                }
            }
        }
        if !global.contains(&ldso) {
            global.push(ldso);
        }
        rtld.context_mut(context).global_scope = global.clone();

        // Per-file local scopes.
        for &id in &global {
            let scope = deps_breadth_first(&rtld, id);
            rtld.file_mut(id).local_scope = scope;
        }

        let all_files = global;

        // Static TLS layout must precede relocation: TPOFF relocations
        // read the offsets it assigns.
        tls::initialize_static(&mut rtld, &all_files);

        reloc::relocate_files(&mut rtld, &all_files, bind_now)?;

        // The main thread's TCB and DTV.
        let tcb = tls::tcb_allocate(&rtld);
        tls::tcb_initialize(tcb, rtld.sysinfo);
        tls::dtv_allocate(&rtld, tcb);
        tls::dtv_initialize(&rtld, tcb);
        arch::set_thread_pointer(tcb);

        gdb::initialize(&mut rtld);
        glibc::initialize();
        unsafe {
            *glibc::__libc_stack_end.0.get() = sp as usize;
            *glibc::_dl_argv.0.get() = handoff.argv as *const *const c_char;
        }
        glibc::patch_files(&mut rtld, &all_files);

        if program_mode {
            // the program will read the aux vector through libc
            let exec_file = rtld.file(exec);
            handoff.aux_set(AT_PHDR, exec_file.phdrs.as_ptr() as usize);
            handoff.aux_set(AT_PHNUM, exec_file.phdrs.len());
            handoff.aux_set(AT_PHENT, core::mem::size_of::<ElfPhdr>());
            handoff.aux_set(AT_ENTRY, exec_file.entry_point());
            handoff.aux_set(AT_BASE, ldso_base);
            handoff.aux_set(AT_EXECFN, unsafe { handoff.argv.read() } as usize);
        }

        rtld.startup_done = true;
        entry = rtld.file(exec).entry_point();
        ctor_order = constructor_order(&rtld, &all_files);
    }

    // constructors run unlocked, dependencies first
    init_fini::run_constructors(&ctor_order);

    glibc::startup_finished();
    log::debug!("transferring control to 0x{entry:x}");
    Ok(Startup {
        entry,
        sp: handoff.sp,
    })
}
