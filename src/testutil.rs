//! Helpers for constructing synthetic images in unit tests: a real SysV
//! hash table, symbol table and string table are built in leaked memory
//! so the lookup machinery runs exactly as it does on mapped files.

use crate::arch::{ElfPhdr, ElfSymbol};
use crate::context::Namespace;
use crate::dynamic::ElfDynamic;
use crate::engine::Rtld;
use crate::file::{ContextId, ElfImage, GcColor, ImageId, LookupPolicy};
use crate::segment::FileMap;
use crate::symbol::SymbolTable;
use alloc::vec;
use alloc::vec::Vec;
use elf::abi::{PT_TLS, STB_GLOBAL, STT_FUNC};

/// One exported symbol of a synthetic image: name and unrebased value.
pub(crate) type Export = (&'static str, usize);

fn leak<T>(data: Vec<T>) -> &'static mut [T] {
    alloc::boxed::Box::leak(data.into_boxed_slice())
}

/// Build a string table, symbol table and SysV hash table covering
/// `exports`, returning the dynamic-section view of them.
fn synthetic_tables(exports: &[Export]) -> ElfDynamic {
    let mut strtab: Vec<u8> = vec![0];
    let mut symtab: Vec<ElfSymbol> = vec![unsafe { core::mem::zeroed() }];
    for (name, value) in exports {
        let st_name = strtab.len() as u32;
        strtab.extend_from_slice(name.as_bytes());
        strtab.push(0);
        let mut sym: ElfSymbol = unsafe { core::mem::zeroed() };
        sym.st_name = st_name;
        sym.st_value = *value as _;
        sym.st_size = core::mem::size_of::<usize>() as _;
        sym.st_info = (STB_GLOBAL << 4) | STT_FUNC;
        sym.st_shndx = 1;
        symtab.push(sym);
    }
    let nsyms = symtab.len() as u32;

    // one bucket, every defined symbol on its chain
    let mut hash: Vec<u32> = Vec::with_capacity(3 + nsyms as usize);
    hash.push(1); // nbucket
    hash.push(nsyms); // nchain
    hash.push(if nsyms > 1 { 1 } else { 0 }); // the single bucket
    hash.push(0); // chain slot of the null symbol
    for idx in 1..nsyms as usize {
        let next = if idx + 1 < nsyms as usize { (idx + 1) as u32 } else { 0 };
        hash.push(next);
    }

    let strtab = leak(strtab);
    let symtab = leak(symtab);
    let hash = leak(hash);

    ElfDynamic {
        dyn_ptr: core::ptr::null(),
        hashtab: Some(crate::dynamic::ElfDynamicHashTab::Sysv(hash.as_ptr() as usize)),
        symtab: symtab.as_ptr() as usize,
        strtab: strtab.as_ptr() as usize,
        flags: 0,
        bind_now: false,
        got: None,
        needed_libs: Vec::new(),
        soname_off: None,
        pltrel: None,
        dynrel: None,
        rel_count: None,
        init_fn: None,
        init_array: None,
        fini_fn: None,
        fini_array: None,
        versym: None,
        verneed: None,
        verdef: None,
        rpath_off: None,
        runpath_off: None,
        debug_slot: None,
    }
}

/// A synthetic image exporting `exports`, not yet registered anywhere.
pub(crate) fn image(
    context: ContextId,
    name: &str,
    load_base: usize,
    exports: &[Export],
) -> ElfImage {
    image_with_phdrs(context, name, load_base, exports, Vec::new())
}

/// A synthetic image whose symbols carry versym entries. `versym` must
/// have one entry per symbol, the null symbol included.
pub(crate) fn image_with_versym(
    context: ContextId,
    name: &str,
    load_base: usize,
    exports: &[Export],
    versym: Vec<u16>,
) -> ElfImage {
    assert_eq!(versym.len(), exports.len() + 1);
    let mut img = image(context, name, load_base, exports);
    img.symbols.versym = Some(leak(versym).as_ptr());
    img
}

/// A synthetic image carrying a PT_TLS segment.
pub(crate) fn image_with_tls(
    context: ContextId,
    name: &str,
    load_base: usize,
    filesz: usize,
    memsz: usize,
    align: usize,
    static_tls: bool,
) -> ElfImage {
    let mut phdr: ElfPhdr = unsafe { core::mem::zeroed() };
    phdr.p_type = PT_TLS;
    phdr.p_vaddr = 0x100 as _;
    phdr.p_filesz = filesz as _;
    phdr.p_memsz = memsz as _;
    phdr.p_align = align as _;
    let mut img = image_with_phdrs(context, name, load_base, &[], vec![phdr]);
    if static_tls {
        img.dynamic.flags |= elf::abi::DF_STATIC_TLS as usize;
    }
    img
}

fn image_with_phdrs(
    context: ContextId,
    name: &str,
    load_base: usize,
    exports: &[Export],
    phdrs: Vec<ElfPhdr>,
) -> ElfImage {
    let dynamic = synthetic_tables(exports);
    let symbols = SymbolTable::from_dynamic(&dynamic);
    let name = alloc::ffi::CString::new(name).unwrap();
    ElfImage {
        load_base,
        path: name.clone(),
        name,
        dev: load_base as u64,
        ino: load_base as u64,
        dyn_ptr: core::ptr::null(),
        dynamic,
        symbols,
        phdrs: leak(phdrs),
        entry: 0,
        ro: FileMap::default(),
        rw: FileMap::default(),
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
    }
}

/// An engine plus one namespace, ready to take synthetic images.
pub(crate) fn engine() -> (Rtld, ContextId) {
    let mut rtld = Rtld::new();
    let context = rtld.new_context(Namespace::new(0, core::ptr::null(), core::ptr::null()));
    (rtld, context)
}

/// Register a chain of images where each depends on the next, returning
/// their ids in chain order.
pub(crate) fn chain(rtld: &mut Rtld, context: ContextId, names: &[&str]) -> Vec<ImageId> {
    let mut ids = Vec::new();
    for (i, name) in names.iter().enumerate() {
        let mut img = image(context, name, 0x10_0000 * (i + 1), &[]);
        img.depth = i as u32;
        ids.push(rtld.insert_file(img));
    }
    for pair in ids.windows(2) {
        let (parent, child) = (pair[0], pair[1]);
        rtld.file_mut(parent).deps.push(child);
    }
    ids
}
