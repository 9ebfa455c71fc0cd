//! Architecture backend: native ELF record layouts plus the small set of
//! operations the engine cannot express portably, namely relocation
//! application, the lazy-binding resolve trampoline, direct-jump patching
//! and the thread-pointer register.

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        mod x86_64;
        pub use x86_64::*;
    } else if #[cfg(target_arch = "x86")] {
        mod x86;
        pub use x86::*;
    } else {
        compile_error!("unsupported architecture");
    }
}

pub const EHDR_SIZE: usize = core::mem::size_of::<ElfEhdr>();
pub const PHDR_SIZE: usize = core::mem::size_of::<ElfPhdr>();

/// Index of the class byte inside `e_ident`.
pub(crate) const EI_CLASS_IDX: usize = 4;

/// The ELF file header, native width.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct ElfEhdr {
    pub e_ident: [u8; 16],
    pub e_type: u16,
    pub e_machine: u16,
    pub e_version: u32,
    pub e_entry: ElfWord,
    pub e_phoff: ElfWord,
    pub e_shoff: ElfWord,
    pub e_flags: u32,
    pub e_ehsize: u16,
    pub e_phentsize: u16,
    pub e_phnum: u16,
    pub e_shentsize: u16,
    pub e_shnum: u16,
    pub e_shstrndx: u16,
}

/// One entry of the dynamic section.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct ElfDyn {
    pub d_tag: isize,
    pub d_un: usize,
}

/// Version definition header (`DT_VERDEF` array element).
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct ElfVerdef {
    pub vd_version: u16,
    pub vd_flags: u16,
    pub vd_ndx: u16,
    pub vd_cnt: u16,
    pub vd_hash: u32,
    pub vd_aux: u32,
    pub vd_next: u32,
}

/// Auxiliary name entry hanging off an [`ElfVerdef`].
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct ElfVerdaux {
    pub vda_name: u32,
    pub vda_next: u32,
}

/// Version requirement header (`DT_VERNEED` array element).
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct ElfVerneed {
    pub vn_version: u16,
    pub vn_cnt: u16,
    pub vn_file: u32,
    pub vn_aux: u32,
    pub vn_next: u32,
}

/// Auxiliary entry hanging off an [`ElfVerneed`].
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct ElfVernaux {
    pub vna_hash: u32,
    pub vna_flags: u16,
    pub vna_other: u16,
    pub vna_name: u32,
    pub vna_next: u32,
}

/// The hidden bit of a versym entry. A hidden definition cannot be bound
/// from outside its own file.
pub const VERSYM_HIDDEN: u16 = 0x8000;
/// Versym index of unversioned local definitions.
pub const VER_NDX_LOCAL: u16 = 0;
/// Versym index of the base (unversioned global) definition.
pub const VER_NDX_BASE: u16 = 1;

/// Everything the relocation appliers need to know about the module a value
/// comes from: where it landed and, when it carries TLS, its block identity.
pub(crate) struct RelocModule {
    pub load_base: usize,
    pub has_tls: bool,
    pub tls_offset: isize,
    pub tls_index: usize,
}

/// Shared shape of the lazy-binding GOT setup; the prelinked back-pointer
/// formula is per-architecture ([`prelinked_plt_entry`]).
///
/// `GOT[1]` receives `handle` (handed back to the resolver by the PLT stub),
/// `GOT[2]` the resolve trampoline. Returns the previous `GOT[1]` value: the
/// prelinker stores a PLT pointer there, zero means not prelinked.
pub(crate) unsafe fn lazy_got_install(got: *mut usize, handle: usize) -> usize {
    unsafe {
        let plt = got.add(1).read();
        got.add(1).write(handle);
        got.add(2).write(resolve_trampoline_addr());
        plt
    }
}

/// Map a relocation type to its name, for diagnostics.
pub(crate) fn reloc_name(r_type: u32) -> &'static str {
    rel_type_to_str(r_type)
}
