//! Parsing the PT_DYNAMIC area of a mapped image.

use crate::arch::{ElfDyn, ElfRelType};
use crate::error::malformed_error;
use crate::Result;
use alloc::vec::Vec;
use core::ffi::{c_char, c_int};
use core::num::NonZeroUsize;
use core::ptr::NonNull;
use elf::abi::*;

/// Old-style initializer; glibc passes argc/argv/envp as a non-standard
/// extension and some libc constructors rely on it.
pub type InitFn = extern "C" fn(c_int, *const *const c_char, *const *const c_char);
/// Old-style finalizer.
pub type FiniFn = extern "C" fn();

/// Which hash table the file carries for symbol lookup. When both are
/// present the GNU table wins.
#[derive(Clone, Copy, Debug)]
pub enum ElfDynamicHashTab {
    /// GNU-style hash table (DT_GNU_HASH), absolute address.
    Gnu(usize),
    /// Traditional ELF hash table (DT_HASH), absolute address.
    Sysv(usize),
}

/// Information extracted from the dynamic section, with every offset
/// already rebased to an absolute address.
pub struct ElfDynamic {
    /// Pointer to the dynamic section itself.
    pub dyn_ptr: *const ElfDyn,
    /// Hash table for symbol lookup, if any.
    pub hashtab: Option<ElfDynamicHashTab>,
    /// Symbol table address.
    pub symtab: usize,
    /// String table address.
    pub strtab: usize,
    /// DT_FLAGS value (DF_STATIC_TLS is the interesting bit).
    pub flags: usize,
    /// Whether DT_FLAGS/DT_FLAGS_1 request immediate binding.
    pub bind_now: bool,
    /// Global offset table address.
    pub got: Option<NonNull<usize>>,
    /// String table offsets of the DT_NEEDED entries, in file order.
    pub needed_libs: Vec<NonZeroUsize>,
    /// String table offset of DT_SONAME.
    pub soname_off: Option<NonZeroUsize>,
    /// PLT relocation entries (DT_JMPREL).
    pub pltrel: Option<&'static [ElfRelType]>,
    /// Non-PLT relocation entries (DT_REL or DT_RELA).
    pub dynrel: Option<&'static [ElfRelType]>,
    /// Leading count of relative entries inside `dynrel`.
    pub rel_count: Option<NonZeroUsize>,
    /// DT_INIT.
    pub init_fn: Option<InitFn>,
    /// DT_INIT_ARRAY.
    pub init_array: Option<&'static [InitFn]>,
    /// DT_FINI.
    pub fini_fn: Option<FiniFn>,
    /// DT_FINI_ARRAY.
    pub fini_array: Option<&'static [FiniFn]>,
    /// Versym table address.
    pub versym: Option<NonZeroUsize>,
    /// Verneed table address and entry count.
    pub verneed: Option<(NonZeroUsize, NonZeroUsize)>,
    /// Verdef table address and entry count.
    pub verdef: Option<(NonZeroUsize, NonZeroUsize)>,
    /// String table offset of DT_RPATH.
    pub rpath_off: Option<NonZeroUsize>,
    /// String table offset of DT_RUNPATH.
    pub runpath_off: Option<NonZeroUsize>,
    /// Address of the value word of the DT_DEBUG entry. The debugger
    /// rendezvous pointer is stored through it.
    pub debug_slot: Option<NonNull<usize>>,
}

impl ElfDynamic {
    /// Walk the dynamic entries starting at `dyn_ptr` in an image loaded at
    /// `base`.
    pub fn parse(dyn_ptr: *const ElfDyn, base: usize) -> Result<Self> {
        let mut symtab_off = 0;
        let mut strtab_off = 0;
        let mut elf_hash_off = None;
        let mut gnu_hash_off = None;
        let mut got_off = None;
        let mut pltrel_size = None;
        let mut pltrel_off = None;
        let mut rel_off = None;
        let mut rel_size = None;
        let mut rel_count = None;
        let mut init_off = None;
        let mut fini_off = None;
        let mut init_array_off = None;
        let mut init_array_size = None;
        let mut fini_array_off = None;
        let mut fini_array_size = None;
        let mut versym_off = None;
        let mut verneed_off = None;
        let mut verneed_num = None;
        let mut verdef_off = None;
        let mut verdef_num = None;
        let mut rpath_off = None;
        let mut runpath_off = None;
        let mut soname_off = None;
        let mut debug_slot = None;
        let mut flags = 0;
        let mut flags_1 = 0;
        let mut is_rela = None;
        let mut needed_libs = Vec::new();

        let mut cur_dyn_ptr = dyn_ptr;
        let mut dynamic = unsafe { &*cur_dyn_ptr };

        unsafe {
            loop {
                match dynamic.d_tag as i64 {
                    DT_FLAGS => flags = dynamic.d_un,
                    DT_FLAGS_1 => flags_1 = dynamic.d_un,
                    DT_PLTGOT => got_off = NonZeroUsize::new(dynamic.d_un),
                    DT_NEEDED => {
                        if let Some(val) = NonZeroUsize::new(dynamic.d_un) {
                            needed_libs.push(val);
                        }
                    }
                    DT_SONAME => soname_off = NonZeroUsize::new(dynamic.d_un),
                    DT_HASH => elf_hash_off = Some(dynamic.d_un),
                    DT_GNU_HASH => gnu_hash_off = Some(dynamic.d_un),
                    DT_SYMTAB => symtab_off = dynamic.d_un,
                    DT_STRTAB => strtab_off = dynamic.d_un,
                    DT_PLTRELSZ => pltrel_size = NonZeroUsize::new(dynamic.d_un),
                    DT_PLTREL => is_rela = Some(dynamic.d_un as i64 == DT_RELA),
                    DT_JMPREL => pltrel_off = NonZeroUsize::new(dynamic.d_un),
                    DT_RELA | DT_REL => {
                        is_rela = Some(dynamic.d_tag as i64 == DT_RELA);
                        rel_off = NonZeroUsize::new(dynamic.d_un);
                    }
                    DT_RELASZ | DT_RELSZ => rel_size = NonZeroUsize::new(dynamic.d_un),
                    DT_RELACOUNT | DT_RELCOUNT => rel_count = NonZeroUsize::new(dynamic.d_un),
                    DT_INIT => init_off = NonZeroUsize::new(dynamic.d_un),
                    DT_FINI => fini_off = NonZeroUsize::new(dynamic.d_un),
                    DT_INIT_ARRAY => init_array_off = NonZeroUsize::new(dynamic.d_un),
                    DT_INIT_ARRAYSZ => init_array_size = NonZeroUsize::new(dynamic.d_un),
                    DT_FINI_ARRAY => fini_array_off = NonZeroUsize::new(dynamic.d_un),
                    DT_FINI_ARRAYSZ => fini_array_size = NonZeroUsize::new(dynamic.d_un),
                    DT_VERSYM => versym_off = NonZeroUsize::new(dynamic.d_un),
                    DT_VERNEED => verneed_off = NonZeroUsize::new(dynamic.d_un),
                    DT_VERNEEDNUM => verneed_num = NonZeroUsize::new(dynamic.d_un),
                    DT_VERDEF => verdef_off = NonZeroUsize::new(dynamic.d_un),
                    DT_VERDEFNUM => verdef_num = NonZeroUsize::new(dynamic.d_un),
                    DT_RPATH => rpath_off = NonZeroUsize::new(dynamic.d_un),
                    DT_RUNPATH => runpath_off = NonZeroUsize::new(dynamic.d_un),
                    DT_DEBUG => {
                        debug_slot =
                            NonNull::new(&raw const (*cur_dyn_ptr).d_un as *mut usize);
                    }
                    DT_NULL => break,
                    _ => {}
                }
                cur_dyn_ptr = cur_dyn_ptr.add(1);
                dynamic = &*cur_dyn_ptr;
            }
        }

        // The entry width must agree with what this architecture compiles
        // relocations to.
        if let Some(is_rela) = is_rela {
            if is_rela != (core::mem::size_of::<ElfRelType>() == 24) {
                return Err(malformed_error("relocation entry kind mismatch"));
            }
        }

        // Prefer the GNU table when both are present.
        let hashtab = if let Some(off) = gnu_hash_off {
            Some(ElfDynamicHashTab::Gnu(off + base))
        } else {
            elf_hash_off.map(|off| ElfDynamicHashTab::Sysv(off + base))
        };

        let pltrel = pltrel_off.zip(pltrel_size).map(|(off, size)| unsafe {
            core::slice::from_raw_parts(
                (base + off.get()) as *const ElfRelType,
                size.get() / core::mem::size_of::<ElfRelType>(),
            )
        });
        let dynrel = rel_off.zip(rel_size).map(|(off, size)| unsafe {
            core::slice::from_raw_parts(
                (base + off.get()) as *const ElfRelType,
                size.get() / core::mem::size_of::<ElfRelType>(),
            )
        });

        let init_fn = init_off
            .map(|off| unsafe { core::mem::transmute::<usize, InitFn>(base + off.get()) });
        let fini_fn = fini_off
            .map(|off| unsafe { core::mem::transmute::<usize, FiniFn>(base + off.get()) });
        let init_array = init_array_off.zip(init_array_size).map(|(off, size)| unsafe {
            core::slice::from_raw_parts(
                (base + off.get()) as *const InitFn,
                size.get() / core::mem::size_of::<usize>(),
            )
        });
        let fini_array = fini_array_off.zip(fini_array_size).map(|(off, size)| unsafe {
            core::slice::from_raw_parts(
                (base + off.get()) as *const FiniFn,
                size.get() / core::mem::size_of::<usize>(),
            )
        });

        let versym = versym_off.map(|off| off.checked_add(base).unwrap());
        let verneed = verneed_off
            .map(|off| (off.checked_add(base).unwrap(), verneed_num.unwrap()));
        let verdef = verdef_off
            .map(|off| (off.checked_add(base).unwrap(), verdef_num.unwrap()));

        Ok(ElfDynamic {
            dyn_ptr,
            hashtab,
            symtab: symtab_off + base,
            strtab: strtab_off + base,
            flags,
            bind_now: flags & DF_BIND_NOW as usize != 0 || flags_1 & DF_1_NOW as usize != 0,
            got: NonNull::new(
                got_off
                    .map(|off| (base + off.get()) as *mut usize)
                    .unwrap_or(core::ptr::null_mut()),
            ),
            needed_libs,
            soname_off,
            pltrel,
            dynrel,
            rel_count,
            init_fn,
            init_array,
            fini_fn,
            fini_array,
            versym,
            verneed,
            verdef,
            rpath_off,
            runpath_off,
            debug_slot,
        })
    }

    /// Whether the file asks to live in the static TLS block.
    #[inline]
    pub fn wants_static_tls(&self) -> bool {
        self.flags & DF_STATIC_TLS as usize != 0
    }
}
