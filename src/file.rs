//! The per-file record of the link map.

use crate::arch::{ElfDyn, ElfPhdr};
use crate::dynamic::ElfDynamic;
use crate::segment::FileMap;
use crate::symbol::SymbolTable;
use alloc::ffi::CString;
use alloc::vec::Vec;

/// Arena handle of one mapped file. All cross-references between files go
/// through these ids so the dependency graph can hold cycles and
/// back-references without ownership knots.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct ImageId(pub(crate) u32);

/// Arena handle of one namespace.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ContextId(pub(crate) u32);

/// Which scopes a lookup starting from this file searches, and in which
/// order.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum LookupPolicy {
    /// Only the namespace's global scope. Used by the main executable.
    GlobalOnly,
    /// Global scope first, then the file's local scope. The default.
    GlobalThenLocal,
    /// Local scope first. Set by RTLD_DEEPBIND opens.
    LocalThenGlobal,
    /// Only the local scope.
    LocalOnly,
}

/// Tri-color state used by the unload collector.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum GcColor {
    Black,
    Grey,
    White,
}

/// Lifecycle notifications delivered to namespace observers.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Event {
    /// The file's segments are mapped.
    Mapped,
    /// Its constructors have run.
    Constructed,
    /// Its destructors have run; unmapping follows.
    Destroyed,
}

/// The TLS block template of a file with a PT_TLS segment.
#[derive(Clone, Copy, Debug)]
pub struct TlsTemplate {
    /// Address of the initialization image.
    pub tmpl_start: usize,
    /// Size of the initialization image.
    pub tmpl_size: usize,
    /// Zero-initialized tail after the image.
    pub zero_size: usize,
    /// Alignment of the block.
    pub align: usize,
    /// Module index: the per-thread DTV slot this file owns.
    pub index: usize,
    /// Offset of the block from the thread pointer. Only meaningful for
    /// static-TLS files.
    pub offset: isize,
    /// Whether the block lives in the static TLS area.
    pub is_static: bool,
    /// Value of the generation counter when this template was registered.
    pub r#gen: usize,
}

/// One mapped ELF image and its place in the link map.
pub struct ElfImage {
    /// Difference between link-time and runtime addresses.
    pub load_base: usize,
    /// The path the file was actually opened from.
    pub path: CString,
    /// The name the file is known by (DT_NEEDED spelling or user string).
    pub name: CString,
    /// Device and inode, for de-duplication across names.
    pub dev: u64,
    pub ino: u64,
    /// The PT_DYNAMIC area inside the image.
    pub dyn_ptr: *const ElfDyn,
    /// Parsed dynamic section.
    pub dynamic: ElfDynamic,
    /// Symbol lookup state.
    pub symbols: SymbolTable,
    /// Program headers inside the mapped image.
    pub phdrs: &'static [ElfPhdr],
    /// Program entry point (unrebased).
    pub entry: usize,
    /// Layout of the read-only segment.
    pub ro: FileMap,
    /// Layout of the read-write segment.
    pub rw: FileMap,

    /// Explicit references: dlopen handles, plus the main binary, the
    /// interpreter and LD_PRELOAD entries pinned at startup.
    pub refcount: u32,

    pub deps_resolved: bool,
    pub tls_initialized: bool,
    pub init_called: bool,
    pub fini_called: bool,
    pub relocated: bool,
    pub patched: bool,
    pub is_executable: bool,

    pub lookup_policy: LookupPolicy,
    pub gc_color: GcColor,

    /// Direct DT_NEEDED dependencies, in file order.
    pub deps: Vec<ImageId>,
    /// Breadth-first dependency closure, self first.
    pub local_scope: Vec<ImageId>,
    /// Files this file resolved at least one symbol in. Only the collector
    /// reads this.
    pub symbols_resolved_in: Vec<ImageId>,
    /// Longest dependency path from any root to this file.
    pub depth: u32,

    /// TLS template, present iff the file has a PT_TLS segment.
    pub tls: Option<TlsTemplate>,

    /// The namespace this file belongs to.
    pub context: ContextId,

    /// This file's node on the debugger-visible link map chain.
    pub debug_node: *mut crate::gdb::LinkMapNode,
}

impl ElfImage {
    /// Runtime address of the entry point.
    #[inline]
    pub fn entry_point(&self) -> usize {
        self.load_base + self.entry
    }

    #[inline]
    pub fn name_str(&self) -> &str {
        self.name.to_str().unwrap_or("<non-utf8>")
    }

    /// Whether `addr` points into this image's mapped span.
    pub fn spans(&self, addr: usize) -> bool {
        let start = self.load_base + self.ro.mem_start;
        let end = self.load_base + self.rw.mem_end();
        addr >= start && addr < end
    }

    #[inline]
    pub fn has_tls(&self) -> bool {
        self.tls.is_some()
    }

    /// DT_RPATH search string, if present.
    pub fn rpath(&self) -> Option<&'static str> {
        self.dynamic
            .rpath_off
            .map(|off| self.symbols.strtab().get_str(off.get()))
    }

    /// DT_RUNPATH search string, if present. Overrides RPATH.
    pub fn runpath(&self) -> Option<&'static str> {
        self.dynamic
            .runpath_off
            .map(|off| self.symbols.strtab().get_str(off.get()))
    }

    /// The DT_NEEDED names of this file, in file order.
    pub fn needed(&self) -> Vec<&'static core::ffi::CStr> {
        self.dynamic
            .needed_libs
            .iter()
            .map(|off| self.symbols.strtab().get_cstr(off.get()))
            .collect()
    }
}
