//! Namespaces: isolated universes of loaded files.
//!
//! Every file belongs to exactly one namespace; two namespaces never share
//! a file except for the interpreter itself. A namespace carries the
//! global lookup scope, the remap tables, observer callbacks and the saved
//! argc/argv/envp constructors receive.

use crate::file::{Event, ImageId};
use alloc::ffi::CString;
use alloc::vec::Vec;
use core::ffi::{c_char, CStr};

/// Rewrites one symbol (and optionally its version) to another during
/// lookups in this namespace.
pub struct SymbolRemap {
    pub src_name: CString,
    pub src_ver_name: Option<CString>,
    pub dst_name: CString,
    pub dst_ver_name: Option<CString>,
}

/// Rewrites one library name to another during dependency resolution,
/// e.g. `libdl.so.2` to the engine's own binary.
pub struct LibRemap {
    pub src: CString,
    pub dst: CString,
}

/// Lifecycle callback registered on a namespace.
pub type Observer = fn(ImageId, Event);

/// One namespace.
pub struct Namespace {
    /// Files contributing to unqualified lookups, in insertion order.
    pub global_scope: Vec<ImageId>,
    pub symbol_remaps: Vec<SymbolRemap>,
    pub lib_remaps: Vec<LibRemap>,
    pub observers: Vec<Observer>,
    /// Arguments passed to every DT_INIT/DT_INIT_ARRAY function, the way
    /// libc startup code expects them.
    pub argc: i32,
    pub argv: *const *const c_char,
    pub envp: *const *const c_char,
}

impl Namespace {
    pub fn new(argc: i32, argv: *const *const c_char, envp: *const *const c_char) -> Namespace {
        Namespace {
            global_scope: Vec::new(),
            symbol_remaps: Vec::new(),
            lib_remaps: Vec::new(),
            observers: Vec::new(),
            argc,
            argv,
            envp,
        }
    }

    /// Apply the library remap table to a DT_NEEDED name.
    pub fn remap_lib<'a>(&'a self, name: &'a CStr) -> &'a CStr {
        for remap in &self.lib_remaps {
            if remap.src.as_c_str() == name {
                return remap.dst.as_c_str();
            }
        }
        name
    }

    /// Apply the symbol remap table to a lookup query.
    pub fn remap_symbol<'a>(
        &'a self,
        name: &'a CStr,
        ver_name: Option<&'a CStr>,
    ) -> (&'a CStr, Option<&'a CStr>) {
        for remap in &self.symbol_remaps {
            if remap.src_name.as_c_str() != name {
                continue;
            }
            if let Some(src_ver) = &remap.src_ver_name {
                if ver_name != Some(src_ver.as_c_str()) {
                    continue;
                }
            }
            return (
                remap.dst_name.as_c_str(),
                remap.dst_ver_name.as_deref().or(ver_name),
            );
        }
        (name, ver_name)
    }

    /// Deliver a lifecycle event to every registered observer.
    pub fn notify(&self, id: ImageId, event: Event) {
        for observer in &self.observers {
            observer(id, event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::ptr::null;

    fn ns() -> Namespace {
        Namespace::new(0, null(), null())
    }

    #[test]
    fn lib_remap_rewrites_known_names_only() {
        let mut ns = ns();
        ns.lib_remaps.push(LibRemap {
            src: c"libdl.so.2".into(),
            dst: c"ldso".into(),
        });
        assert_eq!(ns.remap_lib(c"libdl.so.2"), c"ldso");
        assert_eq!(ns.remap_lib(c"libc.so.6"), c"libc.so.6");
    }

    #[test]
    fn symbol_remap_honors_version_filter() {
        let mut ns = ns();
        ns.symbol_remaps.push(SymbolRemap {
            src_name: c"malloc".into(),
            src_ver_name: Some(c"GLIBC_2.2.5".into()),
            dst_name: c"vdl_malloc".into(),
            dst_ver_name: None,
        });
        let (name, _) = ns.remap_symbol(c"malloc", Some(c"GLIBC_2.2.5"));
        assert_eq!(name, c"vdl_malloc");
        let (name, _) = ns.remap_symbol(c"malloc", None);
        assert_eq!(name, c"malloc");
    }
}
