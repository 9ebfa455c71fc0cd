//! The symbol lookup engine.
//!
//! A lookup walks the scopes its requester's policy names, file by file in
//! scope order. Within one file the hash table yields candidates, each
//! graded against the version requirement; the first perfect match wins.
//! A single ambiguous match per file is accepted when no perfect one
//! exists; two or more fail the lookup with a scope-ambiguity error.

use crate::arch::ElfSymbol;
use crate::engine::Rtld;
use crate::error::scope_ambiguous_error;
use crate::file::{ImageId, LookupPolicy};
use crate::hash::Hashes;
use crate::version::{symbol_version_matches, VersionMatch, VersionRef};
use crate::Result;
use alloc::ffi::CString;
use alloc::format;
use alloc::vec::Vec;
use core::ffi::CStr;

bitflags::bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct LookupFlags: u32 {
        /// Skip the main executable. Copy relocations re-resolve their
        /// symbol with this set so the copied definition is found, not the
        /// executable's own placeholder.
        const NO_EXEC = 1;
    }
}

/// A successful lookup: the defining file and its symbol record.
#[derive(Clone, Copy, Debug)]
pub struct LookupResult {
    pub file: ImageId,
    pub symbol: &'static ElfSymbol,
}

impl LookupResult {
    /// Runtime address of the definition.
    pub fn address(&self, rtld: &Rtld) -> usize {
        rtld.file(self.file).load_base + self.symbol.st_value()
    }
}

/// Search one scope, in order. `requester` drives the hidden/local version
/// rules and receives the GC back-reference when the match lands in
/// another file.
///
/// `Ok(None)` means no file in the scope defines the name;
/// `Err(ScopeAmbiguous)` means one file offered two or more versioned
/// definitions with nothing to pick between them.
pub(crate) fn lookup_in_scope(
    rtld: &mut Rtld,
    requester: Option<ImageId>,
    name: &CStr,
    ver: Option<&VersionRef<'_>>,
    hashes: &Hashes,
    flags: LookupFlags,
    scope: &[ImageId],
) -> Result<Option<LookupResult>> {
    for &cur in scope {
        if flags.contains(LookupFlags::NO_EXEC) && rtld.file(cur).is_executable {
            continue;
        }
        let found = {
            let file = rtld.file(cur);
            let same_file = requester == Some(cur);
            let mut n_ambiguous = 0u32;
            let mut last_ambiguous = None;
            let mut perfect = None;
            for idx in file.symbols.candidates(name, hashes) {
                match symbol_version_matches(&file.symbols, &file.name, same_file, ver, idx) {
                    VersionMatch::Perfect => {
                        perfect = Some(idx);
                        break;
                    }
                    VersionMatch::Ambiguous => {
                        n_ambiguous += 1;
                        last_ambiguous = Some(idx);
                    }
                    VersionMatch::Bad => {}
                }
            }
            if perfect.is_none() && n_ambiguous > 1 {
                return Err(scope_ambiguous_error(format!(
                    "{} versioned definitions of {:?} in {:?} and no perfect match",
                    n_ambiguous, name, file.name
                )));
            }
            // a single ambiguous match is not really ambiguous
            perfect.or(last_ambiguous)
        };
        if let Some(idx) = found {
            let symbol = rtld.file(cur).symbols.symbol(idx);
            if let Some(from) = requester {
                if from != cur {
                    let from_file = rtld.file_mut(from);
                    if !from_file.symbols_resolved_in.contains(&cur) {
                        from_file.symbols_resolved_in.push(cur);
                    }
                    log::trace!(target: "symbol-ok",
                        "resolved {:?} in {:?} from {:?}",
                        name,
                        rtld.file(cur).name,
                        rtld.file(from).name
                    );
                }
            }
            return Ok(Some(LookupResult { file: cur, symbol }));
        }
    }
    Ok(None)
}

/// A full lookup starting from `requester`, honoring its scope policy and
/// its namespace's symbol remap table.
pub(crate) fn lookup(
    rtld: &mut Rtld,
    requester: ImageId,
    name: &CStr,
    ver: Option<&VersionRef<'_>>,
    flags: LookupFlags,
) -> Result<Option<LookupResult>> {
    let context = rtld.file(requester).context;

    // Remapping may rewrite both the symbol and the version name. The
    // remapped strings are copied out so the namespace borrow ends before
    // the scope walk mutates back-references.
    let (name_owned, ver_name_owned): (CString, Option<CString>) = {
        let ns = rtld.context(context);
        let (n, v) = ns.remap_symbol(name, ver.map(|req| req.name));
        (n.into(), v.map(|cstr| cstr.into()))
    };
    let remapped_ver = match (ver, &ver_name_owned) {
        (Some(req), Some(ver_name)) if ver_name.as_c_str() != req.name => {
            Some(VersionRef::new(ver_name.as_c_str(), req.file))
        }
        (Some(req), _) => Some(*req),
        (None, _) => None,
    };

    let hashes = Hashes::of(name_owned.to_bytes());
    let (first, second): (Vec<ImageId>, Vec<ImageId>) = {
        let file = rtld.file(requester);
        let local = file.local_scope.clone();
        let global = rtld.context(context).global_scope.clone();
        match file.lookup_policy {
            LookupPolicy::LocalThenGlobal => (local, global),
            LookupPolicy::GlobalThenLocal => (global, local),
            LookupPolicy::GlobalOnly => (global, Vec::new()),
            LookupPolicy::LocalOnly => (local, Vec::new()),
        }
    };

    if let Some(found) = lookup_in_scope(
        rtld,
        Some(requester),
        &name_owned,
        remapped_ver.as_ref(),
        &hashes,
        flags,
        &first,
    )? {
        return Ok(Some(found));
    }
    lookup_in_scope(
        rtld,
        Some(requester),
        &name_owned,
        remapped_ver.as_ref(),
        &hashes,
        flags,
        &second,
    )
}

/// Look a name up inside a single file, ignoring scopes and versions.
/// Returns the first defined candidate. Used by the libc patch layer and
/// by dl_addr's nearest-symbol search.
pub(crate) fn lookup_local(rtld: &Rtld, id: ImageId, name: &CStr) -> Option<&'static ElfSymbol> {
    let file = rtld.file(id);
    let hashes = Hashes::of(name.to_bytes());
    let idx = file.symbols.candidates(name, &hashes).next()?;
    Some(file.symbols.symbol(idx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;
    use crate::Error;

    #[test]
    fn first_file_in_scope_wins() {
        let (mut rtld, ctx) = testutil::engine();
        let a = rtld.insert_file(testutil::image(ctx, "liba", 0x100000, &[("foo", 0x10)]));
        let b = rtld.insert_file(testutil::image(ctx, "libb", 0x200000, &[("foo", 0x20)]));
        let hashes = Hashes::of(b"foo");
        let found = lookup_in_scope(
            &mut rtld,
            None,
            c"foo",
            None,
            &hashes,
            LookupFlags::empty(),
            &[a, b],
        )
        .unwrap()
        .unwrap();
        assert_eq!(found.file, a);
        assert_eq!(found.address(&rtld), 0x100010);

        let found = lookup_in_scope(
            &mut rtld,
            None,
            c"foo",
            None,
            &hashes,
            LookupFlags::empty(),
            &[b, a],
        )
        .unwrap()
        .unwrap();
        assert_eq!(found.file, b);
        assert_eq!(found.address(&rtld), 0x200020);
    }

    #[test]
    fn resolving_elsewhere_records_the_back_reference() {
        let (mut rtld, ctx) = testutil::engine();
        let asker = rtld.insert_file(testutil::image(ctx, "asker", 0x100000, &[]));
        let def = rtld.insert_file(testutil::image(ctx, "def", 0x200000, &[("foo", 0x20)]));
        let hashes = Hashes::of(b"foo");
        let found = lookup_in_scope(
            &mut rtld,
            Some(asker),
            c"foo",
            None,
            &hashes,
            LookupFlags::empty(),
            &[asker, def],
        )
        .unwrap()
        .unwrap();
        assert_eq!(found.file, def);
        assert_eq!(rtld.file(asker).symbols_resolved_in, alloc::vec![def]);

        // resolving within the requester itself records nothing
        let own = rtld.insert_file(testutil::image(ctx, "own", 0x300000, &[("bar", 0x30)]));
        let hashes = Hashes::of(b"bar");
        lookup_in_scope(
            &mut rtld,
            Some(own),
            c"bar",
            None,
            &hashes,
            LookupFlags::empty(),
            &[own],
        )
        .unwrap()
        .unwrap();
        assert!(rtld.file(own).symbols_resolved_in.is_empty());
    }

    #[test]
    fn no_exec_skips_the_main_executable() {
        let (mut rtld, ctx) = testutil::engine();
        let exec = rtld.insert_file(testutil::image(ctx, "main", 0x100000, &[("stdin", 0x10)]));
        rtld.file_mut(exec).is_executable = true;
        let libc = rtld.insert_file(testutil::image(ctx, "libc", 0x200000, &[("stdin", 0x20)]));
        let hashes = Hashes::of(b"stdin");
        let found = lookup_in_scope(
            &mut rtld,
            None,
            c"stdin",
            None,
            &hashes,
            LookupFlags::NO_EXEC,
            &[exec, libc],
        )
        .unwrap()
        .unwrap();
        assert_eq!(found.file, libc);
    }

    #[test]
    fn policy_selects_scope_order() {
        let (mut rtld, ctx) = testutil::engine();
        let asker = rtld.insert_file(testutil::image(ctx, "asker", 0x100000, &[]));
        let global_def =
            rtld.insert_file(testutil::image(ctx, "global", 0x200000, &[("foo", 0x20)]));
        let local_def =
            rtld.insert_file(testutil::image(ctx, "local", 0x300000, &[("foo", 0x30)]));
        rtld.context_mut(ctx).global_scope = alloc::vec![global_def];
        rtld.file_mut(asker).local_scope = alloc::vec![asker, local_def];

        rtld.file_mut(asker).lookup_policy = LookupPolicy::GlobalThenLocal;
        let found = lookup(&mut rtld, asker, c"foo", None, LookupFlags::empty())
            .unwrap()
            .unwrap();
        assert_eq!(found.file, global_def);

        rtld.file_mut(asker).lookup_policy = LookupPolicy::LocalThenGlobal;
        let found = lookup(&mut rtld, asker, c"foo", None, LookupFlags::empty())
            .unwrap()
            .unwrap();
        assert_eq!(found.file, local_def);

        rtld.file_mut(asker).lookup_policy = LookupPolicy::LocalOnly;
        assert!(lookup(&mut rtld, asker, c"bar", None, LookupFlags::empty())
            .unwrap()
            .is_none());
    }

    #[test]
    fn one_versioned_definition_is_accepted_for_an_unversioned_request() {
        let (mut rtld, ctx) = testutil::engine();
        // a single non-base versioned definition and no perfect match
        let def = rtld.insert_file(testutil::image_with_versym(
            ctx,
            "libv",
            0x100000,
            &[("memcpy", 0x40)],
            alloc::vec![0, 2],
        ));
        let hashes = Hashes::of(b"memcpy");
        let found = lookup_in_scope(
            &mut rtld,
            None,
            c"memcpy",
            None,
            &hashes,
            LookupFlags::empty(),
            &[def],
        )
        .unwrap()
        .unwrap();
        assert_eq!(found.file, def);
    }

    #[test]
    fn two_versioned_definitions_fail_the_lookup() {
        let (mut rtld, ctx) = testutil::engine();
        // two non-base versioned definitions of the same name, no base
        // entry: nothing to pick between them
        let def = rtld.insert_file(testutil::image_with_versym(
            ctx,
            "libv",
            0x100000,
            &[("memcpy", 0x40), ("memcpy", 0x80)],
            alloc::vec![0, 2, 3],
        ));
        let hashes = Hashes::of(b"memcpy");
        let err = lookup_in_scope(
            &mut rtld,
            None,
            c"memcpy",
            None,
            &hashes,
            LookupFlags::empty(),
            &[def],
        )
        .unwrap_err();
        assert!(matches!(err, Error::ScopeAmbiguous { .. }));
    }
}
