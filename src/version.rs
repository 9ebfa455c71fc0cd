//! Symbol version matching.
//!
//! A lookup optionally carries a version requirement: the version name, the
//! library expected to define it, and the SysV hash of the version name.
//! Candidates are graded [`VersionMatch::Perfect`], [`VersionMatch::Ambiguous`]
//! (acceptable only if it stays unique within a scope) or
//! [`VersionMatch::Bad`].

use crate::arch::{ElfVerdaux, ElfVerdef, ElfVerneed, ElfVernaux};
use crate::arch::{VER_NDX_BASE, VER_NDX_LOCAL, VERSYM_HIDDEN};
use crate::hash::sysv_hash;
use crate::symbol::SymbolTable;
use core::ffi::CStr;

/// A version requirement attached to a lookup.
#[derive(Clone, Copy, Debug)]
pub struct VersionRef<'a> {
    /// Version name, e.g. `GLIBC_2.2.5`.
    pub name: &'a CStr,
    /// The library the requirement names, when known (from verneed).
    pub file: Option<&'a CStr>,
    /// SysV hash of `name`.
    pub hash: u32,
}

impl<'a> VersionRef<'a> {
    /// Build a requirement from a bare version name (the `dl_vsym` path).
    pub fn new(name: &'a CStr, file: Option<&'a CStr>) -> VersionRef<'a> {
        VersionRef {
            name,
            file,
            hash: sysv_hash(name.to_bytes()),
        }
    }
}

/// Grade of one candidate symbol against a requirement.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VersionMatch {
    /// Versions agree; the candidate wins immediately.
    Perfect,
    /// Versioned definition met by an unversioned request; acceptable only
    /// if it is the single such candidate in the scope.
    Ambiguous,
    /// Versions disagree; the candidate is skipped.
    Bad,
}

/// Grade the candidate at `sym_idx` of the defining file against `req`.
///
/// `same_file` is true when the defining file is the requester itself;
/// local and hidden definitions are only visible in that case. `def_name`
/// is the defining file's display name, used to detect the impossible case
/// of a requirement naming a file that carries no version info at all.
pub(crate) fn symbol_version_matches(
    def: &SymbolTable,
    def_name: &CStr,
    same_file: bool,
    req: Option<&VersionRef<'_>>,
    sym_idx: usize,
) -> VersionMatch {
    let Some(req) = req else {
        // No requirement on the lookup side.
        let Some(ver_index) = def.versym(sym_idx) else {
            // No version info on either side: plain name match rules.
            return VersionMatch::Perfect;
        };
        if ver_index & VERSYM_HIDDEN != 0 && !same_file {
            // hidden definitions never satisfy outside references
            return VersionMatch::Bad;
        }
        if ver_index & !VERSYM_HIDDEN == VER_NDX_BASE {
            return VersionMatch::Perfect;
        }
        // A versioned definition may still satisfy us if no base
        // definition shows up, so report it as ambiguous and let the scope
        // walk decide.
        return VersionMatch::Ambiguous;
    };

    let Some(ver_index) = def.versym(sym_idx) else {
        // We have a requirement but the defining file has no version info.
        // Sanity check: the requirement must not name this very file.
        if let Some(req_file) = req.file {
            assert!(
                req_file != def_name,
                "required version does not exist in the object the requirement names"
            );
        }
        return VersionMatch::Perfect;
    };

    if ver_index == VER_NDX_LOCAL {
        // local definition, only visible from its own file
        return if same_file {
            VersionMatch::Perfect
        } else {
            VersionMatch::Bad
        };
    }
    if ver_index & VERSYM_HIDDEN != 0 && !same_file {
        log::debug!("hidden symbol rejected");
        return VersionMatch::Bad;
    }
    let ver_index = ver_index & !VERSYM_HIDDEN;

    // First the version definitions of the defining file...
    if let Some((verdef, num)) = def.verdef {
        let mut cur = verdef as *const ElfVerdef;
        for _ in 0..num {
            let vd = unsafe { &*cur };
            assert!(vd.vd_version == 1, "invalid Verdef version number");
            if vd.vd_ndx == ver_index && vd.vd_hash == req.hash {
                let aux = unsafe { &*((cur as usize + vd.vd_aux as usize) as *const ElfVerdaux) };
                if def.strtab().get_cstr(aux.vda_name as usize) == req.name {
                    return VersionMatch::Perfect;
                }
            }
            if vd.vd_next == 0 {
                break;
            }
            cur = (cur as usize + vd.vd_next as usize) as *const ElfVerdef;
        }
    }

    // ...then its version requirements. A definition can satisfy a
    // reference through a version the defining file itself only requires.
    if let Some((verneed, num)) = def.verneed {
        let mut cur = verneed as *const ElfVerneed;
        for _ in 0..num {
            let vn = unsafe { &*cur };
            assert!(vn.vn_version == 1, "invalid Verneed version number");
            let mut aux = (cur as usize + vn.vn_aux as usize) as *const ElfVernaux;
            for _ in 0..vn.vn_cnt {
                let vna = unsafe { &*aux };
                if vna.vna_other & !VERSYM_HIDDEN == ver_index && vna.vna_hash == req.hash {
                    if def.strtab().get_cstr(vna.vna_name as usize) == req.name {
                        return VersionMatch::Perfect;
                    }
                }
                if vna.vna_next == 0 {
                    break;
                }
                aux = (aux as usize + vna.vna_next as usize) as *const ElfVernaux;
            }
            if vn.vn_next == 0 {
                break;
            }
            cur = (cur as usize + vn.vn_next as usize) as *const ElfVerneed;
        }
    }

    VersionMatch::Bad
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::ElfSymbol;
    use crate::hash::HashTable;
    use crate::symbol::ElfStringTable;
    use alloc::boxed::Box;
    use alloc::vec;

    #[repr(C)]
    struct VerdefPair {
        vd: ElfVerdef,
        aux: ElfVerdaux,
    }

    #[repr(C)]
    struct VerneedPair {
        vn: ElfVerneed,
        aux: ElfVernaux,
    }

    // strtab: offset 1 = "VER_1", offset 7 = "libv.so"
    const STRTAB: &[u8] = b"\0VER_1\0libv.so\0";

    fn table(versym: Vec<u16>, verdef: Option<&'static VerdefPair>, verneed: Option<&'static VerneedPair>) -> SymbolTable {
        let symtab: &'static mut [ElfSymbol] =
            Box::leak(vec![unsafe { core::mem::zeroed() }; versym.len().max(1)].into_boxed_slice());
        let versym: &'static [u16] = Box::leak(versym.into_boxed_slice());
        SymbolTable {
            hashtab: HashTable::Absent,
            symtab: symtab.as_ptr(),
            strtab: ElfStringTable::new(STRTAB.as_ptr()),
            versym: if versym.is_empty() {
                None
            } else {
                Some(versym.as_ptr())
            },
            verdef: verdef.map(|pair| (pair as *const VerdefPair as usize, 1)),
            verneed: verneed.map(|pair| (pair as *const VerneedPair as usize, 1)),
        }
    }

    fn verdef_pair(ndx: u16, name_off: u32, hash: u32) -> &'static VerdefPair {
        Box::leak(Box::new(VerdefPair {
            vd: ElfVerdef {
                vd_version: 1,
                vd_flags: 0,
                vd_ndx: ndx,
                vd_cnt: 1,
                vd_hash: hash,
                vd_aux: core::mem::size_of::<ElfVerdef>() as u32,
                vd_next: 0,
            },
            aux: ElfVerdaux {
                vda_name: name_off,
                vda_next: 0,
            },
        }))
    }

    fn verneed_pair(other: u16, name_off: u32, hash: u32) -> &'static VerneedPair {
        Box::leak(Box::new(VerneedPair {
            vn: ElfVerneed {
                vn_version: 1,
                vn_cnt: 1,
                vn_file: 7,
                vn_aux: core::mem::size_of::<ElfVerneed>() as u32,
                vn_next: 0,
            },
            aux: ElfVernaux {
                vna_hash: hash,
                vna_flags: 0,
                vna_other: other,
                vna_name: name_off,
                vna_next: 0,
            },
        }))
    }

    fn req() -> VersionRef<'static> {
        VersionRef::new(c"VER_1", None)
    }

    #[test]
    fn unversioned_on_both_sides_is_perfect() {
        let def = table(vec![], None, None);
        assert_eq!(
            symbol_version_matches(&def, c"libv.so", false, None, 0),
            VersionMatch::Perfect
        );
    }

    #[test]
    fn base_definition_satisfies_unversioned_request() {
        let def = table(vec![VER_NDX_BASE, 2], None, None);
        assert_eq!(
            symbol_version_matches(&def, c"libv.so", false, None, 0),
            VersionMatch::Perfect
        );
        // a non-base definition is only ambiguous, not a match
        assert_eq!(
            symbol_version_matches(&def, c"libv.so", false, None, 1),
            VersionMatch::Ambiguous
        );
    }

    #[test]
    fn hidden_definitions_stay_inside_their_file() {
        let def = table(vec![2 | VERSYM_HIDDEN], None, None);
        assert_eq!(
            symbol_version_matches(&def, c"libv.so", false, None, 0),
            VersionMatch::Bad
        );
        assert_eq!(
            symbol_version_matches(&def, c"libv.so", true, None, 0),
            VersionMatch::Ambiguous
        );
        let req = req();
        assert_eq!(
            symbol_version_matches(&def, c"libv.so", false, Some(&req), 0),
            VersionMatch::Bad
        );
    }

    #[test]
    fn local_index_binds_only_within_the_file() {
        let def = table(vec![VER_NDX_LOCAL], None, None);
        let req = req();
        assert_eq!(
            symbol_version_matches(&def, c"libv.so", true, Some(&req), 0),
            VersionMatch::Perfect
        );
        assert_eq!(
            symbol_version_matches(&def, c"libv.so", false, Some(&req), 0),
            VersionMatch::Bad
        );
    }

    #[test]
    fn verdef_matches_by_hash_and_name() {
        let req = req();
        let good = table(vec![2], Some(verdef_pair(2, 1, req.hash)), None);
        assert_eq!(
            symbol_version_matches(&good, c"libv.so", false, Some(&req), 0),
            VersionMatch::Perfect
        );
        // same index, different version hash
        let bad = table(vec![2], Some(verdef_pair(2, 1, req.hash ^ 1)), None);
        assert_eq!(
            symbol_version_matches(&bad, c"libv.so", false, Some(&req), 0),
            VersionMatch::Bad
        );
        // index mismatch between versym and verdef
        let bad = table(vec![3], Some(verdef_pair(2, 1, req.hash)), None);
        assert_eq!(
            symbol_version_matches(&bad, c"libv.so", false, Some(&req), 0),
            VersionMatch::Bad
        );
    }

    #[test]
    fn verneed_of_the_defining_file_can_satisfy_a_request() {
        let req = req();
        let def = table(vec![4], None, Some(verneed_pair(4, 1, req.hash)));
        assert_eq!(
            symbol_version_matches(&def, c"libv.so", false, Some(&req), 0),
            VersionMatch::Perfect
        );
    }

    #[test]
    fn versionless_file_satisfies_any_request() {
        let def = table(vec![], None, None);
        let req = req();
        assert_eq!(
            symbol_version_matches(&def, c"other.so", false, Some(&req), 0),
            VersionMatch::Perfect
        );
    }
}
