//! The two ELF symbol hash tables.
//!
//! Every file carries at most one of each; when both are present the GNU
//! table is used and the SysV table is ignored.

pub(crate) mod gnu;
pub(crate) mod sysv;

use crate::dynamic::{ElfDynamic, ElfDynamicHashTab};
use gnu::ElfGnuHash;
use sysv::ElfSysvHash;

/// Compute the SysV hash of a symbol name
///
/// This is the hash function from the ELF specification; the same values
/// are stored in Verdef/Vernaux entries for version names.
///
/// # Arguments
/// * `name` - The symbol name as a byte slice, without the terminator
///
/// # Returns
/// The computed hash value
pub(crate) fn sysv_hash(name: &[u8]) -> u32 {
    let mut h: u32 = 0;
    for byte in name {
        h = (h << 4).wrapping_add(u32::from(*byte));
        let g = h & 0xf000_0000;
        if g != 0 {
            h ^= g >> 24;
        }
        h &= !g;
    }
    h
}

/// Compute the GNU hash of a symbol name
///
/// This method implements the GNU hash algorithm (djb2 variant), which
/// provides good distribution properties.
///
/// # Arguments
/// * `name` - The symbol name as a byte slice, without the terminator
///
/// # Returns
/// The computed hash value
pub(crate) fn gnu_hash(name: &[u8]) -> u32 {
    let mut h: u32 = 5381;
    for byte in name {
        h = h.wrapping_mul(33).wrapping_add(u32::from(*byte));
    }
    h
}

/// Both hash values of one name, computed once per lookup and reused for
/// every file in the scope.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Hashes {
    pub sysv: u32,
    pub gnu: u32,
}

impl Hashes {
    /// Precompute both hash values of a query name
    ///
    /// # Arguments
    /// * `name` - The symbol name as a byte slice
    ///
    /// # Returns
    /// A new Hashes instance holding the SysV and GNU values
    pub(crate) fn of(name: &[u8]) -> Hashes {
        Hashes {
            sysv: sysv_hash(name),
            gnu: gnu_hash(name),
        }
    }
}

/// The hash table one file exposes for lookups.
pub(crate) enum HashTable {
    Gnu(ElfGnuHash),
    Sysv(ElfSysvHash),
    /// No hash table at all; lookups in this file never match.
    Absent,
}

impl HashTable {
    /// Create a hash table from ELF dynamic section information
    ///
    /// When the dynamic section names both tables, the GNU table wins.
    ///
    /// # Arguments
    /// * `dynamic` - Reference to the parsed dynamic section
    ///
    /// # Returns
    /// A new HashTable instance, [`HashTable::Absent`] when the file has
    /// neither table
    pub(crate) fn from_dynamic(dynamic: &ElfDynamic) -> HashTable {
        match dynamic.hashtab {
            Some(ElfDynamicHashTab::Gnu(addr)) => {
                HashTable::Gnu(ElfGnuHash::parse(addr as *const u8))
            }
            Some(ElfDynamicHashTab::Sysv(addr)) => {
                HashTable::Sysv(ElfSysvHash::parse(addr as *const u32))
            }
            None => HashTable::Absent,
        }
    }

    /// Get the number of dynamic symbols reachable through this table
    ///
    /// # Returns
    /// The number of symbols, zero for an absent table
    pub(crate) fn count_syms(&self) -> usize {
        match self {
            HashTable::Gnu(gnu) => gnu.count_syms(),
            HashTable::Sysv(sysv) => sysv.count_syms(),
            HashTable::Absent => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_values_match_the_reference_algorithms() {
        // reference values from the glibc implementations
        assert_eq!(gnu_hash(b""), 5381);
        assert_eq!(gnu_hash(b"printf"), 0x156b2bb8);
        assert_eq!(sysv_hash(b"printf"), 0x077a05a6);
        assert_eq!(gnu_hash(b"exit"), 0x7c967e3f);
        assert_eq!(sysv_hash(b"exit"), 0x0006cf04);
    }
}
