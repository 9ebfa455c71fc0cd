//! Per-file symbol table access: string table, hash-driven candidate
//! iteration, and the versym/verneed/verdef side tables.

use crate::arch::{ElfSymbol, VERSYM_HIDDEN};
use crate::dynamic::ElfDynamic;
use crate::hash::gnu::GnuChainIter;
use crate::hash::sysv::SysvChainIter;
use crate::hash::{HashTable, Hashes};
use crate::version::VersionRef;
use core::ffi::CStr;

/// ELF string table wrapper
///
/// This structure provides access to the string table of a mapped file,
/// which holds null-terminated strings for symbol names, needed-library
/// names and version names.
pub(crate) struct ElfStringTable {
    /// Pointer to the raw string table data in memory.
    data: *const u8,
}

impl ElfStringTable {
    /// Create a new string table wrapper from a raw pointer
    ///
    /// # Arguments
    /// * `data` - Pointer to the string table data in memory
    ///
    /// # Returns
    /// A new ElfStringTable instance
    pub(crate) const fn new(data: *const u8) -> Self {
        ElfStringTable { data }
    }

    /// Get a C-style string from the table at the specified offset
    ///
    /// # Arguments
    /// * `offset` - Byte offset within the string table where the string
    ///   starts
    ///
    /// # Returns
    /// A static reference to the C-style string at the specified offset
    #[inline]
    pub(crate) fn get_cstr(&self, offset: usize) -> &'static CStr {
        unsafe { CStr::from_ptr(self.data.add(offset).cast()) }
    }

    /// Get a Rust string slice from the table at the specified offset
    ///
    /// # Arguments
    /// * `offset` - Byte offset within the string table where the string
    ///   starts
    ///
    /// # Returns
    /// A static reference to the string at the specified offset
    #[inline]
    pub(crate) fn get_str(&self, offset: usize) -> &'static str {
        unsafe { core::str::from_utf8_unchecked(self.get_cstr(offset).to_bytes()) }
    }
}

/// Symbol table of one mapped file
///
/// This structure bundles the hash table used for lookup, the dynamic
/// symbol table itself, the string table for names, and the optional
/// symbol versioning side tables.
pub struct SymbolTable {
    /// Hash table for symbol lookup (.gnu.hash or .hash).
    pub(crate) hashtab: HashTable,
    /// Pointer to the symbol table (.dynsym).
    pub(crate) symtab: *const ElfSymbol,
    /// String table for symbol names (.dynstr).
    pub(crate) strtab: ElfStringTable,
    /// .gnu.version: one index per dynamic symbol.
    pub(crate) versym: Option<*const u16>,
    /// .gnu.version_d: address and entry count.
    pub(crate) verdef: Option<(usize, usize)>,
    /// .gnu.version_r: address and entry count.
    pub(crate) verneed: Option<(usize, usize)>,
}

impl SymbolTable {
    /// Create a symbol table from ELF dynamic section information
    ///
    /// # Arguments
    /// * `dynamic` - Reference to the parsed dynamic section
    ///
    /// # Returns
    /// A new SymbolTable instance
    pub(crate) fn from_dynamic(dynamic: &ElfDynamic) -> Self {
        SymbolTable {
            hashtab: HashTable::from_dynamic(dynamic),
            symtab: dynamic.symtab as *const ElfSymbol,
            strtab: ElfStringTable::new(dynamic.strtab as *const u8),
            versym: dynamic.versym.map(|addr| addr.get() as *const u16),
            verdef: dynamic.verdef.map(|(addr, num)| (addr.get(), num.get())),
            verneed: dynamic.verneed.map(|(addr, num)| (addr.get(), num.get())),
        }
    }

    /// Get a reference to the string table
    ///
    /// # Returns
    /// A reference to the string table
    #[inline]
    pub(crate) fn strtab(&self) -> &ElfStringTable {
        &self.strtab
    }

    /// Get the symbol record at an index
    ///
    /// # Arguments
    /// * `idx` - The index of the symbol to retrieve
    ///
    /// # Returns
    /// A static reference to the symbol record
    #[inline]
    pub(crate) fn symbol(&self, idx: usize) -> &'static ElfSymbol {
        unsafe { &*self.symtab.add(idx) }
    }

    /// Get the name of the symbol at an index
    ///
    /// # Arguments
    /// * `idx` - The index of the symbol
    ///
    /// # Returns
    /// A static reference to the C-style symbol name
    #[inline]
    pub(crate) fn symbol_name(&self, idx: usize) -> &'static CStr {
        self.strtab.get_cstr(self.symbol(idx).st_name())
    }

    /// Get the versym entry of the symbol at an index
    ///
    /// # Arguments
    /// * `idx` - The index of the symbol
    ///
    /// # Returns
    /// * `Some(versym)` - The raw versym value, hidden bit included
    /// * `None` - If the file carries no versym table
    #[inline]
    pub(crate) fn versym(&self, idx: usize) -> Option<u16> {
        self.versym.map(|v| unsafe { v.add(idx).read() })
    }

    /// Get the number of dynamic symbols reachable through the hash table
    ///
    /// # Returns
    /// The number of symbols in the symbol table
    #[inline]
    pub(crate) fn count_syms(&self) -> usize {
        self.hashtab.count_syms()
    }

    /// Get the version this file requires for its *undefined* reference
    /// at an index
    ///
    /// The versym entry names the requirement; the matching verneed aux
    /// entry carries its name, the library expected to define it, and the
    /// precomputed hash. Used when relocating, to attach the requirement
    /// to the lookup.
    ///
    /// # Arguments
    /// * `idx` - The index of the undefined symbol
    ///
    /// # Returns
    /// * `Some(requirement)` - The version requirement for the reference
    /// * `None` - If the reference is unversioned or carries the base
    ///   version
    pub(crate) fn requirement(&self, idx: usize) -> Option<VersionRef<'static>> {
        let ver = self.versym(idx)? & !VERSYM_HIDDEN;
        if ver <= crate::arch::VER_NDX_BASE {
            return None;
        }
        let (verneed, num) = self.verneed?;
        let mut cur = verneed as *const crate::arch::ElfVerneed;
        for _ in 0..num {
            let vn = unsafe { &*cur };
            let mut aux =
                (cur as usize + vn.vn_aux as usize) as *const crate::arch::ElfVernaux;
            for _ in 0..vn.vn_cnt {
                let vna = unsafe { &*aux };
                if vna.vna_other & !VERSYM_HIDDEN == ver {
                    return Some(VersionRef {
                        name: self.strtab.get_cstr(vna.vna_name as usize),
                        file: Some(self.strtab.get_cstr(vn.vn_file as usize)),
                        hash: vna.vna_hash,
                    });
                }
                if vna.vna_next == 0 {
                    break;
                }
                aux = (aux as usize + vna.vna_next as usize) as *const crate::arch::ElfVernaux;
            }
            if vn.vn_next == 0 {
                break;
            }
            cur = (cur as usize + vn.vn_next as usize) as *const crate::arch::ElfVerneed;
        }
        None
    }

    /// Iterate the *defined* symbols matching a query name
    ///
    /// Candidates come out in hash-chain order; undefined entries and
    /// entries with other names are filtered away.
    ///
    /// # Arguments
    /// * `name` - The queried symbol name
    /// * `hashes` - Precomputed hash values of `name`
    ///
    /// # Returns
    /// An iterator yielding the symbol table index of every candidate
    pub(crate) fn candidates<'tab, 'n>(
        &'tab self,
        name: &'n CStr,
        hashes: &Hashes,
    ) -> Candidates<'tab, 'n> {
        let chain = match &self.hashtab {
            HashTable::Gnu(gnu) => CandidateChain::Gnu(GnuChainIter::new(gnu, hashes.gnu)),
            HashTable::Sysv(sysv) => {
                CandidateChain::Sysv(SysvChainIter::new(sysv, hashes.sysv))
            }
            HashTable::Absent => CandidateChain::Absent,
        };
        Candidates {
            chain,
            table: self,
            name,
        }
    }
}

enum CandidateChain<'tab> {
    Gnu(GnuChainIter),
    Sysv(SysvChainIter<'tab>),
    Absent,
}

/// Iterator over the defined symbols of one file whose name equals the
/// query.
pub(crate) struct Candidates<'tab, 'n> {
    chain: CandidateChain<'tab>,
    table: &'tab SymbolTable,
    name: &'n CStr,
}

impl Iterator for Candidates<'_, '_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        loop {
            let idx = match &mut self.chain {
                CandidateChain::Gnu(iter) => iter.next()?,
                CandidateChain::Sysv(iter) => iter.next()?,
                CandidateChain::Absent => return None,
            };
            let sym = self.table.symbol(idx);
            if sym.st_name() != 0
                && !sym.is_undef()
                && self.table.symbol_name(idx) == self.name
            {
                return Some(idx);
            }
        }
    }
}
