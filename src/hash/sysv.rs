//! Traditional SysV ELF hash table.

/// A parsed SysV hash table
///
/// Layout is `nbucket, nchain, bucket[nbucket], chain[nchain]`; both
/// arrays hold symbol table indices and index zero terminates a chain.
pub(crate) struct ElfSysvHash {
    /// Number of bucket entries.
    nbucket: u32,
    /// Number of chain entries, equal to the symbol count.
    nchain: u32,
    /// Pointer to the bucket array.
    buckets: *const u32,
    /// Pointer to the chain array.
    chains: *const u32,
}

impl ElfSysvHash {
    /// Parse a SysV hash table from raw memory
    ///
    /// # Arguments
    /// * `ptr` - Pointer to the mapped hash table data
    ///
    /// # Returns
    /// An ElfSysvHash instance representing the parsed table
    pub(crate) fn parse(ptr: *const u32) -> ElfSysvHash {
        unsafe {
            let nbucket = ptr.read();
            let nchain = ptr.add(1).read();
            ElfSysvHash {
                nbucket,
                nchain,
                buckets: ptr.add(2),
                chains: ptr.add(2 + nbucket as usize),
            }
        }
    }

    /// Get the number of symbols in the symbol table
    ///
    /// The chain array is exactly as long as the symbol table, so the
    /// count is stored directly in the header.
    ///
    /// # Returns
    /// The number of symbols in the symbol table
    #[inline]
    pub(crate) fn count_syms(&self) -> usize {
        self.nchain as usize
    }

    /// Get the first symbol index for a hash value
    ///
    /// # Arguments
    /// * `hash` - The SysV hash of the queried name
    ///
    /// # Returns
    /// The symbol index starting the chain, zero when the bucket is empty
    #[inline]
    fn bucket(&self, hash: u32) -> usize {
        unsafe {
            self.buckets
                .add(hash as usize % self.nbucket as usize)
                .read() as usize
        }
    }

    /// Get the chain successor of a symbol index
    ///
    /// # Arguments
    /// * `idx` - The current symbol index
    ///
    /// # Returns
    /// The next symbol index on the chain, zero at the end
    #[inline]
    fn chain(&self, idx: usize) -> usize {
        unsafe { self.chains.add(idx).read() as usize }
    }
}

/// Walks one SysV hash chain, yielding every symbol index on it. Name
/// comparison happens in the caller; the SysV table stores no hashes to
/// pre-filter on.
pub(crate) struct SysvChainIter<'tab> {
    table: &'tab ElfSysvHash,
    current: usize,
}

impl<'tab> SysvChainIter<'tab> {
    /// Create a chain iterator for one query
    ///
    /// # Arguments
    /// * `table` - The SysV hash table to walk
    /// * `hash` - The SysV hash of the queried name
    ///
    /// # Returns
    /// A new SysvChainIter instance starting at the bucket for `hash`
    pub(crate) fn new(table: &'tab ElfSysvHash, hash: u32) -> SysvChainIter<'tab> {
        SysvChainIter {
            table,
            current: table.bucket(hash),
        }
    }
}

impl Iterator for SysvChainIter<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        let index = self.current;
        if index == 0 {
            return None;
        }
        self.current = self.table.chain(index);
        Some(index)
    }
}
