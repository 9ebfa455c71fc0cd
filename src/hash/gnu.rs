//! GNU hash table: bloom filter, buckets, and hash-terminated chains.

/// Header structure for GNU ELF hash tables
///
/// This structure represents the header of a GNU hash table, which
/// contains metadata about the table structure and layout.
#[repr(C)]
struct ElfGnuHeader {
    /// Number of bucket entries.
    nbucket: u32,
    /// Index of the first symbol covered by the table.
    symbias: u32,
    /// Number of bloom filter words.
    nbloom: u32,
    /// Shift count for the second bloom bit.
    nshift: u32,
}

/// A parsed GNU hash table
///
/// The table uses a bloom filter for fast negative lookups, buckets to
/// start a chain walk, and per-symbol hash chains terminated by a low
/// stop bit.
pub(crate) struct ElfGnuHash {
    /// Hash table header containing metadata.
    header: ElfGnuHeader,
    /// Pointer to the bloom filter array.
    blooms: *const usize,
    /// Pointer to the bucket array.
    buckets: *const u32,
    /// Pointer to the chain array.
    chains: *const u32,
}

impl ElfGnuHash {
    /// Parse a GNU hash table from raw memory
    ///
    /// # Arguments
    /// * `ptr` - Pointer to the mapped hash table data
    ///
    /// # Returns
    /// An ElfGnuHash instance representing the parsed table
    pub(crate) fn parse(ptr: *const u8) -> ElfGnuHash {
        const HEADER_SIZE: usize = core::mem::size_of::<ElfGnuHeader>();
        let mut bytes = [0u8; HEADER_SIZE];
        bytes.copy_from_slice(unsafe { core::slice::from_raw_parts(ptr, HEADER_SIZE) });
        let header: ElfGnuHeader = unsafe { core::mem::transmute(bytes) };

        let bloom_size = header.nbloom as usize * core::mem::size_of::<usize>();
        let bucket_size = header.nbucket as usize * core::mem::size_of::<u32>();

        let blooms = unsafe { ptr.add(HEADER_SIZE) };
        let buckets = unsafe { blooms.add(bloom_size) };
        let chains = unsafe { buckets.add(bucket_size) };

        ElfGnuHash {
            header,
            blooms: blooms.cast(),
            buckets: buckets.cast(),
            chains: chains.cast(),
        }
    }

    /// Get the number of dynamic symbols covered by the table
    ///
    /// The GNU table stores no symbol count; it is recovered by finding
    /// the highest bucket entry and walking its chain to the stop bit.
    ///
    /// # Returns
    /// The number of symbols in the symbol table
    pub(crate) fn count_syms(&self) -> usize {
        let mut nsym = 0;
        for i in 0..self.header.nbucket as usize {
            nsym = nsym.max(unsafe { self.buckets.add(i).read() as usize });
        }
        if nsym > 0 {
            unsafe {
                let mut val = self.chains.add(nsym - self.header.symbias as usize);
                while val.read() & 1 == 0 {
                    nsym += 1;
                    val = val.add(1);
                }
            }
        }
        nsym + 1
    }

    /// Start a chain walk for a hash value
    ///
    /// Tests the bloom filter first, then reads the bucket.
    ///
    /// # Arguments
    /// * `hash` - The GNU hash of the queried name
    ///
    /// # Returns
    /// * `Some((index, cursor))` - The first symbol index on the chain and
    ///   the chain cursor to continue from
    /// * `None` - If the bloom filter or the bucket rules the name out
    pub(crate) fn chain_start(&self, hash: u32) -> Option<(usize, *const u32)> {
        const NATIVE_BITS: u32 = usize::BITS;
        let bloom_idx = (hash / NATIVE_BITS) as usize % self.header.nbloom as usize;
        let word = unsafe { self.blooms.add(bloom_idx).read() };
        let bit1 = 1usize << (hash % NATIVE_BITS);
        let bit2 = 1usize << ((hash >> self.header.nshift) % NATIVE_BITS);
        if word & bit1 == 0 || word & bit2 == 0 {
            return None;
        }
        let chain = unsafe {
            self.buckets
                .add(hash as usize % self.header.nbucket as usize)
                .read()
        } as usize;
        if chain == 0 {
            return None;
        }
        let cur_hash = unsafe { self.chains.add(chain - self.header.symbias as usize) };
        Some((chain, cur_hash))
    }
}

/// Walks one GNU hash chain, yielding every symbol index whose stored hash
/// matches the query (the low bit is the end-of-chain marker and is
/// ignored for comparison).
pub(crate) struct GnuChainIter {
    hash: u32,
    current: usize,
    cur_hash: Option<*const u32>,
}

impl GnuChainIter {
    /// Create a chain iterator for one query
    ///
    /// # Arguments
    /// * `table` - The GNU hash table to walk
    /// * `hash` - The GNU hash of the queried name
    ///
    /// # Returns
    /// A new GnuChainIter instance; it yields nothing when the bloom
    /// filter already rejected the name
    pub(crate) fn new(table: &ElfGnuHash, hash: u32) -> GnuChainIter {
        match table.chain_start(hash) {
            Some((current, cur_hash)) => GnuChainIter {
                hash,
                current,
                cur_hash: Some(cur_hash),
            },
            None => GnuChainIter {
                hash,
                current: 0,
                cur_hash: None,
            },
        }
    }
}

impl Iterator for GnuChainIter {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        loop {
            let cur_hash = self.cur_hash?;
            let chain_hash = unsafe { cur_hash.read() };
            let index = self.current;

            // advance, remembering whether this was the last entry
            if chain_hash & 1 == 1 {
                self.cur_hash = None;
            } else {
                self.cur_hash = Some(unsafe { cur_hash.add(1) });
                self.current += 1;
            }

            if chain_hash | 1 == self.hash | 1 {
                return Some(index);
            }
        }
    }
}
