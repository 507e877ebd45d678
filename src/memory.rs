//! Paged, lazily-Merkleized memory.
//!
//! The address space is a sparse mapping from page index to 4096-byte pages.
//! Each page is merkleized over its 128 32-byte chunks (depth 7), and a
//! binary keccak256 tree of depth 27 commits to all page roots. Node hashes
//! are cached and invalidated root-ward on every write, then recomputed
//! lazily when a root or proof is requested.

use crate::{
    cannon::{
        Page, PAGE_ADDRESS_MASK, PAGE_ADDRESS_SIZE, PAGE_KEY_MASK, PAGE_KEY_SIZE, PAGE_SIZE,
    },
    error::VmError,
    keccak256_pair,
};
use once_cell::sync::Lazy;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::{collections::HashMap, io::Read};

/// Depth of the per-page tree: 4096 bytes = 128 chunks of 32 bytes.
const PAGE_DEPTH: usize = 7;

/// Total tree depth from a 32-byte chunk up to the memory root.
const TREE_DEPTH: usize = PAGE_DEPTH + PAGE_KEY_SIZE as usize;

/// Entries in a memory Merkle proof: the leaf page root plus one sibling per
/// page-tree level.
pub const MEM_PROOF_LEN: usize = PAGE_KEY_SIZE as usize + 1;

pub type MemoryProof = [[u8; 32]; MEM_PROOF_LEN];

/// `ZERO_HASHES[i]` is the root of an all-zero subtree of height `i` above
/// the 32-byte chunk level. A zero page hashes to `ZERO_HASHES[PAGE_DEPTH]`,
/// empty memory to `ZERO_HASHES[TREE_DEPTH]`.
static ZERO_HASHES: Lazy<[[u8; 32]; TREE_DEPTH + 1]> = Lazy::new(|| {
    let mut hashes = [[0u8; 32]; TREE_DEPTH + 1];
    for i in 1..=TREE_DEPTH {
        hashes[i] = keccak256_pair(&hashes[i - 1], &hashes[i - 1]);
    }
    hashes
});

// Zero hash for a tree node at `depth` levels below the memory root.
fn zero_hash_at(depth: u64) -> [u8; 32] {
    ZERO_HASHES[TREE_DEPTH - depth as usize]
}

#[derive(Clone)]
struct CachedPage {
    data: [u8; PAGE_SIZE as usize],
    /// Merkle root over the page's 32-byte chunks, recomputed when stale.
    root: Option<[u8; 32]>,
}

impl CachedPage {
    fn new() -> Self {
        CachedPage {
            data: [0u8; PAGE_SIZE as usize],
            root: None,
        }
    }

    fn merkle_root(&mut self) -> [u8; 32] {
        if let Some(root) = self.root {
            return root;
        }
        let mut level: Vec<[u8; 32]> = self
            .data
            .chunks_exact(32)
            .map(|c| {
                let mut chunk = [0u8; 32];
                chunk.copy_from_slice(c);
                chunk
            })
            .collect();
        while level.len() > 1 {
            level = level
                .chunks_exact(2)
                .map(|pair| keccak256_pair(&pair[0], &pair[1]))
                .collect();
        }
        self.root = Some(level[0]);
        level[0]
    }
}

/// The VM's paged address space.
///
/// Reads from unmapped addresses return zero without allocating; writes
/// allocate the covering page and invalidate the cached hashes on the path
/// to the root.
#[derive(Clone)]
pub struct Memory {
    pages: HashMap<u64, CachedPage>,
    /// Cached internal nodes of the page tree, keyed by generalized index.
    /// `None` marks a node whose children exist but whose hash is stale;
    /// an absent entry is an empty subtree.
    nodes: HashMap<u64, Option<[u8; 32]>>,
}

impl Memory {
    pub fn new() -> Self {
        Memory {
            pages: HashMap::new(),
            nodes: HashMap::new(),
        }
    }

    /// Page key of an address. Address bits above the covered 2^39-byte range
    /// are masked off; they never reach the page table or the tree.
    fn page_key(addr: u64) -> u64 {
        (addr >> PAGE_ADDRESS_SIZE) & PAGE_KEY_MASK
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    fn alloc_page(&mut self, page_key: u64) -> &mut CachedPage {
        let mut gindex = (1 << PAGE_KEY_SIZE) | page_key;
        while gindex > 1 {
            gindex >>= 1;
            self.nodes.insert(gindex, None);
        }
        self.pages.entry(page_key).or_insert_with(CachedPage::new)
    }

    // Mark the page and every node on its path to the root as stale.
    fn invalidate_page(&mut self, page_key: u64) {
        match self.pages.get_mut(&page_key) {
            Some(page) => {
                if page.root.is_none() {
                    // Already stale, so the path to the root is stale too.
                    return;
                }
                page.root = None;
            }
            None => return,
        }
        let mut gindex = (1 << PAGE_KEY_SIZE) | page_key;
        while gindex > 1 {
            gindex >>= 1;
            self.nodes.insert(gindex, None);
        }
    }

    fn merkleize_subtree(&mut self, gindex: u64) -> [u8; 32] {
        let depth = 63 - gindex.leading_zeros() as u64;
        if depth == PAGE_KEY_SIZE {
            let page_key = gindex & PAGE_KEY_MASK;
            return match self.pages.get_mut(&page_key) {
                Some(page) => page.merkle_root(),
                None => zero_hash_at(depth),
            };
        }
        match self.nodes.get(&gindex) {
            None => return zero_hash_at(depth),
            Some(Some(hash)) => return *hash,
            Some(None) => (),
        }
        let left = self.merkleize_subtree(gindex << 1);
        let right = self.merkleize_subtree((gindex << 1) | 1);
        let hash = keccak256_pair(&left, &right);
        self.nodes.insert(gindex, Some(hash));
        hash
    }

    /// Root commitment over all populated pages.
    pub fn merkle_root(&mut self) -> [u8; 32] {
        self.merkleize_subtree(1)
    }

    /// Merkle proof for the page covering `addr`: the page root followed by
    /// the 27 sibling hashes bottom-up.
    pub fn merkle_proof(&mut self, addr: u64) -> MemoryProof {
        let page_key = Self::page_key(addr);
        let mut proof = [[0u8; 32]; MEM_PROOF_LEN];
        proof[0] = match self.pages.get_mut(&page_key) {
            Some(page) => page.merkle_root(),
            None => zero_hash_at(PAGE_KEY_SIZE),
        };
        let mut gindex = (1 << PAGE_KEY_SIZE) | page_key;
        for sibling in proof.iter_mut().skip(1) {
            *sibling = self.merkleize_subtree(gindex ^ 1);
            gindex >>= 1;
        }
        proof
    }

    /// Read the aligned 4-byte big-endian word at `addr`.
    pub fn get_u32(&self, addr: u64) -> Result<u32, VmError> {
        if addr & 3 != 0 {
            return Err(VmError::UnalignedAccess { addr, size: 4 });
        }
        let page_key = Self::page_key(addr);
        let offset = (addr & PAGE_ADDRESS_MASK) as usize;
        match self.pages.get(&page_key) {
            Some(page) => {
                let word: [u8; 4] = page.data[offset..offset + 4].try_into().unwrap();
                Ok(u32::from_be_bytes(word))
            }
            None => Ok(0),
        }
    }

    /// Write the aligned 4-byte big-endian word at `addr`.
    pub fn set_u32(&mut self, addr: u64, value: u32) -> Result<(), VmError> {
        if addr & 3 != 0 {
            return Err(VmError::UnalignedAccess { addr, size: 4 });
        }
        let page_key = Self::page_key(addr);
        let offset = (addr & PAGE_ADDRESS_MASK) as usize;
        if self.pages.contains_key(&page_key) {
            self.invalidate_page(page_key);
        } else {
            self.alloc_page(page_key);
        }
        let page = self.pages.get_mut(&page_key).unwrap();
        page.data[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
        Ok(())
    }

    /// Read the aligned 8-byte big-endian word at `addr`.
    pub fn get_u64(&self, addr: u64) -> Result<u64, VmError> {
        if addr & 7 != 0 {
            return Err(VmError::UnalignedAccess { addr, size: 8 });
        }
        let hi = self.get_u32(addr)?;
        let lo = self.get_u32(addr + 4)?;
        Ok(((hi as u64) << 32) | lo as u64)
    }

    /// Write the aligned 8-byte big-endian word at `addr`.
    pub fn set_u64(&mut self, addr: u64, value: u64) -> Result<(), VmError> {
        if addr & 7 != 0 {
            return Err(VmError::UnalignedAccess { addr, size: 8 });
        }
        self.set_u32(addr, (value >> 32) as u32)?;
        self.set_u32(addr + 4, value as u32)
    }

    /// Stream `reader` into memory starting at `addr`, allocating pages as
    /// needed. Byte-granular; crosses page boundaries.
    pub fn set_range(&mut self, addr: u64, reader: &mut impl Read) -> Result<(), VmError> {
        let mut addr = addr;
        loop {
            let page_key = Self::page_key(addr);
            let offset = (addr & PAGE_ADDRESS_MASK) as usize;
            if self.pages.contains_key(&page_key) {
                self.invalidate_page(page_key);
            } else {
                self.alloc_page(page_key);
            }
            let page = self.pages.get_mut(&page_key).unwrap();
            let n = reader.read(&mut page.data[offset..])?;
            if n == 0 {
                return Ok(());
            }
            addr += n as u64;
        }
    }

    /// Copy `len` bytes starting at `addr` out of memory, zero-filling holes.
    /// Never allocates.
    pub fn read_range(&self, addr: u64, len: u64) -> Vec<u8> {
        let mut out = Vec::with_capacity(len as usize);
        let mut addr = addr;
        let mut remaining = len;
        while remaining > 0 {
            let page_key = Self::page_key(addr);
            let offset = (addr & PAGE_ADDRESS_MASK) as usize;
            let in_page = std::cmp::min(remaining, PAGE_SIZE - offset as u64) as usize;
            match self.pages.get(&page_key) {
                Some(page) => out.extend_from_slice(&page.data[offset..offset + in_page]),
                None => out.extend(std::iter::repeat(0u8).take(in_page)),
            }
            addr += in_page as u64;
            remaining -= in_page as u64;
        }
        out
    }
}

impl Default for Memory {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Memory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Memory")
            .field("pages", &self.pages.len())
            .finish()
    }
}

// The snapshot format stores memory as the ordered list of populated pages.
impl Serialize for Memory {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut pages: Vec<Page> = self
            .pages
            .iter()
            .map(|(index, page)| Page {
                index: *index,
                data: page.data.to_vec(),
            })
            .collect();
        pages.sort_by_key(|p| p.index);
        pages.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Memory {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let pages: Vec<Page> = Deserialize::deserialize(deserializer)?;
        let mut memory = Memory::new();
        for page in pages {
            let cached = memory.alloc_page(page.index & PAGE_KEY_MASK);
            cached.data.copy_from_slice(&page.data);
        }
        Ok(memory)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cannon::HEAP_START;

    // Recompute the root from a proof, the way a verifier would.
    fn proof_root(proof: &MemoryProof, addr: u64) -> [u8; 32] {
        let mut acc = proof[0];
        let mut gindex = (1 << PAGE_KEY_SIZE) | Memory::page_key(addr);
        for sibling in proof.iter().skip(1) {
            acc = if gindex & 1 == 1 {
                keccak256_pair(sibling, &acc)
            } else {
                keccak256_pair(&acc, sibling)
            };
            gindex >>= 1;
        }
        acc
    }

    #[test]
    fn read_unmapped_returns_zero_without_allocating() {
        let memory = Memory::new();
        assert_eq!(memory.get_u32(0x1000).unwrap(), 0);
        assert_eq!(memory.get_u64(0xdead_0000).unwrap(), 0);
        assert_eq!(memory.page_count(), 0);
    }

    #[test]
    fn word_roundtrip() {
        let mut memory = Memory::new();
        memory.set_u32(0x100, 0xdead_beef).unwrap();
        assert_eq!(memory.get_u32(0x100).unwrap(), 0xdead_beef);
        memory.set_u64(0x200, 0x0123_4567_89ab_cdef).unwrap();
        assert_eq!(memory.get_u64(0x200).unwrap(), 0x0123_4567_89ab_cdef);
        // big-endian layout
        assert_eq!(memory.get_u32(0x200).unwrap(), 0x0123_4567);
        assert_eq!(memory.get_u32(0x204).unwrap(), 0x89ab_cdef);
    }

    #[test]
    fn unaligned_access_fails() {
        let mut memory = Memory::new();
        assert!(memory.get_u32(0x101).is_err());
        assert!(memory.set_u32(0x102, 1).is_err());
        assert!(memory.get_u64(0x104).is_err());
        assert!(memory.set_u64(0x104, 1).is_err());
    }

    #[test]
    fn empty_root_matches_zero_ladder() {
        let mut memory = Memory::new();
        assert_eq!(memory.merkle_root(), ZERO_HASHES[TREE_DEPTH]);
    }

    #[test]
    fn writing_zero_allocates_but_preserves_root() {
        let mut memory = Memory::new();
        let empty = memory.merkle_root();
        memory.set_u32(0x4000, 0).unwrap();
        assert_eq!(memory.page_count(), 1);
        assert_eq!(memory.merkle_root(), empty);
    }

    #[test]
    fn root_changes_on_write_and_is_stable() {
        let mut memory = Memory::new();
        let empty = memory.merkle_root();
        memory.set_u32(0x1000, 42).unwrap();
        let root = memory.merkle_root();
        assert_ne!(root, empty);
        assert_eq!(memory.merkle_root(), root);
        // overwriting with the same value keeps the root
        memory.set_u32(0x1000, 42).unwrap();
        assert_eq!(memory.merkle_root(), root);
        // reverting the write restores the empty root
        memory.set_u32(0x1000, 0).unwrap();
        assert_eq!(memory.merkle_root(), empty);
    }

    #[test]
    fn proof_recomputes_root() {
        let mut memory = Memory::new();
        memory.set_u32(0x1000, 0xaabb_ccdd).unwrap();
        memory.set_u32(0x8000_0000, 1).unwrap();
        let root = memory.merkle_root();
        for addr in [0x1000u64, 0x8000_0000, 0x42_0000 /* unmapped */] {
            let proof = memory.merkle_proof(addr);
            assert_eq!(proof_root(&proof, addr), root, "addr {addr:#x}");
        }
    }

    #[test]
    fn heap_addresses_are_masked_into_tree_range() {
        let mut memory = Memory::new();
        memory.set_u32(HEAP_START, 7).unwrap();
        assert_eq!(memory.get_u32(HEAP_START).unwrap(), 7);
        let root = memory.merkle_root();
        let proof = memory.merkle_proof(HEAP_START);
        assert_eq!(proof_root(&proof, HEAP_START), root);
    }

    #[test]
    fn set_range_crosses_pages() {
        let mut memory = Memory::new();
        let data: Vec<u8> = (0..PAGE_SIZE + 100).map(|i| (i % 255) as u8).collect();
        memory.set_range(PAGE_SIZE - 50, &mut &data[..]).unwrap();
        assert_eq!(memory.page_count(), 3);
        assert_eq!(memory.read_range(PAGE_SIZE - 50, data.len() as u64), data);
    }

    #[test]
    fn read_range_zero_fills_holes() {
        let mut memory = Memory::new();
        memory.set_u32(PAGE_SIZE, 0x0102_0304).unwrap();
        let out = memory.read_range(PAGE_SIZE - 4, 12);
        assert_eq!(out, vec![0, 0, 0, 0, 1, 2, 3, 4, 0, 0, 0, 0]);
        // the hole before the page was not allocated
        assert_eq!(memory.page_count(), 1);
    }

    #[test]
    fn randomized_writes_keep_proofs_consistent() {
        use rand::{Rng, SeedableRng};

        let mut rng = rand::rngs::StdRng::seed_from_u64(42);
        let mut memory = Memory::new();
        let mut touched = Vec::new();
        for _ in 0..200 {
            let addr = (rng.gen_range(0u64..1 << 30)) & !3;
            memory.set_u32(addr, rng.gen()).unwrap();
            touched.push(addr);
        }
        let root = memory.merkle_root();
        for addr in touched {
            let proof = memory.merkle_proof(addr);
            assert_eq!(proof_root(&proof, addr), root, "addr {addr:#x}");
        }
    }

    #[test]
    fn serde_roundtrip() {
        let mut memory = Memory::new();
        memory.set_u32(0x1000, 0xdead_beef).unwrap();
        memory.set_u64(0x7000, 0x1122_3344_5566_7788).unwrap();
        let root = memory.merkle_root();
        let json = serde_json::to_string(&memory).unwrap();
        let mut decoded: Memory = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.page_count(), memory.page_count());
        assert_eq!(decoded.get_u32(0x1000).unwrap(), 0xdead_beef);
        assert_eq!(decoded.merkle_root(), root);
    }
}
