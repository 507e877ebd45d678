//! A single-step, bit-exact emulator of a 64-bit multithreaded MIPS
//! instruction set, whose every reachable state is committed to a keccak256
//! Merkle root so that any individual step can be re-executed and checked
//! witness-against-witness by an independent verifier.

/// Constants and data structures shared with the Cannon state format.
pub mod cannon;

pub mod cli;

/// A module to load ELF files into an initial VM state.
pub mod elf_loader;

pub mod error;

pub mod interpreters;

/// Paged, lazily-Merkleized memory.
pub mod memory;

/// Preimage oracle interface used by the VM.
pub mod preimage_oracle;

/// The global multithreaded VM state.
pub mod state;

/// Per-thread state and the thread hash onion.
pub mod thread;

pub mod utils;

/// State-witness encoding and hashing.
pub mod witness;

use sha3::{Digest, Keccak256};

/// keccak256 of `data`, the hash underlying every commitment in the VM.
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// keccak256 of the concatenation of two 32-byte nodes.
pub fn keccak256_pair(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}
