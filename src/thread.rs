//! Per-thread state: CPU scalars, general-purpose registers and futex
//! bookkeeping, plus the canonical 322-byte serialization and the hash onion
//! committing to a thread stack.

use crate::{cannon::FUTEX_EMPTY_ADDR, keccak256, keccak256_pair};
use serde::{Deserialize, Serialize};

/// Size of a serialized thread in bytes.
pub const SERIALIZED_THREAD_SIZE: usize = 322;

/// Size of a thread witness: the serialized active thread concatenated with
/// the hash onion of the active stack without that thread.
pub const THREAD_WITNESS_SIZE: usize = SERIALIZED_THREAD_SIZE + 32;

/// Starting root of the thread hash onion: `keccak256(bytes32(0) ++ bytes32(0))`.
pub const EMPTY_THREADS_ROOT: [u8; 32] = [
    0xad, 0x32, 0x28, 0xb6, 0x76, 0xf7, 0xd3, 0xcd, 0x42, 0x84, 0xa5, 0x44, 0x3f, 0x17, 0xf1,
    0x96, 0x2b, 0x36, 0xe4, 0x91, 0xb3, 0x0a, 0x40, 0xb2, 0x40, 0x58, 0x49, 0xe5, 0x97, 0xba,
    0x5f, 0xb5,
];

/// The four per-thread CPU scalars. `next_pc` tracks the delay-slot
/// successor of `pc`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuScalars {
    pub pc: u64,
    #[serde(rename = "nextPC")]
    pub next_pc: u64,
    pub lo: u64,
    pub hi: u64,
}

/// One scheduled unit of the VM.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ThreadState {
    #[serde(rename = "threadId")]
    pub thread_id: u64,
    #[serde(rename = "exit")]
    pub exit_code: u8,
    pub exited: bool,
    #[serde(rename = "futexAddr")]
    pub futex_addr: u64,
    #[serde(rename = "futexVal")]
    pub futex_val: u64,
    #[serde(rename = "futexTimeoutStep")]
    pub futex_timeout_step: u64,
    pub cpu: CpuScalars,
    pub registers: [u64; 32],
}

impl ThreadState {
    /// A fresh thread with id 0 and `next_pc = 4`, not waiting on any futex.
    pub fn create_empty() -> Self {
        ThreadState {
            thread_id: 0,
            exit_code: 0,
            exited: false,
            futex_addr: FUTEX_EMPTY_ADDR,
            futex_val: 0,
            futex_timeout_step: 0,
            cpu: CpuScalars {
                pc: 0,
                next_pc: 4,
                lo: 0,
                hi: 0,
            },
            registers: [0u64; 32],
        }
    }

    /// Canonical big-endian serialization, in field order.
    pub fn serialize_thread(&self) -> [u8; SERIALIZED_THREAD_SIZE] {
        let mut out = [0u8; SERIALIZED_THREAD_SIZE];
        out[0..8].copy_from_slice(&self.thread_id.to_be_bytes());
        out[8] = self.exit_code;
        out[9] = self.exited as u8;
        out[10..18].copy_from_slice(&self.futex_addr.to_be_bytes());
        out[18..26].copy_from_slice(&self.futex_val.to_be_bytes());
        out[26..34].copy_from_slice(&self.futex_timeout_step.to_be_bytes());
        out[34..42].copy_from_slice(&self.cpu.pc.to_be_bytes());
        out[42..50].copy_from_slice(&self.cpu.next_pc.to_be_bytes());
        out[50..58].copy_from_slice(&self.cpu.lo.to_be_bytes());
        out[58..66].copy_from_slice(&self.cpu.hi.to_be_bytes());
        for (i, reg) in self.registers.iter().enumerate() {
            out[66 + i * 8..74 + i * 8].copy_from_slice(&reg.to_be_bytes());
        }
        out
    }
}

/// One layer of the thread hash onion:
/// `root' = keccak256(root ++ keccak256(serialize(thread)))`.
pub fn compute_thread_root(prev_stack_root: [u8; 32], thread: &ThreadState) -> [u8; 32] {
    let hashed_thread = keccak256(&thread.serialize_thread());
    keccak256_pair(&prev_stack_root, &hashed_thread)
}

/// Hash onion over a whole stack, bottom to top.
pub fn compute_thread_stack_root(stack: &[ThreadState]) -> [u8; 32] {
    stack
        .iter()
        .fold(EMPTY_THREADS_ROOT, |root, thread| {
            compute_thread_root(root, thread)
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_threads_root_constant() {
        assert_eq!(keccak256(&[0u8; 64]), EMPTY_THREADS_ROOT);
    }

    #[test]
    fn serialized_thread_layout() {
        let mut thread = ThreadState::create_empty();
        thread.thread_id = 0x0102_0304_0506_0708;
        thread.exit_code = 0x2a;
        thread.exited = true;
        thread.futex_addr = 0x1000;
        thread.futex_val = 77;
        thread.futex_timeout_step = 99;
        thread.cpu.pc = 0x4000;
        thread.cpu.next_pc = 0x4004;
        thread.cpu.lo = 1;
        thread.cpu.hi = 2;
        thread.registers[2] = 0xdead_beef;
        thread.registers[31] = 0xffff_ffff_ffff_ffff;

        let bytes = thread.serialize_thread();
        assert_eq!(bytes.len(), SERIALIZED_THREAD_SIZE);
        assert_eq!(&bytes[0..8], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(bytes[8], 0x2a);
        assert_eq!(bytes[9], 1);
        assert_eq!(&bytes[10..18], &0x1000u64.to_be_bytes());
        assert_eq!(&bytes[34..42], &0x4000u64.to_be_bytes());
        assert_eq!(&bytes[66 + 2 * 8..66 + 3 * 8], &0xdead_beefu64.to_be_bytes());
        assert_eq!(&bytes[66 + 31 * 8..], &[0xff; 8]);
    }

    #[test]
    fn onion_order_matters() {
        let mut a = ThreadState::create_empty();
        a.thread_id = 1;
        let mut b = ThreadState::create_empty();
        b.thread_id = 2;

        let ab = compute_thread_stack_root(&[a.clone(), b.clone()]);
        let ba = compute_thread_stack_root(&[b.clone(), a.clone()]);
        assert_ne!(ab, ba);

        // folding manually gives the same root
        let manual = compute_thread_root(compute_thread_root(EMPTY_THREADS_ROOT, &a), &b);
        assert_eq!(ab, manual);
    }

    #[test]
    fn empty_stack_root() {
        assert_eq!(compute_thread_stack_root(&[]), EMPTY_THREADS_ROOT);
    }
}
