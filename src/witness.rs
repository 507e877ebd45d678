//! The canonical state-witness encoding and hashing rule. Every
//! implementation of the VM must reproduce these bytes exactly.

use crate::{
    error::VmError,
    keccak256,
    memory::Memory,
};
use serde::ser::{Serialize, SerializeStruct, Serializer};

/// Size of the state witness encoding in bytes.
pub const STATE_WITNESS_SIZE: usize = 179;

pub const MEMROOT_WITNESS_OFFSET: usize = 0;
pub const PREIMAGE_KEY_WITNESS_OFFSET: usize = MEMROOT_WITNESS_OFFSET + 32;
pub const PREIMAGE_OFFSET_WITNESS_OFFSET: usize = PREIMAGE_KEY_WITNESS_OFFSET + 32;
pub const HEAP_WITNESS_OFFSET: usize = PREIMAGE_OFFSET_WITNESS_OFFSET + 8;
pub const EXITCODE_WITNESS_OFFSET: usize = HEAP_WITNESS_OFFSET + 8;
pub const EXITED_WITNESS_OFFSET: usize = EXITCODE_WITNESS_OFFSET + 1;
pub const STEP_WITNESS_OFFSET: usize = EXITED_WITNESS_OFFSET + 1;
pub const STEPS_SINCE_CONTEXT_SWITCH_WITNESS_OFFSET: usize = STEP_WITNESS_OFFSET + 8;
pub const WAKEUP_WITNESS_OFFSET: usize = STEPS_SINCE_CONTEXT_SWITCH_WITNESS_OFFSET + 8;
pub const TRAVERSE_RIGHT_WITNESS_OFFSET: usize = WAKEUP_WITNESS_OFFSET + 8;
pub const LEFT_THREADS_ROOT_WITNESS_OFFSET: usize = TRAVERSE_RIGHT_WITNESS_OFFSET + 1;
pub const RIGHT_THREADS_ROOT_WITNESS_OFFSET: usize = LEFT_THREADS_ROOT_WITNESS_OFFSET + 32;
pub const THREAD_ID_WITNESS_OFFSET: usize = RIGHT_THREADS_ROOT_WITNESS_OFFSET + 32;

pub type StateWitness = [u8; STATE_WITNESS_SIZE];

/// Status byte of a state hash, derived from `(exited, exit_code)` so a
/// verifier can cheaply reject finalized states.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmStatus {
    Valid = 0,
    Invalid = 1,
    Panic = 2,
    Unfinished = 3,
}

pub fn vm_status(exited: bool, exit_code: u8) -> VmStatus {
    if !exited {
        return VmStatus::Unfinished;
    }
    match exit_code {
        0 => VmStatus::Valid,
        1 => VmStatus::Invalid,
        _ => VmStatus::Panic,
    }
}

/// keccak256 of the witness, with byte 0 overwritten by the VM status.
pub fn state_hash_from_witness(witness: &StateWitness) -> [u8; 32] {
    let mut hash = keccak256(witness);
    let exit_code = witness[EXITCODE_WITNESS_OFFSET];
    let exited = witness[EXITED_WITNESS_OFFSET];
    hash[0] = vm_status(exited == 1, exit_code) as u8;
    hash
}

/// Fallible variant for witnesses of unchecked length, e.g. read from disk.
pub fn state_hash_from_slice(witness: &[u8]) -> Result<[u8; 32], VmError> {
    let witness: &StateWitness =
        witness
            .try_into()
            .map_err(|_| VmError::WitnessSizeMismatch {
                expected: STATE_WITNESS_SIZE,
                got: witness.len(),
            })?;
    Ok(state_hash_from_witness(witness))
}

/// Capability set shared by every FPVM state flavor. The multithreaded state
/// is the one concrete implementation in this crate.
pub trait FpvmState {
    fn get_pc(&self) -> u64;
    fn get_registers(&self) -> &[u64; 32];
    fn get_memory(&mut self) -> &mut Memory;
    fn get_exit_code(&self) -> u8;
    fn get_exited(&self) -> bool;
    fn get_step(&self) -> u64;
    fn encode_witness(&mut self) -> (StateWitness, [u8; 32]);
    fn vm_status(&self) -> u8 {
        vm_status(self.get_exited(), self.get_exit_code()) as u8
    }
}

/// Everything a verifier needs to re-execute one step: the pre-state witness
/// and hash, the thread and memory proofs, and the preimage touched during
/// the step, if any.
#[derive(Debug, Clone, Default)]
pub struct StepWitness {
    pub state: Vec<u8>,
    pub state_hash: [u8; 32],
    /// Thread proof, instruction proof, and (if a data word was touched) the
    /// access proof, concatenated.
    pub proof_data: Vec<u8>,
    pub preimage_key: Option<[u8; 32]>,
    pub preimage_value: Option<Vec<u8>>,
    pub preimage_offset: Option<u64>,
}

impl StepWitness {
    pub fn has_preimage(&self) -> bool {
        self.preimage_key.is_some()
    }
}

// Proof dumps encode all byte fields as 0x-prefixed hex.
impl Serialize for StepWitness {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        fn hex0x(bytes: &[u8]) -> String {
            format!("0x{}", hex::encode(bytes))
        }
        let mut s = serializer.serialize_struct("StepWitness", 6)?;
        s.serialize_field("state", &hex0x(&self.state))?;
        s.serialize_field("stateHash", &hex0x(&self.state_hash))?;
        s.serialize_field("proofData", &hex0x(&self.proof_data))?;
        s.serialize_field("preimageKey", &self.preimage_key.map(|k| hex0x(&k)))?;
        s.serialize_field(
            "preimageValue",
            &self.preimage_value.as_ref().map(|v| hex0x(v)),
        )?;
        s.serialize_field("preimageOffset", &self.preimage_offset)?;
        s.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_byte() {
        assert_eq!(vm_status(false, 0), VmStatus::Unfinished);
        assert_eq!(vm_status(false, 42), VmStatus::Unfinished);
        assert_eq!(vm_status(true, 0), VmStatus::Valid);
        assert_eq!(vm_status(true, 1), VmStatus::Invalid);
        assert_eq!(vm_status(true, 2), VmStatus::Panic);
        assert_eq!(vm_status(true, 255), VmStatus::Panic);
    }

    #[test]
    fn hash_embeds_status() {
        let mut witness = [0u8; STATE_WITNESS_SIZE];
        let hash = state_hash_from_witness(&witness);
        assert_eq!(hash[0], VmStatus::Unfinished as u8);

        witness[EXITED_WITNESS_OFFSET] = 1;
        witness[EXITCODE_WITNESS_OFFSET] = 1;
        let hash = state_hash_from_witness(&witness);
        assert_eq!(hash[0], VmStatus::Invalid as u8);
        // the rest of the hash is untouched keccak output
        let raw = keccak256(&witness);
        assert_eq!(&hash[1..], &raw[1..]);
    }

    #[test]
    fn slice_hash_rejects_bad_length() {
        assert!(state_hash_from_slice(&[0u8; 178]).is_err());
        assert!(state_hash_from_slice(&[0u8; STATE_WITNESS_SIZE]).is_ok());
    }

    #[test]
    fn witness_field_offsets() {
        assert_eq!(THREAD_ID_WITNESS_OFFSET + 8, STATE_WITNESS_SIZE);
        assert_eq!(EXITCODE_WITNESS_OFFSET, 80);
        assert_eq!(EXITED_WITNESS_OFFSET, 81);
        assert_eq!(STEP_WITNESS_OFFSET, 82);
        assert_eq!(WAKEUP_WITNESS_OFFSET, 98);
        assert_eq!(LEFT_THREADS_ROOT_WITNESS_OFFSET, 107);
        assert_eq!(RIGHT_THREADS_ROOT_WITNESS_OFFSET, 139);
    }
}
