//! The global multithreaded VM state and its canonical witness encoding.
//!
//! Threads live on two ordered stacks. The concatenation of the two stacks,
//! bottom to top with the right stack reversed, is the logical thread order;
//! the current thread is the top of whichever stack `traverse_right` points
//! at. The field names and JSON layout stay compatible with the Cannon
//! snapshot format.

use crate::{
    cannon::{deserialize_preimage_key, serialize_preimage_key, FUTEX_EMPTY_ADDR},
    memory::Memory,
    thread::{
        compute_thread_stack_root, CpuScalars, ThreadState, SERIALIZED_THREAD_SIZE,
        THREAD_WITNESS_SIZE,
    },
    witness::{state_hash_from_witness, FpvmState, StateWitness, STATE_WITNESS_SIZE},
};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct State {
    pub memory: Memory,

    #[serde(
        rename = "preimageKey",
        deserialize_with = "deserialize_preimage_key",
        serialize_with = "serialize_preimage_key"
    )]
    pub preimage_key: [u8; 32],
    /// Offset into the length-prefixed preimage stream; includes the 8-byte
    /// prefix.
    #[serde(rename = "preimageOffset")]
    pub preimage_offset: u64,

    /// Next address handed out by zero-address `mmap`.
    pub heap: u64,

    #[serde(rename = "exit")]
    pub exit_code: u8,
    pub exited: bool,

    pub step: u64,
    #[serde(rename = "stepsSinceLastContextSwitch")]
    pub steps_since_last_context_switch: u64,
    /// Futex address being woken, or `FUTEX_EMPTY_ADDR` when no wakeup
    /// traversal is in progress.
    pub wakeup: u64,

    #[serde(rename = "traverseRight")]
    pub traverse_right: bool,
    #[serde(rename = "leftThreadStack")]
    pub left_thread_stack: Vec<ThreadState>,
    #[serde(rename = "rightThreadStack")]
    pub right_thread_stack: Vec<ThreadState>,
    #[serde(rename = "nextThreadId")]
    pub next_thread_id: u64,

    /// Optional metadata: the last (possibly incomplete) buffered pre-image
    /// hint, so a VM can restart from any state and replay it on setup.
    /// Not part of the witnessed state.
    #[serde(
        rename = "lastHint",
        default,
        skip_serializing_if = "Option::is_none",
        serialize_with = "serialize_opt_hex",
        deserialize_with = "deserialize_opt_hex"
    )]
    pub last_hint: Option<Vec<u8>>,
}

fn serialize_opt_hex<S>(v: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match v {
        Some(bytes) => serializer.serialize_str(&format!("0x{}", hex::encode(bytes))),
        None => serializer.serialize_none(),
    }
}

fn deserialize_opt_hex<'de, D>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;
    let s: Option<String> = Deserialize::deserialize(deserializer)?;
    match s {
        None => Ok(None),
        Some(s) => hex::decode(s.strip_prefix("0x").unwrap_or(&s))
            .map(Some)
            .map_err(|e| D::Error::custom(format!("lastHint is not valid hex: {e}"))),
    }
}

impl State {
    /// A fresh state with a single thread (id 0) at pc 0.
    pub fn create_empty() -> Self {
        let init_thread = ThreadState::create_empty();
        let next_thread_id = init_thread.thread_id + 1;
        State {
            memory: Memory::new(),
            preimage_key: [0u8; 32],
            preimage_offset: 0,
            heap: 0,
            exit_code: 0,
            exited: false,
            step: 0,
            steps_since_last_context_switch: 0,
            wakeup: FUTEX_EMPTY_ADDR,
            traverse_right: false,
            left_thread_stack: vec![init_thread],
            right_thread_stack: vec![],
            next_thread_id,
            last_hint: None,
        }
    }

    /// The state an ELF loader starts from: entry point in `pc`, delay slot
    /// armed, heap at `heap_start`.
    pub fn create_initial(pc: u64, heap_start: u64) -> Self {
        let mut state = Self::create_empty();
        let thread = state.current_thread_mut();
        thread.cpu.pc = pc;
        thread.cpu.next_pc = pc + 4;
        state.heap = heap_start;
        state
    }

    pub fn active_thread_stack(&self) -> &Vec<ThreadState> {
        if self.traverse_right {
            &self.right_thread_stack
        } else {
            &self.left_thread_stack
        }
    }

    pub fn active_thread_stack_mut(&mut self) -> &mut Vec<ThreadState> {
        if self.traverse_right {
            &mut self.right_thread_stack
        } else {
            &mut self.left_thread_stack
        }
    }

    pub fn inactive_thread_stack_mut(&mut self) -> &mut Vec<ThreadState> {
        if self.traverse_right {
            &mut self.left_thread_stack
        } else {
            &mut self.right_thread_stack
        }
    }

    /// The currently scheduled thread: top of the active stack.
    pub fn current_thread(&self) -> &ThreadState {
        self.active_thread_stack()
            .last()
            .expect("Active thread stack is empty")
    }

    pub fn current_thread_mut(&mut self) -> &mut ThreadState {
        self.active_thread_stack_mut()
            .last_mut()
            .expect("Active thread stack is empty")
    }

    pub fn thread_count(&self) -> usize {
        self.left_thread_stack.len() + self.right_thread_stack.len()
    }

    pub fn get_cpu(&self) -> &CpuScalars {
        &self.current_thread().cpu
    }

    fn left_thread_stack_root(&self) -> [u8; 32] {
        compute_thread_stack_root(&self.left_thread_stack)
    }

    fn right_thread_stack_root(&self) -> [u8; 32] {
        compute_thread_stack_root(&self.right_thread_stack)
    }

    /// Witness of the current thread: its 322-byte serialization followed by
    /// the hash onion of the active stack without it.
    pub fn encode_thread_proof(&self) -> [u8; THREAD_WITNESS_SIZE] {
        let active_stack = self.active_thread_stack();
        let thread_count = active_stack.len();
        assert!(thread_count > 0, "Invalid empty thread stack");

        let active_thread = &active_stack[thread_count - 1];
        let other_threads = &active_stack[..thread_count - 1];

        let mut out = [0u8; THREAD_WITNESS_SIZE];
        out[..SERIALIZED_THREAD_SIZE].copy_from_slice(&active_thread.serialize_thread());
        out[SERIALIZED_THREAD_SIZE..].copy_from_slice(&compute_thread_stack_root(other_threads));
        out
    }
}

impl FpvmState for State {
    fn get_pc(&self) -> u64 {
        self.current_thread().cpu.pc
    }

    fn get_registers(&self) -> &[u64; 32] {
        &self.current_thread().registers
    }

    fn get_memory(&mut self) -> &mut Memory {
        &mut self.memory
    }

    fn get_exit_code(&self) -> u8 {
        self.exit_code
    }

    fn get_exited(&self) -> bool {
        self.exited
    }

    fn get_step(&self) -> u64 {
        self.step
    }

    fn encode_witness(&mut self) -> (StateWitness, [u8; 32]) {
        let mut out = Vec::with_capacity(STATE_WITNESS_SIZE);
        let mem_root = self.memory.merkle_root();
        out.extend_from_slice(&mem_root);
        out.extend_from_slice(&self.preimage_key);
        out.extend_from_slice(&self.preimage_offset.to_be_bytes());
        out.extend_from_slice(&self.heap.to_be_bytes());
        out.push(self.exit_code);
        out.push(self.exited as u8);

        out.extend_from_slice(&self.step.to_be_bytes());
        out.extend_from_slice(&self.steps_since_last_context_switch.to_be_bytes());
        out.extend_from_slice(&self.wakeup.to_be_bytes());

        out.push(self.traverse_right as u8);
        out.extend_from_slice(&self.left_thread_stack_root());
        out.extend_from_slice(&self.right_thread_stack_root());
        out.extend_from_slice(&self.next_thread_id.to_be_bytes());

        let witness: StateWitness = out.try_into().expect("state witness size is fixed");
        let hash = state_hash_from_witness(&witness);
        (witness, hash)
    }
}
