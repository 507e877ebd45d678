//! Helpers shared by the integration tests.
#![allow(dead_code)]

use mipsevm64::{
    cannon::{Hint, Preimage},
    error::VmError,
    interpreters::mips::witness::Env,
    preimage_oracle::PreImageOracleT,
    state::State,
};
use std::{
    io,
    sync::{Arc, Mutex},
};

/// The encoded `syscall` instruction.
pub const SYSCALL_INSN: u32 = 0x0000_000c;

/// Serves the same preimage for every key.
pub struct StaticOracle {
    data: Vec<u8>,
}

impl StaticOracle {
    pub fn new(data: Vec<u8>) -> Self {
        StaticOracle { data }
    }
}

impl PreImageOracleT for StaticOracle {
    fn get_preimage(&mut self, _key: [u8; 32]) -> Result<Preimage, VmError> {
        Ok(Preimage::create(self.data.clone()))
    }

    fn hint(&mut self, _hint: Hint) -> Result<(), VmError> {
        Ok(())
    }
}

/// An oracle that records delivered hints.
pub struct RecordingOracle {
    pub data: Vec<u8>,
    pub hints: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl PreImageOracleT for RecordingOracle {
    fn get_preimage(&mut self, _key: [u8; 32]) -> Result<Preimage, VmError> {
        Ok(Preimage::create(self.data.clone()))
    }

    fn hint(&mut self, hint: Hint) -> Result<(), VmError> {
        self.hints.lock().unwrap().push(hint.get());
        Ok(())
    }
}

/// A write sink whose contents the test can inspect afterwards.
#[derive(Clone, Default)]
pub struct SharedSink(pub Arc<Mutex<Vec<u8>>>);

impl io::Write for SharedSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl SharedSink {
    pub fn contents(&self) -> Vec<u8> {
        self.0.lock().unwrap().clone()
    }
}

pub fn env_with_oracle<PO: PreImageOracleT>(state: State, oracle: PO) -> Env<PO> {
    Env::create(
        state,
        oracle,
        Box::new(io::sink()),
        Box::new(io::sink()),
    )
}

pub fn env_from_state(state: State) -> Env<StaticOracle> {
    env_with_oracle(state, StaticOracle::new(b"hello world".to_vec()))
}

/// A state whose current thread is about to execute `syscall` with the given
/// `$v0` and `$a0..$a3`.
pub fn syscall_state(syscall_num: u64, args: [u64; 4]) -> State {
    let mut state = State::create_initial(0, 0x1_0000_0000);
    state.memory.set_u32(0, SYSCALL_INSN).unwrap();
    let thread = state.current_thread_mut();
    thread.registers[2] = syscall_num;
    thread.registers[4] = args[0];
    thread.registers[5] = args[1];
    thread.registers[6] = args[2];
    thread.registers[7] = args[3];
    state
}
