use crate::{
    cannon::{Hint, Preimage, PAGE_SIZE},
    error::VmError,
    interpreters::mips::{interpreter::InstructionParts, witness::Env},
    preimage_oracle::PreImageOracleT,
    state::State,
};
use std::io;

/// Test program counter: the start of the second page.
pub(crate) const PC_START: u64 = PAGE_SIZE;

pub(crate) const TEST_HEAP_START: u64 = 0x1_0000_0000;

/// Serves the same preimage for every key.
pub(crate) struct StaticOracle {
    data: Vec<u8>,
}

impl StaticOracle {
    pub(crate) fn new(data: Vec<u8>) -> Self {
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

pub(crate) fn dummy_env() -> Env<StaticOracle> {
    let state = State::create_initial(PC_START, TEST_HEAP_START);
    Env::create(
        state,
        StaticOracle::new(b"hello world".to_vec()),
        Box::new(io::sink()),
        Box::new(io::sink()),
    )
}

/// Write an encoded instruction at the current instruction pointer.
pub(crate) fn write_instruction(env: &mut Env<StaticOracle>, instruction_parts: InstructionParts) {
    let pc = env.state.current_thread().cpu.pc;
    env.state
        .memory
        .set_u32(pc, instruction_parts.encode())
        .unwrap();
}

pub(crate) fn write_instruction_at(env: &mut Env<StaticOracle>, addr: u64, insn: u32) {
    env.state.memory.set_u32(addr, insn).unwrap();
}

/// Step once without witness production and panic on VM errors.
pub(crate) fn step(env: &mut Env<StaticOracle>) {
    env.step(false).unwrap();
}
