//! The environment the virtual machine state uses to transition: the owned
//! [`State`], the injected output sinks and preimage oracle, and the
//! per-step witness bookkeeping. One call to [`Env::step`] drives one
//! instruction, one syscall, or one scheduler tick to completion.

use crate::{
    cannon::{FUTEX_EMPTY_ADDR, SCHED_QUANTUM},
    error::VmError,
    interpreters::mips::interpreter::{self, sign_extend},
    memory::{MemoryProof, MEM_PROOF_LEN},
    preimage_oracle::{PreImageOracleT, TrackingPreimageOracle},
    state::State,
    thread::THREAD_WITNESS_SIZE,
    witness::{FpvmState, StepWitness},
};
use log::debug;
use std::io::Write;

pub struct Env<PO: PreImageOracleT> {
    pub state: State,
    pub preimage_oracle: TrackingPreimageOracle<PO>,

    pub std_out: Box<dyn Write>,
    pub std_err: Box<dyn Write>,

    /// Whether memory accesses of the current step are proven.
    pub(crate) mem_proof_enabled: bool,
    /// The one data address the current step touched, if any.
    pub(crate) last_mem_access: Option<u64>,
    pub(crate) mem_proof: Option<MemoryProof>,
}

impl<PO: PreImageOracleT> Env<PO> {
    pub fn create(
        state: State,
        preimage_oracle: PO,
        std_out: Box<dyn Write>,
        std_err: Box<dyn Write>,
    ) -> Self {
        Env {
            state,
            preimage_oracle: TrackingPreimageOracle::new(preimage_oracle),
            std_out,
            std_err,
            mem_proof_enabled: false,
            last_mem_access: None,
            mem_proof: None,
        }
    }

    /// Execute a single step of the program, optionally producing the
    /// pre-step access witness.
    pub fn step(&mut self, produce_witness: bool) -> Result<Option<StepWitness>, VmError> {
        self.preimage_oracle.reset();
        self.mem_proof_enabled = produce_witness;
        self.last_mem_access = None;
        self.mem_proof = None;

        let mut witness = if produce_witness {
            // Commit to the pre-state before performing the transition.
            let thread_proof = self.state.encode_thread_proof();
            let pc = self.state.current_thread().cpu.pc;
            let insn_proof = self.state.memory.merkle_proof(pc);
            let (state_witness, state_hash) = self.state.encode_witness();

            let mut proof_data =
                Vec::with_capacity(THREAD_WITNESS_SIZE + 2 * MEM_PROOF_LEN * 32);
            proof_data.extend_from_slice(&thread_proof);
            for node in insn_proof.iter() {
                proof_data.extend_from_slice(node);
            }
            Some(StepWitness {
                state: state_witness.to_vec(),
                state_hash,
                proof_data,
                ..Default::default()
            })
        } else {
            None
        };

        self.inner_step()?;

        if let Some(witness) = witness.as_mut() {
            if let Some(mem_proof) = self.mem_proof.take() {
                for node in mem_proof.iter() {
                    witness.proof_data.extend_from_slice(node);
                }
            }
            let (key, value, offset) = self.preimage_oracle.last_preimage();
            if let Some(offset) = offset {
                witness.preimage_key = Some(key);
                witness.preimage_value = Some(value.to_vec());
                witness.preimage_offset = Some(offset);
            }
        }

        Ok(witness)
    }

    fn inner_step(&mut self) -> Result<(), VmError> {
        if self.state.exited {
            return Ok(());
        }
        self.state.step += 1;

        // A wakeup traversal skips threads until it reaches one blocked on
        // the wakeup address, or has cycled through every thread.
        if self.state.wakeup != FUTEX_EMPTY_ADDR {
            if self.state.wakeup == self.state.current_thread().futex_addr {
                // Found a waiter; the futex check below decides whether it
                // actually resumes.
                self.state.wakeup = FUTEX_EMPTY_ADDR;
            } else {
                let traversing_right = self.state.traverse_right;
                let changed_directions = self.preempt_thread();
                if traversing_right && changed_directions {
                    // Walked all the way right without finding a waiter.
                    self.state.wakeup = FUTEX_EMPTY_ADDR;
                }
                return Ok(());
            }
        }

        if self.state.current_thread().exited {
            self.pop_thread();
            return Ok(());
        }

        let thread = self.state.current_thread();
        if thread.futex_addr != FUTEX_EMPTY_ADDR {
            let futex_addr = thread.futex_addr;
            let futex_val = thread.futex_val;
            let futex_timeout_step = thread.futex_timeout_step;
            self.track_mem_access(futex_addr)?;
            let mem = self.state.memory.get_u32(futex_addr)? as u64;
            if futex_val == mem {
                if self.state.step >= futex_timeout_step {
                    self.on_wait_complete(true);
                } else {
                    self.preempt_thread();
                }
            } else {
                self.on_wait_complete(false);
            }
            return Ok(());
        }

        if self.state.steps_since_last_context_switch >= SCHED_QUANTUM {
            if self.state.thread_count() > 1 {
                debug!(
                    "step {}: thread {} hit the scheduler quantum",
                    self.state.step,
                    self.state.current_thread().thread_id
                );
            }
            self.preempt_thread();
            return Ok(());
        }
        self.state.steps_since_last_context_switch += 1;

        // instruction fetch
        let pc = self.state.current_thread().cpu.pc;
        let insn = self.state.memory.get_u32(pc)?;
        let instr = interpreter::decode(insn, pc)?;
        interpreter::interpret_instruction(self, instr, insn)
    }

    /// Move the current thread to the other stack and reset the context
    /// switch counter. Returns whether the traversal changed direction.
    pub(crate) fn preempt_thread(&mut self) -> bool {
        let thread = self
            .state
            .active_thread_stack_mut()
            .pop()
            .expect("Active thread stack is empty");
        self.state.inactive_thread_stack_mut().push(thread);
        let changed_directions = self.state.active_thread_stack().is_empty();
        if changed_directions {
            self.state.traverse_right = !self.state.traverse_right;
        }
        self.state.steps_since_last_context_switch = 0;
        changed_directions
    }

    /// Drop an exited thread from the active stack. Counts as a context
    /// switch: a different thread is current afterwards.
    fn pop_thread(&mut self) {
        self.state
            .active_thread_stack_mut()
            .pop()
            .expect("Active thread stack is empty");
        if self.state.active_thread_stack().is_empty() {
            self.state.traverse_right = !self.state.traverse_right;
        }
        self.state.steps_since_last_context_switch = 0;
    }

    /// Complete a blocked `futex_wait`: clear the futex fields and deliver
    /// the syscall return value.
    fn on_wait_complete(&mut self, timed_out: bool) {
        use crate::cannon::{MIPS_ETIMEDOUT, SYS_ERROR_SIGNAL};

        let thread = self.state.current_thread_mut();
        thread.futex_addr = FUTEX_EMPTY_ADDR;
        thread.futex_val = 0;
        thread.futex_timeout_step = 0;

        let (v0, v1) = if timed_out {
            (SYS_ERROR_SIGNAL, MIPS_ETIMEDOUT)
        } else {
            (0, 0)
        };
        self.handle_syscall_updates(v0, v1);
    }

    /// Deliver a syscall result and advance past the `syscall` instruction.
    pub(crate) fn handle_syscall_updates(&mut self, v0: u64, v1: u64) {
        let thread = self.state.current_thread_mut();
        thread.registers[2] = v0;
        thread.registers[7] = v1;
        thread.cpu.pc = thread.cpu.next_pc;
        thread.cpu.next_pc = thread.cpu.next_pc.wrapping_add(4);
    }

    pub fn read_register(&self, index: u32) -> u64 {
        self.state.current_thread().registers[index as usize]
    }

    /// Register 0 reads as zero and ignores writes.
    pub fn write_register(&mut self, index: u32, value: u64) {
        if index != 0 {
            self.state.current_thread_mut().registers[index as usize] = value;
        }
    }

    pub(crate) fn advance_pc(&mut self) {
        let cpu = &mut self.state.current_thread_mut().cpu;
        cpu.pc = cpu.next_pc;
        cpu.next_pc = cpu.next_pc.wrapping_add(4);
    }

    /// Write `value` to `rd` and retire the instruction.
    pub(crate) fn handle_rd(&mut self, rd: u32, value: u64) {
        self.write_register(rd, value);
        self.advance_pc();
    }

    pub(crate) fn handle_branch(&mut self, should_branch: bool, insn: u32) -> Result<(), VmError> {
        let cpu = &mut self.state.current_thread_mut().cpu;
        if cpu.next_pc != cpu.pc.wrapping_add(4) {
            return Err(VmError::BranchInDelaySlot { pc: cpu.pc });
        }
        let prev_pc = cpu.pc;
        // execute the delay slot first
        cpu.pc = cpu.next_pc;
        if should_branch {
            let offset = sign_extend((insn & 0xffff) as u64, 16) << 2;
            cpu.next_pc = prev_pc.wrapping_add(4).wrapping_add(offset);
        } else {
            cpu.next_pc = cpu.next_pc.wrapping_add(4);
        }
        Ok(())
    }

    pub(crate) fn handle_jump(
        &mut self,
        link_reg: Option<u32>,
        dest: u64,
    ) -> Result<(), VmError> {
        let cpu = &mut self.state.current_thread_mut().cpu;
        if cpu.next_pc != cpu.pc.wrapping_add(4) {
            return Err(VmError::BranchInDelaySlot { pc: cpu.pc });
        }
        let prev_pc = cpu.pc;
        cpu.pc = cpu.next_pc;
        cpu.next_pc = dest;
        if let Some(reg) = link_reg {
            self.write_register(reg, prev_pc.wrapping_add(8));
        }
        Ok(())
    }

    /// Buffer the Merkle proof of the first (and only) data word the step
    /// touches. Capturing at first touch keeps the proof pre-state.
    pub(crate) fn track_mem_access(&mut self, eff_addr: u64) -> Result<(), VmError> {
        if self.mem_proof_enabled && self.last_mem_access != Some(eff_addr) {
            if let Some(buffered) = self.last_mem_access {
                return Err(VmError::UnexpectedMemoryAccess {
                    addr: eff_addr,
                    buffered,
                });
            }
            self.last_mem_access = Some(eff_addr);
            self.mem_proof = Some(self.state.memory.merkle_proof(eff_addr));
        }
        Ok(())
    }

    /// Tracked read of the aligned word covering `addr`, zero-extended.
    pub(crate) fn read_mem_word(&mut self, addr: u64) -> Result<u64, VmError> {
        let eff_addr = addr & !3;
        self.track_mem_access(eff_addr)?;
        Ok(self.state.memory.get_u32(eff_addr)? as u64)
    }

    pub(crate) fn write_mem_word(&mut self, addr: u64, value: u32) -> Result<(), VmError> {
        let eff_addr = addr & !3;
        self.track_mem_access(eff_addr)?;
        self.state.memory.set_u32(eff_addr, value)
    }

    /// Tracked read of the aligned doubleword covering `addr`.
    pub(crate) fn read_mem_doubleword(&mut self, addr: u64) -> Result<u64, VmError> {
        let eff_addr = addr & !7;
        self.track_mem_access(eff_addr)?;
        self.state.memory.get_u64(eff_addr)
    }

    pub(crate) fn write_mem_doubleword(&mut self, addr: u64, value: u64) -> Result<(), VmError> {
        let eff_addr = addr & !7;
        self.track_mem_access(eff_addr)?;
        self.state.memory.set_u64(eff_addr, value)
    }

    /// VM status byte of the current state.
    pub fn vm_status(&self) -> u8 {
        self.state.vm_status()
    }
}
