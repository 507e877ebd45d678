//! Syscall dispatch: the minimum subset needed to support a hosted program.
//!
//! Calling convention: the syscall number is in `$v0`, arguments in
//! `$a0..$a3`; the result is returned in `$v0` with the error flag in `$a3`.
//! On completion the handler advances `pc` past the `syscall` instruction.
//! `futex_wait` is the one exception: a successfully blocked wait leaves the
//! program counters alone so the syscall completes on wakeup.

use crate::{
    cannon::{
        Hint, FD_HINT_READ, FD_HINT_WRITE, FD_PREIMAGE_READ, FD_PREIMAGE_WRITE, FD_STDERR,
        FD_STDIN, FD_STDOUT, FUTEX_EMPTY_ADDR, FUTEX_NO_TIMEOUT, FUTEX_TIMEOUT_STEPS,
        FUTEX_WAIT_PRIVATE, FUTEX_WAKE_PRIVATE, MIPS_EAGAIN, MIPS_EBADF, MIPS_EINVAL,
        PAGE_ADDRESS_MASK, PAGE_SIZE, PROGRAM_BREAK, SYSCALL_BRK, SYSCALL_CLONE, SYSCALL_EXIT,
        SYSCALL_EXIT_GROUP, SYSCALL_FCNTL, SYSCALL_FUTEX, SYSCALL_GETTID, SYSCALL_MMAP,
        SYSCALL_NANOSLEEP, SYSCALL_READ, SYSCALL_SCHED_YIELD, SYSCALL_WRITE, SYS_ERROR_SIGNAL,
    },
    error::VmError,
    interpreters::mips::witness::Env,
    preimage_oracle::PreImageOracleT,
};
use log::debug;

impl<PO: PreImageOracleT> Env<PO> {
    pub(crate) fn handle_syscall(&mut self) -> Result<(), VmError> {
        let registers = &self.state.current_thread().registers;
        let syscall_num = registers[2]; // $v0
        let a0 = registers[4];
        let a1 = registers[5];
        let a2 = registers[6];
        let a3 = registers[7];

        let mut v0: u64 = 0;
        let mut v1: u64 = 0;

        match syscall_num {
            SYSCALL_MMAP => {
                let mut size = a1;
                if size & PAGE_ADDRESS_MASK != 0 {
                    // round up to page size
                    size = size.wrapping_add(PAGE_SIZE - (size & PAGE_ADDRESS_MASK));
                }
                if a0 == 0 {
                    v0 = self.state.heap;
                    self.state.heap = self.state.heap.wrapping_add(size);
                    debug!("mmap heap {:#x} size {:#x}", v0, size);
                } else {
                    // fixed mappings are accepted as-is; pages stay lazy
                    v0 = a0;
                }
            }
            SYSCALL_BRK => {
                v0 = PROGRAM_BREAK;
            }
            SYSCALL_CLONE => {
                let parent = self.state.current_thread();
                let child_id = self.state.next_thread_id;
                let mut child = parent.clone();
                child.thread_id = child_id;
                child.exit_code = 0;
                child.exited = false;
                child.futex_addr = FUTEX_EMPTY_ADDR;
                child.futex_val = 0;
                child.futex_timeout_step = 0;
                // the child resumes after the syscall, on its own stack
                child.cpu.pc = parent.cpu.next_pc;
                child.cpu.next_pc = parent.cpu.next_pc.wrapping_add(4);
                child.registers[29] = a1; // $sp
                child.registers[2] = 0; // child observes a 0 return value
                child.registers[7] = 0;
                self.state.next_thread_id += 1;

                // deliver the child id to the parent, then schedule the child
                self.handle_syscall_updates(child_id, 0);
                self.state.active_thread_stack_mut().push(child);
                return Ok(());
            }
            SYSCALL_EXIT_GROUP => {
                self.state.exited = true;
                self.state.exit_code = a0 as u8;
                return Ok(());
            }
            SYSCALL_EXIT => {
                let last_thread = self.state.thread_count() == 1;
                let thread = self.state.current_thread_mut();
                thread.exited = true;
                thread.exit_code = a0 as u8;
                if last_thread {
                    self.state.exited = true;
                    self.state.exit_code = a0 as u8;
                }
                return Ok(());
            }
            SYSCALL_READ => (v0, v1) = self.handle_sys_read(a0, a1, a2)?,
            SYSCALL_WRITE => (v0, v1) = self.handle_sys_write(a0, a1, a2)?,
            SYSCALL_FCNTL => {
                if a1 == 3 {
                    // F_GETFL: read-only fds report 0, write-only fds 1
                    match a0 {
                        FD_STDIN | FD_HINT_READ | FD_PREIMAGE_READ => v0 = 0,
                        FD_STDOUT | FD_STDERR | FD_HINT_WRITE | FD_PREIMAGE_WRITE => v0 = 1,
                        _ => {
                            v0 = SYS_ERROR_SIGNAL;
                            v1 = MIPS_EBADF;
                        }
                    }
                } else {
                    v0 = SYS_ERROR_SIGNAL;
                    v1 = MIPS_EINVAL;
                }
            }
            SYSCALL_FUTEX => {
                let eff_addr = a0 & !3;
                match a1 {
                    FUTEX_WAIT_PRIVATE => {
                        self.track_mem_access(eff_addr)?;
                        let mem = self.state.memory.get_u32(eff_addr)? as u64;
                        if mem != a2 {
                            v0 = SYS_ERROR_SIGNAL;
                            v1 = MIPS_EAGAIN;
                        } else {
                            let step = self.state.step;
                            let thread = self.state.current_thread_mut();
                            thread.futex_addr = eff_addr;
                            thread.futex_val = a2;
                            thread.futex_timeout_step = if a3 == 0 {
                                FUTEX_NO_TIMEOUT
                            } else {
                                step + FUTEX_TIMEOUT_STEPS
                            };
                            // leave the program counters alone: the syscall
                            // completes when the thread is woken
                            return Ok(());
                        }
                    }
                    FUTEX_WAKE_PRIVATE => {
                        // start a wakeup traversal from the left stack
                        self.state.wakeup = eff_addr;
                        self.handle_syscall_updates(0, 0);
                        self.preempt_thread();
                        self.state.traverse_right = self.state.left_thread_stack.is_empty();
                        return Ok(());
                    }
                    _ => {
                        v0 = SYS_ERROR_SIGNAL;
                        v1 = MIPS_EINVAL;
                    }
                }
            }
            SYSCALL_SCHED_YIELD | SYSCALL_NANOSLEEP => {
                self.handle_syscall_updates(0, 0);
                self.preempt_thread();
                return Ok(());
            }
            SYSCALL_GETTID => {
                v0 = self.state.current_thread().thread_id;
            }
            _ => {
                // unsupported syscalls are ignored
            }
        }

        self.handle_syscall_updates(v0, v1);
        Ok(())
    }

    fn handle_sys_read(&mut self, fd: u64, buf: u64, count: u64) -> Result<(u64, u64), VmError> {
        let mut v0: u64 = 0;
        let mut v1: u64 = 0;
        match fd {
            FD_STDIN => {
                // no stdin: EOF
            }
            FD_PREIMAGE_READ => {
                let eff_addr = buf & !3;
                self.track_mem_access(eff_addr)?;
                let mem = self.state.memory.get_u32(eff_addr)?;
                let (dat, dat_len) = self
                    .preimage_oracle
                    .read_preimage(self.state.preimage_key, self.state.preimage_offset)?;
                // clip to stay within the aligned word and the caller's count
                let alignment = buf & 3;
                let space = 4 - alignment;
                let dat_len = dat_len.min(space).min(count) as usize;

                if dat_len > 0 {
                    let mut out = mem.to_be_bytes();
                    out[alignment as usize..alignment as usize + dat_len]
                        .copy_from_slice(&dat[..dat_len]);
                    self.state.memory.set_u32(eff_addr, u32::from_be_bytes(out))?;
                    self.state.preimage_offset += dat_len as u64;
                }
                v0 = dat_len as u64;
            }
            FD_HINT_READ => {
                // hint response is all zeroes, so there is nothing to write
                v0 = count;
            }
            _ => {
                v0 = SYS_ERROR_SIGNAL;
                v1 = MIPS_EBADF;
            }
        }
        Ok((v0, v1))
    }

    fn handle_sys_write(&mut self, fd: u64, buf: u64, count: u64) -> Result<(u64, u64), VmError> {
        let mut v0: u64 = 0;
        let mut v1: u64 = 0;
        match fd {
            FD_STDOUT => {
                let bytes = self.state.memory.read_range(buf, count);
                self.std_out.write_all(&bytes)?;
                self.std_out.flush()?;
                v0 = count;
            }
            FD_STDERR => {
                let bytes = self.state.memory.read_range(buf, count);
                self.std_err.write_all(&bytes)?;
                self.std_err.flush()?;
                v0 = count;
            }
            FD_HINT_WRITE => {
                // buffer the hint bytes and deliver every complete
                // length-prefixed hint to the oracle
                let bytes = self.state.memory.read_range(buf, count);
                let mut last_hint = self.state.last_hint.take().unwrap_or_default();
                last_hint.extend_from_slice(&bytes);
                while last_hint.len() >= 4 {
                    let hint_len =
                        u32::from_be_bytes(last_hint[..4].try_into().unwrap()) as usize;
                    if last_hint.len() < 4 + hint_len {
                        break;
                    }
                    let hint = last_hint[4..4 + hint_len].to_vec();
                    last_hint.drain(..4 + hint_len);
                    self.preimage_oracle.hint(Hint::create(hint))?;
                }
                self.state.last_hint = Some(last_hint);
                v0 = count;
            }
            FD_PREIMAGE_WRITE => {
                let eff_addr = buf & !3;
                self.track_mem_access(eff_addr)?;
                let mem = self.state.memory.get_u32(eff_addr)?;
                let alignment = (buf & 3) as usize;
                let space = 4 - alignment;
                let written = space.min(count as usize);

                // the preimage key is a 32-byte shift register: new bytes
                // come in from the right
                let mut key = self.state.preimage_key;
                key.copy_within(written.., 0);
                let word = mem.to_be_bytes();
                key[32 - written..].copy_from_slice(&word[alignment..alignment + written]);
                self.state.preimage_key = key;
                self.state.preimage_offset = 0;
                v0 = written as u64;
            }
            _ => {
                v0 = SYS_ERROR_SIGNAL;
                v1 = MIPS_EBADF;
            }
        }
        Ok((v0, v1))
    }
}
