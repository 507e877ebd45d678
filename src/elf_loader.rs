//! Load an ELF executable into an initial VM state.
//!
//! The entry point becomes `pc` (with the delay slot armed at `pc + 4`) and
//! the heap starts at `HEAP_START`. `PT_LOAD` segments shorter on disk than
//! in memory are zero-padded; `MIPS_ABIFLAGS` segments carry no code and are
//! skipped. Every segment must live strictly below the heap.

use crate::{cannon::HEAP_START, error::VmError, state::State};
use elf::{abi::PT_LOAD, endian::AnyEndian, ElfBytes};
use std::{io::Read, path::Path};

/// Segment type carrying the MIPS ABI flags block.
pub const PT_MIPS_ABIFLAGS: u32 = 0x7000_0003;

pub fn parse_elf(path: &Path) -> Result<State, VmError> {
    let file_data = std::fs::read(path)?;
    load_elf(&file_data)
}

pub fn load_elf(data: &[u8]) -> Result<State, VmError> {
    let file = ElfBytes::<AnyEndian>::minimal_parse(data)
        .map_err(|e| VmError::InvalidElf(format!("could not parse ELF: {e}")))?;

    let mut state = State::create_initial(file.ehdr.e_entry, HEAP_START);

    let segments = file
        .segments()
        .ok_or_else(|| VmError::InvalidElf("ELF has no program headers".to_string()))?;

    for (index, prog) in segments.iter().enumerate() {
        if prog.p_type == PT_MIPS_ABIFLAGS {
            continue;
        }

        let file_bytes = file
            .segment_data(&prog)
            .map_err(|e| VmError::InvalidElf(format!("segment {index} data: {e}")))?;

        let padding = if prog.p_filesz != prog.p_memsz {
            if prog.p_type != PT_LOAD || prog.p_filesz > prog.p_memsz {
                return Err(VmError::InvalidFileSize {
                    index,
                    file_size: prog.p_filesz,
                    mem_size: prog.p_memsz,
                });
            }
            prog.p_memsz - prog.p_filesz
        } else {
            0
        };

        if prog.p_vaddr.wrapping_add(prog.p_memsz) >= HEAP_START {
            return Err(VmError::SegmentOverlapsHeap {
                index,
                start: prog.p_vaddr,
                end: prog.p_vaddr.wrapping_add(prog.p_memsz),
            });
        }

        let mut reader = file_bytes.chain(std::io::repeat(0).take(padding));
        state.memory.set_range(prog.p_vaddr, &mut reader)?;
    }

    Ok(state)
}
