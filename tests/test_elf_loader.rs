//! Loading synthetic big-endian MIPS64 ELF images.

use mipsevm64::{cannon::HEAP_START, elf_loader, error::VmError};

const PT_LOAD: u32 = 1;
const PT_MIPS_ABIFLAGS: u32 = 0x7000_0003;

struct Segment {
    p_type: u32,
    vaddr: u64,
    data: Vec<u8>,
    memsz: u64,
}

// Assemble a minimal ELF64 big-endian MIPS executable from scratch.
fn build_elf(entry: u64, segments: &[Segment]) -> Vec<u8> {
    let phnum = segments.len() as u16;
    let phoff = 64u64;
    let data_start = phoff + 56 * segments.len() as u64;

    let mut out = Vec::new();
    // e_ident: magic, ELFCLASS64, ELFDATA2MSB, EV_CURRENT
    out.extend_from_slice(&[0x7f, b'E', b'L', b'F', 2, 2, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
    out.extend_from_slice(&2u16.to_be_bytes()); // e_type: EXEC
    out.extend_from_slice(&8u16.to_be_bytes()); // e_machine: MIPS
    out.extend_from_slice(&1u32.to_be_bytes()); // e_version
    out.extend_from_slice(&entry.to_be_bytes());
    out.extend_from_slice(&phoff.to_be_bytes());
    out.extend_from_slice(&0u64.to_be_bytes()); // e_shoff
    out.extend_from_slice(&0u32.to_be_bytes()); // e_flags
    out.extend_from_slice(&64u16.to_be_bytes()); // e_ehsize
    out.extend_from_slice(&56u16.to_be_bytes()); // e_phentsize
    out.extend_from_slice(&phnum.to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes()); // e_shentsize
    out.extend_from_slice(&0u16.to_be_bytes()); // e_shnum
    out.extend_from_slice(&0u16.to_be_bytes()); // e_shstrndx
    assert_eq!(out.len(), 64);

    let mut offset = data_start;
    for segment in segments {
        out.extend_from_slice(&segment.p_type.to_be_bytes());
        out.extend_from_slice(&5u32.to_be_bytes()); // p_flags: r-x
        out.extend_from_slice(&offset.to_be_bytes());
        out.extend_from_slice(&segment.vaddr.to_be_bytes());
        out.extend_from_slice(&segment.vaddr.to_be_bytes()); // p_paddr
        out.extend_from_slice(&(segment.data.len() as u64).to_be_bytes());
        out.extend_from_slice(&segment.memsz.to_be_bytes());
        out.extend_from_slice(&8u64.to_be_bytes()); // p_align
        offset += segment.data.len() as u64;
    }
    for segment in segments {
        out.extend_from_slice(&segment.data);
    }
    out
}

#[test]
fn loads_entry_point_and_segments() {
    let code: Vec<u8> = (0..64u8).collect();
    let elf = build_elf(
        0x1000,
        &[Segment {
            p_type: PT_LOAD,
            vaddr: 0x1000,
            data: code.clone(),
            memsz: 64,
        }],
    );

    let state = elf_loader::load_elf(&elf).unwrap();
    let thread = state.current_thread();
    assert_eq!(thread.cpu.pc, 0x1000);
    assert_eq!(thread.cpu.next_pc, 0x1004);
    assert_eq!(state.heap, HEAP_START);
    assert_eq!(state.memory.read_range(0x1000, 64), code);
    assert_eq!(state.memory.get_u32(0x1000).unwrap(), 0x0001_0203);
}

#[test]
fn bss_is_zero_padded() {
    let elf = build_elf(
        0x1000,
        &[Segment {
            p_type: PT_LOAD,
            vaddr: 0x2000,
            data: vec![0xaa; 16],
            memsz: 0x100,
        }],
    );

    let state = elf_loader::load_elf(&elf).unwrap();
    assert_eq!(state.memory.read_range(0x2000, 16), vec![0xaa; 16]);
    assert_eq!(state.memory.read_range(0x2010, 0xf0), vec![0u8; 0xf0]);
}

#[test]
fn abiflags_segment_is_skipped() {
    let elf = build_elf(
        0x1000,
        &[
            Segment {
                p_type: PT_MIPS_ABIFLAGS,
                vaddr: 0x9000,
                data: vec![0xff; 24],
                memsz: 24,
            },
            Segment {
                p_type: PT_LOAD,
                vaddr: 0x1000,
                data: vec![0x11; 8],
                memsz: 8,
            },
        ],
    );

    let state = elf_loader::load_elf(&elf).unwrap();
    assert_eq!(state.memory.read_range(0x9000, 24), vec![0u8; 24]);
    assert_eq!(state.memory.read_range(0x1000, 8), vec![0x11; 8]);
}

#[test]
fn segment_overlapping_heap_is_rejected() {
    let elf = build_elf(
        0x1000,
        &[Segment {
            p_type: PT_LOAD,
            vaddr: HEAP_START - 8,
            data: vec![0u8; 16],
            memsz: 16,
        }],
    );

    assert!(matches!(
        elf_loader::load_elf(&elf),
        Err(VmError::SegmentOverlapsHeap { index: 0, .. })
    ));
}

#[test]
fn file_size_larger_than_mem_size_is_rejected() {
    let elf = build_elf(
        0x1000,
        &[Segment {
            p_type: PT_LOAD,
            vaddr: 0x1000,
            data: vec![0u8; 32],
            memsz: 16,
        }],
    );

    assert!(matches!(
        elf_loader::load_elf(&elf),
        Err(VmError::InvalidFileSize {
            index: 0,
            file_size: 32,
            mem_size: 16,
        })
    ));
}
