use thiserror::Error;

/// Fatal VM failures. None of these are recoverable from inside the VM; they
/// are surfaced to the caller with enough context to reproduce the step.
/// A non-zero exit code of the emulated program is not an error, it is a
/// normal terminal state observable through the VM status byte.
#[derive(Debug, Error)]
pub enum VmError {
    #[error("invalid instruction {insn:#010x} at pc={pc:#x}")]
    InvalidInstruction { pc: u64, insn: u32 },

    #[error("unaligned {size}-byte memory access at address {addr:#x}")]
    UnalignedAccess { addr: u64, size: u64 },

    #[error("division by zero at pc={pc:#x}")]
    DivisionByZero { pc: u64 },

    #[error("branch or jump in delay slot at pc={pc:#x}")]
    BranchInDelaySlot { pc: u64 },

    #[error("invalid ELF: {0}")]
    InvalidElf(String),

    #[error("program segment {index} overlaps the heap: {start:#x}..{end:#x}")]
    SegmentOverlapsHeap { index: usize, start: u64, end: u64 },

    #[error("program segment {index} has file size {file_size} > mem size {mem_size}")]
    InvalidFileSize {
        index: usize,
        file_size: u64,
        mem_size: u64,
    },

    #[error("no preimage known for key 0x{}", hex::encode(key))]
    OracleMissing { key: [u8; 32] },

    #[error("invalid state witness length: expected {expected}, got {got}")]
    WitnessSizeMismatch { expected: usize, got: usize },

    #[error("unexpected memory access at {addr:#x}, already have access at {buffered:#x} buffered")]
    UnexpectedMemoryAccess { addr: u64, buffered: u64 },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, VmError>;
