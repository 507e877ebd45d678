//! Instruction decoding and retirement for the 64-bit MIPS subset the
//! hosted toolchains emit.
//!
//! Every instruction first moves `pc` to `next_pc` and then computes its own
//! effect on `next_pc`; branches and jumps redirect `next_pc` so the delay
//! slot executes before the target. Register `$0` reads as zero and ignores
//! writes.

use crate::{
    error::VmError,
    interpreters::mips::witness::Env,
    preimage_oracle::PreImageOracleT,
};
use strum_macros::{EnumCount, EnumIter};

#[derive(Debug, Clone, Copy, Eq, PartialEq, EnumCount, EnumIter, Hash, Ord, PartialOrd)]
pub enum Instruction {
    RType(RTypeInstruction),
    JType(JTypeInstruction),
    IType(ITypeInstruction),
    /// The all-zero word; retired as a plain `pc` advance.
    NoOp,
}

#[derive(
    Debug, Clone, Copy, Eq, PartialEq, EnumCount, EnumIter, Default, Hash, Ord, PartialOrd,
)]
pub enum RTypeInstruction {
    #[default]
    ShiftLeftLogical, // sll
    ShiftRightLogical,                  // srl
    ShiftRightArithmetic,               // sra
    ShiftLeftLogicalVariable,           // sllv
    ShiftRightLogicalVariable,          // srlv
    ShiftRightArithmeticVariable,       // srav
    JumpRegister,                       // jr
    JumpAndLinkRegister,                // jalr
    MoveZero,                           // movz
    MoveNonZero,                        // movn
    Syscall,                            // syscall
    Sync,                               // sync
    MoveFromHi,                         // mfhi
    MoveToHi,                           // mthi
    MoveFromLo,                         // mflo
    MoveToLo,                           // mtlo
    DoubleShiftLeftLogicalVariable,     // dsllv
    DoubleShiftRightLogicalVariable,    // dsrlv
    DoubleShiftRightArithmeticVariable, // dsrav
    Multiply,                           // mult
    MultiplyUnsigned,                   // multu
    Div,                                // div
    DivUnsigned,                        // divu
    DoubleMultiply,                     // dmult
    DoubleMultiplyUnsigned,             // dmultu
    DoubleDiv,                          // ddiv
    DoubleDivUnsigned,                  // ddivu
    Add,                                // add
    AddUnsigned,                        // addu
    Sub,                                // sub
    SubUnsigned,                        // subu
    And,                                // and
    Or,                                 // or
    Xor,                                // xor
    Nor,                                // nor
    SetLessThan,                        // slt
    SetLessThanUnsigned,                // sltu
    DoubleAdd,                          // dadd
    DoubleAddUnsigned,                  // daddu
    DoubleSub,                          // dsub
    DoubleSubUnsigned,                  // dsubu
    DoubleShiftLeftLogical,             // dsll
    DoubleShiftRightLogical,            // dsrl
    DoubleShiftRightArithmetic,         // dsra
    DoubleShiftLeftLogical32,           // dsll32
    DoubleShiftRightLogical32,          // dsrl32
    DoubleShiftRightArithmetic32,       // dsra32
    MultiplyToRegister,                 // mul
    CountLeadingZeros,                  // clz
    CountLeadingOnes,                   // clo
    DoubleCountLeadingZeros,            // dclz
    DoubleCountLeadingOnes,             // dclo
}

#[derive(
    Debug, Clone, Copy, Eq, PartialEq, EnumCount, EnumIter, Default, Hash, Ord, PartialOrd,
)]
pub enum JTypeInstruction {
    #[default]
    Jump, // j
    JumpAndLink, // jal
}

#[derive(
    Debug, Clone, Copy, Eq, PartialEq, EnumCount, EnumIter, Default, Hash, Ord, PartialOrd,
)]
pub enum ITypeInstruction {
    #[default]
    BranchEq, // beq
    BranchNeq,                          // bne
    BranchLeqZero,                      // blez
    BranchGtZero,                       // bgtz
    BranchLtZero,                       // bltz
    BranchGeqZero,                      // bgez
    BranchLtZeroAndLink,                // bltzal
    BranchGeqZeroAndLink,               // bgezal
    AddImmediate,                       // addi
    AddImmediateUnsigned,               // addiu
    SetLessThanImmediate,               // slti
    SetLessThanImmediateUnsigned,       // sltiu
    AndImmediate,                       // andi
    OrImmediate,                        // ori
    XorImmediate,                       // xori
    LoadUpperImmediate,                 // lui
    DoubleAddImmediate,                 // daddi
    DoubleAddImmediateUnsigned,         // daddiu
    Load8,                              // lb
    Load16,                             // lh
    Load32,                             // lw
    Load8Unsigned,                      // lbu
    Load16Unsigned,                     // lhu
    Load32Unsigned,                     // lwu
    Load64,                             // ld
    LoadWordLeft,                       // lwl
    LoadWordRight,                      // lwr
    LoadDoubleLeft,                     // ldl
    LoadDoubleRight,                    // ldr
    Store8,                             // sb
    Store16,                            // sh
    Store32,                            // sw
    Store64,                            // sd
    StoreWordLeft,                      // swl
    StoreWordRight,                     // swr
    StoreDoubleLeft,                    // sdl
    StoreDoubleRight,                   // sdr
    LoadLinked,                         // ll
    LoadLinkedDouble,                   // lld
    StoreConditional,                   // sc
    StoreConditionalDouble,             // scd
}

/// The fixed fields of an encoded instruction word.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InstructionParts {
    pub op_code: u32,
    pub rs: u32,
    pub rt: u32,
    pub rd: u32,
    pub shamt: u32,
    pub funct: u32,
}

impl InstructionParts {
    pub fn decode(insn: u32) -> Self {
        InstructionParts {
            op_code: (insn >> 26) & 0x3f,
            rs: (insn >> 21) & 0x1f,
            rt: (insn >> 16) & 0x1f,
            rd: (insn >> 11) & 0x1f,
            shamt: (insn >> 6) & 0x1f,
            funct: insn & 0x3f,
        }
    }

    pub fn encode(&self) -> u32 {
        (self.op_code << 26)
            | (self.rs << 21)
            | (self.rt << 16)
            | (self.rd << 11)
            | (self.shamt << 6)
            | self.funct
    }
}

/// Sign-extend the low `bitlength` bits of `x` to 64 bits. `bitlength` must
/// be below 64.
pub fn sign_extend(x: u64, bitlength: u32) -> u64 {
    let high_bit = (x >> (bitlength - 1)) & 1;
    let x = x & ((1u64 << bitlength) - 1);
    if high_bit == 1 {
        x | (u64::MAX << bitlength)
    } else {
        x
    }
}

/// A 32-bit result placed in a 64-bit register.
pub fn sign_extend32(x: u32) -> u64 {
    x as i32 as i64 as u64
}

/// Classify the 4-byte word at `pc`. Unknown encodings are fatal.
pub fn decode(insn: u32, pc: u64) -> Result<Instruction, VmError> {
    use ITypeInstruction as I;
    use JTypeInstruction as J;
    use RTypeInstruction as R;

    let invalid = VmError::InvalidInstruction { pc, insn };
    let instruction = match insn >> 26 {
        0x00 => match insn & 0x3f {
            0x00 => {
                if insn == 0 {
                    Instruction::NoOp
                } else {
                    Instruction::RType(R::ShiftLeftLogical)
                }
            }
            0x02 => Instruction::RType(R::ShiftRightLogical),
            0x03 => Instruction::RType(R::ShiftRightArithmetic),
            0x04 => Instruction::RType(R::ShiftLeftLogicalVariable),
            0x06 => Instruction::RType(R::ShiftRightLogicalVariable),
            0x07 => Instruction::RType(R::ShiftRightArithmeticVariable),
            0x08 => Instruction::RType(R::JumpRegister),
            0x09 => Instruction::RType(R::JumpAndLinkRegister),
            0x0a => Instruction::RType(R::MoveZero),
            0x0b => Instruction::RType(R::MoveNonZero),
            0x0c => Instruction::RType(R::Syscall),
            0x0f => Instruction::RType(R::Sync),
            0x10 => Instruction::RType(R::MoveFromHi),
            0x11 => Instruction::RType(R::MoveToHi),
            0x12 => Instruction::RType(R::MoveFromLo),
            0x13 => Instruction::RType(R::MoveToLo),
            0x14 => Instruction::RType(R::DoubleShiftLeftLogicalVariable),
            0x16 => Instruction::RType(R::DoubleShiftRightLogicalVariable),
            0x17 => Instruction::RType(R::DoubleShiftRightArithmeticVariable),
            0x18 => Instruction::RType(R::Multiply),
            0x19 => Instruction::RType(R::MultiplyUnsigned),
            0x1a => Instruction::RType(R::Div),
            0x1b => Instruction::RType(R::DivUnsigned),
            0x1c => Instruction::RType(R::DoubleMultiply),
            0x1d => Instruction::RType(R::DoubleMultiplyUnsigned),
            0x1e => Instruction::RType(R::DoubleDiv),
            0x1f => Instruction::RType(R::DoubleDivUnsigned),
            0x20 => Instruction::RType(R::Add),
            0x21 => Instruction::RType(R::AddUnsigned),
            0x22 => Instruction::RType(R::Sub),
            0x23 => Instruction::RType(R::SubUnsigned),
            0x24 => Instruction::RType(R::And),
            0x25 => Instruction::RType(R::Or),
            0x26 => Instruction::RType(R::Xor),
            0x27 => Instruction::RType(R::Nor),
            0x2a => Instruction::RType(R::SetLessThan),
            0x2b => Instruction::RType(R::SetLessThanUnsigned),
            0x2c => Instruction::RType(R::DoubleAdd),
            0x2d => Instruction::RType(R::DoubleAddUnsigned),
            0x2e => Instruction::RType(R::DoubleSub),
            0x2f => Instruction::RType(R::DoubleSubUnsigned),
            0x38 => Instruction::RType(R::DoubleShiftLeftLogical),
            0x3a => Instruction::RType(R::DoubleShiftRightLogical),
            0x3b => Instruction::RType(R::DoubleShiftRightArithmetic),
            0x3c => Instruction::RType(R::DoubleShiftLeftLogical32),
            0x3e => Instruction::RType(R::DoubleShiftRightLogical32),
            0x3f => Instruction::RType(R::DoubleShiftRightArithmetic32),
            _ => return Err(invalid),
        },
        0x01 => {
            // RegImm instructions
            match (insn >> 16) & 0x1f {
                0x00 => Instruction::IType(I::BranchLtZero),
                0x01 => Instruction::IType(I::BranchGeqZero),
                0x10 => Instruction::IType(I::BranchLtZeroAndLink),
                0x11 => Instruction::IType(I::BranchGeqZeroAndLink),
                _ => return Err(invalid),
            }
        }
        0x02 => Instruction::JType(J::Jump),
        0x03 => Instruction::JType(J::JumpAndLink),
        0x04 => Instruction::IType(I::BranchEq),
        0x05 => Instruction::IType(I::BranchNeq),
        0x06 => Instruction::IType(I::BranchLeqZero),
        0x07 => Instruction::IType(I::BranchGtZero),
        0x08 => Instruction::IType(I::AddImmediate),
        0x09 => Instruction::IType(I::AddImmediateUnsigned),
        0x0a => Instruction::IType(I::SetLessThanImmediate),
        0x0b => Instruction::IType(I::SetLessThanImmediateUnsigned),
        0x0c => Instruction::IType(I::AndImmediate),
        0x0d => Instruction::IType(I::OrImmediate),
        0x0e => Instruction::IType(I::XorImmediate),
        0x0f => Instruction::IType(I::LoadUpperImmediate),
        0x18 => Instruction::IType(I::DoubleAddImmediate),
        0x19 => Instruction::IType(I::DoubleAddImmediateUnsigned),
        0x1a => Instruction::IType(I::LoadDoubleLeft),
        0x1b => Instruction::IType(I::LoadDoubleRight),
        0x1c => match insn & 0x3f {
            0x02 => Instruction::RType(R::MultiplyToRegister),
            0x20 => Instruction::RType(R::CountLeadingZeros),
            0x21 => Instruction::RType(R::CountLeadingOnes),
            0x24 => Instruction::RType(R::DoubleCountLeadingZeros),
            0x25 => Instruction::RType(R::DoubleCountLeadingOnes),
            _ => return Err(invalid),
        },
        0x20 => Instruction::IType(I::Load8),
        0x21 => Instruction::IType(I::Load16),
        0x22 => Instruction::IType(I::LoadWordLeft),
        0x23 => Instruction::IType(I::Load32),
        0x24 => Instruction::IType(I::Load8Unsigned),
        0x25 => Instruction::IType(I::Load16Unsigned),
        0x26 => Instruction::IType(I::LoadWordRight),
        0x27 => Instruction::IType(I::Load32Unsigned),
        0x28 => Instruction::IType(I::Store8),
        0x29 => Instruction::IType(I::Store16),
        0x2a => Instruction::IType(I::StoreWordLeft),
        0x2b => Instruction::IType(I::Store32),
        0x2c => Instruction::IType(I::StoreDoubleLeft),
        0x2d => Instruction::IType(I::StoreDoubleRight),
        0x2e => Instruction::IType(I::StoreWordRight),
        0x30 => Instruction::IType(I::LoadLinked),
        0x33 => Instruction::NoOp, // pref
        0x34 => Instruction::IType(I::LoadLinkedDouble),
        0x37 => Instruction::IType(I::Load64),
        0x38 => Instruction::IType(I::StoreConditional),
        0x3c => Instruction::IType(I::StoreConditionalDouble),
        0x3f => Instruction::IType(I::Store64),
        _ => return Err(invalid),
    };
    Ok(instruction)
}

pub fn interpret_instruction<PO: PreImageOracleT>(
    env: &mut Env<PO>,
    instr: Instruction,
    insn: u32,
) -> Result<(), VmError> {
    match instr {
        Instruction::RType(rtype) => interpret_rtype(env, rtype, insn),
        Instruction::JType(jtype) => interpret_jtype(env, jtype, insn),
        Instruction::IType(itype) => interpret_itype(env, itype, insn),
        Instruction::NoOp => {
            env.advance_pc();
            Ok(())
        }
    }
}

pub fn interpret_rtype<PO: PreImageOracleT>(
    env: &mut Env<PO>,
    instr: RTypeInstruction,
    insn: u32,
) -> Result<(), VmError> {
    use RTypeInstruction as R;

    let parts = InstructionParts::decode(insn);
    let rs = env.read_register(parts.rs);
    let rt = env.read_register(parts.rt);
    let rd = parts.rd;
    let pc = env.state.current_thread().cpu.pc;

    match instr {
        R::Syscall => return env.handle_syscall(),
        R::JumpRegister => return env.handle_jump(None, rs),
        R::JumpAndLinkRegister => return env.handle_jump(Some(rd), rs),
        _ => (),
    }

    match instr {
        R::ShiftLeftLogical => env.handle_rd(rd, sign_extend32((rt as u32) << parts.shamt)),
        R::ShiftRightLogical => env.handle_rd(rd, sign_extend32((rt as u32) >> parts.shamt)),
        R::ShiftRightArithmetic => {
            env.handle_rd(rd, sign_extend32(((rt as u32 as i32) >> parts.shamt) as u32))
        }
        R::ShiftLeftLogicalVariable => {
            env.handle_rd(rd, sign_extend32((rt as u32) << (rs & 0x1f)))
        }
        R::ShiftRightLogicalVariable => {
            env.handle_rd(rd, sign_extend32((rt as u32) >> (rs & 0x1f)))
        }
        R::ShiftRightArithmeticVariable => env.handle_rd(
            rd,
            sign_extend32(((rt as u32 as i32) >> (rs & 0x1f)) as u32),
        ),
        R::MoveZero => {
            if rt == 0 {
                env.write_register(rd, rs);
            }
            env.advance_pc();
        }
        R::MoveNonZero => {
            if rt != 0 {
                env.write_register(rd, rs);
            }
            env.advance_pc();
        }
        R::Sync => env.advance_pc(),
        R::MoveFromHi => env.handle_rd(rd, env.state.current_thread().cpu.hi),
        R::MoveFromLo => env.handle_rd(rd, env.state.current_thread().cpu.lo),
        R::MoveToHi => {
            env.state.current_thread_mut().cpu.hi = rs;
            env.advance_pc();
        }
        R::MoveToLo => {
            env.state.current_thread_mut().cpu.lo = rs;
            env.advance_pc();
        }
        R::DoubleShiftLeftLogicalVariable => env.handle_rd(rd, rt << (rs & 0x3f)),
        R::DoubleShiftRightLogicalVariable => env.handle_rd(rd, rt >> (rs & 0x3f)),
        R::DoubleShiftRightArithmeticVariable => {
            env.handle_rd(rd, ((rt as i64) >> (rs & 0x3f)) as u64)
        }
        R::Multiply => {
            let product = (rs as u32 as i32 as i64).wrapping_mul(rt as u32 as i32 as i64) as u64;
            let cpu = &mut env.state.current_thread_mut().cpu;
            cpu.lo = sign_extend32(product as u32);
            cpu.hi = sign_extend32((product >> 32) as u32);
            env.advance_pc();
        }
        R::MultiplyUnsigned => {
            let product = (rs as u32 as u64).wrapping_mul(rt as u32 as u64);
            let cpu = &mut env.state.current_thread_mut().cpu;
            cpu.lo = sign_extend32(product as u32);
            cpu.hi = sign_extend32((product >> 32) as u32);
            env.advance_pc();
        }
        R::Div => {
            if rt as u32 == 0 {
                return Err(VmError::DivisionByZero { pc });
            }
            let (x, y) = (rs as u32 as i32, rt as u32 as i32);
            let cpu = &mut env.state.current_thread_mut().cpu;
            cpu.lo = sign_extend32(x.wrapping_div(y) as u32);
            cpu.hi = sign_extend32(x.wrapping_rem(y) as u32);
            env.advance_pc();
        }
        R::DivUnsigned => {
            if rt as u32 == 0 {
                return Err(VmError::DivisionByZero { pc });
            }
            let (x, y) = (rs as u32, rt as u32);
            let cpu = &mut env.state.current_thread_mut().cpu;
            cpu.lo = sign_extend32(x / y);
            cpu.hi = sign_extend32(x % y);
            env.advance_pc();
        }
        R::DoubleMultiply => {
            let product = (rs as i64 as i128).wrapping_mul(rt as i64 as i128) as u128;
            let cpu = &mut env.state.current_thread_mut().cpu;
            cpu.lo = product as u64;
            cpu.hi = (product >> 64) as u64;
            env.advance_pc();
        }
        R::DoubleMultiplyUnsigned => {
            let product = (rs as u128).wrapping_mul(rt as u128);
            let cpu = &mut env.state.current_thread_mut().cpu;
            cpu.lo = product as u64;
            cpu.hi = (product >> 64) as u64;
            env.advance_pc();
        }
        R::DoubleDiv => {
            if rt == 0 {
                return Err(VmError::DivisionByZero { pc });
            }
            let (x, y) = (rs as i64, rt as i64);
            let cpu = &mut env.state.current_thread_mut().cpu;
            cpu.lo = x.wrapping_div(y) as u64;
            cpu.hi = x.wrapping_rem(y) as u64;
            env.advance_pc();
        }
        R::DoubleDivUnsigned => {
            if rt == 0 {
                return Err(VmError::DivisionByZero { pc });
            }
            let cpu = &mut env.state.current_thread_mut().cpu;
            cpu.lo = rs / rt;
            cpu.hi = rs % rt;
            env.advance_pc();
        }
        // Overflow traps are not used by the hosted toolchains; add/sub
        // behave like their unsigned forms.
        R::Add | R::AddUnsigned => {
            env.handle_rd(rd, sign_extend32((rs as u32).wrapping_add(rt as u32)))
        }
        R::Sub | R::SubUnsigned => {
            env.handle_rd(rd, sign_extend32((rs as u32).wrapping_sub(rt as u32)))
        }
        R::And => env.handle_rd(rd, rs & rt),
        R::Or => env.handle_rd(rd, rs | rt),
        R::Xor => env.handle_rd(rd, rs ^ rt),
        R::Nor => env.handle_rd(rd, !(rs | rt)),
        R::SetLessThan => env.handle_rd(rd, ((rs as i64) < (rt as i64)) as u64),
        R::SetLessThanUnsigned => env.handle_rd(rd, (rs < rt) as u64),
        R::DoubleAdd | R::DoubleAddUnsigned => env.handle_rd(rd, rs.wrapping_add(rt)),
        R::DoubleSub | R::DoubleSubUnsigned => env.handle_rd(rd, rs.wrapping_sub(rt)),
        R::DoubleShiftLeftLogical => env.handle_rd(rd, rt << parts.shamt),
        R::DoubleShiftRightLogical => env.handle_rd(rd, rt >> parts.shamt),
        R::DoubleShiftRightArithmetic => env.handle_rd(rd, ((rt as i64) >> parts.shamt) as u64),
        R::DoubleShiftLeftLogical32 => env.handle_rd(rd, rt << (parts.shamt + 32)),
        R::DoubleShiftRightLogical32 => env.handle_rd(rd, rt >> (parts.shamt + 32)),
        R::DoubleShiftRightArithmetic32 => {
            env.handle_rd(rd, ((rt as i64) >> (parts.shamt + 32)) as u64)
        }
        R::MultiplyToRegister => env.handle_rd(
            rd,
            sign_extend32((rs as u32 as i32).wrapping_mul(rt as u32 as i32) as u32),
        ),
        R::CountLeadingZeros => env.handle_rd(rd, (rs as u32).leading_zeros() as u64),
        R::CountLeadingOnes => env.handle_rd(rd, (rs as u32).leading_ones() as u64),
        R::DoubleCountLeadingZeros => env.handle_rd(rd, rs.leading_zeros() as u64),
        R::DoubleCountLeadingOnes => env.handle_rd(rd, rs.leading_ones() as u64),
        R::Syscall | R::JumpRegister | R::JumpAndLinkRegister => unreachable!(),
    }
    Ok(())
}

pub fn interpret_jtype<PO: PreImageOracleT>(
    env: &mut Env<PO>,
    instr: JTypeInstruction,
    insn: u32,
) -> Result<(), VmError> {
    // The jump target replaces the low 28 bits of the delay-slot address.
    let region = env.state.current_thread().cpu.pc.wrapping_add(4) & !((1u64 << 28) - 1);
    let dest = region | (((insn & 0x03ff_ffff) as u64) << 2);
    match instr {
        JTypeInstruction::Jump => env.handle_jump(None, dest),
        JTypeInstruction::JumpAndLink => env.handle_jump(Some(31), dest),
    }
}

pub fn interpret_itype<PO: PreImageOracleT>(
    env: &mut Env<PO>,
    instr: ITypeInstruction,
    insn: u32,
) -> Result<(), VmError> {
    use ITypeInstruction as I;

    let parts = InstructionParts::decode(insn);
    let rs = env.read_register(parts.rs);
    let rt_reg = parts.rt;
    let rt = env.read_register(rt_reg);
    let imm = sign_extend((insn & 0xffff) as u64, 16);
    let addr = rs.wrapping_add(imm);

    match instr {
        I::BranchEq => return env.handle_branch(rs == rt, insn),
        I::BranchNeq => return env.handle_branch(rs != rt, insn),
        I::BranchLeqZero => return env.handle_branch((rs as i64) <= 0, insn),
        I::BranchGtZero => return env.handle_branch((rs as i64) > 0, insn),
        I::BranchLtZero => return env.handle_branch((rs as i64) < 0, insn),
        I::BranchGeqZero => return env.handle_branch((rs as i64) >= 0, insn),
        I::BranchLtZeroAndLink => {
            let link = env.state.current_thread().cpu.pc.wrapping_add(8);
            env.write_register(31, link);
            return env.handle_branch((rs as i64) < 0, insn);
        }
        I::BranchGeqZeroAndLink => {
            let link = env.state.current_thread().cpu.pc.wrapping_add(8);
            env.write_register(31, link);
            return env.handle_branch((rs as i64) >= 0, insn);
        }
        I::AddImmediate | I::AddImmediateUnsigned => {
            env.handle_rd(rt_reg, sign_extend32((rs as u32).wrapping_add(imm as u32)));
        }
        I::SetLessThanImmediate => {
            env.handle_rd(rt_reg, ((rs as i64) < (imm as i64)) as u64);
        }
        I::SetLessThanImmediateUnsigned => {
            env.handle_rd(rt_reg, (rs < imm) as u64);
        }
        I::AndImmediate => env.handle_rd(rt_reg, rs & (insn & 0xffff) as u64),
        I::OrImmediate => env.handle_rd(rt_reg, rs | (insn & 0xffff) as u64),
        I::XorImmediate => env.handle_rd(rt_reg, rs ^ (insn & 0xffff) as u64),
        I::LoadUpperImmediate => {
            env.handle_rd(rt_reg, sign_extend32(((insn & 0xffff) as u32) << 16));
        }
        I::DoubleAddImmediate | I::DoubleAddImmediateUnsigned => {
            env.handle_rd(rt_reg, rs.wrapping_add(imm));
        }
        I::Load8 => {
            let word = env.read_mem_word(addr)?;
            let byte = (word >> (24 - 8 * (addr & 3))) & 0xff;
            env.handle_rd(rt_reg, sign_extend(byte, 8));
        }
        I::Load8Unsigned => {
            let word = env.read_mem_word(addr)?;
            env.handle_rd(rt_reg, (word >> (24 - 8 * (addr & 3))) & 0xff);
        }
        I::Load16 => {
            let word = env.read_mem_word(addr)?;
            let half = (word >> (16 - 8 * (addr & 2))) & 0xffff;
            env.handle_rd(rt_reg, sign_extend(half, 16));
        }
        I::Load16Unsigned => {
            let word = env.read_mem_word(addr)?;
            env.handle_rd(rt_reg, (word >> (16 - 8 * (addr & 2))) & 0xffff);
        }
        I::Load32 | I::LoadLinked => {
            // ll is a plain load: interference is only possible across
            // context switches, and the scheduler boundary is the
            // instruction boundary.
            let word = env.read_mem_word(addr)?;
            env.handle_rd(rt_reg, sign_extend32(word as u32));
        }
        I::Load32Unsigned => {
            let word = env.read_mem_word(addr)?;
            env.handle_rd(rt_reg, word);
        }
        I::Load64 | I::LoadLinkedDouble => {
            let word = env.read_mem_doubleword(addr)?;
            env.handle_rd(rt_reg, word);
        }
        I::LoadWordLeft => {
            let word = env.read_mem_word(addr)? as u32;
            let shift = 8 * (addr & 3) as u32;
            let mask = u32::MAX << shift;
            let merged = ((rt as u32) & !mask) | ((word << shift) & mask);
            env.handle_rd(rt_reg, sign_extend32(merged));
        }
        I::LoadWordRight => {
            let word = env.read_mem_word(addr)? as u32;
            let shift = 24 - 8 * (addr & 3) as u32;
            let mask = u32::MAX >> shift;
            let merged = ((rt as u32) & !mask) | ((word >> shift) & mask);
            env.handle_rd(rt_reg, sign_extend32(merged));
        }
        I::LoadDoubleLeft => {
            let word = env.read_mem_doubleword(addr)?;
            let shift = 8 * (addr & 7) as u32;
            let mask = u64::MAX << shift;
            env.handle_rd(rt_reg, (rt & !mask) | ((word << shift) & mask));
        }
        I::LoadDoubleRight => {
            let word = env.read_mem_doubleword(addr)?;
            let shift = 56 - 8 * (addr & 7) as u32;
            let mask = u64::MAX >> shift;
            env.handle_rd(rt_reg, (rt & !mask) | ((word >> shift) & mask));
        }
        I::Store8 => {
            let word = env.read_mem_word(addr)? as u32;
            let shift = 24 - 8 * (addr & 3) as u32;
            let merged = (word & !(0xff << shift)) | (((rt as u32) & 0xff) << shift);
            env.write_mem_word(addr, merged)?;
            env.advance_pc();
        }
        I::Store16 => {
            let word = env.read_mem_word(addr)? as u32;
            let shift = 16 - 8 * (addr & 2) as u32;
            let merged = (word & !(0xffff << shift)) | (((rt as u32) & 0xffff) << shift);
            env.write_mem_word(addr, merged)?;
            env.advance_pc();
        }
        I::Store32 => {
            env.write_mem_word(addr, rt as u32)?;
            env.advance_pc();
        }
        I::Store64 => {
            env.write_mem_doubleword(addr, rt)?;
            env.advance_pc();
        }
        I::StoreWordLeft => {
            let word = env.read_mem_word(addr)? as u32;
            let shift = 8 * (addr & 3) as u32;
            let mask = u32::MAX >> shift;
            let merged = (word & !mask) | (((rt as u32) >> shift) & mask);
            env.write_mem_word(addr, merged)?;
            env.advance_pc();
        }
        I::StoreWordRight => {
            let word = env.read_mem_word(addr)? as u32;
            let shift = 24 - 8 * (addr & 3) as u32;
            let mask = u32::MAX << shift;
            let merged = (word & !mask) | (((rt as u32) << shift) & mask);
            env.write_mem_word(addr, merged)?;
            env.advance_pc();
        }
        I::StoreDoubleLeft => {
            let word = env.read_mem_doubleword(addr)?;
            let shift = 8 * (addr & 7) as u32;
            let mask = u64::MAX >> shift;
            env.write_mem_doubleword(addr, (word & !mask) | ((rt >> shift) & mask))?;
            env.advance_pc();
        }
        I::StoreDoubleRight => {
            let word = env.read_mem_doubleword(addr)?;
            let shift = 56 - 8 * (addr & 7) as u32;
            let mask = u64::MAX << shift;
            env.write_mem_doubleword(addr, (word & !mask) | ((rt << shift) & mask))?;
            env.advance_pc();
        }
        I::StoreConditional => {
            // sc always succeeds: the scheduler never switches threads
            // between ll and sc.
            env.write_mem_word(addr, rt as u32)?;
            env.handle_rd(rt_reg, 1);
        }
        I::StoreConditionalDouble => {
            env.write_mem_doubleword(addr, rt)?;
            env.handle_rd(rt_reg, 1);
        }
    }
    Ok(())
}
