//! Decoder-facing instruction types
//!
//! The instruction decoder is an external collaborator; these are the
//! records it hands to the dispatcher. One `DecodedOp` is one guest
//! instruction with classified opcode, parsed operands, and prefixes.

use super::state;
use super::OpDispatchBuilder;
use crate::ir::NodeId;

/// x86-64 general purpose registers in encoding order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[rustfmt::skip]
pub enum X86Reg {
    Rax, Rcx, Rdx, Rbx, Rsp, Rbp, Rsi, Rdi,
    R8, R9, R10, R11, R12, R13, R14, R15,
}

impl X86Reg {
    pub fn index(self) -> u32 {
        self as u32
    }
}

/// Segment registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segment {
    Es,
    Cs,
    Ss,
    Ds,
    Fs,
    Gs,
}

/// x86 condition codes, in Jcc encoding order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[rustfmt::skip]
pub enum Cond {
    O, No, B, Nb, Z, Nz, Be, Nbe,
    S, Ns, P, Np, L, Nl, Le, Nle,
}

/// Two-operand ALU family selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AluOp {
    Add,
    Or,
    Adc,
    Sbb,
    And,
    Sub,
    Xor,
    Cmp,
}

/// Shift and rotate family selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShiftOp {
    Shl,
    Shr,
    Sar,
    Rol,
    Ror,
}

/// Packed-integer vector ALU selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorAluOp {
    Add,
    Sub,
    And,
    Or,
    Xor,
    UMin,
    SMin,
}

/// Instruction prefix bits as reported by the decoder.
pub mod prefix {
    pub const LOCK: u16 = 1 << 0;
    pub const REP: u16 = 1 << 1;
    pub const REPNE: u16 = 1 << 2;
    pub const OPERAND_SIZE: u16 = 1 << 3;
    pub const ADDRESS_SIZE: u16 = 1 << 4;
    pub const REX_W: u16 = 1 << 5;
    pub const VEX: u16 = 1 << 6;
    pub const EVEX: u16 = 1 << 7;
}

/// A parsed operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Operand {
    #[default]
    None,
    Imm(u64),
    Gpr(X86Reg),
    /// AH/CH/DH/BH encodings.
    GprHigh(X86Reg),
    Xmm(u8),
    Mem {
        base: Option<X86Reg>,
        index: Option<X86Reg>,
        scale: u8,
        disp: i64,
    },
    RipRelative(i64),
}

/// Opcode families the dispatcher implements. Selector payloads carry
/// what the opcode byte itself encodes (condition, ALU sub-op, element
/// size); operand-derived values arrive through `DecodedOp` operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum X86Op {
    Mov,
    MovOffset,
    Movsx,
    Movzx,
    Movsxd,
    Lea,
    Leave,
    Xchg,
    Bswap,
    Cmov(Cond),
    Setcc(Cond),
    Alu(AluOp),
    Test,
    Inc,
    Dec,
    Neg,
    Not,
    Mul,
    Imul1Src,
    Imul2Src,
    Div,
    Idiv,
    Shift(ShiftOp),
    Bsf,
    Bsr,
    Bt,
    Push,
    Pop,
    Call,
    CallAbs,
    Ret,
    Jump,
    JumpAbs,
    CondJump(Cond),
    Nop,
    Sahf,
    Lahf,
    Clc,
    Stc,
    Cld,
    Std,
    Cmc,
    Cpuid,
    Rdtsc,
    Cqo,
    Cdq,
    Stos,
    Movs,
    Cmps,
    /// `mov` to or from a segment register.
    MovSeg {
        to_seg: bool,
    },
    Cmpxchg,
    Int3,
    Int(u8),
    Syscall,

    // SSE
    Movups,
    Movlhps,
    Movhpd,
    Movddup,
    Movd,
    Movq,
    VectorAlu {
        op: VectorAluOp,
        elem_size: u8,
    },
    PcmpEq {
        elem_size: u8,
    },
    PcmpGt {
        elem_size: u8,
    },
    Pshuf {
        elem_size: u8,
        low: bool,
    },
    Shuf {
        elem_size: u8,
    },
    Punpckl {
        elem_size: u8,
    },
    Punpckh {
        elem_size: u8,
    },
    Palignr,
    Psll {
        elem_size: u8,
    },
    Psrl {
        elem_size: u8,
    },
    Psrldq,
    Pminu {
        elem_size: u8,
    },
    Pminsw,
    Pmovmskb,
    Fxsave,
    Fxrstor,

    // Crypto
    AesImc,
    AesEnc,
    AesEncLast,
    AesDec,
    AesDecLast,
    AesKeyGenAssist,
    Crc32,

    /// Decoded but not implemented by this dispatcher.
    Unimplemented,
}

/// One decoded guest instruction.
#[derive(Debug, Clone, Copy)]
pub struct DecodedOp {
    /// Guest instruction pointer of this instruction.
    pub rip: u64,
    pub op: X86Op,
    pub dest: Operand,
    pub src: [Operand; 2],
    /// Instruction length in bytes.
    pub len: u8,
    /// Operand size in bytes (1, 2, 4, 8, or 16).
    pub op_size: u8,
    /// Source size in bytes where it differs (MOVSX/MOVZX/CRC32).
    pub src_size: u8,
    pub prefixes: u16,
    pub segment: Option<Segment>,
}

impl DecodedOp {
    /// The guest rip of the following instruction.
    pub fn next_rip(&self) -> u64 {
        self.rip + self.len as u64
    }

    pub fn has_prefix(&self, bit: u16) -> bool {
        self.prefixes & bit != 0
    }
}

impl Default for DecodedOp {
    fn default() -> Self {
        DecodedOp {
            rip: 0,
            op: X86Op::Nop,
            dest: Operand::None,
            src: [Operand::None; 2],
            len: 1,
            op_size: 8,
            src_size: 8,
            prefixes: 0,
            segment: None,
        }
    }
}

impl OpDispatchBuilder {
    /// Load an operand as an SSA value of the instruction's operand size.
    pub(crate) fn load_source(&mut self, op: &DecodedOp, operand: &Operand) -> NodeId {
        self.load_source_with_size(op, operand, op.op_size)
    }

    /// Load an operand as an SSA value of an explicit size.
    pub(crate) fn load_source_with_size(
        &mut self,
        op: &DecodedOp,
        operand: &Operand,
        size: u8,
    ) -> NodeId {
        match *operand {
            Operand::None => panic!("loading an absent operand at rip {:#x}", op.rip),
            Operand::Imm(value) => self.constant(size, value),
            Operand::Gpr(reg) => self.load_context(size, state::gpr_offset(reg)),
            Operand::GprHigh(reg) => self.load_context(1, state::gpr_offset(reg) + 1),
            Operand::Xmm(reg) => self.load_context(size, state::xmm_offset(reg)),
            Operand::Mem { .. } | Operand::RipRelative(_) => {
                let addr = self.effective_address(op, operand);
                self.load_mem(size, addr)
            }
        }
    }

    /// Compute the effective address of a memory operand, applying the
    /// segment base for FS/GS overrides.
    pub(crate) fn effective_address(&mut self, op: &DecodedOp, operand: &Operand) -> NodeId {
        let mut addr = match *operand {
            Operand::Mem {
                base,
                index,
                scale,
                disp,
            } => {
                let mut addr = match base {
                    Some(reg) => self.load_context(8, state::gpr_offset(reg)),
                    None => self.constant(8, 0),
                };
                if let Some(reg) = index {
                    let mut idx = self.load_context(8, state::gpr_offset(reg));
                    if scale > 1 {
                        let shift = self.constant(8, scale.trailing_zeros() as u64);
                        idx = self.lshl(8, idx, shift);
                    }
                    addr = self.add(8, addr, idx);
                }
                if disp != 0 {
                    let disp = self.constant(8, disp as u64);
                    addr = self.add(8, addr, disp);
                }
                addr
            }
            Operand::RipRelative(disp) => {
                self.constant(8, op.next_rip().wrapping_add(disp as u64))
            }
            _ => panic!("address of a non-memory operand at rip {:#x}", op.rip),
        };
        if let Some(segment @ (Segment::Fs | Segment::Gs)) = op.segment {
            let base = self.load_context(8, state::segment_base_offset(segment));
            addr = self.add(8, addr, base);
        }
        addr
    }

    /// Store an SSA value back to an operand at the instruction's size.
    pub(crate) fn store_result(&mut self, op: &DecodedOp, operand: &Operand, value: NodeId) {
        self.store_result_with_size(op, operand, value, op.op_size)
    }

    /// Store with an explicit size. 32-bit GPR writes zero the upper half,
    /// 8/16-bit writes merge into the register.
    pub(crate) fn store_result_with_size(
        &mut self,
        op: &DecodedOp,
        operand: &Operand,
        value: NodeId,
        size: u8,
    ) {
        match *operand {
            Operand::None => panic!("storing to an absent operand at rip {:#x}", op.rip),
            Operand::Imm(_) => panic!("storing to an immediate at rip {:#x}", op.rip),
            Operand::Gpr(reg) => {
                if size == 4 {
                    let wide = self.zext(32, value);
                    self.store_context(8, state::gpr_offset(reg), wide);
                } else {
                    self.store_context(size, state::gpr_offset(reg), value);
                }
            }
            Operand::GprHigh(reg) => {
                self.store_context(1, state::gpr_offset(reg) + 1, value);
            }
            Operand::Xmm(reg) => {
                self.store_context(size, state::xmm_offset(reg), value);
            }
            Operand::Mem { .. } | Operand::RipRelative(_) => {
                let addr = self.effective_address(op, operand);
                self.store_mem(size, addr, value);
            }
        }
    }
}
