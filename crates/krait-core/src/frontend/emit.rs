//! IR emission helpers
//!
//! Thin constructors over `OpDispatchBuilder::emit`: allocate the payload,
//! link a node after the write cursor, hand back the new value's id.
//! Scalar helpers take the result size in bytes; vector helpers take the
//! register size and element size separately.

use super::OpDispatchBuilder;
use crate::ir::{BreakReason, CondCode, NodeId, Op, OpKind};

impl OpDispatchBuilder {
    fn scalar(&mut self, kind: OpKind, size: u8, has_dest: bool, args: &[NodeId]) -> NodeId {
        self.emit(Op::new(kind, size, 1, has_dest, args))
    }

    fn vector(&mut self, kind: OpKind, reg_size: u8, elem_size: u8, args: &[NodeId]) -> NodeId {
        debug_assert!(reg_size % elem_size == 0);
        self.emit(Op::new(kind, elem_size, reg_size / elem_size, true, args))
    }

    // ===== Values and guest state =====

    pub fn constant(&mut self, size: u8, value: u64) -> NodeId {
        self.scalar(OpKind::Constant { value }, size, true, &[])
    }

    pub fn load_context(&mut self, size: u8, offset: u32) -> NodeId {
        self.scalar(OpKind::LoadContext { offset }, size, true, &[])
    }

    pub fn store_context(&mut self, size: u8, offset: u32, value: NodeId) -> NodeId {
        self.scalar(OpKind::StoreContext { offset }, size, false, &[value])
    }

    pub fn load_mem(&mut self, size: u8, addr: NodeId) -> NodeId {
        self.scalar(OpKind::LoadMem, size, true, &[addr])
    }

    pub fn store_mem(&mut self, size: u8, addr: NodeId, value: NodeId) -> NodeId {
        self.scalar(OpKind::StoreMem, size, false, &[addr, value])
    }

    // ===== Integer ALU =====

    pub fn add(&mut self, size: u8, a: NodeId, b: NodeId) -> NodeId {
        self.scalar(OpKind::Add, size, true, &[a, b])
    }

    pub fn sub(&mut self, size: u8, a: NodeId, b: NodeId) -> NodeId {
        self.scalar(OpKind::Sub, size, true, &[a, b])
    }

    pub fn mul(&mut self, size: u8, a: NodeId, b: NodeId) -> NodeId {
        self.scalar(OpKind::Mul, size, true, &[a, b])
    }

    pub fn umul(&mut self, size: u8, a: NodeId, b: NodeId) -> NodeId {
        self.scalar(OpKind::UMul, size, true, &[a, b])
    }

    pub fn mulh(&mut self, size: u8, a: NodeId, b: NodeId) -> NodeId {
        self.scalar(OpKind::MulH, size, true, &[a, b])
    }

    pub fn umulh(&mut self, size: u8, a: NodeId, b: NodeId) -> NodeId {
        self.scalar(OpKind::UMulH, size, true, &[a, b])
    }

    pub fn ldiv(&mut self, size: u8, low: NodeId, high: NodeId, divisor: NodeId) -> NodeId {
        self.scalar(OpKind::LDiv, size, true, &[low, high, divisor])
    }

    pub fn ludiv(&mut self, size: u8, low: NodeId, high: NodeId, divisor: NodeId) -> NodeId {
        self.scalar(OpKind::LUDiv, size, true, &[low, high, divisor])
    }

    pub fn lrem(&mut self, size: u8, low: NodeId, high: NodeId, divisor: NodeId) -> NodeId {
        self.scalar(OpKind::LRem, size, true, &[low, high, divisor])
    }

    pub fn lurem(&mut self, size: u8, low: NodeId, high: NodeId, divisor: NodeId) -> NodeId {
        self.scalar(OpKind::LURem, size, true, &[low, high, divisor])
    }

    pub fn and(&mut self, size: u8, a: NodeId, b: NodeId) -> NodeId {
        self.scalar(OpKind::And, size, true, &[a, b])
    }

    pub fn or(&mut self, size: u8, a: NodeId, b: NodeId) -> NodeId {
        self.scalar(OpKind::Or, size, true, &[a, b])
    }

    pub fn xor(&mut self, size: u8, a: NodeId, b: NodeId) -> NodeId {
        self.scalar(OpKind::Xor, size, true, &[a, b])
    }

    pub fn not(&mut self, size: u8, a: NodeId) -> NodeId {
        self.scalar(OpKind::Not, size, true, &[a])
    }

    pub fn neg(&mut self, size: u8, a: NodeId) -> NodeId {
        self.scalar(OpKind::Neg, size, true, &[a])
    }

    pub fn lshl(&mut self, size: u8, value: NodeId, amount: NodeId) -> NodeId {
        self.scalar(OpKind::Lshl, size, true, &[value, amount])
    }

    pub fn lshr(&mut self, size: u8, value: NodeId, amount: NodeId) -> NodeId {
        self.scalar(OpKind::Lshr, size, true, &[value, amount])
    }

    pub fn ashr(&mut self, size: u8, value: NodeId, amount: NodeId) -> NodeId {
        self.scalar(OpKind::Ashr, size, true, &[value, amount])
    }

    pub fn ror(&mut self, size: u8, value: NodeId, amount: NodeId) -> NodeId {
        self.scalar(OpKind::Ror, size, true, &[value, amount])
    }

    /// Sign-extend from `src_width` bits to a 64-bit value.
    pub fn sext(&mut self, src_width: u8, value: NodeId) -> NodeId {
        self.scalar(OpKind::Sext { src_width }, 8, true, &[value])
    }

    /// Zero-extend from `src_width` bits to a 64-bit value.
    pub fn zext(&mut self, src_width: u8, value: NodeId) -> NodeId {
        self.scalar(OpKind::Zext { src_width }, 8, true, &[value])
    }

    pub fn bfe(&mut self, width: u8, lsb: u8, value: NodeId) -> NodeId {
        self.scalar(OpKind::Bfe { width, lsb }, 8, true, &[value])
    }

    pub fn bfi(&mut self, size: u8, width: u8, lsb: u8, base: NodeId, field: NodeId) -> NodeId {
        self.scalar(OpKind::Bfi { width, lsb }, size, true, &[base, field])
    }

    /// `cond(a, b) ? if_true : if_false`.
    pub fn select(
        &mut self,
        cond: CondCode,
        size: u8,
        a: NodeId,
        b: NodeId,
        if_true: NodeId,
        if_false: NodeId,
    ) -> NodeId {
        self.scalar(OpKind::Select { cond }, size, true, &[a, b, if_true, if_false])
    }

    pub fn popcount(&mut self, size: u8, value: NodeId) -> NodeId {
        self.scalar(OpKind::Popcount, size, true, &[value])
    }

    pub fn find_lsb(&mut self, size: u8, value: NodeId) -> NodeId {
        self.scalar(OpKind::FindLsb, size, true, &[value])
    }

    pub fn find_msb(&mut self, size: u8, value: NodeId) -> NodeId {
        self.scalar(OpKind::FindMsb, size, true, &[value])
    }

    pub fn bswap(&mut self, size: u8, value: NodeId) -> NodeId {
        self.scalar(OpKind::Bswap, size, true, &[value])
    }

    pub fn cpuid(&mut self, function: NodeId, subleaf: NodeId) -> NodeId {
        // Four 64-bit result lanes: rax, rbx, rcx, rdx.
        self.emit(Op::new(OpKind::Cpuid, 8, 4, true, &[function, subleaf]))
    }

    pub fn cycle_counter(&mut self) -> NodeId {
        self.scalar(OpKind::CycleCounter, 8, true, &[])
    }

    pub fn syscall(&mut self, args: [NodeId; 7]) -> NodeId {
        self.scalar(OpKind::Syscall, 8, true, &args)
    }

    pub fn cas(&mut self, size: u8, expected: NodeId, desired: NodeId, addr: NodeId) -> NodeId {
        self.scalar(OpKind::Cas, size, true, &[expected, desired, addr])
    }

    // ===== Control flow =====

    /// Unconditional branch with an unresolved target.
    pub fn jump(&mut self) -> NodeId {
        self.scalar(OpKind::Jump, 0, false, &[NodeId::INVALID])
    }

    /// Conditional branch on `cond_value != 0` with unresolved edges.
    pub fn cond_jump(&mut self, cond_value: NodeId) -> NodeId {
        self.scalar(
            OpKind::CondJump,
            0,
            false,
            &[cond_value, NodeId::INVALID, NodeId::INVALID],
        )
    }

    pub fn break_op(&mut self, reason: BreakReason) -> NodeId {
        self.scalar(OpKind::Break { reason }, 0, false, &[])
    }

    // ===== Vector =====

    pub fn vector_zero(&mut self) -> NodeId {
        self.vector(OpKind::VectorZero, 16, 16, &[])
    }

    pub fn vadd(&mut self, reg_size: u8, elem_size: u8, a: NodeId, b: NodeId) -> NodeId {
        self.vector(OpKind::VAdd, reg_size, elem_size, &[a, b])
    }

    pub fn vsub(&mut self, reg_size: u8, elem_size: u8, a: NodeId, b: NodeId) -> NodeId {
        self.vector(OpKind::VSub, reg_size, elem_size, &[a, b])
    }

    pub fn vand(&mut self, reg_size: u8, elem_size: u8, a: NodeId, b: NodeId) -> NodeId {
        self.vector(OpKind::VAnd, reg_size, elem_size, &[a, b])
    }

    pub fn vor(&mut self, reg_size: u8, elem_size: u8, a: NodeId, b: NodeId) -> NodeId {
        self.vector(OpKind::VOr, reg_size, elem_size, &[a, b])
    }

    pub fn vxor(&mut self, reg_size: u8, elem_size: u8, a: NodeId, b: NodeId) -> NodeId {
        self.vector(OpKind::VXor, reg_size, elem_size, &[a, b])
    }

    pub fn vumin(&mut self, reg_size: u8, elem_size: u8, a: NodeId, b: NodeId) -> NodeId {
        self.vector(OpKind::VUMin, reg_size, elem_size, &[a, b])
    }

    pub fn vsmin(&mut self, reg_size: u8, elem_size: u8, a: NodeId, b: NodeId) -> NodeId {
        self.vector(OpKind::VSMin, reg_size, elem_size, &[a, b])
    }

    pub fn vcmpeq(&mut self, reg_size: u8, elem_size: u8, a: NodeId, b: NodeId) -> NodeId {
        self.vector(OpKind::VCmpEq, reg_size, elem_size, &[a, b])
    }

    pub fn vcmpgt(&mut self, reg_size: u8, elem_size: u8, a: NodeId, b: NodeId) -> NodeId {
        self.vector(OpKind::VCmpGt, reg_size, elem_size, &[a, b])
    }

    pub fn vushl_wide(&mut self, reg_size: u8, elem_size: u8, a: NodeId, b: NodeId) -> NodeId {
        self.vector(OpKind::VUShl, reg_size, elem_size, &[a, b])
    }

    /// Shift every element left by the scalar in `amount`'s first lane.
    pub fn vushl_scalar(&mut self, reg_size: u8, elem_size: u8, a: NodeId, amount: NodeId) -> NodeId {
        self.vector(OpKind::VUShlS, reg_size, elem_size, &[a, amount])
    }

    pub fn vushr_wide(&mut self, reg_size: u8, elem_size: u8, a: NodeId, b: NodeId) -> NodeId {
        self.vector(OpKind::VUShr, reg_size, elem_size, &[a, b])
    }

    pub fn vushr_scalar(&mut self, reg_size: u8, elem_size: u8, a: NodeId, amount: NodeId) -> NodeId {
        self.vector(OpKind::VUShrS, reg_size, elem_size, &[a, amount])
    }

    /// Extract 16 bytes at byte `index` of `upper:lower`.
    pub fn vextr(&mut self, reg_size: u8, index: u8, upper: NodeId, lower: NodeId) -> NodeId {
        self.vector(OpKind::VExtr { index }, reg_size, 1, &[upper, lower])
    }

    pub fn vins_element(
        &mut self,
        reg_size: u8,
        elem_size: u8,
        dest_idx: u8,
        src_idx: u8,
        base: NodeId,
        src: NodeId,
    ) -> NodeId {
        self.vector(
            OpKind::VInsElement { dest_idx, src_idx },
            reg_size,
            elem_size,
            &[base, src],
        )
    }

    pub fn vdup_element(&mut self, reg_size: u8, elem_size: u8, idx: u8, value: NodeId) -> NodeId {
        self.vector(OpKind::VDupElement { idx }, reg_size, elem_size, &[value])
    }

    pub fn vzip(&mut self, reg_size: u8, elem_size: u8, a: NodeId, b: NodeId) -> NodeId {
        self.vector(OpKind::VZip, reg_size, elem_size, &[a, b])
    }

    pub fn vzip2(&mut self, reg_size: u8, elem_size: u8, a: NodeId, b: NodeId) -> NodeId {
        self.vector(OpKind::VZip2, reg_size, elem_size, &[a, b])
    }

    pub fn vmove_byte_mask(&mut self, reg_size: u8, value: NodeId) -> NodeId {
        self.vector(OpKind::VMoveByteMask, reg_size, 1, &[value])
    }

    pub fn vcast_from_gpr(&mut self, elem_size: u8, value: NodeId) -> NodeId {
        self.vector(OpKind::VCastFromGpr, 16, elem_size, &[value])
    }

    pub fn vextract_to_gpr(&mut self, elem_size: u8, idx: u8, value: NodeId) -> NodeId {
        self.scalar(OpKind::VExtractToGpr { idx }, elem_size, true, &[value])
    }

    // ===== Crypto =====

    pub fn vaesimc(&mut self, state: NodeId) -> NodeId {
        self.vector(OpKind::VAesImc, 16, 16, &[state])
    }

    pub fn vaesenc(&mut self, state: NodeId, key: NodeId) -> NodeId {
        self.vector(OpKind::VAesEnc, 16, 16, &[state, key])
    }

    pub fn vaesenclast(&mut self, state: NodeId, key: NodeId) -> NodeId {
        self.vector(OpKind::VAesEncLast, 16, 16, &[state, key])
    }

    pub fn vaesdec(&mut self, state: NodeId, key: NodeId) -> NodeId {
        self.vector(OpKind::VAesDec, 16, 16, &[state, key])
    }

    pub fn vaesdeclast(&mut self, state: NodeId, key: NodeId) -> NodeId {
        self.vector(OpKind::VAesDecLast, 16, 16, &[state, key])
    }

    pub fn vaeskeygenassist(&mut self, rcon: u8, src: NodeId) -> NodeId {
        self.vector(OpKind::VAesKeyGenAssist { rcon }, 16, 16, &[src])
    }

    pub fn crc32(&mut self, src_size: u8, acc: NodeId, input: NodeId) -> NodeId {
        self.scalar(OpKind::Crc32 { src_size }, 4, true, &[acc, input])
    }
}
