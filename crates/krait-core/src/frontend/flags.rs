//! RFLAGS lane handling
//!
//! Each architectural flag is modeled as its own one-byte lane in the
//! guest context so the backend can drop flag computations nothing reads.
//! The generators mirror the x86 flag semantics of each result family.

use super::operands::Cond;
use super::state;
use super::OpDispatchBuilder;
use crate::ir::{CondCode, NodeId, Op, OpKind};

pub const FLAG_CF: u8 = 0;
pub const FLAG_PF: u8 = 2;
pub const FLAG_AF: u8 = 4;
pub const FLAG_ZF: u8 = 6;
pub const FLAG_SF: u8 = 7;
pub const FLAG_DF: u8 = 10;
pub const FLAG_OF: u8 = 11;

/// Lanes materialized by the packed accessors, low byte first.
const PACKED_LOWER8: [u8; 5] = [FLAG_CF, FLAG_PF, FLAG_AF, FLAG_ZF, FLAG_SF];
const PACKED_UPPER: [u8; 2] = [FLAG_DF, FLAG_OF];

impl OpDispatchBuilder {
    /// Write one flag lane from an SSA value holding 0 or 1.
    pub fn set_rflag(&mut self, bit: u8, value: NodeId) {
        debug_assert!((bit as u32) < state::FLAGS_LANES);
        self.emit(Op::new(OpKind::StoreFlag { bit }, 1, 1, false, &[value]));
    }

    /// Read one flag lane as a 0/1 value.
    pub fn get_rflag(&mut self, bit: u8) -> NodeId {
        debug_assert!((bit as u32) < state::FLAGS_LANES);
        self.emit(Op::new(OpKind::LoadFlag { bit }, 1, 1, true, &[]))
    }

    /// Scatter a packed flags word into the lanes. `lower8` restricts the
    /// write to the SAHF-visible byte.
    pub fn set_packed_rflag(&mut self, lower8: bool, src: NodeId) {
        for &bit in &PACKED_LOWER8 {
            let lane = self.bfe(1, bit, src);
            self.set_rflag(bit, lane);
        }
        if !lower8 {
            for &bit in &PACKED_UPPER {
                let lane = self.bfe(1, bit, src);
                self.set_rflag(bit, lane);
            }
        }
    }

    /// Gather the lanes back into a packed flags word. Bit 1 is the
    /// architecturally reserved always-one bit.
    pub fn get_packed_rflag(&mut self, lower8: bool) -> NodeId {
        let mut packed = self.constant(8, 0b10);
        let lanes: &[u8] = if lower8 {
            &PACKED_LOWER8
        } else {
            &[FLAG_CF, FLAG_PF, FLAG_AF, FLAG_ZF, FLAG_SF, FLAG_DF, FLAG_OF]
        };
        for &bit in lanes {
            let lane = self.get_rflag(bit);
            let shift = self.constant(8, bit as u64);
            let shifted = self.lshl(8, lane, shift);
            packed = self.or(8, packed, shifted);
        }
        packed
    }

    /// ZF, SF, and PF from a result value.
    pub(crate) fn set_zsp(&mut self, size: u8, res: NodeId) {
        let zero = self.constant(size, 0);
        let one = self.constant(1, 1);
        let zero1 = self.constant(1, 0);

        let zf = self.select(CondCode::Eq, size, res, zero, one, zero1);
        self.set_rflag(FLAG_ZF, zf);

        let sf = self.bfe(1, size * 8 - 1, res);
        self.set_rflag(FLAG_SF, sf);

        // PF is set for an even population count of the low byte.
        let low = self.bfe(8, 0, res);
        let pop = self.popcount(8, low);
        let parity = self.bfe(1, 0, pop);
        let inverted = self.xor(1, parity, one);
        self.set_rflag(FLAG_PF, inverted);
    }

    fn set_af(&mut self, res: NodeId, src1: NodeId, src2: NodeId) {
        let x = self.xor(8, src1, src2);
        let x = self.xor(8, x, res);
        let af = self.bfe(1, 4, x);
        self.set_rflag(FLAG_AF, af);
    }

    /// Signed-overflow lane from `(a ^ res) & (b ^ res)`-style masks.
    fn set_of_from(&mut self, size: u8, lhs: NodeId, rhs: NodeId) {
        let both = self.and(size, lhs, rhs);
        let of = self.bfe(1, size * 8 - 1, both);
        self.set_rflag(FLAG_OF, of);
    }

    pub(crate) fn flags_add(&mut self, size: u8, res: NodeId, src1: NodeId, src2: NodeId) {
        self.set_zsp(size, res);
        self.set_af(res, src1, src2);

        let one = self.constant(1, 1);
        let zero = self.constant(1, 0);
        let cf = self.select(CondCode::Ult, size, res, src1, one, zero);
        self.set_rflag(FLAG_CF, cf);

        let x1 = self.xor(size, src1, res);
        let x2 = self.xor(size, src2, res);
        self.set_of_from(size, x1, x2);
    }

    pub(crate) fn flags_sub(&mut self, size: u8, res: NodeId, src1: NodeId, src2: NodeId) {
        self.set_zsp(size, res);
        self.set_af(res, src1, src2);

        let one = self.constant(1, 1);
        let zero = self.constant(1, 0);
        let cf = self.select(CondCode::Ult, size, src1, src2, one, zero);
        self.set_rflag(FLAG_CF, cf);

        let x1 = self.xor(size, src1, src2);
        let x2 = self.xor(size, src1, res);
        self.set_of_from(size, x1, x2);
    }

    pub(crate) fn flags_adc(
        &mut self,
        size: u8,
        res: NodeId,
        src1: NodeId,
        src2: NodeId,
        carry_in: NodeId,
    ) {
        self.set_zsp(size, res);
        self.set_af(res, src1, src2);

        // Carry out: res < src1, or res == src1 while a carry came in.
        let one = self.constant(1, 1);
        let zero = self.constant(1, 0);
        let lt = self.select(CondCode::Ult, size, res, src1, one, zero);
        let eq = self.select(CondCode::Eq, size, res, src1, one, zero);
        let eq_carry = self.and(1, eq, carry_in);
        let cf = self.or(1, lt, eq_carry);
        self.set_rflag(FLAG_CF, cf);

        let x1 = self.xor(size, src1, res);
        let x2 = self.xor(size, src2, res);
        self.set_of_from(size, x1, x2);
    }

    pub(crate) fn flags_sbb(
        &mut self,
        size: u8,
        res: NodeId,
        src1: NodeId,
        src2: NodeId,
        borrow_in: NodeId,
    ) {
        self.set_zsp(size, res);
        self.set_af(res, src1, src2);

        let one = self.constant(1, 1);
        let zero = self.constant(1, 0);
        let lt = self.select(CondCode::Ult, size, src1, src2, one, zero);
        let eq = self.select(CondCode::Eq, size, src1, src2, one, zero);
        let eq_borrow = self.and(1, eq, borrow_in);
        let cf = self.or(1, lt, eq_borrow);
        self.set_rflag(FLAG_CF, cf);

        let x1 = self.xor(size, src1, src2);
        let x2 = self.xor(size, src1, res);
        self.set_of_from(size, x1, x2);
    }

    /// Signed widening multiply: CF=OF= high half differs from the sign
    /// extension of the low half.
    pub(crate) fn flags_mul(&mut self, size: u8, res: NodeId, high: NodeId) {
        self.set_zsp(size, res);

        let shift = self.constant(8, size as u64 * 8 - 1);
        let sign = self.ashr(size, res, shift);
        let one = self.constant(1, 1);
        let zero = self.constant(1, 0);
        let overflow = self.select(CondCode::Neq, size, high, sign, one, zero);
        self.set_rflag(FLAG_CF, overflow);
        self.set_rflag(FLAG_OF, overflow);
    }

    /// Unsigned widening multiply: CF=OF= high half non-zero.
    pub(crate) fn flags_umul(&mut self, size: u8, res: NodeId, high: NodeId) {
        self.set_zsp(size, res);

        let zero_val = self.constant(size, 0);
        let one = self.constant(1, 1);
        let zero = self.constant(1, 0);
        let overflow = self.select(CondCode::Neq, size, high, zero_val, one, zero);
        self.set_rflag(FLAG_CF, overflow);
        self.set_rflag(FLAG_OF, overflow);
    }

    pub(crate) fn flags_logical(&mut self, size: u8, res: NodeId) {
        self.set_zsp(size, res);
        let zero = self.constant(1, 0);
        self.set_rflag(FLAG_CF, zero);
        let zero = self.constant(1, 0);
        self.set_rflag(FLAG_OF, zero);
    }

    /// Left shift: CF is the last bit shifted out, OF is CF ^ the result
    /// sign (architecturally defined only for a shift of one).
    pub(crate) fn flags_shift_left(&mut self, size: u8, res: NodeId, src: NodeId, amount: NodeId) {
        self.set_zsp(size, res);

        let bits = self.constant(8, size as u64 * 8);
        let inv = self.sub(8, bits, amount);
        let out = self.lshr(size, src, inv);
        let cf = self.bfe(1, 0, out);
        self.set_rflag(FLAG_CF, cf);

        let msb = self.bfe(1, size * 8 - 1, res);
        let of = self.xor(1, msb, cf);
        self.set_rflag(FLAG_OF, of);
    }

    /// Right shifts: CF is bit `amount - 1` of the source.
    pub(crate) fn flags_shift_right(&mut self, size: u8, res: NodeId, src: NodeId, amount: NodeId) {
        self.set_zsp(size, res);

        let one = self.constant(8, 1);
        let last = self.sub(8, amount, one);
        let out = self.lshr(size, src, last);
        let cf = self.bfe(1, 0, out);
        self.set_rflag(FLAG_CF, cf);

        let of = self.bfe(1, size * 8 - 1, src);
        self.set_rflag(FLAG_OF, of);
    }

    /// Rotates only touch CF and OF.
    pub(crate) fn flags_rotate(&mut self, size: u8, res: NodeId, left: bool) {
        let cf = if left {
            self.bfe(1, 0, res)
        } else {
            self.bfe(1, size * 8 - 1, res)
        };
        self.set_rflag(FLAG_CF, cf);

        let msb = self.bfe(1, size * 8 - 1, res);
        let next = self.bfe(1, size * 8 - 2, res);
        let of = self.xor(1, msb, next);
        self.set_rflag(FLAG_OF, of);
    }

    /// Materialize a Jcc/SETcc/CMOVcc condition as a 0/1 value.
    pub(crate) fn cond_value(&mut self, cond: Cond) -> NodeId {
        let one = self.constant(1, 1);
        match cond {
            Cond::O => self.get_rflag(FLAG_OF),
            Cond::No => {
                let of = self.get_rflag(FLAG_OF);
                self.xor(1, of, one)
            }
            Cond::B => self.get_rflag(FLAG_CF),
            Cond::Nb => {
                let cf = self.get_rflag(FLAG_CF);
                self.xor(1, cf, one)
            }
            Cond::Z => self.get_rflag(FLAG_ZF),
            Cond::Nz => {
                let zf = self.get_rflag(FLAG_ZF);
                self.xor(1, zf, one)
            }
            Cond::Be => {
                let cf = self.get_rflag(FLAG_CF);
                let zf = self.get_rflag(FLAG_ZF);
                self.or(1, cf, zf)
            }
            Cond::Nbe => {
                let cf = self.get_rflag(FLAG_CF);
                let zf = self.get_rflag(FLAG_ZF);
                let either = self.or(1, cf, zf);
                self.xor(1, either, one)
            }
            Cond::S => self.get_rflag(FLAG_SF),
            Cond::Ns => {
                let sf = self.get_rflag(FLAG_SF);
                self.xor(1, sf, one)
            }
            Cond::P => self.get_rflag(FLAG_PF),
            Cond::Np => {
                let pf = self.get_rflag(FLAG_PF);
                self.xor(1, pf, one)
            }
            Cond::L => {
                let sf = self.get_rflag(FLAG_SF);
                let of = self.get_rflag(FLAG_OF);
                self.xor(1, sf, of)
            }
            Cond::Nl => {
                let sf = self.get_rflag(FLAG_SF);
                let of = self.get_rflag(FLAG_OF);
                let ne = self.xor(1, sf, of);
                self.xor(1, ne, one)
            }
            Cond::Le => {
                let sf = self.get_rflag(FLAG_SF);
                let of = self.get_rflag(FLAG_OF);
                let ne = self.xor(1, sf, of);
                let zf = self.get_rflag(FLAG_ZF);
                self.or(1, ne, zf)
            }
            Cond::Nle => {
                let sf = self.get_rflag(FLAG_SF);
                let of = self.get_rflag(FLAG_OF);
                let ne = self.xor(1, sf, of);
                let zf = self.get_rflag(FLAG_ZF);
                let either = self.or(1, ne, zf);
                self.xor(1, either, one)
            }
        }
    }
}
