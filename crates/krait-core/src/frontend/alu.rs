//! Integer ALU, shift, bit-scan, and data-movement handlers
//!
//! Each handler lowers one x86 instruction family: load the sources,
//! emit the arithmetic, store the destination, and update the affected
//! RFLAGS lanes through the shared generators.

use super::operands::{AluOp, Cond, DecodedOp, Operand, ShiftOp, X86Reg};
use super::state;
use super::OpDispatchBuilder;
use crate::ir::{CondCode, NodeId};

impl OpDispatchBuilder {
    fn load_gpr(&mut self, size: u8, reg: X86Reg) -> NodeId {
        self.load_context(size, state::gpr_offset(reg))
    }

    /// Store to a GPR with the x86-64 32-bit zero-extension rule.
    pub(crate) fn store_gpr(&mut self, size: u8, reg: X86Reg, value: NodeId) {
        if size == 4 {
            let wide = self.zext(32, value);
            self.store_context(8, state::gpr_offset(reg), wide);
        } else {
            self.store_context(size, state::gpr_offset(reg), value);
        }
    }

    pub(crate) fn mov_op(&mut self, op: &DecodedOp) {
        let src = self.load_source(op, &op.src[0]);
        self.store_result(op, &op.dest, src);
    }

    /// `mov` with a moffs operand: the absolute address is the immediate.
    pub(crate) fn mov_offset_op(&mut self, op: &DecodedOp) {
        let src = self.load_source(op, &op.src[0]);
        self.store_result(op, &op.dest, src);
    }

    pub(crate) fn movsx_op(&mut self, op: &DecodedOp) {
        let src = self.load_source_with_size(op, &op.src[0], op.src_size);
        let res = self.sext(op.src_size * 8, src);
        self.store_result(op, &op.dest, res);
    }

    pub(crate) fn movzx_op(&mut self, op: &DecodedOp) {
        let src = self.load_source_with_size(op, &op.src[0], op.src_size);
        let res = self.zext(op.src_size * 8, src);
        self.store_result(op, &op.dest, res);
    }

    pub(crate) fn movsxd_op(&mut self, op: &DecodedOp) {
        let src = self.load_source_with_size(op, &op.src[0], 4);
        let res = self.sext(32, src);
        self.store_result(op, &op.dest, res);
    }

    pub(crate) fn lea_op(&mut self, op: &DecodedOp) {
        let addr = self.effective_address(op, &op.src[0]);
        self.store_result(op, &op.dest, addr);
    }

    pub(crate) fn xchg_op(&mut self, op: &DecodedOp) {
        let a = self.load_source(op, &op.dest);
        let b = self.load_source(op, &op.src[0]);
        self.store_result(op, &op.dest, b);
        self.store_result(op, &op.src[0], a);
    }

    pub(crate) fn bswap_op(&mut self, op: &DecodedOp) {
        let src = self.load_source(op, &op.dest);
        let res = self.bswap(op.op_size, src);
        self.store_result(op, &op.dest, res);
    }

    pub(crate) fn cmov_op(&mut self, op: &DecodedOp, cond: Cond) {
        let size = op.op_size;
        let cv = self.cond_value(cond);
        let zero = self.constant(size, 0);
        let src = self.load_source(op, &op.src[0]);
        let dest = self.load_source(op, &op.dest);
        let res = self.select(CondCode::Neq, size, cv, zero, src, dest);
        self.store_result(op, &op.dest, res);
    }

    pub(crate) fn setcc_op(&mut self, op: &DecodedOp, cond: Cond) {
        let cv = self.cond_value(cond);
        self.store_result_with_size(op, &op.dest, cv, 1);
    }

    pub(crate) fn alu_op(&mut self, op: &DecodedOp, alu: AluOp) {
        let size = op.op_size;
        let dest = self.load_source(op, &op.dest);
        let src = self.load_source(op, &op.src[0]);
        match alu {
            AluOp::Add => {
                let res = self.add(size, dest, src);
                self.store_result(op, &op.dest, res);
                self.flags_add(size, res, dest, src);
            }
            AluOp::Adc => {
                let cf = self.get_rflag(super::FLAG_CF);
                let sum = self.add(size, dest, src);
                let res = self.add(size, sum, cf);
                self.store_result(op, &op.dest, res);
                self.flags_adc(size, res, dest, src, cf);
            }
            AluOp::Sub => {
                let res = self.sub(size, dest, src);
                self.store_result(op, &op.dest, res);
                self.flags_sub(size, res, dest, src);
            }
            AluOp::Sbb => {
                let cf = self.get_rflag(super::FLAG_CF);
                let diff = self.sub(size, dest, src);
                let res = self.sub(size, diff, cf);
                self.store_result(op, &op.dest, res);
                self.flags_sbb(size, res, dest, src, cf);
            }
            AluOp::And => {
                let res = self.and(size, dest, src);
                self.store_result(op, &op.dest, res);
                self.flags_logical(size, res);
            }
            AluOp::Or => {
                let res = self.or(size, dest, src);
                self.store_result(op, &op.dest, res);
                self.flags_logical(size, res);
            }
            AluOp::Xor => {
                let res = self.xor(size, dest, src);
                self.store_result(op, &op.dest, res);
                self.flags_logical(size, res);
            }
            AluOp::Cmp => {
                let res = self.sub(size, dest, src);
                self.flags_sub(size, res, dest, src);
            }
        }
    }

    pub(crate) fn test_op(&mut self, op: &DecodedOp) {
        let size = op.op_size;
        let dest = self.load_source(op, &op.dest);
        let src = self.load_source(op, &op.src[0]);
        let res = self.and(size, dest, src);
        self.flags_logical(size, res);
    }

    pub(crate) fn inc_op(&mut self, op: &DecodedOp) {
        let size = op.op_size;
        let dest = self.load_source(op, &op.dest);
        let one = self.constant(size, 1);
        let res = self.add(size, dest, one);
        self.store_result(op, &op.dest, res);

        // INC leaves CF untouched.
        self.set_zsp(size, res);
        let sign_min = self.constant(size, 1u64 << (size * 8 - 1));
        let t = self.constant(1, 1);
        let f = self.constant(1, 0);
        let of = self.select(CondCode::Eq, size, res, sign_min, t, f);
        self.set_rflag(super::FLAG_OF, of);
        let x = self.xor(8, dest, one);
        let x = self.xor(8, x, res);
        let af = self.bfe(1, 4, x);
        self.set_rflag(super::FLAG_AF, af);
    }

    pub(crate) fn dec_op(&mut self, op: &DecodedOp) {
        let size = op.op_size;
        let dest = self.load_source(op, &op.dest);
        let one = self.constant(size, 1);
        let res = self.sub(size, dest, one);
        self.store_result(op, &op.dest, res);

        // DEC leaves CF untouched.
        self.set_zsp(size, res);
        let sign_max = self.constant(size, (1u64 << (size * 8 - 1)) - 1);
        let t = self.constant(1, 1);
        let f = self.constant(1, 0);
        let of = self.select(CondCode::Eq, size, res, sign_max, t, f);
        self.set_rflag(super::FLAG_OF, of);
        let x = self.xor(8, dest, one);
        let x = self.xor(8, x, res);
        let af = self.bfe(1, 4, x);
        self.set_rflag(super::FLAG_AF, af);
    }

    pub(crate) fn neg_op(&mut self, op: &DecodedOp) {
        let size = op.op_size;
        let dest = self.load_source(op, &op.dest);
        let res = self.neg(size, dest);
        self.store_result(op, &op.dest, res);
        let zero = self.constant(size, 0);
        self.flags_sub(size, res, zero, dest);
    }

    pub(crate) fn not_op(&mut self, op: &DecodedOp) {
        let dest = self.load_source(op, &op.dest);
        let res = self.not(op.op_size, dest);
        self.store_result(op, &op.dest, res);
    }

    /// Unsigned widening multiply into rDX:rAX.
    pub(crate) fn mul_op(&mut self, op: &DecodedOp) {
        let size = op.op_size;
        let src = self.load_source(op, &op.dest);
        if size == 1 {
            let al = self.load_gpr(1, X86Reg::Rax);
            let a = self.zext(8, al);
            let b = self.zext(8, src);
            let wide = self.umul(2, a, b);
            self.store_context(2, state::gpr_offset(X86Reg::Rax), wide);
            let high = self.bfe(8, 8, wide);
            self.flags_umul(size, wide, high);
        } else if size == 8 {
            let rax = self.load_gpr(8, X86Reg::Rax);
            let low = self.umul(8, rax, src);
            let high = self.umulh(8, rax, src);
            self.store_gpr(8, X86Reg::Rax, low);
            self.store_gpr(8, X86Reg::Rdx, high);
            self.flags_umul(size, low, high);
        } else {
            let acc = self.load_gpr(size, X86Reg::Rax);
            let a = self.zext(size * 8, acc);
            let b = self.zext(size * 8, src);
            let wide = self.umul(size * 2, a, b);
            let low = self.bfe(size * 8, 0, wide);
            let high = self.bfe(size * 8, size * 8, wide);
            self.store_gpr(size, X86Reg::Rax, low);
            self.store_gpr(size, X86Reg::Rdx, high);
            self.flags_umul(size, low, high);
        }
    }

    /// Signed widening multiply into rDX:rAX.
    pub(crate) fn imul1_src_op(&mut self, op: &DecodedOp) {
        let size = op.op_size;
        let src = self.load_source(op, &op.dest);
        if size == 1 {
            let al = self.load_gpr(1, X86Reg::Rax);
            let a = self.sext(8, al);
            let b = self.sext(8, src);
            let wide = self.mul(2, a, b);
            self.store_context(2, state::gpr_offset(X86Reg::Rax), wide);
            let high = self.bfe(8, 8, wide);
            self.flags_mul(size, wide, high);
        } else if size == 8 {
            let rax = self.load_gpr(8, X86Reg::Rax);
            let low = self.mul(8, rax, src);
            let high = self.mulh(8, rax, src);
            self.store_gpr(8, X86Reg::Rax, low);
            self.store_gpr(8, X86Reg::Rdx, high);
            self.flags_mul(size, low, high);
        } else {
            let acc = self.load_gpr(size, X86Reg::Rax);
            let a = self.sext(size * 8, acc);
            let b = self.sext(size * 8, src);
            let wide = self.mul(size * 2, a, b);
            let low = self.bfe(size * 8, 0, wide);
            let high = self.bfe(size * 8, size * 8, wide);
            self.store_gpr(size, X86Reg::Rax, low);
            self.store_gpr(size, X86Reg::Rdx, high);
            self.flags_mul(size, low, high);
        }
    }

    /// Two- and three-operand IMUL into a register.
    pub(crate) fn imul2_src_op(&mut self, op: &DecodedOp) {
        let size = op.op_size;
        let a = self.load_source(op, &op.src[0]);
        let b = if matches!(op.src[1], Operand::None) {
            self.load_source(op, &op.dest)
        } else {
            self.load_source(op, &op.src[1])
        };
        let res = self.mul(size, a, b);
        let high = self.mulh(size, a, b);
        self.store_result(op, &op.dest, res);
        self.flags_mul(size, res, high);
    }

    pub(crate) fn div_op(&mut self, op: &DecodedOp) {
        let size = op.op_size;
        let divisor = self.load_source(op, &op.dest);
        if size == 1 {
            let low = self.load_gpr(1, X86Reg::Rax);
            let high = self.load_context(1, state::gpr_offset(X86Reg::Rax) + 1);
            let q = self.ludiv(1, low, high, divisor);
            let r = self.lurem(1, low, high, divisor);
            self.store_context(1, state::gpr_offset(X86Reg::Rax), q);
            self.store_context(1, state::gpr_offset(X86Reg::Rax) + 1, r);
        } else {
            let low = self.load_gpr(size, X86Reg::Rax);
            let high = self.load_gpr(size, X86Reg::Rdx);
            let q = self.ludiv(size, low, high, divisor);
            let r = self.lurem(size, low, high, divisor);
            self.store_gpr(size, X86Reg::Rax, q);
            self.store_gpr(size, X86Reg::Rdx, r);
        }
    }

    pub(crate) fn idiv_op(&mut self, op: &DecodedOp) {
        let size = op.op_size;
        let divisor = self.load_source(op, &op.dest);
        if size == 1 {
            let low = self.load_gpr(1, X86Reg::Rax);
            let high = self.load_context(1, state::gpr_offset(X86Reg::Rax) + 1);
            let q = self.ldiv(1, low, high, divisor);
            let r = self.lrem(1, low, high, divisor);
            self.store_context(1, state::gpr_offset(X86Reg::Rax), q);
            self.store_context(1, state::gpr_offset(X86Reg::Rax) + 1, r);
        } else {
            let low = self.load_gpr(size, X86Reg::Rax);
            let high = self.load_gpr(size, X86Reg::Rdx);
            let q = self.ldiv(size, low, high, divisor);
            let r = self.lrem(size, low, high, divisor);
            self.store_gpr(size, X86Reg::Rax, q);
            self.store_gpr(size, X86Reg::Rdx, r);
        }
    }

    pub(crate) fn shift_op(&mut self, op: &DecodedOp, shift: ShiftOp) {
        let size = op.op_size;
        let bits = size as u64 * 8;
        let dest = self.load_source(op, &op.dest);
        let raw = self.load_source_with_size(op, &op.src[0], 1);
        let mask = self.constant(size, if size == 8 { 63 } else { 31 });
        let amount = self.and(size, raw, mask);

        match shift {
            ShiftOp::Shl => {
                let res = self.lshl(size, dest, amount);
                self.store_result(op, &op.dest, res);
                self.flags_shift_left(size, res, dest, amount);
            }
            ShiftOp::Shr => {
                let res = self.lshr(size, dest, amount);
                self.store_result(op, &op.dest, res);
                self.flags_shift_right(size, res, dest, amount);
            }
            ShiftOp::Sar => {
                let res = self.ashr(size, dest, amount);
                self.store_result(op, &op.dest, res);
                self.flags_shift_right(size, res, dest, amount);
            }
            ShiftOp::Rol => {
                let width = self.constant(size, bits);
                let inv = self.sub(size, width, amount);
                let res = self.ror(size, dest, inv);
                self.store_result(op, &op.dest, res);
                self.flags_rotate(size, res, true);
            }
            ShiftOp::Ror => {
                let res = self.ror(size, dest, amount);
                self.store_result(op, &op.dest, res);
                self.flags_rotate(size, res, false);
            }
        }
    }

    pub(crate) fn bsf_op(&mut self, op: &DecodedOp) {
        self.bit_scan_op(op, true);
    }

    pub(crate) fn bsr_op(&mut self, op: &DecodedOp) {
        self.bit_scan_op(op, false);
    }

    fn bit_scan_op(&mut self, op: &DecodedOp, forward: bool) {
        let size = op.op_size;
        let src = self.load_source(op, &op.src[0]);
        let found = if forward {
            self.find_lsb(size, src)
        } else {
            self.find_msb(size, src)
        };
        let zero = self.constant(size, 0);
        let t = self.constant(1, 1);
        let f = self.constant(1, 0);
        let zf = self.select(CondCode::Eq, size, src, zero, t, f);
        self.set_rflag(super::FLAG_ZF, zf);

        // Destination is unchanged when the source is zero.
        let old = self.load_source(op, &op.dest);
        let res = self.select(CondCode::Eq, size, src, zero, old, found);
        self.store_result(op, &op.dest, res);
    }

    pub(crate) fn bt_op(&mut self, op: &DecodedOp) {
        let size = op.op_size;
        let base = self.load_source(op, &op.dest);
        let offset = self.load_source(op, &op.src[0]);
        let mask = self.constant(size, size as u64 * 8 - 1);
        let masked = self.and(size, offset, mask);
        let shifted = self.lshr(size, base, masked);
        let cf = self.bfe(1, 0, shifted);
        self.set_rflag(super::FLAG_CF, cf);
    }

    pub(crate) fn cmpxchg_op(&mut self, op: &DecodedOp) {
        let size = op.op_size;
        let acc = self.load_gpr(size, X86Reg::Rax);
        let desired = self.load_source(op, &op.src[0]);

        let observed = match op.dest {
            Operand::Mem { .. } | Operand::RipRelative(_) => {
                let addr = self.effective_address(op, &op.dest);
                self.cas(size, acc, desired, addr)
            }
            _ => {
                let old = self.load_source(op, &op.dest);
                let swapped = self.select(CondCode::Eq, size, old, acc, desired, old);
                self.store_result(op, &op.dest, swapped);
                old
            }
        };

        let res = self.sub(size, acc, observed);
        self.flags_sub(size, res, acc, observed);

        // rAX receives the observed value on failure, keeps its own on success.
        let rax = self.select(CondCode::Eq, size, observed, acc, acc, observed);
        self.store_gpr(size, X86Reg::Rax, rax);
    }

    /// CQO/CDQ: broadcast the accumulator's sign into rDX.
    pub(crate) fn sign_extend_acc_op(&mut self, op: &DecodedOp) {
        let size = op.op_size;
        let acc = self.load_gpr(size, X86Reg::Rax);
        let shift = self.constant(8, size as u64 * 8 - 1);
        let sign = self.ashr(size, acc, shift);
        self.store_gpr(size, X86Reg::Rdx, sign);
    }
}

#[cfg(test)]
mod tests {
    use super::super::operands::*;
    use super::super::OpDispatchBuilder;
    use crate::ir::OpKind;

    fn count_kind(builder: &OpDispatchBuilder, pred: impl Fn(&OpKind) -> bool) -> usize {
        let view = builder.view_ir();
        view.iter().filter(|&id| pred(&view.op(id).kind)).count()
    }

    #[test]
    fn test_add_generates_arith_and_flag_lanes() {
        let mut builder = OpDispatchBuilder::new();
        builder.begin_function(0x1000);
        builder.dispatch(&DecodedOp {
            rip: 0x1000,
            op: X86Op::Alu(AluOp::Add),
            dest: Operand::Gpr(X86Reg::Rax),
            src: [Operand::Gpr(X86Reg::Rbx), Operand::None],
            len: 3,
            ..Default::default()
        });
        builder.finalize();

        assert_eq!(count_kind(&builder, |k| matches!(k, OpKind::Add)), 1);
        // CF, PF, ZF, SF, OF, AF all written.
        assert_eq!(
            count_kind(&builder, |k| matches!(k, OpKind::StoreFlag { .. })),
            6
        );
        assert!(!builder.had_decode_failure());
    }

    #[test]
    fn test_cmp_stores_no_result() {
        let mut builder = OpDispatchBuilder::new();
        builder.begin_function(0x1000);
        builder.dispatch(&DecodedOp {
            rip: 0x1000,
            op: X86Op::Alu(AluOp::Cmp),
            dest: Operand::Gpr(X86Reg::Rcx),
            src: [Operand::Imm(5), Operand::None],
            len: 4,
            ..Default::default()
        });
        builder.finalize();

        assert_eq!(
            count_kind(&builder, |k| matches!(k, OpKind::StoreContext { .. })),
            0
        );
        assert_eq!(count_kind(&builder, |k| matches!(k, OpKind::Sub)), 1);
    }

    #[test]
    fn test_mov32_zero_extends_destination() {
        let mut builder = OpDispatchBuilder::new();
        builder.begin_function(0x1000);
        builder.dispatch(&DecodedOp {
            rip: 0x1000,
            op: X86Op::Mov,
            dest: Operand::Gpr(X86Reg::Rax),
            src: [Operand::Gpr(X86Reg::Rbx), Operand::None],
            op_size: 4,
            len: 2,
            ..Default::default()
        });
        builder.finalize();

        assert_eq!(
            count_kind(&builder, |k| matches!(k, OpKind::Zext { src_width: 32 })),
            1
        );
        // The context store is widened to the full register.
        let view = builder.view_ir();
        let store = view
            .iter()
            .find(|&id| matches!(view.op(id).kind, OpKind::StoreContext { .. }))
            .unwrap();
        assert_eq!(view.op(store).size, 8);
    }

    #[test]
    fn test_cmpxchg_memory_uses_cas() {
        let mut builder = OpDispatchBuilder::new();
        builder.begin_function(0x1000);
        builder.dispatch(&DecodedOp {
            rip: 0x1000,
            op: X86Op::Cmpxchg,
            dest: Operand::Mem {
                base: Some(X86Reg::Rdi),
                index: None,
                scale: 1,
                disp: 0,
            },
            src: [Operand::Gpr(X86Reg::Rbx), Operand::None],
            len: 4,
            ..Default::default()
        });
        builder.finalize();

        assert_eq!(count_kind(&builder, |k| matches!(k, OpKind::Cas)), 1);
    }

    #[test]
    fn test_segment_override_adds_base() {
        let mut builder = OpDispatchBuilder::new();
        builder.begin_function(0x1000);
        builder.dispatch(&DecodedOp {
            rip: 0x1000,
            op: X86Op::Mov,
            dest: Operand::Gpr(X86Reg::Rax),
            src: [
                Operand::Mem {
                    base: None,
                    index: None,
                    scale: 1,
                    disp: 0x28,
                },
                Operand::None,
            ],
            segment: Some(Segment::Fs),
            len: 9,
            ..Default::default()
        });
        builder.finalize();

        // The FS base load shows up as a context read distinct from the GPRs.
        let view = builder.view_ir();
        let fs_loads = view
            .iter()
            .filter(|&id| {
                matches!(
                    view.op(id).kind,
                    OpKind::LoadContext { offset } if offset == super::super::state::segment_base_offset(Segment::Fs)
                )
            })
            .count();
        assert_eq!(fs_loads, 1);
    }

    #[test]
    fn test_shift_masks_amount() {
        let mut builder = OpDispatchBuilder::new();
        builder.begin_function(0x1000);
        builder.dispatch(&DecodedOp {
            rip: 0x1000,
            op: X86Op::Shift(ShiftOp::Shl),
            dest: Operand::Gpr(X86Reg::Rax),
            src: [Operand::Gpr(X86Reg::Rcx), Operand::None],
            len: 3,
            ..Default::default()
        });
        builder.finalize();

        assert_eq!(count_kind(&builder, |k| matches!(k, OpKind::Lshl)), 1);
        // The amount passes through an AND with the 63 mask.
        let view = builder.view_ir();
        let masked = view.iter().any(|id| {
            matches!(view.op(id).kind, OpKind::Constant { value: 63 })
        });
        assert!(masked);
    }
}
