//! SSE vector handlers
//!
//! The packed families lower to wide vector ops; shuffles are composed
//! from element inserts driven by the control immediate.

use super::operands::{DecodedOp, Operand, VectorAluOp};
use super::OpDispatchBuilder;
use crate::ir::NodeId;

impl OpDispatchBuilder {
    pub(crate) fn imm8(&self, op: &DecodedOp, slot: usize) -> u8 {
        match op.src[slot] {
            Operand::Imm(v) => v as u8,
            other => panic!(
                "vector op at {:#x} expected an immediate, got {:?}",
                op.rip, other
            ),
        }
    }

    /// Load a memory or register operand as a full vector, widening
    /// 8-byte memory forms through a GPR cast.
    fn load_vector_or_mem64(&mut self, op: &DecodedOp, operand: &Operand) -> NodeId {
        match operand {
            Operand::Xmm(_) => self.load_source_with_size(op, operand, 16),
            _ => {
                let low = self.load_source_with_size(op, operand, 8);
                self.vcast_from_gpr(8, low)
            }
        }
    }

    pub(crate) fn movups_op(&mut self, op: &DecodedOp) {
        let src = self.load_source_with_size(op, &op.src[0], 16);
        self.store_result_with_size(op, &op.dest, src, 16);
    }

    pub(crate) fn movlhps_op(&mut self, op: &DecodedOp) {
        let dest = self.load_source_with_size(op, &op.dest, 16);
        let src = self.load_source_with_size(op, &op.src[0], 16);
        let res = self.vins_element(16, 8, 1, 0, dest, src);
        self.store_result_with_size(op, &op.dest, res, 16);
    }

    pub(crate) fn movhpd_op(&mut self, op: &DecodedOp) {
        match op.dest {
            Operand::Xmm(_) => {
                let incoming = self.load_vector_or_mem64(op, &op.src[0]);
                let dest = self.load_source_with_size(op, &op.dest, 16);
                let res = self.vins_element(16, 8, 1, 0, dest, incoming);
                self.store_result_with_size(op, &op.dest, res, 16);
            }
            _ => {
                let src = self.load_source_with_size(op, &op.src[0], 16);
                let high = self.vextract_to_gpr(8, 1, src);
                self.store_result_with_size(op, &op.dest, high, 8);
            }
        }
    }

    pub(crate) fn movddup_op(&mut self, op: &DecodedOp) {
        let src = self.load_vector_or_mem64(op, &op.src[0]);
        let res = self.vdup_element(16, 8, 0, src);
        self.store_result_with_size(op, &op.dest, res, 16);
    }

    pub(crate) fn movd_op(&mut self, op: &DecodedOp) {
        match op.dest {
            Operand::Xmm(_) => {
                let value = self.load_source_with_size(op, &op.src[0], op.op_size);
                let vec = self.vcast_from_gpr(op.op_size, value);
                self.store_result_with_size(op, &op.dest, vec, 16);
            }
            _ => {
                let vec = self.load_source_with_size(op, &op.src[0], 16);
                let value = self.vextract_to_gpr(op.op_size, 0, vec);
                self.store_result_with_size(op, &op.dest, value, op.op_size);
            }
        }
    }

    pub(crate) fn movq_op(&mut self, op: &DecodedOp) {
        match op.dest {
            Operand::Xmm(_) => {
                // Low quadword moves in, upper is zeroed.
                let low = match op.src[0] {
                    Operand::Xmm(_) => {
                        let vec = self.load_source_with_size(op, &op.src[0], 16);
                        self.vextract_to_gpr(8, 0, vec)
                    }
                    _ => self.load_source_with_size(op, &op.src[0], 8),
                };
                let vec = self.vcast_from_gpr(8, low);
                self.store_result_with_size(op, &op.dest, vec, 16);
            }
            _ => {
                let vec = self.load_source_with_size(op, &op.src[0], 16);
                let low = self.vextract_to_gpr(8, 0, vec);
                self.store_result_with_size(op, &op.dest, low, 8);
            }
        }
    }

    pub(crate) fn vector_alu_op(&mut self, op: &DecodedOp, vop: VectorAluOp, elem_size: u8) {
        let dest = self.load_source_with_size(op, &op.dest, 16);
        let src = self.load_source_with_size(op, &op.src[0], 16);
        let res = match vop {
            VectorAluOp::Add => self.vadd(16, elem_size, dest, src),
            VectorAluOp::Sub => self.vsub(16, elem_size, dest, src),
            VectorAluOp::And => self.vand(16, elem_size, dest, src),
            VectorAluOp::Or => self.vor(16, elem_size, dest, src),
            VectorAluOp::Xor => self.vxor(16, elem_size, dest, src),
            VectorAluOp::UMin => self.vumin(16, elem_size, dest, src),
            VectorAluOp::SMin => self.vsmin(16, elem_size, dest, src),
        };
        self.store_result_with_size(op, &op.dest, res, 16);
    }

    pub(crate) fn pcmpeq_op(&mut self, op: &DecodedOp, elem_size: u8) {
        let dest = self.load_source_with_size(op, &op.dest, 16);
        let src = self.load_source_with_size(op, &op.src[0], 16);
        let res = self.vcmpeq(16, elem_size, dest, src);
        self.store_result_with_size(op, &op.dest, res, 16);
    }

    pub(crate) fn pcmpgt_op(&mut self, op: &DecodedOp, elem_size: u8) {
        let dest = self.load_source_with_size(op, &op.dest, 16);
        let src = self.load_source_with_size(op, &op.src[0], 16);
        let res = self.vcmpgt(16, elem_size, dest, src);
        self.store_result_with_size(op, &op.dest, res, 16);
    }

    /// PSHUFD and the PSHUFLW/PSHUFHW halves.
    pub(crate) fn pshuf_op(&mut self, op: &DecodedOp, elem_size: u8, low: bool) {
        let imm = self.imm8(op, 1);
        let src = self.load_source_with_size(op, &op.src[0], 16);
        let mut res = src;
        if elem_size == 4 {
            for lane in 0..4u8 {
                let sel = (imm >> (lane * 2)) & 0b11;
                res = self.vins_element(16, 4, lane, sel, res, src);
            }
        } else {
            // Word shuffle confined to one half; the other half copies through.
            let base = if low { 0 } else { 4 };
            for lane in 0..4u8 {
                let sel = ((imm >> (lane * 2)) & 0b11) + base;
                res = self.vins_element(16, 2, lane + base, sel, res, src);
            }
        }
        self.store_result_with_size(op, &op.dest, res, 16);
    }

    /// SHUFPS/SHUFPD: low lanes select from dest, high lanes from src.
    pub(crate) fn shuf_op(&mut self, op: &DecodedOp, elem_size: u8) {
        let imm = self.imm8(op, 1);
        let dest = self.load_source_with_size(op, &op.dest, 16);
        let src = self.load_source_with_size(op, &op.src[0], 16);
        let mut res = dest;
        if elem_size == 4 {
            for lane in 0..4u8 {
                let sel = (imm >> (lane * 2)) & 0b11;
                let from = if lane < 2 { dest } else { src };
                res = self.vins_element(16, 4, lane, sel, res, from);
            }
        } else {
            let sel0 = imm & 1;
            let sel1 = (imm >> 1) & 1;
            res = self.vins_element(16, 8, 0, sel0, res, dest);
            res = self.vins_element(16, 8, 1, sel1, res, src);
        }
        self.store_result_with_size(op, &op.dest, res, 16);
    }

    pub(crate) fn punpck_op(&mut self, op: &DecodedOp, elem_size: u8, low: bool) {
        let dest = self.load_source_with_size(op, &op.dest, 16);
        let src = self.load_source_with_size(op, &op.src[0], 16);
        let res = if low {
            self.vzip(16, elem_size, dest, src)
        } else {
            self.vzip2(16, elem_size, dest, src)
        };
        self.store_result_with_size(op, &op.dest, res, 16);
    }

    pub(crate) fn palignr_op(&mut self, op: &DecodedOp) {
        let imm = self.imm8(op, 1);
        let dest = self.load_source_with_size(op, &op.dest, 16);
        let src = self.load_source_with_size(op, &op.src[0], 16);
        let res = self.vextr(16, imm, dest, src);
        self.store_result_with_size(op, &op.dest, res, 16);
    }

    pub(crate) fn vector_shift_op(&mut self, op: &DecodedOp, elem_size: u8, left: bool) {
        let dest = self.load_source_with_size(op, &op.dest, 16);
        let amount = match op.src[0] {
            Operand::Imm(v) => {
                let c = self.constant(8, v);
                self.vcast_from_gpr(8, c)
            }
            _ => self.load_source_with_size(op, &op.src[0], 16),
        };
        let res = if left {
            self.vushl_scalar(16, elem_size, dest, amount)
        } else {
            self.vushr_scalar(16, elem_size, dest, amount)
        };
        self.store_result_with_size(op, &op.dest, res, 16);
    }

    /// Whole-register byte shift right.
    pub(crate) fn psrldq_op(&mut self, op: &DecodedOp) {
        let imm = self.imm8(op, 1);
        let dest = self.load_source_with_size(op, &op.dest, 16);
        let zero = self.vector_zero();
        let res = self.vextr(16, imm, zero, dest);
        self.store_result_with_size(op, &op.dest, res, 16);
    }

    pub(crate) fn pminu_op(&mut self, op: &DecodedOp, elem_size: u8) {
        let dest = self.load_source_with_size(op, &op.dest, 16);
        let src = self.load_source_with_size(op, &op.src[0], 16);
        let res = self.vumin(16, elem_size, dest, src);
        self.store_result_with_size(op, &op.dest, res, 16);
    }

    pub(crate) fn pminsw_op(&mut self, op: &DecodedOp) {
        let dest = self.load_source_with_size(op, &op.dest, 16);
        let src = self.load_source_with_size(op, &op.src[0], 16);
        let res = self.vsmin(16, 2, dest, src);
        self.store_result_with_size(op, &op.dest, res, 16);
    }

    pub(crate) fn pmovmskb_op(&mut self, op: &DecodedOp) {
        let src = self.load_source_with_size(op, &op.src[0], 16);
        let mask = self.vmove_byte_mask(16, src);
        self.store_result_with_size(op, &op.dest, mask, 8);
    }

    /// FXSAVE region layout: FCW at +0, MXCSR at +24, XMM at +160.
    pub(crate) fn fxsave_op(&mut self, op: &DecodedOp) {
        let addr = self.effective_address(op, &op.dest);

        let fcw = self.constant(2, 0x037F);
        self.store_mem(2, addr, fcw);

        let mxcsr = self.constant(4, 0x1F80);
        let mxcsr_off = self.constant(8, 24);
        let mxcsr_addr = self.add(8, addr, mxcsr_off);
        self.store_mem(4, mxcsr_addr, mxcsr);

        for reg in 0..16u8 {
            let vec = self.load_context(16, super::state::xmm_offset(reg));
            let off = self.constant(8, 160 + reg as u64 * 16);
            let slot = self.add(8, addr, off);
            self.store_mem(16, slot, vec);
        }
    }

    pub(crate) fn fxrstor_op(&mut self, op: &DecodedOp) {
        let addr = self.effective_address(op, &op.dest);
        for reg in 0..16u8 {
            let off = self.constant(8, 160 + reg as u64 * 16);
            let slot = self.add(8, addr, off);
            let vec = self.load_mem(16, slot);
            self.store_context(16, super::state::xmm_offset(reg), vec);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::operands::*;
    use super::super::OpDispatchBuilder;
    use crate::ir::OpKind;

    fn xmm_binary(op: X86Op) -> DecodedOp {
        DecodedOp {
            rip: 0x1000,
            op,
            dest: Operand::Xmm(0),
            src: [Operand::Xmm(1), Operand::None],
            op_size: 16,
            len: 4,
            ..Default::default()
        }
    }

    #[test]
    fn test_paddd_emits_wide_add() {
        let mut builder = OpDispatchBuilder::new();
        builder.begin_function(0x1000);
        builder.dispatch(&xmm_binary(X86Op::VectorAlu {
            op: VectorAluOp::Add,
            elem_size: 4,
        }));
        builder.finalize();

        let view = builder.view_ir();
        let vadd = view
            .iter()
            .find(|&id| matches!(view.op(id).kind, OpKind::VAdd))
            .unwrap();
        assert_eq!(view.op(vadd).size, 4);
        assert_eq!(view.op(vadd).elements, 4);
    }

    #[test]
    fn test_pshufd_inserts_four_lanes() {
        let mut builder = OpDispatchBuilder::new();
        builder.begin_function(0x1000);
        builder.dispatch(&DecodedOp {
            rip: 0x1000,
            op: X86Op::Pshuf {
                elem_size: 4,
                low: true,
            },
            dest: Operand::Xmm(0),
            src: [Operand::Xmm(1), Operand::Imm(0b00_01_10_11)],
            op_size: 16,
            len: 5,
            ..Default::default()
        });
        builder.finalize();

        let view = builder.view_ir();
        let inserts: Vec<(u8, u8)> = view
            .iter()
            .filter_map(|id| match view.op(id).kind {
                OpKind::VInsElement { dest_idx, src_idx } => Some((dest_idx, src_idx)),
                _ => None,
            })
            .collect();
        assert_eq!(inserts, vec![(0, 3), (1, 2), (2, 1), (3, 0)]);
    }

    #[test]
    fn test_psrldq_shifts_against_zero_vector() {
        let mut builder = OpDispatchBuilder::new();
        builder.begin_function(0x1000);
        builder.dispatch(&DecodedOp {
            rip: 0x1000,
            op: X86Op::Psrldq,
            dest: Operand::Xmm(2),
            src: [Operand::None, Operand::Imm(4)],
            op_size: 16,
            len: 5,
            ..Default::default()
        });
        builder.finalize();

        let view = builder.view_ir();
        assert!(view
            .iter()
            .any(|id| matches!(view.op(id).kind, OpKind::VectorZero)));
        assert!(view
            .iter()
            .any(|id| matches!(view.op(id).kind, OpKind::VExtr { index: 4 })));
    }

    #[test]
    fn test_pmovmskb_extracts_to_gpr() {
        let mut builder = OpDispatchBuilder::new();
        builder.begin_function(0x1000);
        builder.dispatch(&DecodedOp {
            rip: 0x1000,
            op: X86Op::Pmovmskb,
            dest: Operand::Gpr(X86Reg::Rax),
            src: [Operand::Xmm(3), Operand::None],
            op_size: 4,
            len: 4,
            ..Default::default()
        });
        builder.finalize();

        let view = builder.view_ir();
        assert!(view
            .iter()
            .any(|id| matches!(view.op(id).kind, OpKind::VMoveByteMask)));
    }

    #[test]
    fn test_fxsave_writes_all_xmm_slots() {
        let mut builder = OpDispatchBuilder::new();
        builder.begin_function(0x1000);
        builder.dispatch(&DecodedOp {
            rip: 0x1000,
            op: X86Op::Fxsave,
            dest: Operand::Mem {
                base: Some(X86Reg::Rsp),
                index: None,
                scale: 1,
                disp: 0,
            },
            len: 4,
            ..Default::default()
        });
        builder.finalize();

        let view = builder.view_ir();
        let wide_stores = view
            .iter()
            .filter(|&id| matches!(view.op(id).kind, OpKind::StoreMem) && view.op(id).size == 16)
            .count();
        assert_eq!(wide_stores, 16);
    }
}
