//! AES-NI and CRC32 handlers

use super::operands::DecodedOp;
use super::OpDispatchBuilder;

impl OpDispatchBuilder {
    pub(crate) fn aesimc_op(&mut self, op: &DecodedOp) {
        let src = self.load_source_with_size(op, &op.src[0], 16);
        let res = self.vaesimc(src);
        self.store_result_with_size(op, &op.dest, res, 16);
    }

    pub(crate) fn aesenc_op(&mut self, op: &DecodedOp) {
        let state = self.load_source_with_size(op, &op.dest, 16);
        let key = self.load_source_with_size(op, &op.src[0], 16);
        let res = self.vaesenc(state, key);
        self.store_result_with_size(op, &op.dest, res, 16);
    }

    pub(crate) fn aesenclast_op(&mut self, op: &DecodedOp) {
        let state = self.load_source_with_size(op, &op.dest, 16);
        let key = self.load_source_with_size(op, &op.src[0], 16);
        let res = self.vaesenclast(state, key);
        self.store_result_with_size(op, &op.dest, res, 16);
    }

    pub(crate) fn aesdec_op(&mut self, op: &DecodedOp) {
        let state = self.load_source_with_size(op, &op.dest, 16);
        let key = self.load_source_with_size(op, &op.src[0], 16);
        let res = self.vaesdec(state, key);
        self.store_result_with_size(op, &op.dest, res, 16);
    }

    pub(crate) fn aesdeclast_op(&mut self, op: &DecodedOp) {
        let state = self.load_source_with_size(op, &op.dest, 16);
        let key = self.load_source_with_size(op, &op.src[0], 16);
        let res = self.vaesdeclast(state, key);
        self.store_result_with_size(op, &op.dest, res, 16);
    }

    pub(crate) fn aeskeygenassist_op(&mut self, op: &DecodedOp) {
        let rcon = self.imm8(op, 1);
        let src = self.load_source_with_size(op, &op.src[0], 16);
        let res = self.vaeskeygenassist(rcon, src);
        self.store_result_with_size(op, &op.dest, res, 16);
    }

    pub(crate) fn crc32_op(&mut self, op: &DecodedOp) {
        let acc = self.load_source_with_size(op, &op.dest, 4);
        let input = self.load_source_with_size(op, &op.src[0], op.src_size);
        let res = self.crc32(op.src_size, acc, input);
        // The accumulator register is 32-bit; a REX.W form zero-extends.
        let store_size = if op.op_size == 8 { 8 } else { 4 };
        self.store_result_with_size(op, &op.dest, res, store_size);
    }
}

#[cfg(test)]
mod tests {
    use super::super::operands::*;
    use super::super::OpDispatchBuilder;
    use crate::ir::OpKind;

    #[test]
    fn test_aesenc_chains_state_and_key() {
        let mut builder = OpDispatchBuilder::new();
        builder.begin_function(0x1000);
        builder.dispatch(&DecodedOp {
            rip: 0x1000,
            op: X86Op::AesEnc,
            dest: Operand::Xmm(0),
            src: [Operand::Xmm(1), Operand::None],
            op_size: 16,
            len: 5,
            ..Default::default()
        });
        builder.finalize();

        let view = builder.view_ir();
        let enc = view
            .iter()
            .find(|&id| matches!(view.op(id).kind, OpKind::VAesEnc))
            .unwrap();
        assert_eq!(view.op(enc).num_args, 2);
    }

    #[test]
    fn test_keygenassist_carries_rcon() {
        let mut builder = OpDispatchBuilder::new();
        builder.begin_function(0x1000);
        builder.dispatch(&DecodedOp {
            rip: 0x1000,
            op: X86Op::AesKeyGenAssist,
            dest: Operand::Xmm(0),
            src: [Operand::Xmm(1), Operand::Imm(0x1B)],
            op_size: 16,
            len: 6,
            ..Default::default()
        });
        builder.finalize();

        let view = builder.view_ir();
        assert!(view
            .iter()
            .any(|id| matches!(view.op(id).kind, OpKind::VAesKeyGenAssist { rcon: 0x1B })));
    }

    #[test]
    fn test_crc32_records_source_width() {
        let mut builder = OpDispatchBuilder::new();
        builder.begin_function(0x1000);
        builder.dispatch(&DecodedOp {
            rip: 0x1000,
            op: X86Op::Crc32,
            dest: Operand::Gpr(X86Reg::Rax),
            src: [Operand::Gpr(X86Reg::Rbx), Operand::None],
            op_size: 4,
            src_size: 2,
            len: 5,
            ..Default::default()
        });
        builder.finalize();

        let view = builder.view_ir();
        assert!(view
            .iter()
            .any(|id| matches!(view.op(id).kind, OpKind::Crc32 { src_size: 2 })));
    }
}
