//! Control flow, stack, string, and system instruction handlers
//!
//! Branches inside the translation unit become SSA jumps between code
//! blocks, resolved through the jump-target table or deferred as fixups.
//! Branches that leave the unit store the guest rip and exit to the
//! lookup cache.

use super::operands::{prefix, Cond, DecodedOp, Operand, X86Reg};
use super::state;
use super::OpDispatchBuilder;
use crate::ir::{BreakReason, CondCode, NodeId};

impl OpDispatchBuilder {
    fn branch_displacement(&self, op: &DecodedOp) -> i64 {
        match op.src[0] {
            Operand::Imm(disp) => disp as i64,
            other => panic!("branch at {:#x} without immediate target: {:?}", op.rip, other),
        }
    }

    /// Advance by ±size depending on DF.
    fn string_delta(&mut self, size: u8) -> NodeId {
        let df = self.get_rflag(super::FLAG_DF);
        let zero = self.constant(1, 0);
        let forward = self.constant(8, size as u64);
        let backward = self.constant(8, (size as i64).wrapping_neg() as u64);
        self.select(CondCode::Eq, 1, df, zero, forward, backward)
    }

    pub(crate) fn push_op(&mut self, op: &DecodedOp) {
        let size = op.op_size;
        let value = self.load_source(op, &op.src[0]);
        let rsp = self.load_context(8, state::gpr_offset(X86Reg::Rsp));
        let slot = self.constant(8, size as u64);
        let new_rsp = self.sub(8, rsp, slot);
        self.store_mem(size, new_rsp, value);
        self.store_context(8, state::gpr_offset(X86Reg::Rsp), new_rsp);
    }

    pub(crate) fn pop_op(&mut self, op: &DecodedOp) {
        let size = op.op_size;
        let rsp = self.load_context(8, state::gpr_offset(X86Reg::Rsp));
        let value = self.load_mem(size, rsp);
        let slot = self.constant(8, size as u64);
        let new_rsp = self.add(8, rsp, slot);
        self.store_context(8, state::gpr_offset(X86Reg::Rsp), new_rsp);
        // A pop into rsp keeps the loaded value; store the destination last.
        self.store_result(op, &op.dest, value);
    }

    pub(crate) fn leave_op(&mut self, _op: &DecodedOp) {
        let rbp = self.load_context(8, state::gpr_offset(X86Reg::Rbp));
        let restored = self.load_mem(8, rbp);
        let slot = self.constant(8, 8);
        let new_rsp = self.add(8, rbp, slot);
        self.store_context(8, state::gpr_offset(X86Reg::Rbp), restored);
        self.store_context(8, state::gpr_offset(X86Reg::Rsp), new_rsp);
    }

    pub(crate) fn call_op(&mut self, op: &DecodedOp) {
        let disp = self.branch_displacement(op);
        let target = op.next_rip().wrapping_add(disp as u64);

        let ret_addr = self.constant(8, op.next_rip());
        self.push_value(ret_addr);

        let target = self.constant(8, target);
        self.store_context(8, state::RIP_OFFSET, target);
        self.exit_function();
    }

    pub(crate) fn call_absolute_op(&mut self, op: &DecodedOp) {
        let target = self.load_source_with_size(op, &op.src[0], 8);

        let ret_addr = self.constant(8, op.next_rip());
        self.push_value(ret_addr);

        self.store_context(8, state::RIP_OFFSET, target);
        self.exit_function();
    }

    fn push_value(&mut self, value: NodeId) {
        let rsp = self.load_context(8, state::gpr_offset(X86Reg::Rsp));
        let slot = self.constant(8, 8);
        let new_rsp = self.sub(8, rsp, slot);
        self.store_mem(8, new_rsp, value);
        self.store_context(8, state::gpr_offset(X86Reg::Rsp), new_rsp);
    }

    pub(crate) fn ret_op(&mut self, op: &DecodedOp) {
        let rsp = self.load_context(8, state::gpr_offset(X86Reg::Rsp));
        let ret_addr = self.load_mem(8, rsp);

        // `ret imm16` releases extra caller-cleanup bytes.
        let extra = match op.src[0] {
            Operand::Imm(n) => 8 + n,
            _ => 8,
        };
        let slot = self.constant(8, extra);
        let new_rsp = self.add(8, rsp, slot);
        self.store_context(8, state::gpr_offset(X86Reg::Rsp), new_rsp);

        self.store_context(8, state::RIP_OFFSET, ret_addr);
        self.exit_function();
    }

    pub(crate) fn jump_op(&mut self, op: &DecodedOp) {
        let disp = self.branch_displacement(op);
        let target = op.next_rip().wrapping_add(disp as u64);
        self.jump_to_rip(target);
    }

    pub(crate) fn jump_absolute_op(&mut self, op: &DecodedOp) {
        let target = self.load_source_with_size(op, &op.src[0], 8);
        self.store_context(8, state::RIP_OFFSET, target);
        self.exit_function();
    }

    pub(crate) fn cond_jump_op(&mut self, op: &DecodedOp, cond: Cond) {
        let disp = self.branch_displacement(op);
        let taken = op.next_rip().wrapping_add(disp as u64);
        let fall_through = op.next_rip();
        let cv = self.cond_value(cond);
        self.cond_jump_to_rips(cv, taken, fall_through);
    }

    pub(crate) fn sahf_op(&mut self, _op: &DecodedOp) {
        let ah = self.load_context(1, state::gpr_offset(X86Reg::Rax) + 1);
        self.set_packed_rflag(true, ah);
    }

    pub(crate) fn lahf_op(&mut self, _op: &DecodedOp) {
        let packed = self.get_packed_rflag(true);
        self.store_context(1, state::gpr_offset(X86Reg::Rax) + 1, packed);
    }

    /// CLC/STC/CLD/STD write a constant lane; CMC (None) toggles CF.
    pub(crate) fn flag_control_op(&mut self, _op: &DecodedOp, bit: u8, value: Option<u64>) {
        match value {
            Some(v) => {
                let v = self.constant(1, v);
                self.set_rflag(bit, v);
            }
            None => {
                let cur = self.get_rflag(bit);
                let one = self.constant(1, 1);
                let flipped = self.xor(1, cur, one);
                self.set_rflag(bit, flipped);
            }
        }
    }

    pub(crate) fn cpuid_op(&mut self, _op: &DecodedOp) {
        let function = self.load_context(8, state::gpr_offset(X86Reg::Rax));
        let subleaf = self.load_context(8, state::gpr_offset(X86Reg::Rcx));
        let res = self.cpuid(function, subleaf);

        let eax = self.vextract_to_gpr(8, 0, res);
        let ebx = self.vextract_to_gpr(8, 1, res);
        let ecx = self.vextract_to_gpr(8, 2, res);
        let edx = self.vextract_to_gpr(8, 3, res);
        self.store_gpr(8, X86Reg::Rax, eax);
        self.store_gpr(8, X86Reg::Rbx, ebx);
        self.store_gpr(8, X86Reg::Rcx, ecx);
        self.store_gpr(8, X86Reg::Rdx, edx);
    }

    pub(crate) fn rdtsc_op(&mut self, _op: &DecodedOp) {
        let counter = self.cycle_counter();
        let low = self.bfe(32, 0, counter);
        let high = self.bfe(32, 32, counter);
        self.store_gpr(8, X86Reg::Rax, low);
        self.store_gpr(8, X86Reg::Rdx, high);
    }

    pub(crate) fn stos_op(&mut self, op: &DecodedOp) {
        if op.has_prefix(prefix::REP) || op.has_prefix(prefix::REPNE) {
            self.unimplemented_op(op);
            return;
        }
        let size = op.op_size;
        let value = self.load_context(size, state::gpr_offset(X86Reg::Rax));
        let rdi = self.load_context(8, state::gpr_offset(X86Reg::Rdi));
        self.store_mem(size, rdi, value);

        let delta = self.string_delta(size);
        let new_rdi = self.add(8, rdi, delta);
        self.store_context(8, state::gpr_offset(X86Reg::Rdi), new_rdi);
    }

    pub(crate) fn movs_op(&mut self, op: &DecodedOp) {
        if op.has_prefix(prefix::REP) || op.has_prefix(prefix::REPNE) {
            self.unimplemented_op(op);
            return;
        }
        let size = op.op_size;
        let rsi = self.load_context(8, state::gpr_offset(X86Reg::Rsi));
        let rdi = self.load_context(8, state::gpr_offset(X86Reg::Rdi));
        let value = self.load_mem(size, rsi);
        self.store_mem(size, rdi, value);

        let delta = self.string_delta(size);
        let new_rsi = self.add(8, rsi, delta);
        let new_rdi = self.add(8, rdi, delta);
        self.store_context(8, state::gpr_offset(X86Reg::Rsi), new_rsi);
        self.store_context(8, state::gpr_offset(X86Reg::Rdi), new_rdi);
    }

    pub(crate) fn cmps_op(&mut self, op: &DecodedOp) {
        if op.has_prefix(prefix::REP) || op.has_prefix(prefix::REPNE) {
            self.unimplemented_op(op);
            return;
        }
        let size = op.op_size;
        let rsi = self.load_context(8, state::gpr_offset(X86Reg::Rsi));
        let rdi = self.load_context(8, state::gpr_offset(X86Reg::Rdi));
        let lhs = self.load_mem(size, rsi);
        let rhs = self.load_mem(size, rdi);
        let res = self.sub(size, lhs, rhs);
        self.flags_sub(size, res, lhs, rhs);

        let delta = self.string_delta(size);
        let new_rsi = self.add(8, rsi, delta);
        let new_rdi = self.add(8, rdi, delta);
        self.store_context(8, state::gpr_offset(X86Reg::Rsi), new_rsi);
        self.store_context(8, state::gpr_offset(X86Reg::Rdi), new_rdi);
    }

    /// `mov` to or from a segment register; the segment is named by the
    /// decoded op's segment field.
    pub(crate) fn mov_seg_op(&mut self, op: &DecodedOp, to_seg: bool) {
        let segment = op
            .segment
            .unwrap_or_else(|| panic!("segment mov at {:#x} without a segment", op.rip));
        let selector = state::segment_selector_offset(segment);
        if to_seg {
            let value = self.load_source_with_size(op, &op.src[0], 2);
            self.store_context(2, selector, value);
        } else {
            let value = self.load_context(2, selector);
            self.store_result(op, &op.dest, value);
        }
    }

    pub(crate) fn int3_op(&mut self, op: &DecodedOp) {
        let rip = self.constant(8, op.rip);
        self.store_context(8, state::RIP_OFFSET, rip);
        self.break_op(BreakReason::Int3);
    }

    pub(crate) fn int_op(&mut self, op: &DecodedOp, vector: u8) {
        let rip = self.constant(8, op.rip);
        self.store_context(8, state::RIP_OFFSET, rip);
        self.break_op(BreakReason::Interrupt(vector));
    }

    pub(crate) fn syscall_op(&mut self, op: &DecodedOp) {
        let args = [
            self.load_context(8, state::gpr_offset(X86Reg::Rax)),
            self.load_context(8, state::gpr_offset(X86Reg::Rdi)),
            self.load_context(8, state::gpr_offset(X86Reg::Rsi)),
            self.load_context(8, state::gpr_offset(X86Reg::Rdx)),
            self.load_context(8, state::gpr_offset(X86Reg::R10)),
            self.load_context(8, state::gpr_offset(X86Reg::R8)),
            self.load_context(8, state::gpr_offset(X86Reg::R9)),
        ];
        // The handler may observe rip (sigreturn, restart).
        let rip = self.constant(8, op.rip);
        self.store_context(8, state::RIP_OFFSET, rip);

        let result = self.syscall(args);
        self.store_gpr(8, X86Reg::Rax, result);
    }
}

#[cfg(test)]
mod tests {
    use super::super::operands::*;
    use super::super::OpDispatchBuilder;
    use crate::ir::OpKind;

    #[test]
    fn test_push_adjusts_stack_down() {
        let mut builder = OpDispatchBuilder::new();
        builder.begin_function(0x1000);
        builder.dispatch(&DecodedOp {
            rip: 0x1000,
            op: X86Op::Push,
            src: [Operand::Gpr(X86Reg::Rbp), Operand::None],
            len: 1,
            ..Default::default()
        });
        builder.finalize();

        let view = builder.view_ir();
        let subs = view
            .iter()
            .filter(|&id| matches!(view.op(id).kind, OpKind::Sub))
            .count();
        let stores = view
            .iter()
            .filter(|&id| matches!(view.op(id).kind, OpKind::StoreMem))
            .count();
        assert_eq!(subs, 1);
        assert_eq!(stores, 1);
    }

    #[test]
    fn test_call_pushes_return_and_exits() {
        let mut builder = OpDispatchBuilder::new();
        builder.begin_function(0x1000);
        builder.dispatch(&DecodedOp {
            rip: 0x1000,
            op: X86Op::Call,
            src: [Operand::Imm(0x100), Operand::None],
            len: 5,
            ..Default::default()
        });
        builder.finalize();

        assert!(builder.had_unconditional_exit());
        let view = builder.view_ir();
        // Return address 0x1005 and target 0x1105 both materialize.
        let has_ret_addr = view
            .iter()
            .any(|id| matches!(view.op(id).kind, OpKind::Constant { value: 0x1005 }));
        let has_target = view
            .iter()
            .any(|id| matches!(view.op(id).kind, OpKind::Constant { value: 0x1105 }));
        assert!(has_ret_addr);
        assert!(has_target);
    }

    #[test]
    fn test_rep_string_op_is_decode_failure() {
        let mut builder = OpDispatchBuilder::new();
        builder.begin_function(0x1000);
        builder.dispatch(&DecodedOp {
            rip: 0x1000,
            op: X86Op::Stos,
            prefixes: prefix::REP,
            len: 2,
            ..Default::default()
        });
        assert!(builder.had_decode_failure());
    }

    #[test]
    fn test_syscall_loads_linux_argument_registers() {
        let mut builder = OpDispatchBuilder::new();
        builder.begin_function(0x1000);
        builder.dispatch(&DecodedOp {
            rip: 0x1000,
            op: X86Op::Syscall,
            len: 2,
            ..Default::default()
        });
        builder.finalize();

        let view = builder.view_ir();
        let syscall = view
            .iter()
            .find(|&id| matches!(view.op(id).kind, OpKind::Syscall))
            .unwrap();
        assert_eq!(view.op(syscall).num_args, 7);
    }

    #[test]
    fn test_cmc_toggles_carry() {
        let mut builder = OpDispatchBuilder::new();
        builder.begin_function(0x1000);
        builder.dispatch(&DecodedOp {
            rip: 0x1000,
            op: X86Op::Cmc,
            len: 1,
            ..Default::default()
        });
        builder.finalize();

        let view = builder.view_ir();
        let loads = view
            .iter()
            .filter(|&id| matches!(view.op(id).kind, OpKind::LoadFlag { bit: 0 }))
            .count();
        let xors = view
            .iter()
            .filter(|&id| matches!(view.op(id).kind, OpKind::Xor))
            .count();
        assert_eq!(loads, 1);
        assert_eq!(xors, 1);
    }
}
