//! x86 opcode dispatcher
//!
//! `OpDispatchBuilder` walks decoded guest instructions and emits the SSA
//! IR implementing their semantics into a pair of arenas. One builder
//! handles one translation unit at a time: seeded by `begin_function`,
//! grown by `dispatch`, sealed by `finalize`, and rewound by
//! `reset_working_list` for the next unit. Branches to guest addresses
//! not yet emitted are recorded as fixups and patched when the target
//! block appears (or stubbed with a cache exit at finalize).

pub mod operands;
pub mod state;

mod alu;
mod control;
mod crypto;
mod emit;
mod flags;
mod vector;

pub use flags::{FLAG_AF, FLAG_CF, FLAG_DF, FLAG_OF, FLAG_PF, FLAG_SF, FLAG_ZF};

use rustc_hash::FxHashMap;

use crate::ir::{Arena, IrListCopy, IrListView, NodeId, Op, OpId, OpKind, OrderedNode};
use crate::telemetry::{self, TelemetryType};
use operands::{prefix, DecodedOp, X86Op};

/// Default arena backing, in elements. A translation unit rarely exceeds
/// a few thousand ops; the backing bounds `copy_data` between builders.
const DEFAULT_BACKING: usize = 32 * 1024;

/// A branch emitted before its target block existed. `slot` is the
/// argument index awaiting the block id.
#[derive(Debug, Clone, Copy)]
struct Fixup {
    node: NodeId,
    slot: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BuilderState {
    Empty,
    Building,
    Sealed,
}

/// Per-translation-unit IR builder.
pub struct OpDispatchBuilder {
    /// Op payload arena.
    data: Arena<Op>,
    /// Ordered node arena.
    list: Arena<OrderedNode>,

    state: BuilderState,
    write_cursor: NodeId,
    list_head: NodeId,
    invalid_node: NodeId,
    current_code_block: NodeId,
    code_blocks: Vec<NodeId>,

    jump_targets: FxHashMap<u64, NodeId>,
    fixups: FxHashMap<u64, Vec<Fixup>>,

    entry: u64,
    multiblock: bool,
    had_unconditional_exit: bool,
    decode_failure: bool,
}

impl OpDispatchBuilder {
    pub fn new() -> Self {
        Self::with_backing(DEFAULT_BACKING, DEFAULT_BACKING)
    }

    /// Build with explicit arena backings (elements, not bytes).
    pub fn with_backing(op_backing: usize, node_backing: usize) -> Self {
        OpDispatchBuilder {
            data: Arena::with_backing(op_backing),
            list: Arena::with_backing(node_backing),
            state: BuilderState::Empty,
            write_cursor: NodeId::INVALID,
            list_head: NodeId::INVALID,
            invalid_node: NodeId::INVALID,
            current_code_block: NodeId::INVALID,
            code_blocks: Vec::new(),
            jump_targets: FxHashMap::default(),
            fixups: FxHashMap::default(),
            entry: 0,
            multiblock: false,
            had_unconditional_exit: false,
            decode_failure: false,
        }
    }

    // ===== Lifecycle =====

    /// Open a translation unit at a guest entry point.
    pub fn begin_function(&mut self, rip: u64) {
        assert_eq!(
            self.state,
            BuilderState::Empty,
            "begin_function on a builder that was not reset"
        );
        self.state = BuilderState::Building;
        self.entry = rip;
        self.had_unconditional_exit = false;
        self.multiblock = false;

        // The invalid node heads the list; every unresolved branch slot
        // is distinguishable from it because slots use NodeId::INVALID.
        let op = self.allocate_op(Op::new(OpKind::Invalid, 0, 1, false, &[]));
        self.invalid_node = self.create_node(op);

        let entry_block = self.create_code_node();
        self.current_code_block = entry_block;
        let begin = self.emit(Op::new(OpKind::BeginBlock, 0, 1, false, &[]));
        self.set_code_node_begin(entry_block, begin);
        self.insert_jump_target(rip, entry_block);
    }

    /// Emit the terminal exit. The guest rip must already be stored.
    pub fn exit_function(&mut self) {
        self.emit(Op::new(
            OpKind::EndBlock { rip_increment: 0 },
            0,
            1,
            false,
            &[],
        ));
        self.emit(Op::new(OpKind::ExitFunction, 0, 1, false, &[]));
        self.had_unconditional_exit = true;
    }

    /// Seal the unit: stub still-unresolved branch targets with cache
    /// exits, then verify every branch argument lands on a code block.
    pub fn finalize(&mut self) {
        assert_eq!(self.state, BuilderState::Building, "finalize outside Building");

        let mut pending: Vec<u64> = self.fixups.keys().copied().collect();
        pending.sort_unstable();
        for rip in pending {
            let block = self.begin_untargeted_block();
            let target = self.constant(8, rip);
            self.store_context(8, state::RIP_OFFSET, target);
            self.exit_function();
            self.insert_jump_target(rip, block);
        }
        self.seal_current_block();

        if !self.decode_failure {
            self.verify_branches();
        }
        self.state = BuilderState::Sealed;
    }

    /// Rewind both arenas and all tables; the builder is reusable.
    pub fn reset_working_list(&mut self) {
        self.data.clear();
        self.list.clear();
        self.code_blocks.clear();
        self.jump_targets.clear();
        self.fixups.clear();
        self.write_cursor = NodeId::INVALID;
        self.list_head = NodeId::INVALID;
        self.invalid_node = NodeId::INVALID;
        self.current_code_block = NodeId::INVALID;
        self.entry = 0;
        self.multiblock = false;
        self.had_unconditional_exit = false;
        self.decode_failure = false;
        self.state = BuilderState::Empty;
    }

    pub fn had_decode_failure(&self) -> bool {
        self.decode_failure
    }

    pub fn had_unconditional_exit(&self) -> bool {
        self.had_unconditional_exit
    }

    pub fn is_multiblock(&self) -> bool {
        self.multiblock
    }

    pub fn entry_rip(&self) -> u64 {
        self.entry
    }

    // ===== Views =====

    /// Borrow the sealed unit for the backend.
    pub fn view_ir(&self) -> IrListView<'_> {
        assert_eq!(self.state, BuilderState::Sealed, "view of an unsealed unit");
        IrListView::new(
            self.data_nodes(),
            self.data.as_slice(),
            &self.code_blocks,
            self.list_head,
        )
    }

    /// Deep-copy the sealed unit for caching.
    pub fn create_ir_copy(&self) -> IrListCopy {
        IrListCopy::from_view(&self.view_ir())
    }

    /// Take over another builder's arenas and block bookkeeping.
    pub fn copy_data(&mut self, other: &OpDispatchBuilder) {
        self.data.copy_data(&other.data);
        self.list.copy_data(&other.list);
        self.invalid_node = other.invalid_node;
        self.write_cursor = other.write_cursor;
        self.list_head = other.list_head;
        self.current_code_block = other.current_code_block;
        self.code_blocks.clone_from(&other.code_blocks);
        self.entry = other.entry;
        self.state = other.state;
    }

    fn data_nodes(&self) -> &[OrderedNode] {
        self.list.as_slice()
    }

    // ===== Node and payload plumbing =====

    fn allocate_op(&mut self, op: Op) -> OpId {
        OpId(self.data.allocate(op))
    }

    /// Allocate a node for a payload and link it after the write cursor.
    fn create_node(&mut self, op: OpId) -> NodeId {
        let id = NodeId(self.list.allocate(OrderedNode::new(op)));
        self.link_after_cursor(id);
        id
    }

    /// Allocate a node left out of the emission order (code blocks).
    fn create_orphan_node(&mut self, op: OpId) -> NodeId {
        NodeId(self.list.allocate(OrderedNode::new(op)))
    }

    fn link_after_cursor(&mut self, id: NodeId) {
        if self.write_cursor.is_valid() {
            let next = self.list.get(self.write_cursor.0).next;
            {
                let node = self.list.get_mut(id.0);
                node.prev = self.write_cursor;
                node.next = next;
            }
            self.list.get_mut(self.write_cursor.0).next = id;
            if next.is_valid() {
                self.list.get_mut(next.0).prev = id;
            }
        } else if !self.list_head.is_valid() {
            self.list_head = id;
        }
        self.write_cursor = id;
    }

    /// Append a payload as a new node at the cursor. All emission helpers
    /// funnel through here.
    pub(crate) fn emit(&mut self, op: Op) -> NodeId {
        assert_eq!(
            self.state,
            BuilderState::Building,
            "IR emission outside an open translation unit"
        );
        let op = self.allocate_op(op);
        self.create_node(op)
    }

    pub fn op(&self, node: NodeId) -> &Op {
        self.data.get(self.list.get(node.0).op.0)
    }

    fn op_mut(&mut self, node: NodeId) -> &mut Op {
        let op = self.list.get(node.0).op;
        self.data.get_mut(op.0)
    }

    pub fn invalid_node(&self) -> NodeId {
        self.invalid_node
    }

    /// Move the insertion point; subsequent emission goes after `node`.
    pub fn set_write_cursor(&mut self, node: NodeId) {
        self.write_cursor = node;
    }

    pub fn get_write_cursor(&self) -> NodeId {
        self.write_cursor
    }

    /// Remove a node from the emission order. Its id stays addressable.
    pub fn unlink(&mut self, node: NodeId) {
        let (prev, next) = {
            let n = self.list.get(node.0);
            (n.prev, n.next)
        };
        if prev.is_valid() {
            self.list.get_mut(prev.0).next = next;
        }
        if next.is_valid() {
            self.list.get_mut(next.0).prev = prev;
        }
        if self.list_head == node {
            self.list_head = next;
        }
        if self.write_cursor == node {
            self.write_cursor = prev;
        }
        let n = self.list.get_mut(node.0);
        n.prev = NodeId::INVALID;
        n.next = NodeId::INVALID;
    }

    /// Redirect every consumer of `node` to a fresh payload. Legal while
    /// no other node aliases the old payload.
    pub fn replace_all_uses_with_op(&mut self, node: NodeId, op: Op) {
        let op = self.allocate_op(op);
        self.list.get_mut(node.0).op = op;
    }

    /// Redirect every consumer of `node` to `other`'s payload.
    pub fn replace_all_uses_with(&mut self, node: NodeId, other: NodeId) {
        let op = self.list.get(other.0).op;
        self.list.get_mut(node.0).op = op;
    }

    /// If the node resolves to a constant payload, return its value.
    pub fn is_value_constant(&self, node: NodeId) -> Option<u64> {
        match self.op(node).kind {
            OpKind::Constant { value } => Some(value),
            _ => None,
        }
    }

    // ===== Blocks, jump targets, fixups =====

    /// Allocate a code block node outside the emission order and track it.
    pub fn create_code_node(&mut self) -> NodeId {
        let op = self.allocate_op(Op::new(
            OpKind::CodeBlock {
                begin: NodeId::INVALID,
                last: NodeId::INVALID,
                next: NodeId::INVALID,
            },
            0,
            1,
            false,
            &[],
        ));
        let node = self.create_orphan_node(op);
        self.code_blocks.push(node);
        node
    }

    pub fn code_blocks(&self) -> &[NodeId] {
        &self.code_blocks
    }

    fn code_block_fields(&mut self, node: NodeId) -> &mut Op {
        let op = self.op_mut(node);
        assert!(
            matches!(op.kind, OpKind::CodeBlock { .. }),
            "node {} is not a code block",
            node
        );
        op
    }

    pub fn set_code_node_begin(&mut self, block: NodeId, begin: NodeId) {
        if let OpKind::CodeBlock { begin: b, .. } = &mut self.code_block_fields(block).kind {
            *b = begin;
        }
    }

    pub fn set_code_node_last(&mut self, block: NodeId, last: NodeId) {
        if let OpKind::CodeBlock { last: l, .. } = &mut self.code_block_fields(block).kind {
            *l = last;
        }
    }

    pub fn link_code_blocks(&mut self, block: NodeId, next: NodeId) {
        if let OpKind::CodeBlock { next: n, .. } = &mut self.code_block_fields(block).kind {
            *n = next;
        }
    }

    /// Open a new block for guest address `rip`, closing the current one.
    /// Pending fixups at `rip` are patched here.
    pub fn begin_block(&mut self, rip: u64) -> NodeId {
        let block = self.begin_untargeted_block();
        self.insert_jump_target(rip, block);
        self.multiblock = true;
        block
    }

    /// Open a block with no guest address (exit stubs, synthetic arms).
    pub fn begin_untargeted_block(&mut self) -> NodeId {
        assert_eq!(self.state, BuilderState::Building, "block outside Building");
        self.seal_current_block();
        let block = self.create_code_node();
        if self.current_code_block.is_valid() {
            self.link_code_blocks(self.current_code_block, block);
        }
        self.current_code_block = block;
        let begin = self.emit(Op::new(OpKind::BeginBlock, 0, 1, false, &[]));
        self.set_code_node_begin(block, begin);
        block
    }

    fn seal_current_block(&mut self) {
        if self.current_code_block.is_valid() && self.write_cursor.is_valid() {
            self.set_code_node_last(self.current_code_block, self.write_cursor);
        }
    }

    /// Register `block` as the translation of guest address `rip` and
    /// patch every branch waiting on it. Double insertion is fatal.
    pub fn insert_jump_target(&mut self, rip: u64, block: NodeId) {
        assert!(
            !self.jump_targets.contains_key(&rip),
            "jump target {:#x} inserted twice",
            rip
        );
        assert!(
            matches!(self.op(block).kind, OpKind::CodeBlock { .. }),
            "jump target {:#x} is not a code block",
            rip
        );
        self.jump_targets.insert(rip, block);
        if let Some(pending) = self.fixups.remove(&rip) {
            for fixup in pending {
                self.patch_branch_slot(fixup.node, fixup.slot, block);
            }
        }
    }

    pub fn get_jump_target_if_exists(&self, rip: u64) -> Option<NodeId> {
        self.jump_targets.get(&rip).copied()
    }

    fn patch_branch_slot(&mut self, branch: NodeId, slot: u8, target: NodeId) {
        assert!(
            matches!(self.op(target).kind, OpKind::CodeBlock { .. }),
            "branch target {} is not a code block",
            target
        );
        self.op_mut(branch).args[slot as usize] = target;
    }

    /// Point an unconditional jump at a block.
    pub fn set_jump_target(&mut self, branch: NodeId, target: NodeId) {
        assert!(matches!(self.op(branch).kind, OpKind::Jump));
        self.patch_branch_slot(branch, 0, target);
    }

    /// Point a conditional jump's taken edge at a block.
    pub fn set_cond_jump_target(&mut self, branch: NodeId, target: NodeId) {
        assert!(matches!(self.op(branch).kind, OpKind::CondJump));
        self.patch_branch_slot(branch, 1, target);
    }

    /// Point a conditional jump's fall-through edge at a block.
    pub fn set_cond_jump_false_target(&mut self, branch: NodeId, target: NodeId) {
        assert!(matches!(self.op(branch).kind, OpKind::CondJump));
        self.patch_branch_slot(branch, 2, target);
    }

    fn record_fixup(&mut self, rip: u64, node: NodeId, slot: u8) {
        self.fixups.entry(rip).or_default().push(Fixup { node, slot });
    }

    /// Emit a jump to a guest address, resolving or registering a fixup.
    pub(crate) fn jump_to_rip(&mut self, rip: u64) -> NodeId {
        let branch = self.jump();
        match self.get_jump_target_if_exists(rip) {
            Some(block) => self.set_jump_target(branch, block),
            None => self.record_fixup(rip, branch, 0),
        }
        branch
    }

    /// Emit a conditional jump with both edges expressed as guest
    /// addresses.
    pub(crate) fn cond_jump_to_rips(
        &mut self,
        cond_value: NodeId,
        taken: u64,
        fall_through: u64,
    ) -> NodeId {
        let branch = self.cond_jump(cond_value);
        match self.get_jump_target_if_exists(taken) {
            Some(block) => self.set_cond_jump_target(branch, block),
            None => self.record_fixup(taken, branch, 1),
        }
        match self.get_jump_target_if_exists(fall_through) {
            Some(block) => self.set_cond_jump_false_target(branch, block),
            None => self.record_fixup(fall_through, branch, 2),
        }
        branch
    }

    fn verify_branches(&self) {
        let mut cursor = self.list_head;
        while cursor.is_valid() {
            let op = self.op(cursor);
            for &slot in op.branch_target_slots() {
                let target = op.args[slot];
                assert!(
                    target.is_valid(),
                    "branch {} sealed with an unresolved target",
                    cursor
                );
                assert!(
                    matches!(self.op(target).kind, OpKind::CodeBlock { .. }),
                    "branch {} target {} is not a code block",
                    cursor,
                    target
                );
            }
            cursor = self.list.get(cursor.0).next;
        }
    }

    // ===== Dispatch =====

    /// Emit the IR for one decoded instruction. After a decode failure
    /// the unit is abandoned and further dispatch is ignored.
    pub fn dispatch(&mut self, op: &DecodedOp) {
        assert_eq!(self.state, BuilderState::Building, "dispatch outside Building");
        if self.decode_failure {
            return;
        }
        if op.has_prefix(prefix::VEX) {
            telemetry::increment(TelemetryType::VexInstructions, 1);
        }
        if op.has_prefix(prefix::EVEX) {
            telemetry::increment(TelemetryType::EvexInstructions, 1);
        }

        match op.op {
            X86Op::Mov => self.mov_op(op),
            X86Op::MovOffset => self.mov_offset_op(op),
            X86Op::Movsx => self.movsx_op(op),
            X86Op::Movzx => self.movzx_op(op),
            X86Op::Movsxd => self.movsxd_op(op),
            X86Op::Lea => self.lea_op(op),
            X86Op::Leave => self.leave_op(op),
            X86Op::Xchg => self.xchg_op(op),
            X86Op::Bswap => self.bswap_op(op),
            X86Op::Cmov(cond) => self.cmov_op(op, cond),
            X86Op::Setcc(cond) => self.setcc_op(op, cond),
            X86Op::Alu(alu) => self.alu_op(op, alu),
            X86Op::Test => self.test_op(op),
            X86Op::Inc => self.inc_op(op),
            X86Op::Dec => self.dec_op(op),
            X86Op::Neg => self.neg_op(op),
            X86Op::Not => self.not_op(op),
            X86Op::Mul => self.mul_op(op),
            X86Op::Imul1Src => self.imul1_src_op(op),
            X86Op::Imul2Src => self.imul2_src_op(op),
            X86Op::Div => self.div_op(op),
            X86Op::Idiv => self.idiv_op(op),
            X86Op::Shift(shift) => self.shift_op(op, shift),
            X86Op::Bsf => self.bsf_op(op),
            X86Op::Bsr => self.bsr_op(op),
            X86Op::Bt => self.bt_op(op),
            X86Op::Push => self.push_op(op),
            X86Op::Pop => self.pop_op(op),
            X86Op::Call => self.call_op(op),
            X86Op::CallAbs => self.call_absolute_op(op),
            X86Op::Ret => self.ret_op(op),
            X86Op::Jump => self.jump_op(op),
            X86Op::JumpAbs => self.jump_absolute_op(op),
            X86Op::CondJump(cond) => self.cond_jump_op(op, cond),
            X86Op::Nop => {}
            X86Op::Sahf => self.sahf_op(op),
            X86Op::Lahf => self.lahf_op(op),
            X86Op::Clc => self.flag_control_op(op, FLAG_CF, Some(0)),
            X86Op::Stc => self.flag_control_op(op, FLAG_CF, Some(1)),
            X86Op::Cld => self.flag_control_op(op, FLAG_DF, Some(0)),
            X86Op::Std => self.flag_control_op(op, FLAG_DF, Some(1)),
            X86Op::Cmc => self.flag_control_op(op, FLAG_CF, None),
            X86Op::Cpuid => self.cpuid_op(op),
            X86Op::Rdtsc => self.rdtsc_op(op),
            X86Op::Cqo | X86Op::Cdq => self.sign_extend_acc_op(op),
            X86Op::Stos => self.stos_op(op),
            X86Op::Movs => self.movs_op(op),
            X86Op::Cmps => self.cmps_op(op),
            X86Op::MovSeg { to_seg } => self.mov_seg_op(op, to_seg),
            X86Op::Cmpxchg => self.cmpxchg_op(op),
            X86Op::Int3 => self.int3_op(op),
            X86Op::Int(vector) => self.int_op(op, vector),
            X86Op::Syscall => self.syscall_op(op),

            X86Op::Movups => self.movups_op(op),
            X86Op::Movlhps => self.movlhps_op(op),
            X86Op::Movhpd => self.movhpd_op(op),
            X86Op::Movddup => self.movddup_op(op),
            X86Op::Movd => self.movd_op(op),
            X86Op::Movq => self.movq_op(op),
            X86Op::VectorAlu { op: vop, elem_size } => self.vector_alu_op(op, vop, elem_size),
            X86Op::PcmpEq { elem_size } => self.pcmpeq_op(op, elem_size),
            X86Op::PcmpGt { elem_size } => self.pcmpgt_op(op, elem_size),
            X86Op::Pshuf { elem_size, low } => self.pshuf_op(op, elem_size, low),
            X86Op::Shuf { elem_size } => self.shuf_op(op, elem_size),
            X86Op::Punpckl { elem_size } => self.punpck_op(op, elem_size, true),
            X86Op::Punpckh { elem_size } => self.punpck_op(op, elem_size, false),
            X86Op::Palignr => self.palignr_op(op),
            X86Op::Psll { elem_size } => self.vector_shift_op(op, elem_size, true),
            X86Op::Psrl { elem_size } => self.vector_shift_op(op, elem_size, false),
            X86Op::Psrldq => self.psrldq_op(op),
            X86Op::Pminu { elem_size } => self.pminu_op(op, elem_size),
            X86Op::Pminsw => self.pminsw_op(op),
            X86Op::Pmovmskb => self.pmovmskb_op(op),
            X86Op::Fxsave => self.fxsave_op(op),
            X86Op::Fxrstor => self.fxrstor_op(op),

            X86Op::AesImc => self.aesimc_op(op),
            X86Op::AesEnc => self.aesenc_op(op),
            X86Op::AesEncLast => self.aesenclast_op(op),
            X86Op::AesDec => self.aesdec_op(op),
            X86Op::AesDecLast => self.aesdeclast_op(op),
            X86Op::AesKeyGenAssist => self.aeskeygenassist_op(op),
            X86Op::Crc32 => self.crc32_op(op),

            X86Op::Unimplemented => self.unimplemented_op(op),
        }
    }

    /// Opcode the decoder could not classify.
    pub fn unhandled_op(&mut self, op: &DecodedOp) {
        log::debug!("unhandled opcode at rip {:#x}", op.rip);
        self.decode_failure = true;
        self.emit(Op::new(
            OpKind::Break {
                reason: crate::ir::BreakReason::Unimplemented,
            },
            0,
            1,
            false,
            &[],
        ));
    }

    /// Opcode the dispatcher knows but does not implement.
    pub fn unimplemented_op(&mut self, op: &DecodedOp) {
        log::debug!("unimplemented opcode at rip {:#x}", op.rip);
        self.decode_failure = true;
        self.emit(Op::new(
            OpKind::Break {
                reason: crate::ir::BreakReason::Unimplemented,
            },
            0,
            1,
            false,
            &[],
        ));
    }
}

impl Default for OpDispatchBuilder {
    fn default() -> Self {
        Self::new()
    }
}
