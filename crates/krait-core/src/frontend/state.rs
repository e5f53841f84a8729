//! Guest CPU context layout
//!
//! Byte offsets into the per-thread guest state the backend materializes.
//! Context load/store ops address guest registers through these offsets,
//! so the layout is part of the frontend/backend contract.

use super::operands::{Segment, X86Reg};

/// Guest instruction pointer.
pub const RIP_OFFSET: u32 = 0;

const GPR_BASE: u32 = 8;
const XMM_BASE: u32 = GPR_BASE + 16 * 8;
const GS_BASE: u32 = XMM_BASE + 16 * 16;
const FS_BASE: u32 = GS_BASE + 8;
const SEGMENT_SELECTOR_BASE: u32 = FS_BASE + 8;
const FLAGS_BASE: u32 = SEGMENT_SELECTOR_BASE + 6 * 2;

/// One byte per RFLAGS lane, indexed by bit position.
pub const FLAGS_LANES: u32 = 48;

/// Total context bytes the backend must reserve per guest thread.
pub const CPU_STATE_SIZE: u32 = FLAGS_BASE + FLAGS_LANES;

pub fn gpr_offset(reg: X86Reg) -> u32 {
    GPR_BASE + reg.index() * 8
}

pub fn xmm_offset(reg: u8) -> u32 {
    XMM_BASE + reg as u32 * 16
}

/// Base address of a segment. Only FS and GS carry non-zero bases in
/// 64-bit mode.
pub fn segment_base_offset(segment: Segment) -> u32 {
    match segment {
        Segment::Gs => GS_BASE,
        Segment::Fs => FS_BASE,
        _ => panic!("segment {:?} has no base slot", segment),
    }
}

/// Selector word of a segment register.
pub fn segment_selector_offset(segment: Segment) -> u32 {
    let idx = match segment {
        Segment::Es => 0,
        Segment::Cs => 1,
        Segment::Ss => 2,
        Segment::Ds => 3,
        Segment::Fs => 4,
        Segment::Gs => 5,
    };
    SEGMENT_SELECTOR_BASE + idx * 2
}

/// Offset of one RFLAGS lane byte.
pub fn flag_offset(bit: u8) -> u32 {
    assert!((bit as u32) < FLAGS_LANES, "flag lane {} out of range", bit);
    FLAGS_BASE + bit as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offsets_do_not_overlap() {
        assert_eq!(gpr_offset(X86Reg::Rax), 8);
        assert_eq!(gpr_offset(X86Reg::R15), 8 + 15 * 8);
        assert!(xmm_offset(0) >= gpr_offset(X86Reg::R15) + 8);
        assert!(segment_base_offset(Segment::Gs) >= xmm_offset(15) + 16);
        assert!(flag_offset(0) >= segment_selector_offset(Segment::Gs) + 2);
        assert!(flag_offset(11) < CPU_STATE_SIZE);
    }
}
