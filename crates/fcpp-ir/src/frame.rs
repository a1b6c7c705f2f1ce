//! Stack-space pre-pass.
//!
//! Runs once over a function's IR before machine emission and decides the
//! frame layout: a slot for every local, a spill slot for every temporary
//! (the register allocator flushes at calls, branches and back-edge labels,
//! so any temp can need its slot), and the total frame size rounded up to 16
//! bytes.
//!
//! The pass also enforces the sized-load invariant: every instruction that
//! produces a value must name a temp whose width was registered at creation.
//! An unregistered producer would make the downstream load guess a width and
//! read stack garbage, so it is an internal error here, not later.

use crate::ir::{FunctionIr, IrOp, Operand, TempVar};

/// Compute slot offsets and the total frame size.
///
/// Locals are placed first (at their natural alignment), then one 8-byte
/// spill slot per temporary. Offsets are negative and RBP-relative. Local
/// slots keep their natural alignment, which is how structured-binding slots
/// end up at non-8-byte-aligned offsets; the register flush discipline in
/// the code generator must (and does) handle those.
pub fn compute_frame(func: &mut FunctionIr) {
    verify_producers_registered(func);

    let mut cursor: i32 = 0;

    for slot in func.locals.iter_mut() {
        let size = (slot.size_bits.div_ceil(8)).max(1) as i32;
        let align = (slot.align_bits.div_ceil(8)).max(1) as i32;
        cursor -= size;
        // Round the offset down to the slot's alignment.
        cursor = -(((-cursor) + align - 1) / align * align);
        slot.offset = cursor;
    }

    for t in func.temps.indices() {
        cursor -= 8;
        func.temp_slots.insert(t, cursor);
    }

    let used = (-cursor) as u32;
    func.frame_size = used.div_ceil(16) * 16;
}

/// Every temp consumed anywhere must have been produced by an instruction
/// that registered it — including the unary operators, historically the easy
/// ones to forget.
fn verify_producers_registered(func: &FunctionIr) {
    let check = |t: TempVar| {
        assert!(
            func.temps.get(t).is_some(),
            "temp {t:?} used without a registered width in '{}'",
            func.mangled
        );
    };
    let check_op = |op: Operand| {
        if let Operand::Temp(t) = op {
            check(t);
        }
    };
    for inst in &func.ir {
        match inst {
            IrOp::ConstInt { dst, .. } | IrOp::ConstFloat { dst, .. } => check(*dst),
            IrOp::Copy { dst, src } => {
                check(*dst);
                check_op(*src);
            }
            IrOp::LoadLocal { dst, .. }
            | IrOp::AddrOfLocal { dst, .. }
            | IrOp::AddrOfGlobal { dst, .. }
            | IrOp::LoadGlobal { dst, .. }
            | IrOp::AddrOfString { dst, .. } => check(*dst),
            IrOp::StoreLocal { src, .. } | IrOp::StoreGlobal { src, .. } => check_op(*src),
            IrOp::LoadMem { dst, addr, .. } => {
                check(*dst);
                check(*addr);
            }
            IrOp::StoreMem { addr, src, .. } => {
                check(*addr);
                check_op(*src);
            }
            IrOp::Binary { dst, lhs, rhs, .. } | IrOp::Cmp { dst, lhs, rhs, .. } => {
                check(*dst);
                check_op(*lhs);
                check_op(*rhs);
            }
            IrOp::Unary { dst, src, .. } | IrOp::Cast { dst, src, .. } => {
                check(*dst);
                check_op(*src);
            }
            IrOp::Branch { cond, .. } => check_op(*cond),
            IrOp::JumpTable { index, .. } => check_op(*index),
            IrOp::Call { args, dst, sret, callee, .. } => {
                for a in args {
                    check_op(a.value);
                }
                if let Some(d) = dst {
                    check(*d);
                }
                if let Some(s) = sret {
                    check(*s);
                }
                if let crate::ir::Callee::Indirect(t) = callee {
                    check(*t);
                }
            }
            IrOp::Ret { value } => {
                if let Some(v) = value {
                    check_op(*v);
                }
            }
            IrOp::LoadVtableSlot { dst, object, .. } => {
                check(*dst);
                check(*object);
            }
            IrOp::CatchBegin { exc, .. } => check(*exc),
            IrOp::Label(_)
            | IrOp::Jump(_)
            | IrOp::TryBegin { .. }
            | IrOp::TryEnd { .. }
            | IrOp::CatchEnd { .. }
            | IrOp::Unreachable => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{CallConv, LocalSlot};
    use fcpp_sem::TypeIndex;
    use fcpp_util::{FxHashMap, IndexVec, StringHandle};

    fn empty_fn() -> FunctionIr {
        FunctionIr {
            name: StringHandle::DUMMY,
            mangled: "f".to_string(),
            signature: TypeIndex(0),
            conv: CallConv::SysV,
            params: Vec::new(),
            param_locals: Vec::new(),
            thrown_types: Vec::new(),
            ir: Vec::new(),
            temps: IndexVec::new(),
            locals: IndexVec::new(),
            label_count: 0,
            frame_size: 0,
            temp_slots: FxHashMap::default(),
            try_regions: Vec::new(),
            is_internal: false,
            ret: None,
        }
    }

    #[test]
    fn test_empty_function_has_empty_frame() {
        let mut f = empty_fn();
        compute_frame(&mut f);
        assert_eq!(f.frame_size, 0);
    }

    #[test]
    fn test_frame_covers_all_slots() {
        let mut f = empty_fn();
        f.locals.push(LocalSlot { size_bits: 32, align_bits: 32, offset: 0 });
        f.locals.push(LocalSlot { size_bits: 64, align_bits: 64, offset: 0 });
        let t = f.alloc_temp(32, true, false);
        f.emit(IrOp::ConstInt { dst: t, value: 1 });
        compute_frame(&mut f);

        // Sufficiency: frame_size >= |offset| for every slot.
        for slot in f.locals.iter() {
            assert!(slot.offset < 0);
            assert!(f.frame_size as i32 >= -slot.offset);
        }
        let spill = f.temp_slots[&t];
        assert!(f.frame_size as i32 >= -spill);
        assert_eq!(f.frame_size % 16, 0);
    }

    #[test]
    fn test_alignment_respected() {
        let mut f = empty_fn();
        f.locals.push(LocalSlot { size_bits: 8, align_bits: 8, offset: 0 });
        f.locals.push(LocalSlot { size_bits: 64, align_bits: 64, offset: 0 });
        compute_frame(&mut f);
        let eight_byte = f.locals.raw()[1];
        assert_eq!(eight_byte.offset % 8, 0);
    }

    #[test]
    fn test_non_eight_byte_aligned_slots_exist() {
        // Two ints pack at 4-byte alignment; the second lands at an offset
        // that is not 8-aligned, which the register flush path must handle.
        let mut f = empty_fn();
        f.locals.push(LocalSlot { size_bits: 32, align_bits: 32, offset: 0 });
        f.locals.push(LocalSlot { size_bits: 32, align_bits: 32, offset: 0 });
        compute_frame(&mut f);
        assert!(f.locals.iter().any(|s| s.offset % 8 != 0));
    }

    #[test]
    #[should_panic(expected = "without a registered width")]
    fn test_unregistered_producer_panics() {
        let mut f = empty_fn();
        // A temp id that was never allocated.
        f.emit(IrOp::ConstInt { dst: TempVar(7), value: 1 });
        compute_frame(&mut f);
    }
}
