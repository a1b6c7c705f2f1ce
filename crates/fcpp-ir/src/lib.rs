//! fcpp-ir - Three-address IR and AST lowering.
//!
//! For each parsed function this crate produces a [`FunctionIr`]: a linear
//! instruction vector with label/branch control flow (no basic-block
//! structure), typed SSA-style temporaries, the function's stack-frame
//! layout, and its exception-handling region structure. Name mangling for
//! both targets lives here too, since symbol names are fixed at lowering
//! time while machine encoding happens later.

pub mod frame;
pub mod ir;
pub mod lower;
pub mod mangle;

pub use frame::compute_frame;
pub use ir::{
    CallArg, CallConv, Callee, CastKind, FunctionIr, HandlerInfo, IrBinOp, IrCmpOp, IrOp, IrUnOp,
    LabelId, LocalSlot, Operand, Target, TempInfo, TempVar, TryRegion,
};
pub use lower::{lower_function, lower_static_initializers, LowerError};
