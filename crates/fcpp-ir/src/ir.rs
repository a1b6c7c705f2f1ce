//! IR instruction set and function records.
//!
//! The IR is a linear vector of [`IrOp`]s per function. Control flow is
//! expressed with labels and branches; there is no re-ordering pass, so
//! instructions execute in emitted order. Every value-producing instruction
//! names a destination [`TempVar`] whose width and signedness are registered
//! in the function's temp table at creation — the code generator's sized
//! loads depend on that registration being total.

use fcpp_sem::TypeIndex;
use fcpp_util::{define_idx, FxHashMap, IndexVec, LocalId, StringHandle};

define_idx! {
    /// SSA-style temporary id, unique within one function.
    pub struct TempVar;
}

define_idx! {
    /// Branch target, resolved to a code offset by the emitter.
    pub struct LabelId;
}

/// Compilation target; selects ABI, mangling scheme and object flavor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Target {
    Linux64,
    Win64,
}

impl Target {
    /// Size in bytes above which a struct argument passes by hidden
    /// pointer.
    pub fn byval_threshold(self) -> u32 {
        match self {
            Target::Linux64 => 128,
            Target::Win64 => 64,
        }
    }
}

/// Calling convention of a function.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallConv {
    SysV,
    Win64,
}

impl From<Target> for CallConv {
    fn from(target: Target) -> Self {
        match target {
            Target::Linux64 => CallConv::SysV,
            Target::Win64 => CallConv::Win64,
        }
    }
}

/// Registered shape of one temporary.
#[derive(Clone, Copy, Debug)]
pub struct TempInfo {
    pub bits: u8,
    pub signed: bool,
    pub is_float: bool,
}

/// An instruction operand.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Operand {
    Temp(TempVar),
    ImmInt(i64),
    /// Materialized through a `.rodata` constant by the emitter.
    ImmFloat(f64),
}

/// Integer/float binary operations. Signedness is encoded in the opcode so
/// the emitter needs no side-channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IrBinOp {
    Add,
    Sub,
    Mul,
    SDiv,
    UDiv,
    SRem,
    URem,
    And,
    Or,
    Xor,
    Shl,
    AShr,
    LShr,
    FAdd,
    FSub,
    FMul,
    FDiv,
}

/// Unary operations. Logical-not produces a 0/1 byte value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IrUnOp {
    Neg,
    BitNot,
    LogicalNot,
    FNeg,
}

/// Comparison operations, signed/unsigned/float variants.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IrCmpOp {
    Eq,
    Ne,
    SLt,
    SLe,
    SGt,
    SGe,
    ULt,
    ULe,
    UGt,
    UGe,
    FEq,
    FNe,
    FLt,
    FLe,
    FGt,
    FGe,
}

/// Width/representation conversions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CastKind {
    SignExtend { to_bits: u8 },
    ZeroExtend { to_bits: u8 },
    Truncate { to_bits: u8 },
    IntToFloat { to_bits: u8, signed: bool },
    FloatToInt { to_bits: u8, signed: bool },
    FloatExtend,
    FloatTruncate,
    Bitcast,
}

/// Call target.
#[derive(Clone, Debug)]
pub enum Callee {
    /// A named symbol (already mangled).
    Direct(StringHandle),
    /// A function pointer held in a temporary (virtual dispatch, lambdas).
    Indirect(TempVar),
}

/// One call argument with its ABI classification inputs.
#[derive(Clone, Copy, Debug)]
pub struct CallArg {
    pub value: Operand,
    pub bits: u8,
    pub is_float: bool,
}

/// The instruction set.
#[derive(Clone, Debug)]
pub enum IrOp {
    // ---- values ----
    ConstInt { dst: TempVar, value: i64 },
    ConstFloat { dst: TempVar, value: f64 },
    Copy { dst: TempVar, src: Operand },

    // ---- locals, globals, memory ----
    LoadLocal { dst: TempVar, local: LocalId },
    StoreLocal { local: LocalId, src: Operand },
    AddrOfLocal { dst: TempVar, local: LocalId },
    AddrOfGlobal { dst: TempVar, symbol: StringHandle },
    LoadGlobal { dst: TempVar, symbol: StringHandle },
    StoreGlobal { symbol: StringHandle, src: Operand },
    /// Load `dst` (its registered width) from `[addr + offset]`.
    LoadMem { dst: TempVar, addr: TempVar, offset: i32 },
    /// Store `src` of width `bits` to `[addr + offset]`.
    StoreMem { addr: TempVar, offset: i32, src: Operand, bits: u8 },
    /// Address of a pooled string literal in `.rodata`.
    AddrOfString { dst: TempVar, text: StringHandle },

    // ---- arithmetic ----
    Binary { op: IrBinOp, dst: TempVar, lhs: Operand, rhs: Operand },
    Unary { op: IrUnOp, dst: TempVar, src: Operand },
    Cmp { op: IrCmpOp, dst: TempVar, lhs: Operand, rhs: Operand },
    Cast { kind: CastKind, dst: TempVar, src: Operand },

    // ---- control flow ----
    Label(LabelId),
    Jump(LabelId),
    Branch { cond: Operand, if_true: LabelId, if_false: LabelId },
    /// Dense switch through a `.rodata` table of code addresses.
    JumpTable {
        index: Operand,
        low: i64,
        targets: Vec<LabelId>,
        default: LabelId,
        table_symbol: StringHandle,
    },

    // ---- calls ----
    Call {
        callee: Callee,
        args: Vec<CallArg>,
        dst: Option<TempVar>,
        /// Hidden return pointer for large struct returns.
        sret: Option<TempVar>,
        /// True when the return value is in XMM0.
        ret_float: bool,
    },
    Ret { value: Option<Operand> },

    // ---- virtual dispatch ----
    /// `dst = (*object)[slot]`: load the vptr from `[object]`, then the
    /// function pointer at `slot * 8`.
    LoadVtableSlot { dst: TempVar, object: TempVar, slot: u32 },

    // ---- exception handling ----
    TryBegin { region: u32 },
    TryEnd { region: u32, cont: LabelId },
    /// Start of handler `handler` of `region`; `exc` receives the adjusted
    /// exception object pointer from `__cxa_begin_catch`.
    CatchBegin { region: u32, handler: u32, exc: TempVar, catch_ty: Option<TypeIndex> },
    CatchEnd { cont: LabelId },
    Unreachable,
}

/// One catch handler of a try region.
#[derive(Clone, Debug)]
pub struct HandlerInfo {
    /// `None` is `catch (...)`.
    pub catch_ty: Option<TypeIndex>,
}

/// One try region with its handler list in source order (catch-all last).
#[derive(Clone, Debug)]
pub struct TryRegion {
    pub region: u32,
    pub handlers: Vec<HandlerInfo>,
}

/// One local variable's frame slot; offset filled by the frame pre-pass.
#[derive(Clone, Copy, Debug)]
pub struct LocalSlot {
    pub size_bits: u32,
    pub align_bits: u32,
    /// Negative RBP-relative offset.
    pub offset: i32,
}

/// Everything the code generator needs for one function.
#[derive(Debug)]
pub struct FunctionIr {
    /// Unqualified source name.
    pub name: StringHandle,
    /// Symbol name after mangling.
    pub mangled: String,
    /// Function type.
    pub signature: TypeIndex,
    pub conv: CallConv,
    /// Parameter shapes in declaration order (hidden `this` first for
    /// methods).
    pub params: Vec<TempInfo>,
    /// Frame slot of each parameter; the prologue spills incoming argument
    /// registers here.
    pub param_locals: Vec<LocalId>,
    /// Types thrown by this function; drives EH metadata emission.
    pub thrown_types: Vec<TypeIndex>,
    pub ir: Vec<IrOp>,
    /// Registered shape of every temporary; the producing instruction of a
    /// temp must have registered here (sized-load invariant).
    pub temps: IndexVec<TempVar, TempInfo>,
    pub locals: IndexVec<LocalId, LocalSlot>,
    /// Number of labels allocated.
    pub label_count: u32,
    /// Total frame size in bytes, 16-aligned; filled by the frame pre-pass.
    pub frame_size: u32,
    /// Spill slot (negative RBP offset) per temporary; frame pre-pass.
    pub temp_slots: FxHashMap<TempVar, i32>,
    pub try_regions: Vec<TryRegion>,
    /// True for internal-linkage symbols.
    pub is_internal: bool,
    /// Return shape, `None` for void.
    pub ret: Option<TempInfo>,
}

impl FunctionIr {
    /// Allocate a fresh temporary, registering its shape.
    pub fn alloc_temp(&mut self, bits: u8, signed: bool, is_float: bool) -> TempVar {
        self.temps.push(TempInfo { bits, signed, is_float })
    }

    /// Allocate a fresh label.
    pub fn alloc_label(&mut self) -> LabelId {
        let label = LabelId(self.label_count);
        self.label_count += 1;
        label
    }

    /// Append an instruction.
    #[inline]
    pub fn emit(&mut self, op: IrOp) {
        self.ir.push(op);
    }

    /// Shape of a temp.
    #[inline]
    pub fn temp_info(&self, t: TempVar) -> TempInfo {
        self.temps[t]
    }

    /// Shape of an operand (immediates default to 64-bit signed).
    pub fn operand_info(&self, op: Operand) -> TempInfo {
        match op {
            Operand::Temp(t) => self.temps[t],
            Operand::ImmInt(_) => TempInfo { bits: 64, signed: true, is_float: false },
            Operand::ImmFloat(_) => TempInfo { bits: 64, signed: true, is_float: true },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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
    fn test_alloc_temp_registers_shape() {
        let mut f = empty_fn();
        let t = f.alloc_temp(32, true, false);
        assert_eq!(f.temp_info(t).bits, 32);
        assert!(f.temp_info(t).signed);
        let u = f.alloc_temp(8, false, false);
        assert_ne!(t, u);
        assert_eq!(f.temp_info(u).bits, 8);
    }

    #[test]
    fn test_labels_are_sequential() {
        let mut f = empty_fn();
        assert_eq!(f.alloc_label(), LabelId(0));
        assert_eq!(f.alloc_label(), LabelId(1));
        assert_eq!(f.label_count, 2);
    }
}
