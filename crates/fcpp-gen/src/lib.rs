//! fcpp-gen - x86-64 machine-code emission and object building.
//!
//! Walks each function's IR and produces raw instruction bytes with
//! relocations, register allocation with an explicit flush discipline,
//! prologue/epilogue with a CFI event log, and the exception-handling
//! metadata for both targets (`.eh_frame` + `.gcc_except_table` on Linux,
//! `.pdata`/`.xdata`/FuncInfo on Windows). The physical COFF/ELF container
//! is delegated to the `object` crate behind [`obj::ObjectModule`].

pub mod abi;
pub mod cfi;
pub mod eh;
pub mod emit;
pub mod encode;
pub mod obj;
pub mod regalloc;

pub use emit::emit_module;
pub use obj::{ObjectModule, RelocKind, SectionId, SectionKind, SymbolBinding, SymbolId};

use thiserror::Error;

/// Code generation failure. Unresolved symbols at this stage are front-end
/// bugs; container errors come from the object writer.
#[derive(Debug, Error)]
pub enum CodegenError {
    #[error("unresolved symbol '{0}' at code generation time")]
    UnresolvedSymbol(String),
    #[error("internal code generation error: {0}")]
    Internal(String),
    #[error("object writing failed: {0}")]
    Object(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
