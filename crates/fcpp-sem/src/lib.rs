//! fcpp-sem - Type system, symbol tables and template machinery.
//!
//! This crate owns the three registries that live for one translation unit:
//!
//! - the [`TypeRegistry`]: every distinct type has exactly one dense
//!   [`TypeIndex`]; struct/enum metadata (members, bases, vtables, layout)
//!   hangs off it;
//! - the [`ScopeStack`]: lexical scopes mapping interned names to
//!   declarations, with overload sets for functions;
//! - the [`TemplateRegistry`]: template patterns keyed by *unqualified* name,
//!   their specializations, and the memoized instantiation cache.
//!
//! The registries are plain owned values created fresh per TU and passed by
//! reference through the pipeline. The parser writes them; IR lowering and
//! code generation only read.

pub mod consteval;
pub mod record;
pub mod scope;
pub mod template;
pub mod types;

pub use consteval::{ConstBinOp, ConstEvalError, ConstUnOp, ConstValue};
pub use record::{
    Access, BaseClass, EnumInfo, Member, MemberFunction, StaticMember, StructInfo, VTable,
    VtableSlot, Virtuality,
};
pub use scope::{Declaration, FunctionDecl, OverloadSet, Scope, ScopeKind, ScopeStack};
pub use template::{
    unqualified_name, InstantiatedEntity, InstantiationError, Specialization, TemplateArg,
    TemplateKind, TemplateParam, TemplateParamKind, TemplatePattern, TemplateRegistry, TokenRange,
    TypePattern,
};
pub use types::{EnumId, RefKind, StructId, TypeIndex, TypeInfo, TypeKind, TypeRegistry};
