//! fcpp-util - Core Utilities and Foundation Types
//!
//! This crate provides the fundamental types shared by every phase of the
//! FlashCpp compiler:
//!
//! - **String interning** ([`StringTable`], [`StringHandle`]): every
//!   identifier and literal spelling in a translation unit is stored once in
//!   an append-only arena and referred to by a 4-byte handle. Handle equality
//!   is string equality, which is the primary comparison operation in the
//!   parser, the type registry and the template cache.
//! - **Source locations** ([`Span`], [`FileId`], [`SourceMap`]): byte ranges
//!   plus 1-based line/column information for diagnostics.
//! - **Typed indices** ([`Idx`], [`IndexVec`], [`define_idx!`]): newtype
//!   indices that keep the many dense ID spaces of the compiler (AST nodes,
//!   types, IR temporaries, sections, symbols) from being mixed up.
//! - **Diagnostics** ([`diagnostic`]): the error/warning reporting
//!   infrastructure with the `file:line:column: level: message` rendering
//!   contract.
//!
//! All of these are per-translation-unit values owned by the driver and
//! passed down by reference. Nothing in this crate is a process global, so a
//! future multi-TU driver can simply construct one context per unit.

pub mod diagnostic;
pub mod ids;
pub mod index_vec;
pub mod intern;
pub mod span;

pub use ids::{LocalId, NodeId};
pub use index_vec::{Idx, IndexVec};
pub use intern::{InternerStats, StringHandle, StringTable};
pub use span::{FileId, SourceFile, SourceMap, Span};

// Re-export the hash containers used throughout the pipeline so downstream
// crates agree on one hasher.
pub use rustc_hash::{FxHashMap, FxHashSet};
