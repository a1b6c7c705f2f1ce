//! Shared dense ID spaces.
//!
//! These index types are defined here rather than in the crates that
//! allocate them because they cross crate boundaries: the parser allocates
//! [`NodeId`]s, the semantic tables record them in declarations, and the IR
//! lowerer reads them back out.

crate::define_idx! {
    /// Index of an AST node in the translation unit's node arena.
    pub struct NodeId;
}

crate::define_idx! {
    /// Index of a local variable slot within one function.
    pub struct LocalId;
}
