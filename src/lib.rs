//! A graph-structured stack (GSS) for generalized LR parsing.
//!
//! During a generalized LR parse, ambiguity and speculative shifts require
//! many simultaneous parse states that share most of their history. The
//! [`Stack`] represents them as a directed acyclic graph of parse-state
//! nodes whose links carry syntax trees; each distinct leaf of the graph is
//! a *version*, addressed by a dense integer index. Versions can be pushed
//! to independently, split by speculative actions, merged when their
//! histories reconverge, and popped to produce one tree slice per distinct
//! path through the graph.
//!
//! The trees themselves are external: anything implementing [`Tree`] can be
//! stored on the stack, which only reads a tree's extent and `extra` flag
//! and participates in its reference counting through `Clone` and `Drop`.

pub mod error_costs;
pub mod length;
pub mod point;
pub mod stack;
pub mod tree;

/// Identifier of a parse state. State `0` is the initial state;
/// [`error_costs::ERROR_STATE`] marks error recovery.
pub type StateId = u16;

pub use length::Length;
pub use point::Point;
pub use stack::{
    PopResult, PopStatus, Stack, StackAction, StackSlice, StackSummary, StackSummaryEntry,
    StackVersion, MAX_LINK_COUNT,
};
pub use tree::Tree;
