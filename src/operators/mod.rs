//! Internal code for stateful operators.
//!
//! Stateless steps are plain closures composed in
//! [`crate::dataflow::Stream`]; anything that keeps state per key
//! lives here and goes through the recovery store.

pub(crate) mod stateful_map;
