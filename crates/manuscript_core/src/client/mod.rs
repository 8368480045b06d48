//! Client-side tree state.
//!
//! # Responsibility
//! - Hold the local node list and its explicit view state.
//! - Apply mutations optimistically and reconcile them with the server.
//!
//! # Invariants
//! - The client never leaves a partially applied plan visible.

pub mod optimistic;
pub mod remote;
pub mod view_state;
