//! Domain model for the manuscript hierarchy.
//!
//! # Responsibility
//! - Define canonical data structures used by planner, client and service.
//!
//! # Invariants
//! - Every document node is identified by a stable `NodeId`.
//! - Nodes form a forest per project; only container kinds hold children.

pub mod document;
pub mod project;
