//! Pure hierarchy algorithms shared by client and service.
//!
//! # Responsibility
//! - Index flat node lists into ordered parent/children groupings.
//! - Guard against cycles and plan mutations without touching stores.
//!
//! # Invariants
//! - Nothing in this module performs I/O.

pub mod cycle;
pub mod index;
pub mod planner;
