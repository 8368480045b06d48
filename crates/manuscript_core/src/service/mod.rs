//! Server-side use-case services.
//!
//! # Responsibility
//! - Orchestrate cache-store and external-store calls into hierarchy
//!   operations.
//! - Keep client bindings decoupled from storage details.

pub mod node_locks;
pub mod reconcile_service;
pub mod sync_driver;
