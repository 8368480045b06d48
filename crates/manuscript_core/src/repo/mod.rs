//! Repository layer abstractions and persistence implementations.
//!
//! # Responsibility
//! - Define the cache-store contract the services depend on.
//! - Isolate SQLite query details from service orchestration.
//!
//! # Invariants
//! - Repository APIs return semantic errors (`NodeNotFound`,
//!   `ProjectNotFound`) in addition to DB transport errors.

pub mod cache_store;
