//! # leasehold-storage
//!
//! Entity store contract for leasehold.
//!
//! This crate provides:
//! - The `EntityStore` trait every backend implements
//! - Query specifications for read-only API surfaces
//! - An in-memory backend
//! - A backend-agnostic conformance suite

pub mod conformance;
pub mod error;
pub mod memory;
pub mod query;
pub mod store;

pub use error::{ConflictKind, StoreError};
pub use memory::{InMemoryEntityStore, StoreOptions};
pub use query::{QuerySpec, SortField, SortOrder};
pub use store::EntityStore;
