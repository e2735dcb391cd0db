//! # leasehold-core
//!
//! Entity and lease model for leasehold.
//!
//! This crate provides:
//! - The `Entity<P>` record every state machine drives
//! - State enums with stable integer codes (`entity_states!`)
//! - The `Lease` mutual-exclusion envelope
//! - Injectable clocks

pub mod clock;
pub mod entity;
pub mod error;
pub mod lease;

pub use clock::{Clock, ManualClock, SystemClock};
pub use entity::{Entity, EntityBuilder, EntityState, Payload};
pub use error::EntityError;
pub use lease::Lease;

#[doc(hidden)]
pub use serde as __serde;
