//! # leasehold-connector
//!
//! Connector state machines built on the leasehold engine.
//!
//! This crate provides:
//! - Contract negotiation, transfer process and data-flow entities
//! - Their processors and out-of-band commands
//! - Collaborator traits for the services the machines call
//! - `ConnectorRuntime`, which wires all of it together

pub mod collaborator;
mod command;
pub mod dataplane;
pub mod error;
pub mod model;
pub mod negotiation;
pub mod runtime;
pub(crate) mod step;
pub mod transfer;

#[cfg(test)]
mod testing;

pub use collaborator::{
    DataTransferService, PendingGuard, ProtocolMessage, Provisioner, RemoteMessageDispatcher,
    StatusChecker, TransferStatus,
};
pub use dataplane::{DataFlow, DataFlowState};
pub use error::{CollaboratorError, ConnectorError};
pub use model::{ContractAgreement, ContractOffer, CounterParty, DataAddress, Role};
pub use negotiation::{ContractNegotiation, NegotiationState};
pub use runtime::{Collaborators, ConnectorRuntime, ConnectorRuntimeBuilder, Stores};
pub use transfer::{TransferProcess, TransferState};
