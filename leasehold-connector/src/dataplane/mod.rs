//! Data-plane flows.
//!
//! A flow is the data-plane half of a started transfer: it asks the
//! [`DataTransferService`](crate::collaborator::DataTransferService) to move
//! the bytes and polls it until the transfer finishes.

mod commands;
mod processors;

pub use commands::{
    register, DataFlowHandler, ResumeDataFlow, SuspendDataFlow, TerminateDataFlow,
    UnparkDataFlow,
};
pub(crate) use processors::processors;
pub use processors::DataFlowCollaborators;

use crate::model::DataAddress;
use leasehold_core::Payload;
use serde::{Deserialize, Serialize};

leasehold_core::entity_states! {
    pub enum DataFlowState {
        Received = 100,
        Started = 200,
        Suspended = 300,
        Completed = 400 => terminal,
        Terminated = 500 => terminal,
        Failed = 600 => terminal,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataFlow {
    /// Control-plane transfer process this flow serves.
    pub process_id: String,
    pub source: DataAddress,
    pub destination: DataAddress,
}

impl Payload for DataFlow {
    type State = DataFlowState;
    const ENTITY_TYPE: &'static str = "data_flow";
    const INITIAL_STATE: DataFlowState = DataFlowState::Received;
}

impl DataFlow {
    pub fn new(
        process_id: impl Into<String>,
        source: DataAddress,
        destination: DataAddress,
    ) -> Self {
        Self {
            process_id: process_id.into(),
            source,
            destination,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use leasehold_core::EntityState;

    #[test]
    fn test_state_codes() {
        assert_eq!(DataFlowState::Received.code(), 100);
        assert_eq!(DataFlowState::from_code(600), Some(DataFlowState::Failed));
        assert!(!DataFlowState::Suspended.is_terminal());
        assert!(DataFlowState::Completed.is_terminal());
        assert_eq!(DataFlow::INITIAL_STATE, DataFlowState::Received);
    }
}
