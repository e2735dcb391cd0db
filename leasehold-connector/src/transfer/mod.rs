//! Transfer process.
//!
//! Runs after a negotiation produced an agreement. The consumer provisions
//! its destination and requests the transfer; the provider provisions its
//! side and starts it. Completed and terminated transfers stay around until
//! they are deprovisioned.

mod commands;
mod processors;

pub use commands::{
    register, DeprovisionTransfer, ResumeTransfer, SuspendTransfer, TerminateTransfer,
    TransferHandler, TransferNotification, TransferUpdate, UnparkTransfer,
};
pub(crate) use processors::processors;
pub use processors::TransferCollaborators;

use crate::model::{CounterParty, DataAddress, ProvisionedResource, Role};
use leasehold_core::Payload;
use serde::{Deserialize, Serialize};

leasehold_core::entity_states! {
    /// Transfer process states with their persisted codes.
    pub enum TransferState {
        Initial = 100,
        Provisioning = 200,
        Provisioned = 300,
        Requesting = 400,
        Requested = 500,
        Starting = 550,
        Started = 600,
        Suspending = 650,
        Suspended = 700,
        Completing = 750,
        Completed = 800,
        Terminating = 825,
        Terminated = 850,
        Deprovisioning = 900,
        Deprovisioned = 1100 => terminal,
        Error = -1 => terminal,
    }
}

/// Domain fields of a transfer process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferProcess {
    pub role: Role,
    pub counter_party: CounterParty,
    /// The counter-party's id for the same transfer, once known.
    #[serde(default)]
    pub correlation_id: Option<String>,
    pub contract_id: String,
    pub asset_id: String,
    pub data_destination: DataAddress,
    #[serde(default)]
    pub resources: Vec<ProvisionedResource>,
}

impl Payload for TransferProcess {
    type State = TransferState;
    const ENTITY_TYPE: &'static str = "transfer_process";
    const INITIAL_STATE: TransferState = TransferState::Initial;
}

impl TransferProcess {
    /// A transfer this connector requests as consumer.
    pub fn consumer(
        counter_party: CounterParty,
        contract_id: impl Into<String>,
        asset_id: impl Into<String>,
        data_destination: DataAddress,
    ) -> Self {
        Self {
            role: Role::Consumer,
            counter_party,
            correlation_id: None,
            contract_id: contract_id.into(),
            asset_id: asset_id.into(),
            data_destination,
            resources: Vec::new(),
        }
    }

    /// A transfer requested by a counter-party.
    pub fn provider(
        counter_party: CounterParty,
        correlation_id: impl Into<String>,
        contract_id: impl Into<String>,
        asset_id: impl Into<String>,
        data_destination: DataAddress,
    ) -> Self {
        Self {
            role: Role::Provider,
            correlation_id: Some(correlation_id.into()),
            ..Self::consumer(counter_party, contract_id, asset_id, data_destination)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use leasehold_core::EntityState;

    #[test]
    fn test_state_codes() {
        assert_eq!(TransferState::Starting.code(), 550);
        assert_eq!(TransferState::Terminating.code(), 825);
        assert_eq!(TransferState::from_code(1100), Some(TransferState::Deprovisioned));
        assert!(!TransferState::Completed.is_terminal());
        assert!(TransferState::Error.is_terminal());
        assert_eq!(TransferState::all().len(), 16);
    }

    #[test]
    fn test_provider_constructor() {
        let t = TransferProcess::provider(
            CounterParty::default(),
            "their-tp",
            "agr-1",
            "asset-1",
            DataAddress::new("HttpData"),
        );
        assert_eq!(t.role, Role::Provider);
        assert_eq!(t.correlation_id.as_deref(), Some("their-tp"));
        assert_eq!(t.contract_id, "agr-1");
    }
}
