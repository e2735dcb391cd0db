//! Contract negotiation.
//!
//! A consumer requests an offer, the provider answers with an agreement and
//! both sides confirm it. Each side runs its own entity; the "-ING" states
//! are driven by processors that send the matching protocol message, the
//! "-ED" states wait for the counter-party or for a local command.

mod commands;
mod processors;

pub use commands::{
    register, AgreeNegotiation, ApproveNegotiation, CancelNegotiation, DeclineNegotiation,
    NegotiationHandler, NegotiationNotification, NegotiationUpdate, TerminateNegotiation,
    UnparkNegotiation,
};
pub(crate) use processors::processors;
pub use processors::NegotiationCollaborators;

use crate::model::{ContractAgreement, ContractOffer, CounterParty, Role};
use leasehold_core::Payload;
use serde::{Deserialize, Serialize};

leasehold_core::entity_states! {
    /// Negotiation states with their persisted codes.
    pub enum NegotiationState {
        Initial = 50,
        Requesting = 100,
        Requested = 200,
        Offering = 300,
        Offered = 400,
        Approving = 500,
        Approved = 600,
        Agreeing = 800,
        Agreed = 850,
        Verifying = 1050,
        Verified = 1100,
        Finalizing = 1150,
        Finalized = 1200 => terminal,
        Terminating = 1300,
        Terminated = 1400 => terminal,
        Error = -1 => terminal,
    }
}

/// Domain fields of a contract negotiation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractNegotiation {
    pub role: Role,
    pub counter_party: CounterParty,
    /// The counter-party's id for the same negotiation, once known.
    #[serde(default)]
    pub correlation_id: Option<String>,
    pub offer: ContractOffer,
    #[serde(default)]
    pub agreement: Option<ContractAgreement>,
}

impl Payload for ContractNegotiation {
    type State = NegotiationState;
    const ENTITY_TYPE: &'static str = "contract_negotiation";
    const INITIAL_STATE: NegotiationState = NegotiationState::Initial;
}

impl ContractNegotiation {
    /// A negotiation this connector starts as consumer.
    pub fn consumer(counter_party: CounterParty, offer: ContractOffer) -> Self {
        Self {
            role: Role::Consumer,
            counter_party,
            correlation_id: None,
            offer,
            agreement: None,
        }
    }

    /// A negotiation opened by a counter-party's request.
    pub fn provider(
        counter_party: CounterParty,
        correlation_id: impl Into<String>,
        offer: ContractOffer,
    ) -> Self {
        Self {
            role: Role::Provider,
            counter_party,
            correlation_id: Some(correlation_id.into()),
            offer,
            agreement: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use leasehold_core::EntityState;

    #[test]
    fn test_state_codes() {
        assert_eq!(NegotiationState::Initial.code(), 50);
        assert_eq!(NegotiationState::Agreed.code(), 850);
        assert_eq!(NegotiationState::Error.code(), -1);
        assert_eq!(NegotiationState::from_code(1150), Some(NegotiationState::Finalizing));
        assert_eq!(NegotiationState::from_code(700), None);

        let terminal: Vec<_> = NegotiationState::all()
            .iter()
            .filter(|s| s.is_terminal())
            .collect();
        assert_eq!(
            terminal,
            [
                &NegotiationState::Finalized,
                &NegotiationState::Terminated,
                &NegotiationState::Error
            ]
        );
    }

    #[test]
    fn test_payload_json() {
        let n = ContractNegotiation::provider(
            CounterParty::default(),
            "their-1",
            ContractOffer::default(),
        );
        let json = serde_json::to_value(&n).unwrap();
        assert_eq!(json["role"], "provider");
        assert_eq!(json["correlation_id"], "their-1");

        let back: ContractNegotiation = serde_json::from_value(json).unwrap();
        assert_eq!(back, n);
    }
}
