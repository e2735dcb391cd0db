//! External collaborators called from transition functions.
//!
//! The engine only knows these traits. Real deployments plug in protocol
//! clients, cloud provisioners and data-plane services; the implementations
//! here log and succeed so a connector can run standalone.

use crate::error::CollaboratorError;
use crate::model::{
    ContractAgreement, ContractOffer, CounterParty, DataAddress, ProvisionedResource,
};
use async_trait::async_trait;
use leasehold_core::{Entity, Payload};
use serde::Serialize;

/// Reason carried by a termination when none was recorded.
pub const DEFAULT_TERMINATION_REASON: &str = "terminated";

/// Negotiation events sent as plain notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NegotiationEventType {
    Accepted,
    Finalized,
}

/// Messages one connector sends another.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProtocolMessage {
    ContractRequest {
        process_id: String,
        offer: ContractOffer,
    },
    ContractOffer {
        process_id: String,
        offer: ContractOffer,
    },
    ContractAgreement {
        process_id: String,
        agreement: ContractAgreement,
    },
    AgreementVerification {
        process_id: String,
    },
    NegotiationEvent {
        process_id: String,
        event: NegotiationEventType,
    },
    NegotiationTermination {
        process_id: String,
        reason: String,
    },
    TransferRequest {
        process_id: String,
        contract_id: String,
        asset_id: String,
        destination: DataAddress,
    },
    TransferStart {
        process_id: String,
        source: Option<DataAddress>,
    },
    TransferSuspension {
        process_id: String,
        reason: String,
    },
    TransferCompletion {
        process_id: String,
    },
    TransferTermination {
        process_id: String,
        reason: String,
    },
}

impl ProtocolMessage {
    /// Message type name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            ProtocolMessage::ContractRequest { .. } => "contract_request",
            ProtocolMessage::ContractOffer { .. } => "contract_offer",
            ProtocolMessage::ContractAgreement { .. } => "contract_agreement",
            ProtocolMessage::AgreementVerification { .. } => "agreement_verification",
            ProtocolMessage::NegotiationEvent { .. } => "negotiation_event",
            ProtocolMessage::NegotiationTermination { .. } => "negotiation_termination",
            ProtocolMessage::TransferRequest { .. } => "transfer_request",
            ProtocolMessage::TransferStart { .. } => "transfer_start",
            ProtocolMessage::TransferSuspension { .. } => "transfer_suspension",
            ProtocolMessage::TransferCompletion { .. } => "transfer_completion",
            ProtocolMessage::TransferTermination { .. } => "transfer_termination",
        }
    }

    /// The sender's process id the message refers to.
    pub fn process_id(&self) -> &str {
        match self {
            ProtocolMessage::ContractRequest { process_id, .. }
            | ProtocolMessage::ContractOffer { process_id, .. }
            | ProtocolMessage::ContractAgreement { process_id, .. }
            | ProtocolMessage::AgreementVerification { process_id }
            | ProtocolMessage::NegotiationEvent { process_id, .. }
            | ProtocolMessage::NegotiationTermination { process_id, .. }
            | ProtocolMessage::TransferRequest { process_id, .. }
            | ProtocolMessage::TransferStart { process_id, .. }
            | ProtocolMessage::TransferSuspension { process_id, .. }
            | ProtocolMessage::TransferCompletion { process_id }
            | ProtocolMessage::TransferTermination { process_id, .. } => process_id,
        }
    }
}

/// Sends protocol messages to counter-party connectors.
#[async_trait]
pub trait RemoteMessageDispatcher: Send + Sync {
    async fn dispatch(
        &self,
        to: &CounterParty,
        message: ProtocolMessage,
    ) -> Result<(), CollaboratorError>;
}

/// Creates and removes the resources a transfer needs.
#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn provision(
        &self,
        process_id: &str,
        destination: &DataAddress,
    ) -> Result<Vec<ProvisionedResource>, CollaboratorError>;

    async fn deprovision(
        &self,
        process_id: &str,
        resources: &[ProvisionedResource],
    ) -> Result<(), CollaboratorError>;
}

/// Reports whether a running transfer has finished.
#[async_trait]
pub trait StatusChecker: Send + Sync {
    async fn is_complete(
        &self,
        process_id: &str,
        resources: &[ProvisionedResource],
    ) -> Result<bool, CollaboratorError>;
}

/// Progress of a data-plane transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferStatus {
    Running,
    Completed,
    Failed(String),
}

/// Moves the bytes of a data flow.
#[async_trait]
pub trait DataTransferService: Send + Sync {
    async fn start(
        &self,
        flow_id: &str,
        source: &DataAddress,
        destination: &DataAddress,
    ) -> Result<(), CollaboratorError>;

    async fn status(&self, flow_id: &str) -> Result<TransferStatus, CollaboratorError>;

    /// Stops a running transfer. Stopping an unknown flow succeeds.
    async fn terminate(&self, flow_id: &str) -> Result<(), CollaboratorError>;
}

/// Parks entities that need manual action.
pub trait PendingGuard<P: Payload>: Send + Sync {
    fn is_pending(&self, entity: &Entity<P>) -> bool;
}

/// Dispatcher that only logs.
#[derive(Debug, Default)]
pub struct LoggingDispatcher;

#[async_trait]
impl RemoteMessageDispatcher for LoggingDispatcher {
    async fn dispatch(
        &self,
        to: &CounterParty,
        message: ProtocolMessage,
    ) -> Result<(), CollaboratorError> {
        tracing::info!(
            counter_party = %to.id,
            address = %to.address,
            message = message.name(),
            process_id = message.process_id(),
            "dispatching protocol message"
        );
        Ok(())
    }
}

/// Provisioner for transfers that need no resources.
#[derive(Debug, Default)]
pub struct NoopProvisioner;

#[async_trait]
impl Provisioner for NoopProvisioner {
    async fn provision(
        &self,
        _process_id: &str,
        _destination: &DataAddress,
    ) -> Result<Vec<ProvisionedResource>, CollaboratorError> {
        Ok(Vec::new())
    }

    async fn deprovision(
        &self,
        _process_id: &str,
        _resources: &[ProvisionedResource],
    ) -> Result<(), CollaboratorError> {
        Ok(())
    }
}

/// Never reports completion; transfers finish through counter-party
/// notifications instead.
#[derive(Debug, Default)]
pub struct NotificationStatusChecker;

#[async_trait]
impl StatusChecker for NotificationStatusChecker {
    async fn is_complete(
        &self,
        _process_id: &str,
        _resources: &[ProvisionedResource],
    ) -> Result<bool, CollaboratorError> {
        Ok(false)
    }
}

/// Data transfer service that completes every flow immediately.
#[derive(Debug, Default)]
pub struct NoopDataTransferService;

#[async_trait]
impl DataTransferService for NoopDataTransferService {
    async fn start(
        &self,
        flow_id: &str,
        source: &DataAddress,
        destination: &DataAddress,
    ) -> Result<(), CollaboratorError> {
        tracing::debug!(
            flow_id,
            source = %source.kind,
            destination = %destination.kind,
            "transfer started"
        );
        Ok(())
    }

    async fn status(&self, _flow_id: &str) -> Result<TransferStatus, CollaboratorError> {
        Ok(TransferStatus::Completed)
    }

    async fn terminate(&self, _flow_id: &str) -> Result<(), CollaboratorError> {
        Ok(())
    }
}

/// Guard that never parks anything.
#[derive(Debug, Default)]
pub struct NeverPending;

impl<P: Payload> PendingGuard<P> for NeverPending {
    fn is_pending(&self, _entity: &Entity<P>) -> bool {
        false
    }
}
