use super::{TransferProcess, TransferState};
use crate::collaborator::{
    PendingGuard, ProtocolMessage, Provisioner, RemoteMessageDispatcher, StatusChecker,
    DEFAULT_TERMINATION_REASON,
};
use crate::error::with_timeout;
use crate::model::Role;
use crate::step::Steps;
use leasehold_core::Entity;
use leasehold_runtime::{transition, Processor, TransitionFn};
use std::sync::Arc;

type Transfer = Entity<TransferProcess>;

/// Reason sent with a suspension the local side asked for.
const SUSPENSION_REASON: &str = "suspended";

/// What the transfer processors call out to.
#[derive(Clone)]
pub struct TransferCollaborators {
    pub dispatcher: Arc<dyn RemoteMessageDispatcher>,
    pub provisioner: Arc<dyn Provisioner>,
    pub status_checker: Arc<dyn StatusChecker>,
    pub pending: Arc<dyn PendingGuard<TransferProcess>>,
}

/// Builds the transfer processors, one per actionable state.
pub(crate) fn processors(
    steps: &Steps<TransferProcess>,
    collaborators: &TransferCollaborators,
) -> Vec<Processor<TransferProcess>> {
    use TransferState::*;

    let park = |name: &str, state| {
        steps.parking(steps.processor(name, state), collaborators.pending.clone())
    };
    let to = |next| {
        let steps = steps.clone();
        transition(move |e: Transfer| {
            let steps = steps.clone();
            async move { steps.advance(e, next).await }
        })
    };

    vec![
        park("transfer-initial", Initial).process(to(Provisioning)).build(),
        park("transfer-provisioning", Provisioning)
            .process(provisioning(steps, collaborators))
            .build(),
        park("transfer-provisioned", Provisioned)
            .guard(
                "provider-starts",
                |e: &Transfer| e.payload.role == Role::Provider,
                to(Starting),
            )
            .process(to(Requesting))
            .build(),
        park("transfer-requesting", Requesting)
            .process(sender(steps, collaborators, Requested, |e| {
                ProtocolMessage::TransferRequest {
                    process_id: e.id().to_string(),
                    contract_id: e.payload.contract_id.clone(),
                    asset_id: e.payload.asset_id.clone(),
                    destination: e.payload.data_destination.clone(),
                }
            }))
            .build(),
        park("transfer-starting", Starting)
            .process(sender(steps, collaborators, Started, |e| {
                ProtocolMessage::TransferStart {
                    process_id: e.id().to_string(),
                    source: e.payload.resources.iter().find_map(|r| r.address.clone()),
                }
            }))
            .build(),
        park("transfer-started", Started)
            .process(started(steps, collaborators))
            .build(),
        park("transfer-suspending", Suspending)
            .process(sender(steps, collaborators, Suspended, |e| {
                ProtocolMessage::TransferSuspension {
                    process_id: e.id().to_string(),
                    reason: SUSPENSION_REASON.to_string(),
                }
            }))
            .build(),
        park("transfer-completing", Completing)
            .process(sender(steps, collaborators, Completed, |e| {
                ProtocolMessage::TransferCompletion {
                    process_id: e.id().to_string(),
                }
            }))
            .build(),
        // Teardown never parks, so resources are always released.
        steps
            .processor("transfer-terminating", Terminating)
            .process(terminating(steps, collaborators))
            .build(),
        steps
            .processor("transfer-deprovisioning", Deprovisioning)
            .process(deprovisioning(steps, collaborators))
            .build(),
    ]
}

/// Sends `message(entity)` and moves to `next` once it is delivered.
fn sender(
    steps: &Steps<TransferProcess>,
    collaborators: &TransferCollaborators,
    next: TransferState,
    message: fn(&Transfer) -> ProtocolMessage,
) -> TransitionFn<TransferProcess> {
    let steps = steps.clone();
    let dispatcher = collaborators.dispatcher.clone();
    transition(move |e: Transfer| {
        let steps = steps.clone();
        let dispatcher = dispatcher.clone();
        async move {
            let msg = message(&e);
            let to = e.payload.counter_party.clone();
            steps
                .attempt(e, dispatcher.dispatch(&to, msg), |e, (), now| {
                    e.transition_to(next, now)
                })
                .await
        }
    })
}

fn provisioning(
    steps: &Steps<TransferProcess>,
    collaborators: &TransferCollaborators,
) -> TransitionFn<TransferProcess> {
    let steps = steps.clone();
    let provisioner = collaborators.provisioner.clone();
    transition(move |e: Transfer| {
        let steps = steps.clone();
        let provisioner = provisioner.clone();
        async move {
            let id = e.id().to_string();
            let destination = e.payload.data_destination.clone();
            steps
                .attempt(
                    e,
                    provisioner.provision(&id, &destination),
                    |e, resources, now| {
                        e.payload.resources = resources;
                        e.transition_to(TransferState::Provisioned, now);
                    },
                )
                .await
        }
    })
}

/// Polls for completion; an unfinished transfer goes to the back of the queue.
fn started(
    steps: &Steps<TransferProcess>,
    collaborators: &TransferCollaborators,
) -> TransitionFn<TransferProcess> {
    let steps = steps.clone();
    let checker = collaborators.status_checker.clone();
    transition(move |e: Transfer| {
        let steps = steps.clone();
        let checker = checker.clone();
        async move {
            let check = checker.is_complete(e.id(), &e.payload.resources);
            match with_timeout(steps.timeout(), check).await {
                Ok(true) => steps.advance(e, TransferState::Completing).await,
                Ok(false) => steps.requeue(e).await,
                Err(err) => steps.fail(e, err).await,
            }
        }
    })
}

/// Tells the counter-party why the transfer ends; keeps the reason.
fn terminating(
    steps: &Steps<TransferProcess>,
    collaborators: &TransferCollaborators,
) -> TransitionFn<TransferProcess> {
    let steps = steps.clone();
    let dispatcher = collaborators.dispatcher.clone();
    transition(move |e: Transfer| {
        let steps = steps.clone();
        let dispatcher = dispatcher.clone();
        async move {
            let to = e.payload.counter_party.clone();
            let msg = ProtocolMessage::TransferTermination {
                process_id: e.id().to_string(),
                reason: e
                    .error_detail
                    .clone()
                    .unwrap_or_else(|| DEFAULT_TERMINATION_REASON.to_string()),
            };
            steps
                .attempt(e, dispatcher.dispatch(&to, msg), |e, (), now| {
                    let reason = e.error_detail.take();
                    e.transition_to(TransferState::Terminated, now);
                    e.error_detail = reason;
                })
                .await
        }
    })
}

fn deprovisioning(
    steps: &Steps<TransferProcess>,
    collaborators: &TransferCollaborators,
) -> TransitionFn<TransferProcess> {
    let steps = steps.clone();
    let provisioner = collaborators.provisioner.clone();
    transition(move |e: Transfer| {
        let steps = steps.clone();
        let provisioner = provisioner.clone();
        async move {
            let id = e.id().to_string();
            let resources = e.payload.resources.clone();
            steps
                .attempt(e, provisioner.deprovision(&id, &resources), |e, (), now| {
                    e.payload.resources.clear();
                    e.transition_to(TransferState::Deprovisioned, now);
                })
                .await
        }
    })
}
