use super::{ContractNegotiation, NegotiationState};
use crate::collaborator::{
    NegotiationEventType, PendingGuard, ProtocolMessage, RemoteMessageDispatcher,
    DEFAULT_TERMINATION_REASON,
};
use crate::model::{ContractAgreement, Role};
use crate::step::Steps;
use leasehold_core::Entity;
use leasehold_runtime::{transition, Processor, TransitionFn};
use std::sync::Arc;

type Negotiation = Entity<ContractNegotiation>;

/// What the negotiation processors call out to.
#[derive(Clone)]
pub struct NegotiationCollaborators {
    /// Participant id this connector signs agreements as.
    pub participant_id: String,
    pub dispatcher: Arc<dyn RemoteMessageDispatcher>,
    pub pending: Arc<dyn PendingGuard<ContractNegotiation>>,
}

/// Builds the negotiation processors, one per actionable state.
pub(crate) fn processors(
    steps: &Steps<ContractNegotiation>,
    collaborators: &NegotiationCollaborators,
) -> Vec<Processor<ContractNegotiation>> {
    use NegotiationState::*;

    let park = |name: &str, state| {
        steps.parking(steps.processor(name, state), collaborators.pending.clone())
    };

    let initial = {
        let s = steps.clone();
        let provider = steps.clone();
        park("negotiation-initial", Initial)
            .guard(
                "provider-offers",
                |e: &Negotiation| e.payload.role == Role::Provider,
                transition(move |e: Negotiation| {
                    let s = provider.clone();
                    async move { s.advance(e, Offering).await }
                }),
            )
            .process(transition(move |e: Negotiation| {
                let s = s.clone();
                async move { s.advance(e, Requesting).await }
            }))
            .build()
    };

    let send = |state: NegotiationState, next, message: fn(&Negotiation) -> ProtocolMessage| {
        park(&format!("negotiation-{}", name_of(state)), state)
            .process(sender(steps, collaborators, next, message))
            .build()
    };

    vec![
        initial,
        send(Requesting, Requested, |e| ProtocolMessage::ContractRequest {
            process_id: e.id().to_string(),
            offer: e.payload.offer.clone(),
        }),
        send(Offering, Offered, |e| ProtocolMessage::ContractOffer {
            process_id: e.id().to_string(),
            offer: e.payload.offer.clone(),
        }),
        send(Approving, Approved, |e| ProtocolMessage::NegotiationEvent {
            process_id: e.id().to_string(),
            event: NegotiationEventType::Accepted,
        }),
        park("negotiation-agreeing", Agreeing)
            .process(agreeing(steps, collaborators))
            .build(),
        send(Verifying, Verified, |e| ProtocolMessage::AgreementVerification {
            process_id: e.id().to_string(),
        }),
        send(Finalizing, Finalized, |e| ProtocolMessage::NegotiationEvent {
            process_id: e.id().to_string(),
            event: NegotiationEventType::Finalized,
        }),
        // Termination never parks; a cancelled entity must reach TERMINATED.
        steps
            .processor("negotiation-terminating", Terminating)
            .process(terminating(steps, collaborators))
            .build(),
    ]
}

fn name_of(state: NegotiationState) -> String {
    state.to_string().to_lowercase()
}

/// Sends `message(entity)` and moves to `next` once it is delivered.
fn sender(
    steps: &Steps<ContractNegotiation>,
    collaborators: &NegotiationCollaborators,
    next: NegotiationState,
    message: fn(&Negotiation) -> ProtocolMessage,
) -> TransitionFn<ContractNegotiation> {
    let steps = steps.clone();
    let dispatcher = collaborators.dispatcher.clone();
    transition(move |e: Negotiation| {
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

/// Signs the agreement, sends it, and records it once delivered.
fn agreeing(
    steps: &Steps<ContractNegotiation>,
    collaborators: &NegotiationCollaborators,
) -> TransitionFn<ContractNegotiation> {
    let steps = steps.clone();
    let dispatcher = collaborators.dispatcher.clone();
    let participant = collaborators.participant_id.clone();
    transition(move |e: Negotiation| {
        let steps = steps.clone();
        let dispatcher = dispatcher.clone();
        let agreement = e.payload.agreement.clone().unwrap_or_else(|| ContractAgreement {
            id: uuid::Uuid::new_v4().to_string(),
            asset_id: e.payload.offer.asset_id.clone(),
            consumer_id: e.payload.counter_party.id.clone(),
            provider_id: participant.clone(),
            signed_at: steps.now(),
            policy: e.payload.offer.policy.clone(),
        });
        async move {
            let to = e.payload.counter_party.clone();
            let msg = ProtocolMessage::ContractAgreement {
                process_id: e.id().to_string(),
                agreement: agreement.clone(),
            };
            steps
                .attempt(e, dispatcher.dispatch(&to, msg), move |e, (), now| {
                    e.payload.agreement = Some(agreement);
                    e.transition_to(NegotiationState::Agreed, now);
                })
                .await
        }
    })
}

/// Tells the counter-party why the negotiation ends; keeps the reason.
fn terminating(
    steps: &Steps<ContractNegotiation>,
    collaborators: &NegotiationCollaborators,
) -> TransitionFn<ContractNegotiation> {
    let steps = steps.clone();
    let dispatcher = collaborators.dispatcher.clone();
    transition(move |e: Negotiation| {
        let steps = steps.clone();
        let dispatcher = dispatcher.clone();
        async move {
            let to = e.payload.counter_party.clone();
            let msg = ProtocolMessage::NegotiationTermination {
                process_id: e.id().to_string(),
                reason: e
                    .error_detail
                    .clone()
                    .unwrap_or_else(|| DEFAULT_TERMINATION_REASON.to_string()),
            };
            steps
                .attempt(e, dispatcher.dispatch(&to, msg), |e, (), now| {
                    let reason = e.error_detail.take();
                    e.transition_to(NegotiationState::Terminated, now);
                    e.error_detail = reason;
                })
                .await
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CollaboratorError;
    use crate::model::ContractOffer;
    use crate::negotiation::{CancelNegotiation, NegotiationHandler};
    use crate::testing::{
        clock, counter_party, engine, entity, store, ParkIds, RecordingDispatcher, START,
    };
    use leasehold_runtime::EntityCommandHandler;
    use leasehold_core::ManualClock;
    use leasehold_storage::{EntityStore, InMemoryEntityStore};
    use std::collections::HashSet;
    use std::time::Duration;

    struct Harness {
        clock: Arc<ManualClock>,
        store: Arc<InMemoryEntityStore<ContractNegotiation>>,
        dispatcher: Arc<RecordingDispatcher>,
        park: Arc<ParkIds>,
        processors: Vec<Processor<ContractNegotiation>>,
    }

    impl Harness {
        fn new() -> Self {
            let clock = clock();
            let store = store::<ContractNegotiation>(clock.clone());
            let dispatcher = Arc::new(RecordingDispatcher::default());
            let park = Arc::new(ParkIds::default());
            let steps = Steps::<ContractNegotiation>::new(
                store.clone(),
                clock.clone(),
                &engine(),
                NegotiationState::Error,
            );
            let processors = processors(
                &steps,
                &NegotiationCollaborators {
                    participant_id: "provider-self".into(),
                    dispatcher: dispatcher.clone(),
                    pending: park.clone(),
                },
            );
            Self {
                clock,
                store,
                dispatcher,
                park,
                processors,
            }
        }

        async fn seed(&self, id: &str, payload: ContractNegotiation, state: NegotiationState) {
            let mut e = entity(id, payload, state, START - 100);
            self.store.save(&mut e).await.unwrap();
        }

        async fn tick(&self) -> usize {
            self.clock.advance(1);
            let mut total = 0;
            for p in &self.processors {
                total += p.process().await;
            }
            total
        }

        async fn get(&self, id: &str) -> Entity<ContractNegotiation> {
            self.store.find(id).await.unwrap()
        }
    }

    fn consumer() -> ContractNegotiation {
        ContractNegotiation::consumer(
            counter_party(),
            ContractOffer {
                id: "offer-1".into(),
                asset_id: "asset-1".into(),
                policy: serde_json::json!({"permission": "use"}),
            },
        )
    }

    fn provider() -> ContractNegotiation {
        ContractNegotiation::provider(counter_party(), "their-1", consumer().offer)
    }

    #[tokio::test]
    async fn test_consumer_request_is_sent_in_one_tick() {
        let h = Harness::new();
        h.seed("neg-1", consumer(), NegotiationState::Initial).await;

        assert_eq!(h.tick().await, 2);
        let e = h.get("neg-1").await;
        assert_eq!(e.state, NegotiationState::Requested);
        assert_eq!(h.dispatcher.names(), ["contract_request"]);
        assert_eq!(h.tick().await, 0);
    }

    #[tokio::test]
    async fn test_provider_initial_goes_to_offering() {
        let h = Harness::new();
        h.seed("neg-1", provider(), NegotiationState::Initial).await;

        h.tick().await;
        assert_eq!(h.get("neg-1").await.state, NegotiationState::Offered);
        assert_eq!(h.dispatcher.names(), ["contract_offer"]);
    }

    #[tokio::test]
    async fn test_agreeing_signs_and_records_agreement() {
        let h = Harness::new();
        h.seed("neg-1", provider(), NegotiationState::Agreeing).await;

        h.tick().await;
        let e = h.get("neg-1").await;
        assert_eq!(e.state, NegotiationState::Agreed);
        let agreement = e.payload.agreement.unwrap();
        assert_eq!(agreement.provider_id, "provider-self");
        assert_eq!(agreement.consumer_id, "provider-x");
        assert_eq!(agreement.asset_id, "asset-1");

        match &h.dispatcher.sent()[0] {
            ProtocolMessage::ContractAgreement { agreement: sent, .. } => {
                assert_eq!(sent.id, agreement.id)
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_retry_bound_forces_error() {
        let h = Harness::new();
        h.seed("neg-1", consumer(), NegotiationState::Requesting).await;
        h.dispatcher
            .fail_with(Some(CollaboratorError::transient("connection refused")));

        // max_retries = 2: two retries, the third failure gives up.
        assert_eq!(h.tick().await, 0);
        let e = h.get("neg-1").await;
        assert_eq!((e.state, e.state_count), (NegotiationState::Requesting, 1));
        assert_eq!(h.tick().await, 0);
        assert_eq!(h.get("neg-1").await.state_count, 2);
        assert_eq!(h.tick().await, 1);

        let e = h.get("neg-1").await;
        assert_eq!(e.state, NegotiationState::Error);
        let detail = e.error_detail.unwrap();
        assert!(detail.starts_with("retry limit exceeded after 3 attempts"), "{detail}");
        assert!(detail.contains("connection refused"));
        assert!(h.dispatcher.sent().is_empty());
    }

    #[tokio::test]
    async fn test_fatal_failure_moves_to_error() {
        let h = Harness::new();
        h.seed("neg-1", provider(), NegotiationState::Offering).await;
        h.dispatcher.fail_with(Some(CollaboratorError::fatal("unknown participant")));

        assert_eq!(h.tick().await, 1);
        let e = h.get("neg-1").await;
        assert_eq!(e.state, NegotiationState::Error);
        assert_eq!(e.error_detail.as_deref(), Some("unknown participant"));
    }

    #[tokio::test]
    async fn test_slow_dispatch_times_out_and_retries() {
        let h = Harness::new();
        h.seed("neg-1", consumer(), NegotiationState::Verifying).await;
        h.dispatcher.delay(Duration::from_secs(2));

        assert_eq!(h.tick().await, 0);
        let e = h.get("neg-1").await;
        assert_eq!(e.state, NegotiationState::Verifying);
        assert_eq!(e.state_count, 1);
        assert!(e.error_detail.unwrap().contains("timed out"));
        assert!(h.store.lease_of("neg-1").is_none());
    }

    #[tokio::test]
    async fn test_pending_guard_parks_entity() {
        let h = Harness::new();
        h.seed("neg-1", consumer(), NegotiationState::Requesting).await;
        h.park.park("neg-1");

        assert_eq!(h.tick().await, 1);
        let e = h.get("neg-1").await;
        assert!(e.pending);
        assert_eq!(e.state, NegotiationState::Requesting);

        assert_eq!(h.tick().await, 0);
        assert!(h.dispatcher.sent().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_parked_negotiation_still_terminates() {
        let h = Harness::new();
        h.seed("neg-1", consumer(), NegotiationState::Requesting).await;
        h.park.park("neg-1");
        h.tick().await;
        assert!(h.get("neg-1").await.pending);

        let cancel = EntityCommandHandler::new(
            NegotiationHandler::<CancelNegotiation>::new(h.clock.clone()),
            h.store.clone(),
        );
        cancel
            .execute(&CancelNegotiation { id: "neg-1".into() })
            .await
            .unwrap();

        h.tick().await;
        let e = h.get("neg-1").await;
        assert_eq!(e.state, NegotiationState::Terminated);
        assert!(!e.pending);
        assert_eq!(e.error_detail.as_deref(), Some("Cancelled"));
        assert_eq!(h.dispatcher.names(), ["negotiation_termination"]);
    }

    #[tokio::test]
    async fn test_terminating_sends_reason_and_keeps_it() {
        let h = Harness::new();
        let mut e = entity("neg-1", consumer(), NegotiationState::Requested, START - 100);
        e.transition_with_error(NegotiationState::Terminating, "Cancelled", START);
        h.store.save(&mut e).await.unwrap();

        h.tick().await;
        let e = h.get("neg-1").await;
        assert_eq!(e.state, NegotiationState::Terminated);
        assert_eq!(e.error_detail.as_deref(), Some("Cancelled"));
        assert_eq!(
            h.dispatcher.sent(),
            [ProtocolMessage::NegotiationTermination {
                process_id: "neg-1".into(),
                reason: "Cancelled".into(),
            }]
        );
    }

    #[tokio::test]
    async fn test_offered_batches_are_fair_across_instances() {
        let h = Harness::new();
        for i in 0..10 {
            let id = format!("neg-{i:02}");
            let mut e = entity(&id, consumer(), NegotiationState::Offered, START + i);
            h.store.save(&mut e).await.unwrap();
        }

        let mut seen = Vec::new();
        let mut sizes = Vec::new();
        for round in 0..4 {
            let batch = h
                .store
                .lease_next(NegotiationState::Offered, 3, &format!("node-{round}"))
                .await
                .unwrap();
            sizes.push(batch.len());
            seen.extend(batch.iter().map(|e| e.state_timestamp));
        }

        assert_eq!(sizes, [3, 3, 3, 1]);
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(seen.iter().collect::<HashSet<_>>().len(), 10);
    }
}
