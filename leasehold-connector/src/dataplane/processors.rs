use super::{DataFlow, DataFlowState};
use crate::collaborator::{DataTransferService, PendingGuard, TransferStatus};
use crate::error::with_timeout;
use crate::step::Steps;
use leasehold_core::Entity;
use leasehold_runtime::{transition, Processor, TransitionFn};
use std::sync::Arc;
use tracing::warn;

type Flow = Entity<DataFlow>;

#[derive(Clone)]
pub struct DataFlowCollaborators {
    pub service: Arc<dyn DataTransferService>,
    pub pending: Arc<dyn PendingGuard<DataFlow>>,
}

/// Builds the data-flow processors for RECEIVED and STARTED.
pub(crate) fn processors(
    steps: &Steps<DataFlow>,
    collaborators: &DataFlowCollaborators,
) -> Vec<Processor<DataFlow>> {
    let park = |name: &str, state| {
        steps.parking(steps.processor(name, state), collaborators.pending.clone())
    };

    vec![
        park("dataflow-received", DataFlowState::Received)
            .process(received(steps, collaborators))
            .build(),
        park("dataflow-started", DataFlowState::Started)
            .process(started(steps, collaborators))
            .build(),
    ]
}

fn received(
    steps: &Steps<DataFlow>,
    collaborators: &DataFlowCollaborators,
) -> TransitionFn<DataFlow> {
    let steps = steps.clone();
    let service = collaborators.service.clone();
    transition(move |e: Flow| {
        let steps = steps.clone();
        let service = service.clone();
        async move {
            let id = e.id().to_string();
            let DataFlow {
                source,
                destination,
                ..
            } = e.payload.clone();
            steps
                .attempt(e, service.start(&id, &source, &destination), |e, (), now| {
                    e.transition_to(DataFlowState::Started, now)
                })
                .await
        }
    })
}

/// Polls the transfer; a running flow goes to the back of the queue.
fn started(
    steps: &Steps<DataFlow>,
    collaborators: &DataFlowCollaborators,
) -> TransitionFn<DataFlow> {
    let steps = steps.clone();
    let service = collaborators.service.clone();
    transition(move |e: Flow| {
        let steps = steps.clone();
        let service = service.clone();
        async move {
            let status = with_timeout(steps.timeout(), service.status(e.id())).await;
            match status {
                Ok(TransferStatus::Running) => steps.requeue(e).await,
                Ok(TransferStatus::Completed) => steps.advance(e, DataFlowState::Completed).await,
                Ok(TransferStatus::Failed(reason)) => {
                    let mut e = e;
                    warn!(id = e.id(), reason = %reason, "data transfer failed");
                    e.transition_with_error(DataFlowState::Failed, reason, steps.now());
                    steps.save(e, DataFlowState::Started).await?;
                    Ok(true)
                }
                Err(err) => steps.fail(e, err).await,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CollaboratorError;
    use crate::model::DataAddress;
    use crate::testing::{clock, engine, entity, store, FakeTransferService, ParkIds, START};
    use leasehold_core::ManualClock;
    use leasehold_storage::{EntityStore, InMemoryEntityStore};

    struct Harness {
        clock: Arc<ManualClock>,
        store: Arc<InMemoryEntityStore<DataFlow>>,
        service: Arc<FakeTransferService>,
        processors: Vec<Processor<DataFlow>>,
    }

    impl Harness {
        fn new() -> Self {
            let clock = clock();
            let store = store::<DataFlow>(clock.clone());
            let service = Arc::new(FakeTransferService::default());
            let steps = Steps::<DataFlow>::new(
                store.clone(),
                clock.clone(),
                &engine(),
                DataFlowState::Failed,
            );
            let processors = processors(
                &steps,
                &DataFlowCollaborators {
                    service: service.clone(),
                    pending: Arc::new(ParkIds::default()),
                },
            );
            Self {
                clock,
                store,
                service,
                processors,
            }
        }

        async fn seed(&self, id: &str, state: DataFlowState) {
            let flow = DataFlow::new(
                "tp-1",
                DataAddress::new("HttpData").with_property("baseUrl", "https://source.example"),
                DataAddress::new("AmazonS3").with_property("bucket", "in"),
            );
            let mut e = entity(id, flow, state, START - 100);
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

        async fn get(&self, id: &str) -> Flow {
            self.store.find(id).await.unwrap()
        }
    }

    #[tokio::test]
    async fn test_received_flow_starts_and_waits() {
        let h = Harness::new();
        h.seed("df-1", DataFlowState::Received).await;

        assert_eq!(h.tick().await, 1);
        assert_eq!(h.get("df-1").await.state, DataFlowState::Started);
        assert_eq!(*h.service.started.lock(), ["df-1"]);

        let before = h.get("df-1").await;
        assert_eq!(h.tick().await, 0);
        let after = h.get("df-1").await;
        assert_eq!(after.state, DataFlowState::Started);
        assert!(after.state_timestamp > before.state_timestamp);
        assert!(h.store.lease_of("df-1").is_none());
    }

    #[tokio::test]
    async fn test_running_flows_rotate_so_the_youngest_is_polled() {
        let h = Harness::new();
        // One more running flow than fits in a batch.
        for i in 0..=engine().batch_size {
            let flow = DataFlow::new(
                "tp-1",
                DataAddress::new("HttpData"),
                DataAddress::new("AmazonS3"),
            );
            let waited = START - 100 + i as i64;
            let mut e = entity(&format!("df-{i:02}"), flow, DataFlowState::Started, waited);
            h.store.save(&mut e).await.unwrap();
        }
        h.service.completed.lock().insert("df-10".into());

        for _ in 0..3 {
            h.tick().await;
        }
        assert_eq!(h.get("df-10").await.state, DataFlowState::Completed);
        assert_eq!(h.get("df-00").await.state, DataFlowState::Started);
        assert!(h.service.polled.lock().iter().any(|id| id == "df-10"));
    }

    #[tokio::test]
    async fn test_completed_transfer_completes_flow() {
        let h = Harness::new();
        h.seed("df-1", DataFlowState::Started).await;
        *h.service.status.lock() = TransferStatus::Completed;

        assert_eq!(h.tick().await, 1);
        let e = h.get("df-1").await;
        assert_eq!(e.state, DataFlowState::Completed);
        assert!(e.is_terminal());
    }

    #[tokio::test]
    async fn test_failed_transfer_keeps_reason() {
        let h = Harness::new();
        h.seed("df-1", DataFlowState::Started).await;
        *h.service.status.lock() = TransferStatus::Failed("checksum mismatch".into());

        h.tick().await;
        let e = h.get("df-1").await;
        assert_eq!(e.state, DataFlowState::Failed);
        assert_eq!(e.error_detail.as_deref(), Some("checksum mismatch"));
    }

    #[tokio::test]
    async fn test_fatal_start_fails_flow() {
        let h = Harness::new();
        h.seed("df-1", DataFlowState::Received).await;
        *h.service.start_failure.lock() =
            Some(CollaboratorError::fatal("unsupported source type"));

        h.tick().await;
        let e = h.get("df-1").await;
        assert_eq!(e.state, DataFlowState::Failed);
        assert_eq!(e.error_detail.as_deref(), Some("unsupported source type"));
        assert!(h.service.started.lock().is_empty());
    }
}
