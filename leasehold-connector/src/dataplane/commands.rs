use super::{DataFlow, DataFlowState};
use crate::collaborator::DataTransferService;
use crate::command::{entity_command, invalid, unpark};
use crate::error::with_timeout;
use async_trait::async_trait;
use leasehold_core::{Clock, Entity};
use leasehold_runtime::{
    CommandError, CommandHandler, CommandRegistry, EntityCommandHandler, EventBroadcaster,
};
use leasehold_storage::EntityStore;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

type Flow = Entity<DataFlow>;

entity_command! {
    /// Ends a flow and stops its transfer.
    TerminateDataFlow => "terminate_data_flow" {}
}

entity_command! {
    /// Pauses a started flow; the transfer is stopped until resumed.
    SuspendDataFlow => "suspend_data_flow" {}
}

entity_command! {
    /// Restarts a suspended flow from RECEIVED.
    ResumeDataFlow => "resume_data_flow" {}
}

entity_command! {
    /// Releases a flow parked for manual action.
    UnparkDataFlow => "unpark_data_flow" {}
}

/// Handler for data-flow command `C`.
pub struct DataFlowHandler<C> {
    clock: Arc<dyn Clock>,
    service: Arc<dyn DataTransferService>,
    timeout: Duration,
    _command: PhantomData<fn() -> C>,
}

impl<C> DataFlowHandler<C> {
    pub fn new(
        clock: Arc<dyn Clock>,
        service: Arc<dyn DataTransferService>,
        timeout: Duration,
    ) -> Self {
        Self {
            clock,
            service,
            timeout,
            _command: PhantomData,
        }
    }

    /// Stops the transfer behind `flow`. The flow is already saved, so a
    /// failure is only logged.
    async fn stop_transfer(&self, flow: &Flow, command: &'static str) {
        if let Err(e) = with_timeout(self.timeout, self.service.terminate(flow.id())).await {
            warn!(id = flow.id(), command, error = %e, "failed to stop data transfer");
        }
    }
}

#[async_trait]
impl CommandHandler for DataFlowHandler<TerminateDataFlow> {
    type Command = TerminateDataFlow;
    type Payload = DataFlow;

    fn modify(&self, entity: &mut Flow, _c: &TerminateDataFlow) -> Result<bool, CommandError> {
        if entity.is_terminal() {
            return Err(invalid(entity, "terminate_data_flow"));
        }
        entity.transition_to(DataFlowState::Terminated, self.clock.now_millis());
        Ok(true)
    }

    async fn post_actions(&self, entity: &Flow, _c: &TerminateDataFlow) {
        self.stop_transfer(entity, "terminate_data_flow").await;
    }
}

#[async_trait]
impl CommandHandler for DataFlowHandler<SuspendDataFlow> {
    type Command = SuspendDataFlow;
    type Payload = DataFlow;

    fn modify(&self, entity: &mut Flow, _c: &SuspendDataFlow) -> Result<bool, CommandError> {
        if entity.state != DataFlowState::Started {
            return Err(invalid(entity, "suspend_data_flow"));
        }
        entity.transition_to(DataFlowState::Suspended, self.clock.now_millis());
        Ok(true)
    }

    async fn post_actions(&self, entity: &Flow, _c: &SuspendDataFlow) {
        self.stop_transfer(entity, "suspend_data_flow").await;
    }
}

#[async_trait]
impl CommandHandler for DataFlowHandler<ResumeDataFlow> {
    type Command = ResumeDataFlow;
    type Payload = DataFlow;

    fn modify(&self, entity: &mut Flow, _c: &ResumeDataFlow) -> Result<bool, CommandError> {
        if entity.state != DataFlowState::Suspended {
            return Err(invalid(entity, "resume_data_flow"));
        }
        entity.transition_to(DataFlowState::Received, self.clock.now_millis());
        Ok(true)
    }
}

#[async_trait]
impl CommandHandler for DataFlowHandler<UnparkDataFlow> {
    type Command = UnparkDataFlow;
    type Payload = DataFlow;

    fn modify(&self, entity: &mut Flow, _c: &UnparkDataFlow) -> Result<bool, CommandError> {
        unpark(entity, "unpark_data_flow")
    }
}

/// Registers every data-flow command with `registry`. Terminate and suspend
/// stop the transfer through `service`, bounded by `timeout`.
pub fn register(
    registry: &mut CommandRegistry,
    store: Arc<dyn EntityStore<DataFlow>>,
    clock: Arc<dyn Clock>,
    service: Arc<dyn DataTransferService>,
    timeout: Duration,
    max_attempts: u32,
    events: Arc<EventBroadcaster>,
) {
    fn handler<C>(
        store: &Arc<dyn EntityStore<DataFlow>>,
        handler: DataFlowHandler<C>,
        max_attempts: u32,
        events: &Arc<EventBroadcaster>,
    ) -> EntityCommandHandler<DataFlowHandler<C>>
    where
        DataFlowHandler<C>: CommandHandler<Payload = DataFlow>,
    {
        EntityCommandHandler::new(handler, store.clone())
            .max_attempts(max_attempts)
            .retry_backoff(Duration::from_millis(10))
            .events(events.clone())
    }

    registry.register(handler(
        &store,
        DataFlowHandler::<TerminateDataFlow>::new(clock.clone(), service.clone(), timeout),
        max_attempts,
        &events,
    ));
    registry.register(handler(
        &store,
        DataFlowHandler::<SuspendDataFlow>::new(clock.clone(), service.clone(), timeout),
        max_attempts,
        &events,
    ));
    registry.register(handler(
        &store,
        DataFlowHandler::<ResumeDataFlow>::new(clock.clone(), service.clone(), timeout),
        max_attempts,
        &events,
    ));
    registry.register(handler(
        &store,
        DataFlowHandler::<UnparkDataFlow>::new(clock, service, timeout),
        max_attempts,
        &events,
    ));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DataAddress;
    use crate::testing::{clock, entity, store, FakeTransferService, START};
    use leasehold_storage::InMemoryEntityStore;

    fn flow(id: &str, state: DataFlowState) -> Flow {
        entity(
            id,
            DataFlow::new("tp-1", DataAddress::new("HttpData"), DataAddress::new("AmazonS3")),
            state,
            START - 100,
        )
    }

    async fn setup(
        seed: Vec<Flow>,
    ) -> (Arc<InMemoryEntityStore<DataFlow>>, Arc<FakeTransferService>, CommandRegistry) {
        let clock = clock();
        let store = store::<DataFlow>(clock.clone());
        for mut e in seed {
            store.save(&mut e).await.unwrap();
        }
        let service = Arc::new(FakeTransferService::default());
        let mut registry = CommandRegistry::new();
        register(
            &mut registry,
            store.clone(),
            clock,
            service.clone(),
            Duration::from_millis(200),
            3,
            Arc::new(EventBroadcaster::default()),
        );
        (store, service, registry)
    }

    #[tokio::test]
    async fn test_terminate_stops_transfer() {
        let (store, service, registry) = setup(vec![
            flow("df-1", DataFlowState::Started),
            flow("df-2", DataFlowState::Completed),
        ])
        .await;

        registry.execute(TerminateDataFlow { id: "df-1".into() }).await.unwrap();
        assert_eq!(store.find("df-1").await.unwrap().state, DataFlowState::Terminated);
        assert_eq!(*service.terminated.lock(), ["df-1"]);

        let err = registry
            .execute(TerminateDataFlow { id: "df-2".into() })
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "INVALID_STATE");
        assert_eq!(service.terminated.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_suspend_and_resume() {
        let (store, service, registry) = setup(vec![flow("df-1", DataFlowState::Started)]).await;

        registry.execute(SuspendDataFlow { id: "df-1".into() }).await.unwrap();
        assert_eq!(store.find("df-1").await.unwrap().state, DataFlowState::Suspended);
        assert_eq!(*service.terminated.lock(), ["df-1"]);

        let err = registry
            .execute(SuspendDataFlow { id: "df-1".into() })
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::InvalidState { .. }));

        let out = registry.execute(ResumeDataFlow { id: "df-1".into() }).await.unwrap();
        assert_eq!(out.state, "Received");
    }

    #[tokio::test]
    async fn test_unpark_rejects_finished_flow() {
        let mut done = flow("df-1", DataFlowState::Completed);
        done.set_pending(true);
        let mut parked = flow("df-2", DataFlowState::Started);
        parked.set_pending(true);
        let (store, _service, registry) = setup(vec![done, parked]).await;

        let err = registry
            .execute(UnparkDataFlow { id: "df-1".into() })
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::InvalidState { command: "unpark_data_flow", .. }));

        registry.execute(UnparkDataFlow { id: "df-2".into() }).await.unwrap();
        assert!(!store.find("df-2").await.unwrap().pending);
    }
}
