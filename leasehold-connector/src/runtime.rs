//! Connector runtime.
//!
//! [`ConnectorRuntime`] is built once at startup and owns everything the
//! connector needs: one manager per state machine, the command registry and
//! queue, the event broadcaster, and the stores. Nothing is looked up
//! globally; collaborators are passed in through [`Collaborators`].

use crate::collaborator::{
    DataTransferService, LoggingDispatcher, NeverPending, NoopDataTransferService,
    NoopProvisioner, NotificationStatusChecker, PendingGuard, Provisioner,
    RemoteMessageDispatcher, StatusChecker,
};
use crate::dataplane::{self, DataFlow, DataFlowCollaborators, DataFlowState};
use crate::error::ConnectorError;
use crate::model::{ContractOffer, CounterParty, DataAddress};
use crate::negotiation::{self, ContractNegotiation, NegotiationCollaborators, NegotiationState};
use crate::step::Steps;
use crate::transfer::{self, TransferCollaborators, TransferProcess, TransferState};
use leasehold_core::{Clock, Entity, EntityState, Payload, SystemClock};
use leasehold_runtime::{
    CommandOutcome, CommandQueue, CommandRegistry, Config, EntityCommand, EntityEvent,
    EventBroadcaster, ExponentialWaitStrategy, Metrics, Processor, StateMachineManager,
};
use leasehold_storage::{EntityStore, InMemoryEntityStore, StoreOptions};
use std::sync::Arc;
use tracing::info;

/// Default broadcast channel capacity.
const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// One store per entity type.
#[derive(Clone)]
pub struct Stores {
    pub negotiations: Arc<dyn EntityStore<ContractNegotiation>>,
    pub transfers: Arc<dyn EntityStore<TransferProcess>>,
    pub data_flows: Arc<dyn EntityStore<DataFlow>>,
}

impl Stores {
    /// In-memory stores held by `instance_id`.
    pub fn in_memory(instance_id: &str, clock: Arc<dyn Clock>, lease_duration_ms: i64) -> Self {
        let options = StoreOptions::default().with_lease_duration(lease_duration_ms);
        let negotiations = InMemoryEntityStore::new(instance_id, clock.clone(), options.clone());
        let transfers = InMemoryEntityStore::new(instance_id, clock.clone(), options.clone());
        Self {
            negotiations: Arc::new(negotiations),
            transfers: Arc::new(transfers),
            data_flows: Arc::new(InMemoryEntityStore::new(instance_id, clock, options)),
        }
    }
}

/// External services the state machines call.
#[derive(Clone)]
pub struct Collaborators {
    pub dispatcher: Arc<dyn RemoteMessageDispatcher>,
    pub provisioner: Arc<dyn Provisioner>,
    pub status_checker: Arc<dyn StatusChecker>,
    pub transfer_service: Arc<dyn DataTransferService>,
    pub negotiation_pending: Arc<dyn PendingGuard<ContractNegotiation>>,
    pub transfer_pending: Arc<dyn PendingGuard<TransferProcess>>,
    pub data_flow_pending: Arc<dyn PendingGuard<DataFlow>>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            dispatcher: Arc::new(LoggingDispatcher),
            provisioner: Arc::new(NoopProvisioner),
            status_checker: Arc::new(NotificationStatusChecker),
            transfer_service: Arc::new(NoopDataTransferService),
            negotiation_pending: Arc::new(NeverPending),
            transfer_pending: Arc::new(NeverPending),
            data_flow_pending: Arc::new(NeverPending),
        }
    }
}

/// The assembled connector.
pub struct ConnectorRuntime {
    config: Config,
    clock: Arc<dyn Clock>,
    stores: Stores,
    negotiations: StateMachineManager<ContractNegotiation>,
    transfers: StateMachineManager<TransferProcess>,
    data_flows: StateMachineManager<DataFlow>,
    registry: Arc<CommandRegistry>,
    queue: CommandQueue,
    events: Arc<EventBroadcaster>,
    metrics: Option<Arc<Metrics>>,
}

impl ConnectorRuntime {
    pub fn builder(config: Config) -> ConnectorRuntimeBuilder {
        ConnectorRuntimeBuilder {
            config,
            clock: Arc::new(SystemClock),
            stores: None,
            collaborators: Collaborators::default(),
            metrics: None,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.config.instance_id
    }

    /// Starts the three manager loops.
    pub fn start(&self) {
        info!(instance_id = %self.config.instance_id, "Starting connector runtime");
        self.negotiations.start();
        self.transfers.start();
        self.data_flows.start();
    }

    /// Stops the managers, then drains the command queue.
    pub async fn stop(&self) {
        info!(instance_id = %self.config.instance_id, "Stopping connector runtime");
        self.negotiations.stop().await;
        self.transfers.stop().await;
        self.data_flows.stop().await;
        self.queue.shutdown().await;
        info!("Connector runtime stopped");
    }

    pub fn is_running(&self) -> bool {
        self.negotiations.is_running()
            || self.transfers.is_running()
            || self.data_flows.is_running()
    }

    /// Runs `command` on the caller's task.
    pub async fn execute<C: EntityCommand>(
        &self,
        command: C,
    ) -> Result<CommandOutcome, ConnectorError> {
        let outcome = self.registry.execute(command).await?;
        self.wake_all();
        Ok(outcome)
    }

    /// Runs `command` through the bounded command queue.
    pub async fn submit<C: EntityCommand>(
        &self,
        command: C,
    ) -> Result<CommandOutcome, ConnectorError> {
        let outcome = self.queue.submit(command).await?;
        self.wake_all();
        Ok(outcome)
    }

    pub fn events(&self) -> &Arc<EventBroadcaster> {
        &self.events
    }

    pub fn metrics(&self) -> Option<&Arc<Metrics>> {
        self.metrics.as_ref()
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    /// Starts a negotiation as consumer. Returns the new negotiation id.
    pub async fn initiate_negotiation(
        &self,
        counter_party: CounterParty,
        offer: ContractOffer,
    ) -> Result<String, ConnectorError> {
        let entity = Entity::builder(ContractNegotiation::consumer(counter_party, offer))
            .build(self.clock.now_millis())?;
        let id = self.create(&self.stores.negotiations, entity).await?;
        self.negotiations.wake();
        Ok(id)
    }

    /// Records a counter-party's contract request; the provider side waits
    /// in REQUESTED for an agree command.
    pub async fn receive_negotiation_request(
        &self,
        counter_party: CounterParty,
        correlation_id: &str,
        offer: ContractOffer,
    ) -> Result<String, ConnectorError> {
        let payload = ContractNegotiation::provider(counter_party, correlation_id, offer);
        let entity = Entity::builder(payload)
            .state(NegotiationState::Requested)
            .build(self.clock.now_millis())?;
        self.create(&self.stores.negotiations, entity).await
    }

    /// Starts a transfer as consumer under `contract_id`.
    pub async fn request_transfer(
        &self,
        counter_party: CounterParty,
        contract_id: &str,
        asset_id: &str,
        destination: DataAddress,
    ) -> Result<String, ConnectorError> {
        let payload = TransferProcess::consumer(counter_party, contract_id, asset_id, destination);
        let entity = Entity::builder(payload).build(self.clock.now_millis())?;
        let id = self.create(&self.stores.transfers, entity).await?;
        self.transfers.wake();
        Ok(id)
    }

    /// Records a counter-party's transfer request; the provider provisions
    /// and starts it.
    pub async fn receive_transfer_request(
        &self,
        counter_party: CounterParty,
        correlation_id: &str,
        contract_id: &str,
        asset_id: &str,
        destination: DataAddress,
    ) -> Result<String, ConnectorError> {
        let payload = TransferProcess::provider(
            counter_party,
            correlation_id,
            contract_id,
            asset_id,
            destination,
        );
        let entity = Entity::builder(payload).build(self.clock.now_millis())?;
        let id = self.create(&self.stores.transfers, entity).await?;
        self.transfers.wake();
        Ok(id)
    }

    /// Accepts a data flow for transfer process `process_id`.
    pub async fn receive_data_flow(
        &self,
        process_id: &str,
        source: DataAddress,
        destination: DataAddress,
    ) -> Result<String, ConnectorError> {
        let entity = Entity::builder(DataFlow::new(process_id, source, destination))
            .build(self.clock.now_millis())?;
        let id = self.create(&self.stores.data_flows, entity).await?;
        self.data_flows.wake();
        Ok(id)
    }

    async fn create<P: Payload>(
        &self,
        store: &Arc<dyn EntityStore<P>>,
        mut entity: Entity<P>,
    ) -> Result<String, ConnectorError> {
        store.save(&mut entity).await?;
        self.events.notify(EntityEvent::transition(&entity, entity.state));
        info!(
            entity_type = P::ENTITY_TYPE,
            id = entity.id(),
            state = entity.state.name(),
            "entity created"
        );
        Ok(entity.id().to_string())
    }

    fn wake_all(&self) {
        self.negotiations.wake();
        self.transfers.wake();
        self.data_flows.wake();
    }
}

/// Builds a [`ConnectorRuntime`].
pub struct ConnectorRuntimeBuilder {
    config: Config,
    clock: Arc<dyn Clock>,
    stores: Option<Stores>,
    collaborators: Collaborators,
    metrics: Option<Arc<Metrics>>,
}

impl ConnectorRuntimeBuilder {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Uses `stores` instead of fresh in-memory ones.
    pub fn stores(mut self, stores: Stores) -> Self {
        self.stores = Some(stores);
        self
    }

    pub fn collaborators(mut self, collaborators: Collaborators) -> Self {
        self.collaborators = collaborators;
        self
    }

    pub fn metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Wires the managers and command handlers. Spawns the command queue
    /// worker, so it must be called inside a tokio runtime.
    pub fn build(self) -> ConnectorRuntime {
        let Self {
            config,
            clock,
            stores,
            collaborators: c,
            metrics,
        } = self;
        let engine = &config.engine;
        let stores = stores.unwrap_or_else(|| {
            Stores::in_memory(&config.instance_id, clock.clone(), engine.lease_duration_ms as i64)
        });
        let events = Arc::new(EventBroadcaster::new(DEFAULT_EVENT_CAPACITY));

        let mut registry = CommandRegistry::new();
        if let Some(metrics) = &metrics {
            registry = registry.with_metrics(metrics.clone());
        }
        let attempts = engine.command_max_attempts;
        negotiation::register(
            &mut registry,
            stores.negotiations.clone(),
            clock.clone(),
            attempts,
            events.clone(),
        );
        transfer::register(
            &mut registry,
            stores.transfers.clone(),
            clock.clone(),
            attempts,
            events.clone(),
        );
        dataplane::register(
            &mut registry,
            stores.data_flows.clone(),
            clock.clone(),
            c.transfer_service.clone(),
            engine.collaborator_timeout(),
            attempts,
            events.clone(),
        );
        let registry = Arc::new(registry);
        let queue = CommandQueue::start(registry.clone(), engine.command_queue_capacity);

        let negotiation_steps = Steps::<ContractNegotiation>::new(
            stores.negotiations.clone(),
            clock.clone(),
            engine,
            NegotiationState::Error,
        )
        .with_events(events.clone());
        let negotiations = manager(
            "negotiation",
            &config,
            &metrics,
            negotiation::processors(
                &negotiation_steps,
                &NegotiationCollaborators {
                    participant_id: config.instance_id.clone(),
                    dispatcher: c.dispatcher.clone(),
                    pending: c.negotiation_pending.clone(),
                },
            ),
        );

        let transfer_steps = Steps::<TransferProcess>::new(
            stores.transfers.clone(),
            clock.clone(),
            engine,
            TransferState::Error,
        )
        .with_events(events.clone());
        let transfers = manager(
            "transfer",
            &config,
            &metrics,
            transfer::processors(
                &transfer_steps,
                &TransferCollaborators {
                    dispatcher: c.dispatcher.clone(),
                    provisioner: c.provisioner.clone(),
                    status_checker: c.status_checker.clone(),
                    pending: c.transfer_pending.clone(),
                },
            ),
        );

        let flow_steps = Steps::<DataFlow>::new(
            stores.data_flows.clone(),
            clock.clone(),
            engine,
            DataFlowState::Failed,
        )
        .with_events(events.clone());
        let data_flows = manager(
            "data-flow",
            &config,
            &metrics,
            dataplane::processors(
                &flow_steps,
                &DataFlowCollaborators {
                    service: c.transfer_service.clone(),
                    pending: c.data_flow_pending.clone(),
                },
            ),
        );

        ConnectorRuntime {
            config,
            clock,
            stores,
            negotiations,
            transfers,
            data_flows,
            registry,
            queue,
            events,
            metrics,
        }
    }
}

fn manager<P: Payload>(
    name: &str,
    config: &Config,
    metrics: &Option<Arc<Metrics>>,
    processors: Vec<Processor<P>>,
) -> StateMachineManager<P> {
    let engine = &config.engine;
    let mut builder = StateMachineManager::<P>::builder(name, config.instance_id.clone())
        .wait_strategy(ExponentialWaitStrategy::new(engine.min_backoff(), engine.max_backoff()))
        .shutdown_timeout(engine.shutdown_timeout());
    for processor in processors {
        builder = builder.processor(processor);
    }
    if let Some(metrics) = metrics {
        builder = builder.metrics(metrics.clone());
    }
    builder.build()
}
