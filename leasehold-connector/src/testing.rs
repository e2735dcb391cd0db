//! Fakes and fixtures shared by the connector's unit tests.

use crate::collaborator::{
    DataTransferService, PendingGuard, ProtocolMessage, Provisioner, RemoteMessageDispatcher,
    StatusChecker, TransferStatus,
};
use crate::error::CollaboratorError;
use crate::model::{CounterParty, DataAddress, ProvisionedResource};
use async_trait::async_trait;
use leasehold_core::{Entity, ManualClock, Payload};
use leasehold_runtime::EngineConfig;
use leasehold_storage::{InMemoryEntityStore, StoreOptions};
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

pub const INSTANCE: &str = "connector-a";
pub const START: i64 = 1_700_000_000_000;

pub fn clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(START))
}

pub fn engine() -> EngineConfig {
    EngineConfig {
        batch_size: 10,
        lease_duration_ms: 5_000,
        max_retries: 2,
        collaborator_timeout_ms: 200,
        ..EngineConfig::default()
    }
}

pub fn store<P: Payload>(clock: Arc<ManualClock>) -> Arc<InMemoryEntityStore<P>> {
    Arc::new(InMemoryEntityStore::new(
        INSTANCE,
        clock,
        StoreOptions::default().with_lease_duration(engine().lease_duration_ms as i64),
    ))
}

pub fn counter_party() -> CounterParty {
    CounterParty {
        id: "provider-x".into(),
        address: "https://provider-x.example/protocol".into(),
        protocol: "dataspace-protocol-http".into(),
    }
}

/// Builds an unsaved entity in `state`.
pub fn entity<P: Payload>(
    id: &str,
    payload: P,
    state: P::State,
    state_timestamp: i64,
) -> Entity<P> {
    Entity::builder(payload)
        .id(id)
        .state(state)
        .state_timestamp(state_timestamp)
        .build(START)
        .unwrap()
}

/// Records dispatched messages; fails while a failure is set.
#[derive(Default)]
pub struct RecordingDispatcher {
    sent: Mutex<Vec<ProtocolMessage>>,
    failure: Mutex<Option<CollaboratorError>>,
    delay: Mutex<Option<Duration>>,
}

impl RecordingDispatcher {
    pub fn fail_with(&self, err: Option<CollaboratorError>) {
        *self.failure.lock() = err;
    }

    pub fn delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    pub fn sent(&self) -> Vec<ProtocolMessage> {
        self.sent.lock().clone()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.sent.lock().iter().map(ProtocolMessage::name).collect()
    }
}

#[async_trait]
impl RemoteMessageDispatcher for RecordingDispatcher {
    async fn dispatch(
        &self,
        _to: &CounterParty,
        message: ProtocolMessage,
    ) -> Result<(), CollaboratorError> {
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let failure = self.failure.lock().clone();
        if let Some(err) = failure {
            return Err(err);
        }
        self.sent.lock().push(message);
        Ok(())
    }
}

/// Parks entities whose id is in the set.
#[derive(Default)]
pub struct ParkIds(pub Mutex<HashSet<String>>);

impl ParkIds {
    pub fn park(&self, id: &str) {
        self.0.lock().insert(id.to_string());
    }
}

impl<P: Payload> PendingGuard<P> for ParkIds {
    fn is_pending(&self, entity: &Entity<P>) -> bool {
        self.0.lock().contains(entity.id())
    }
}

/// Provisioner that returns one resource per call, or a scripted error.
#[derive(Default)]
pub struct FakeProvisioner {
    pub failures: Mutex<VecDeque<CollaboratorError>>,
    pub deprovisioned: Mutex<Vec<String>>,
}

#[async_trait]
impl Provisioner for FakeProvisioner {
    async fn provision(
        &self,
        process_id: &str,
        destination: &DataAddress,
    ) -> Result<Vec<ProvisionedResource>, CollaboratorError> {
        if let Some(err) = self.failures.lock().pop_front() {
            return Err(err);
        }
        Ok(vec![ProvisionedResource {
            id: format!("{process_id}-bucket"),
            kind: "bucket".into(),
            address: Some(destination.clone()),
        }])
    }

    async fn deprovision(
        &self,
        process_id: &str,
        resources: &[ProvisionedResource],
    ) -> Result<(), CollaboratorError> {
        let mut done = self.deprovisioned.lock();
        done.push(process_id.to_string());
        done.extend(resources.iter().map(|r| r.id.clone()));
        Ok(())
    }
}

/// Status checker with a settable answer, or a per-process one.
#[derive(Default)]
pub struct FakeStatusChecker {
    pub all: Mutex<bool>,
    pub complete: Mutex<HashSet<String>>,
}

#[async_trait]
impl StatusChecker for FakeStatusChecker {
    async fn is_complete(
        &self,
        process_id: &str,
        _resources: &[ProvisionedResource],
    ) -> Result<bool, CollaboratorError> {
        Ok(*self.all.lock() || self.complete.lock().contains(process_id))
    }
}

/// Data transfer service with a settable status; flows in `completed`
/// report Completed regardless.
pub struct FakeTransferService {
    pub status: Mutex<TransferStatus>,
    pub completed: Mutex<HashSet<String>>,
    pub polled: Mutex<Vec<String>>,
    pub started: Mutex<Vec<String>>,
    pub terminated: Mutex<Vec<String>>,
    pub start_failure: Mutex<Option<CollaboratorError>>,
}

impl Default for FakeTransferService {
    fn default() -> Self {
        Self {
            status: Mutex::new(TransferStatus::Running),
            completed: Mutex::new(HashSet::new()),
            polled: Mutex::new(Vec::new()),
            started: Mutex::new(Vec::new()),
            terminated: Mutex::new(Vec::new()),
            start_failure: Mutex::new(None),
        }
    }
}

#[async_trait]
impl DataTransferService for FakeTransferService {
    async fn start(
        &self,
        flow_id: &str,
        _source: &DataAddress,
        _destination: &DataAddress,
    ) -> Result<(), CollaboratorError> {
        if let Some(err) = self.start_failure.lock().clone() {
            return Err(err);
        }
        self.started.lock().push(flow_id.to_string());
        Ok(())
    }

    async fn status(&self, flow_id: &str) -> Result<TransferStatus, CollaboratorError> {
        self.polled.lock().push(flow_id.to_string());
        if self.completed.lock().contains(flow_id) {
            return Ok(TransferStatus::Completed);
        }
        Ok(self.status.lock().clone())
    }

    async fn terminate(&self, flow_id: &str) -> Result<(), CollaboratorError> {
        self.terminated.lock().push(flow_id.to_string());
        Ok(())
    }
}
