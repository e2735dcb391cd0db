//! Fixtures shared by the runtime's unit tests.

use leasehold_core::{Entity, ManualClock, Payload};
use leasehold_storage::{InMemoryEntityStore, StoreOptions};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const INSTANCE: &str = "node-1";
pub const START: i64 = 1_000_000;

leasehold_core::entity_states! {
    pub enum TaskState {
        Ready = 100,
        Working = 200,
        Done = 300 => terminal,
        Failed = -1 => terminal,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub priority: u32,
    pub note: String,
}

impl Payload for Task {
    type State = TaskState;
    const ENTITY_TYPE: &'static str = "task";
    const INITIAL_STATE: TaskState = TaskState::Ready;
}

pub fn task(id: &str, state: TaskState, state_timestamp: i64) -> Entity<Task> {
    Entity::builder(Task::default())
        .id(id)
        .state(state)
        .state_timestamp(state_timestamp)
        .build(START)
        .unwrap()
}

pub fn clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(START))
}

pub fn store(clock: Arc<ManualClock>) -> Arc<InMemoryEntityStore<Task>> {
    Arc::new(InMemoryEntityStore::new(
        INSTANCE,
        clock,
        StoreOptions::default().with_lease_duration(1_000),
    ))
}

/// Saves `count` tasks in `state`, oldest first.
pub async fn seed(store: &InMemoryEntityStore<Task>, count: usize, state: TaskState) {
    use leasehold_storage::EntityStore;
    for i in 0..count {
        let mut e = task(&format!("t-{i:03}"), state, START - 1_000 + i as i64);
        store.save(&mut e).await.unwrap();
    }
}
