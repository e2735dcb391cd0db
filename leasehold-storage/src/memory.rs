//! In-memory entity store.
//!
//! One `RwLock` guards the whole table. Every mutating call, including the
//! scan-and-mark in `lease_next`, runs under the write lock, so operations
//! are serializable across all handles sharing the table.

use crate::error::{ConflictKind, StoreError};
use crate::query::QuerySpec;
use crate::store::EntityStore;
use async_trait::async_trait;
use leasehold_core::{Clock, Entity, EntityState, Lease, Payload, SystemClock};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Default lease lifetime (60 s).
pub const DEFAULT_LEASE_DURATION_MS: i64 = 60_000;

/// Store options.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Lease lifetime in milliseconds.
    pub lease_duration_ms: i64,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            lease_duration_ms: DEFAULT_LEASE_DURATION_MS,
        }
    }
}

impl StoreOptions {
    pub fn with_lease_duration(mut self, millis: i64) -> Self {
        self.lease_duration_ms = millis;
        self
    }
}

struct Record<P: Payload> {
    entity: Entity<P>,
    lease: Option<Lease>,
}

type Table<P> = HashMap<String, Record<P>>;

/// In-memory store. Clone a handle for another instance with
/// [`for_instance`](InMemoryEntityStore::for_instance).
pub struct InMemoryEntityStore<P: Payload> {
    holder: String,
    table: Arc<RwLock<Table<P>>>,
    clock: Arc<dyn Clock>,
    options: StoreOptions,
}

impl<P: Payload> InMemoryEntityStore<P> {
    /// Creates an empty store acting as `holder`.
    pub fn new(holder: impl Into<String>, clock: Arc<dyn Clock>, options: StoreOptions) -> Self {
        Self {
            holder: holder.into(),
            table: Arc::new(RwLock::new(HashMap::new())),
            clock,
            options,
        }
    }

    /// Creates an empty store on the wall clock with default options.
    pub fn with_defaults(holder: impl Into<String>) -> Self {
        Self::new(holder, Arc::new(SystemClock), StoreOptions::default())
    }

    /// Returns a handle over the same table acting as another instance.
    pub fn for_instance(&self, holder: impl Into<String>) -> Self {
        Self {
            holder: holder.into(),
            table: self.table.clone(),
            clock: self.clock.clone(),
            options: self.options.clone(),
        }
    }

    pub fn options(&self) -> &StoreOptions {
        &self.options
    }

    /// Returns the current lease on `id`, expired or not.
    pub fn lease_of(&self, id: &str) -> Option<Lease> {
        self.table.read().get(id).and_then(|r| r.lease.clone())
    }

    /// Returns the number of stored entities.
    pub fn len(&self) -> usize {
        self.table.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.read().is_empty()
    }

    fn leased_by_other(&self, record: &Record<P>, instance: &str, now: i64) -> Option<String> {
        record
            .lease
            .as_ref()
            .filter(|lease| !lease.is_acquirable_by(instance, now))
            .map(|lease| lease.leased_by.clone())
    }
}

#[async_trait]
impl<P: Payload> EntityStore<P> for InMemoryEntityStore<P> {
    fn holder(&self) -> &str {
        &self.holder
    }

    async fn find(&self, id: &str) -> Result<Entity<P>, StoreError> {
        self.table
            .read()
            .get(id)
            .map(|r| r.entity.clone())
            .ok_or_else(|| StoreError::NotFound { id: id.to_string() })
    }

    async fn save(&self, entity: &mut Entity<P>) -> Result<(), StoreError> {
        let now = self.clock.now_millis();
        let mut table = self.table.write();

        match table.get_mut(entity.id()) {
            None => {
                if entity.version() != 0 {
                    return Err(StoreError::NotFound {
                        id: entity.id().to_string(),
                    });
                }
                entity.record_persisted(1, now.max(entity.created_at()));
                table.insert(
                    entity.id().to_string(),
                    Record {
                        entity: entity.clone(),
                        lease: None,
                    },
                );
            }
            Some(record) => {
                let stored_version = record.entity.version();
                if stored_version != entity.version() {
                    return Err(StoreError::Conflict {
                        id: entity.id().to_string(),
                        kind: ConflictKind::VersionMismatch {
                            expected: entity.version(),
                            actual: stored_version,
                        },
                    });
                }
                if let Some(holder) = self.leased_by_other(record, &self.holder, now) {
                    return Err(StoreError::Conflict {
                        id: entity.id().to_string(),
                        kind: ConflictKind::LeasedByOther { holder },
                    });
                }

                let updated_at = now.max(record.entity.updated_at() + 1);
                entity.record_persisted(stored_version + 1, updated_at);
                record.entity = entity.clone();
                record.lease = None;
            }
        }

        tracing::trace!(
            entity_type = P::ENTITY_TYPE,
            id = entity.id(),
            state = %entity.state,
            version = entity.version(),
            "saved entity"
        );
        Ok(())
    }

    async fn lease_next(
        &self,
        state: P::State,
        max: usize,
        for_instance: &str,
    ) -> Result<Vec<Entity<P>>, StoreError> {
        if max == 0 {
            return Ok(Vec::new());
        }

        let now = self.clock.now_millis();
        let mut table = self.table.write();

        let mut candidates: Vec<(i64, i64, String)> = table
            .values()
            .filter(|r| r.entity.state == state && !r.entity.pending)
            .filter(|r| self.leased_by_other(r, for_instance, now).is_none())
            .map(|r| {
                (
                    r.entity.state_timestamp,
                    r.entity.created_at(),
                    r.entity.id().to_string(),
                )
            })
            .collect();
        candidates.sort();
        candidates.truncate(max);

        let mut leased = Vec::with_capacity(candidates.len());
        for (_, _, id) in candidates {
            if let Some(record) = table.get_mut(&id) {
                record.lease = Some(Lease::new(
                    for_instance,
                    now,
                    self.options.lease_duration_ms,
                ));
                leased.push(record.entity.clone());
            }
        }

        if !leased.is_empty() {
            tracing::trace!(
                entity_type = P::ENTITY_TYPE,
                state = state.name(),
                holder = for_instance,
                count = leased.len(),
                "leased entities"
            );
        }
        Ok(leased)
    }

    async fn query(&self, spec: &QuerySpec<P::State>) -> Result<Vec<Entity<P>>, StoreError> {
        let snapshot: Vec<Entity<P>> = self
            .table
            .read()
            .values()
            .filter(|r| spec.matches(&r.entity))
            .map(|r| r.entity.clone())
            .collect();
        Ok(spec.apply(snapshot))
    }

    async fn break_lease(&self, id: &str, instance: &str) -> Result<(), StoreError> {
        let now = self.clock.now_millis();
        let mut table = self.table.write();
        let record = table
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound { id: id.to_string() })?;

        if let Some(holder) = self.leased_by_other(record, instance, now) {
            return Err(StoreError::Conflict {
                id: id.to_string(),
                kind: ConflictKind::LeasedByOther { holder },
            });
        }
        record.lease = None;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let now = self.clock.now_millis();
        let mut table = self.table.write();
        let record = table
            .get(id)
            .ok_or_else(|| StoreError::NotFound { id: id.to_string() })?;

        if !record.entity.is_terminal() {
            return Err(StoreError::InvalidState {
                id: id.to_string(),
                state: record.entity.state.to_string(),
                operation: "delete",
            });
        }
        if let Some(holder) = self.leased_by_other(record, &self.holder, now) {
            return Err(StoreError::Conflict {
                id: id.to_string(),
                kind: ConflictKind::LeasedByOther { holder },
            });
        }
        table.remove(id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conformance::{Ticket, TicketState};
    use leasehold_core::ManualClock;
    use proptest::prelude::*;
    use std::collections::HashSet;

    fn store(clock: Arc<ManualClock>) -> InMemoryEntityStore<Ticket> {
        InMemoryEntityStore::new(
            "instance-a",
            clock,
            StoreOptions::default().with_lease_duration(1_000),
        )
    }

    fn ticket(id: &str, state: TicketState, ts: i64) -> Entity<Ticket> {
        Entity::builder(Ticket::new(id))
            .id(id)
            .state(state)
            .state_timestamp(ts)
            .build(ts)
            .unwrap()
    }

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_save_and_find() {
        let clock = Arc::new(ManualClock::new(10_000));
        let store = store(clock);
        let mut e = ticket("p-1", TicketState::Open, 10_000);
        store.save(&mut e).await.unwrap();
        assert_eq!(e.version(), 1);

        let found = store.find("p-1").await.unwrap();
        assert_eq!(found, e);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_lease_recorded_with_holder() {
        let clock = Arc::new(ManualClock::new(10_000));
        let store = store(clock.clone());
        let mut e = ticket("p-1", TicketState::Open, 10_000);
        store.save(&mut e).await.unwrap();

        let leased = store
            .lease_next(TicketState::Open, 5, "instance-a")
            .await
            .unwrap();
        assert_eq!(leased.len(), 1);

        let lease = store.lease_of("p-1").unwrap();
        assert_eq!(lease.leased_by, "instance-a");
        assert_eq!(lease.leased_at, 10_000);
        assert_eq!(lease.lease_duration_ms, 1_000);

        let mut e = leased.into_iter().next().unwrap();
        store.save(&mut e).await.unwrap();
        assert!(store.lease_of("p-1").is_none());
    }

    #[tokio::test]
    async fn test_handles_share_table() {
        let clock = Arc::new(ManualClock::new(0));
        let a = store(clock);
        let b = a.for_instance("instance-b");
        let mut e = ticket("p-1", TicketState::Open, 0);
        a.save(&mut e).await.unwrap();

        assert_eq!(b.holder(), "instance-b");
        assert!(b.find("p-1").await.is_ok());
    }

    proptest! {
        #[test]
        fn prop_lease_next_is_fifo(
            timestamps in proptest::collection::hash_set(0i64..1_000_000, 1..40),
        ) {
            let rt = runtime();
            let clock = Arc::new(ManualClock::new(2_000_000));
            let store = store(clock);
            let total = timestamps.len();

            rt.block_on(async {
                for (i, ts) in timestamps.iter().enumerate() {
                    let mut e = ticket(&format!("p-{}", i), TicketState::Open, *ts);
                    store.save(&mut e).await.unwrap();
                }
            });

            let leased = rt
                .block_on(store.lease_next(TicketState::Open, total, "instance-a"))
                .unwrap();
            let got: Vec<i64> = leased.iter().map(|e| e.state_timestamp).collect();
            let mut expected: Vec<i64> = timestamps.into_iter().collect();
            expected.sort();
            prop_assert_eq!(got, expected);
        }

        #[test]
        fn prop_instances_never_share_leases(count in 1usize..30, batch in 1usize..8) {
            let rt = runtime();
            let clock = Arc::new(ManualClock::new(0));
            let a = store(clock);
            let b = a.for_instance("instance-b");

            rt.block_on(async {
                for i in 0..count {
                    let mut e = ticket(&format!("p-{}", i), TicketState::Open, i as i64);
                    a.save(&mut e).await.unwrap();
                }
            });

            let mut seen = HashSet::new();
            loop {
                let from_a = rt
                    .block_on(a.lease_next(TicketState::Open, batch, "instance-a"))
                    .unwrap();
                let from_b = rt
                    .block_on(b.lease_next(TicketState::Open, batch, "instance-b"))
                    .unwrap();
                if from_a.is_empty() && from_b.is_empty() {
                    break;
                }
                for e in from_a.iter().chain(from_b.iter()) {
                    prop_assert!(seen.insert(e.id().to_string()), "{} leased twice", e.id());
                }
                // a keeps re-leasing its own; stop it from looping forever
                rt.block_on(async {
                    for mut e in from_a {
                        e.transition_to(TicketState::Closed, 1);
                        a.save(&mut e).await.unwrap();
                    }
                    for mut e in from_b {
                        e.transition_to(TicketState::Closed, 1);
                        b.save(&mut e).await.unwrap();
                    }
                });
            }
            prop_assert_eq!(seen.len(), count);
        }
    }
}
