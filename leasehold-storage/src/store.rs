//! Entity store contract.

use crate::error::StoreError;
use crate::query::QuerySpec;
use async_trait::async_trait;
use leasehold_core::{Entity, Payload};

/// Storage contract shared by every state machine.
///
/// A store handle acts on behalf of one connector instance, named by
/// [`holder`](EntityStore::holder). Several handles (one per replica) may
/// share a backend; the leasing protocol keeps them from processing the same
/// entity at the same time.
///
/// ## Leasing
///
/// `lease_next` must select and mark entities atomically with respect to
/// every other caller, including callers on other handles. A SQL backend
/// does this with `SELECT ... FOR UPDATE SKIP LOCKED` plus a compare-and-set
/// on the lease columns; a document store with a conditional write on its
/// revision field.
///
/// ## Optimistic concurrency
///
/// `save` of an existing entity succeeds only if the caller's `version`
/// matches the stored one and no other instance holds an unexpired lease.
/// A successful save advances the version, bumps `updated_at`, writes both
/// back into the caller's entity, and releases the saver's lease.
#[async_trait]
pub trait EntityStore<P: Payload>: Send + Sync {
    /// Instance this handle saves and breaks leases as.
    fn holder(&self) -> &str;

    /// Returns a copy of the stored entity.
    async fn find(&self, id: &str) -> Result<Entity<P>, StoreError>;

    /// Inserts (version 0) or updates (matching version) an entity.
    async fn save(&self, entity: &mut Entity<P>) -> Result<(), StoreError>;

    /// Leases up to `max` non-pending entities in `state`, oldest
    /// `state_timestamp` first.
    async fn lease_next(
        &self,
        state: P::State,
        max: usize,
        for_instance: &str,
    ) -> Result<Vec<Entity<P>>, StoreError>;

    /// Read-only retrieval for API surfaces.
    async fn query(&self, spec: &QuerySpec<P::State>) -> Result<Vec<Entity<P>>, StoreError>;

    /// Releases a lease held by `instance` before it expires.
    async fn break_lease(&self, id: &str, instance: &str) -> Result<(), StoreError>;

    /// Removes an entity in a terminal state.
    async fn delete(&self, id: &str) -> Result<(), StoreError>;
}
