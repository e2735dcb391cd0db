//! Shared plumbing for the connector's transition functions.
//!
//! Every "-ING" state follows the same shape: call a collaborator under a
//! timeout, then either advance, retry in place, or fail. [`Steps`] holds
//! what that needs so each machine only states the call and the target.

use crate::collaborator::PendingGuard;
use crate::error::{with_timeout, CollaboratorError};
use leasehold_core::{Clock, Entity, EntityState, Payload};
use leasehold_runtime::{
    transition, EngineConfig, EntityEvent, EventBroadcaster, ProcessError, ProcessorBuilder,
    RetryOutcome, RetryPolicy,
};
use leasehold_storage::EntityStore;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};

pub(crate) struct Steps<P: Payload> {
    store: Arc<dyn EntityStore<P>>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    timeout: Duration,
    batch_size: usize,
    error_state: P::State,
    events: Option<Arc<EventBroadcaster>>,
}

impl<P: Payload> Clone for Steps<P> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            clock: self.clock.clone(),
            retry: self.retry.clone(),
            timeout: self.timeout,
            batch_size: self.batch_size,
            error_state: self.error_state,
            events: self.events.clone(),
        }
    }
}

impl<P: Payload> Steps<P> {
    pub(crate) fn new(
        store: Arc<dyn EntityStore<P>>,
        clock: Arc<dyn Clock>,
        engine: &EngineConfig,
        error_state: P::State,
    ) -> Self {
        let retry = RetryPolicy::new(engine.max_retries, clock.clone())
            .with_base_delay(engine.retry_base_delay_ms as i64);
        Self {
            store,
            clock,
            retry,
            timeout: engine.collaborator_timeout(),
            batch_size: engine.batch_size,
            error_state,
            events: None,
        }
    }

    /// Publishes every state change the processors save.
    pub(crate) fn with_events(mut self, events: Arc<EventBroadcaster>) -> Self {
        self.events = Some(events);
        self
    }

    pub(crate) fn now(&self) -> i64 {
        self.clock.now_millis()
    }

    /// A processor for `state` with the engine's batch size and retry delay.
    pub(crate) fn processor(&self, name: &str, state: P::State) -> ProcessorBuilder<P> {
        ProcessorBuilder::new(name, self.store.clone(), state)
            .batch_size(self.batch_size)
            .retry_policy(self.retry.clone())
    }

    /// Adds the guard that parks entities `pending` reports.
    pub(crate) fn parking(
        &self,
        builder: ProcessorBuilder<P>,
        pending: Arc<dyn PendingGuard<P>>,
    ) -> ProcessorBuilder<P> {
        let store = self.store.clone();
        builder.guard(
            "pending",
            move |e: &Entity<P>| pending.is_pending(e),
            transition(move |mut e: Entity<P>| {
                let store = store.clone();
                async move {
                    e.set_pending(true);
                    store.save(&mut e).await?;
                    tracing::info!(
                        id = e.id(),
                        state = e.state.name(),
                        "entity parked for manual action"
                    );
                    Ok(true)
                }
            }),
        )
    }

    /// Moves `entity` to `next` and saves it.
    pub(crate) async fn advance(
        &self,
        mut entity: Entity<P>,
        next: P::State,
    ) -> Result<bool, ProcessError> {
        let from = entity.state;
        entity.transition_to(next, self.now());
        self.save(entity, from).await?;
        Ok(true)
    }

    /// Saves an entity that left `from`, announcing the change.
    pub(crate) async fn save(
        &self,
        mut entity: Entity<P>,
        from: P::State,
    ) -> Result<(), ProcessError> {
        self.store.save(&mut entity).await?;
        if let Some(events) = self.events.as_ref().filter(|_| entity.state != from) {
            events.notify(EntityEvent::transition(&entity, from));
        }
        Ok(())
    }

    /// Keeps `entity` in its state but sends it to the back of the FIFO
    /// order. The poll itself succeeded, so the retry count starts over.
    pub(crate) async fn requeue(&self, mut entity: Entity<P>) -> Result<bool, ProcessError> {
        entity.state_timestamp = self.now();
        entity.state_count = 0;
        entity.error_detail = None;
        self.store.save(&mut entity).await?;
        Ok(false)
    }

    /// Runs `call`, applies `on_success` to the entity and saves it.
    /// Failures go through [`Steps::fail`].
    ///
    /// Returns `Ok(true)` when the entity left its state, `Ok(false)` when it
    /// stays for a retry.
    pub(crate) async fn attempt<T, F, S>(
        &self,
        mut entity: Entity<P>,
        call: F,
        on_success: S,
    ) -> Result<bool, ProcessError>
    where
        F: Future<Output = Result<T, CollaboratorError>>,
        S: FnOnce(&mut Entity<P>, T, i64),
    {
        match with_timeout(self.timeout, call).await {
            Ok(value) => {
                let from = entity.state;
                on_success(&mut entity, value, self.now());
                self.save(entity, from).await?;
                Ok(true)
            }
            Err(err) => self.fail(entity, err).await,
        }
    }

    /// Records a collaborator failure: a transient one schedules a retry
    /// until the retry bound is reached, a fatal one moves the entity to the
    /// error state.
    pub(crate) async fn fail(
        &self,
        mut entity: Entity<P>,
        err: CollaboratorError,
    ) -> Result<bool, ProcessError> {
        let from = entity.state;
        let advanced = match err {
            CollaboratorError::Transient(detail) => {
                match self.retry.on_transient(&mut entity, self.error_state, &detail) {
                    RetryOutcome::Retry { attempt } => {
                        warn!(
                            id = entity.id(),
                            state = entity.state.name(),
                            attempt,
                            error = %detail,
                            "transient failure, will retry"
                        );
                        false
                    }
                    RetryOutcome::Exhausted => {
                        error!(id = entity.id(), error = %detail, "retries exhausted");
                        true
                    }
                }
            }
            CollaboratorError::Fatal(detail) => {
                error!(
                    id = entity.id(),
                    state = entity.state.name(),
                    error = %detail,
                    "fatal collaborator failure"
                );
                entity.transition_with_error(self.error_state, detail, self.now());
                true
            }
        };

        self.save(entity, from).await?;
        Ok(advanced)
    }

    /// Bound on a single collaborator call.
    pub(crate) fn timeout(&self) -> Duration {
        self.timeout
    }
}
