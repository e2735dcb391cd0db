//! Batch processor for one state.
//!
//! A processor leases up to `batch_size` entities in its state, picks the
//! first matching guard (or the default transition) for each, and counts the
//! entities the transition advanced. Transitions persist their own result;
//! the processor only cleans up leases and records failures.

use crate::error::ProcessError;
use crate::guard::{self, Guard, TransitionFn};
use crate::metrics::Metrics;
use crate::retry::RetryPolicy;
use futures::FutureExt;
use leasehold_core::{Entity, EntityState, Payload};
use leasehold_storage::{EntityStore, StoreError};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Default number of entities leased per `process()` call.
pub const DEFAULT_BATCH_SIZE: usize = 5;

/// Applies transitions to leased entities in one state.
pub struct Processor<P: Payload> {
    name: String,
    store: Arc<dyn EntityStore<P>>,
    state: P::State,
    holder: String,
    batch_size: usize,
    guards: Vec<Guard<P>>,
    process: TransitionFn<P>,
    retry: Option<RetryPolicy>,
    instrument: Option<(String, Arc<Metrics>)>,
}

impl<P: Payload> Processor<P> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> P::State {
        self.state
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Attaches metrics under the owning manager's name.
    pub(crate) fn instrument(&mut self, manager: &str, metrics: Arc<Metrics>) {
        self.instrument = Some((manager.to_string(), metrics));
    }

    /// Leases one batch and applies transitions. Returns how many entities
    /// were advanced.
    pub async fn process(&self) -> usize {
        let batch = match self
            .store
            .lease_next(self.state, self.batch_size, &self.holder)
            .await
        {
            Ok(batch) => batch,
            Err(e) => {
                warn!(
                    processor = %self.name,
                    state = self.state.name(),
                    error = %e,
                    "lease_next failed"
                );
                self.record_failure(e.error_code());
                return 0;
            }
        };

        let mut count = 0;
        for entity in batch {
            if self.apply(entity).await {
                count += 1;
            }
        }

        if count > 0 {
            if let Some((manager, metrics)) = &self.instrument {
                metrics
                    .entities_processed_total
                    .with_label_values(&[manager.as_str(), self.state.name()])
                    .inc_by(count as f64);
            }
        }
        count
    }

    async fn apply(&self, entity: Entity<P>) -> bool {
        let id = entity.id().to_string();

        if let Some(retry) = &self.retry {
            if !retry.is_due(&entity) {
                self.release(&id).await;
                return false;
            }
        }

        let action = match guard::select(&self.guards, &entity) {
            Some(g) => {
                debug!(processor = %self.name, id = %id, guard = g.name(), "guard matched");
                g.action().clone()
            }
            None => self.process.clone(),
        };

        let snapshot = entity.clone();
        let outcome = AssertUnwindSafe(async move { action(entity).await })
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(true)) => true,
            Ok(Ok(false)) => {
                self.release(&id).await;
                false
            }
            Ok(Err(ProcessError::Store(e))) => {
                self.on_store_error(&id, e).await;
                false
            }
            Ok(Err(e @ ProcessError::Unrecoverable(_))) => {
                self.fail(snapshot, e.to_string(), e.reason()).await;
                false
            }
            Err(panic) => {
                let msg = format!("transition panicked: {}", panic_message(&*panic));
                self.fail(snapshot, msg, "PANIC").await;
                false
            }
        }
    }

    async fn on_store_error(&self, id: &str, err: StoreError) {
        match &err {
            StoreError::Conflict { .. } => {
                debug!(processor = %self.name, id, error = %err, "skipped on conflict");
            }
            StoreError::NotFound { .. } => {
                debug!(processor = %self.name, id, "entity vanished during transition");
            }
            StoreError::StorageUnavailable(_) => {
                warn!(processor = %self.name, id, error = %err, "storage unavailable");
                self.record_failure(err.error_code());
                self.release(id).await;
            }
            StoreError::InvalidState { .. } | StoreError::Serialization(_) => {
                warn!(processor = %self.name, id, error = %err, "store rejected transition");
                self.record_failure(err.error_code());
                self.release(id).await;
            }
        }
    }

    /// Records `detail` on the entity and saves it, releasing the lease.
    async fn fail(&self, mut entity: Entity<P>, detail: String, reason: &'static str) {
        error!(
            processor = %self.name,
            id = entity.id(),
            state = entity.state.name(),
            error = %detail,
            "unrecoverable transition failure"
        );
        self.record_failure(reason);

        entity.set_error_detail(detail);
        if let Err(e) = self.store.save(&mut entity).await {
            warn!(
                processor = %self.name,
                id = entity.id(),
                error = %e,
                "could not record failure, breaking lease"
            );
            self.release(entity.id()).await;
        }
    }

    /// Best-effort lease release.
    async fn release(&self, id: &str) {
        if let Err(e) = self.store.break_lease(id, &self.holder).await {
            debug!(processor = %self.name, id, error = %e, "break_lease failed");
        }
    }

    fn record_failure(&self, reason: &str) {
        if let Some((manager, metrics)) = &self.instrument {
            metrics
                .processing_failures_total
                .with_label_values(&[manager.as_str(), reason])
                .inc();
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Builds a [`Processor`].
pub struct ProcessorBuilder<P: Payload> {
    name: String,
    store: Arc<dyn EntityStore<P>>,
    state: P::State,
    holder: Option<String>,
    batch_size: usize,
    guards: Vec<Guard<P>>,
    process: Option<TransitionFn<P>>,
    retry: Option<RetryPolicy>,
}

impl<P: Payload> ProcessorBuilder<P> {
    pub fn new(name: impl Into<String>, store: Arc<dyn EntityStore<P>>, state: P::State) -> Self {
        Self {
            name: name.into(),
            store,
            state,
            holder: None,
            batch_size: DEFAULT_BATCH_SIZE,
            guards: Vec::new(),
            process: None,
            retry: None,
        }
    }

    /// Default transition, used when no guard matches.
    pub fn process(mut self, f: TransitionFn<P>) -> Self {
        self.process = Some(f);
        self
    }

    /// Adds a guard; guards are tried in registration order.
    pub fn guard<F>(
        mut self,
        name: impl Into<String>,
        predicate: F,
        action: TransitionFn<P>,
    ) -> Self
    where
        F: Fn(&Entity<P>) -> bool + Send + Sync + 'static,
    {
        self.guards.push(Guard::new(name, predicate, action));
        self
    }

    pub fn batch_size(mut self, n: usize) -> Self {
        self.batch_size = n.max(1);
        self
    }

    /// Instance to lease as; defaults to the store's holder.
    pub fn holder(mut self, instance: impl Into<String>) -> Self {
        self.holder = Some(instance.into());
        self
    }

    /// Skips entities still inside their retry delay.
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    pub fn build(self) -> Processor<P> {
        let holder = self
            .holder
            .unwrap_or_else(|| self.store.holder().to_string());
        // An entity with no default transition is simply released.
        let process = self
            .process
            .unwrap_or_else(|| guard::transition(|_e: Entity<P>| async { Ok(false) }));
        Processor {
            name: self.name,
            store: self.store,
            state: self.state,
            holder,
            batch_size: self.batch_size,
            guards: self.guards,
            process,
            retry: self.retry,
            instrument: None,
        }
    }
}
