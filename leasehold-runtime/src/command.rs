//! Out-of-band commands.
//!
//! A command changes one entity outside the poll loop (cancel, decline,
//! terminate, counter-party notifications). [`EntityCommandHandler`] runs
//! the find/modify/save cycle with optimistic-concurrency retries;
//! [`CommandRegistry`] routes a command to its handler by type.

use crate::error::CommandError;
use crate::events::{EntityEvent, EventBroadcaster};
use crate::metrics::Metrics;
use async_trait::async_trait;
use leasehold_core::{Entity, EntityState, Payload};
use leasehold_storage::EntityStore;
use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default find/modify/save attempts before a conflict is surfaced.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// A command addressed to one entity.
pub trait EntityCommand: Send + Sync + 'static {
    fn entity_id(&self) -> &str;

    /// Stable name for logs and metrics.
    fn name(&self) -> &'static str;
}

/// Domain logic of one command type.
#[async_trait]
pub trait CommandHandler: Send + Sync + 'static {
    type Command: EntityCommand;
    type Payload: Payload;

    /// Applies `command` to a freshly read entity. Returns `Ok(false)` when
    /// nothing changed. May run several times if saves conflict.
    fn modify(
        &self,
        entity: &mut Entity<Self::Payload>,
        command: &Self::Command,
    ) -> Result<bool, CommandError>;

    /// Runs once after a successful save.
    async fn post_actions(&self, _entity: &Entity<Self::Payload>, _command: &Self::Command) {}
}

/// Result of an executed command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    pub entity_id: String,
    /// Whether the entity was modified and saved.
    pub changed: bool,
    /// State after the command.
    pub state: String,
    /// Stored version after the command.
    pub version: u64,
    /// Save attempts used.
    pub attempts: u32,
}

/// Generic executor for a [`CommandHandler`].
pub struct EntityCommandHandler<H: CommandHandler> {
    handler: H,
    store: Arc<dyn EntityStore<H::Payload>>,
    max_attempts: u32,
    retry_backoff: Duration,
    events: Option<Arc<EventBroadcaster>>,
}

impl<H: CommandHandler> EntityCommandHandler<H> {
    pub fn new(handler: H, store: Arc<dyn EntityStore<H::Payload>>) -> Self {
        Self {
            handler,
            store,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_backoff: Duration::from_millis(10),
            events: None,
        }
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Pause before re-reading after a conflict, multiplied by the attempt.
    pub fn retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn events(mut self, events: Arc<EventBroadcaster>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub async fn execute(&self, command: &H::Command) -> Result<CommandOutcome, CommandError> {
        let id = command.entity_id();

        for attempt in 1..=self.max_attempts {
            let mut entity = self.store.find(id).await?;
            let from = entity.state;

            if !self.handler.modify(&mut entity, command)? {
                debug!(command = command.name(), id, "command changed nothing");
                return Ok(outcome(&entity, false, attempt));
            }

            match self.store.save(&mut entity).await {
                Ok(()) => {
                    info!(
                        command = command.name(),
                        id,
                        from = from.name(),
                        to = entity.state.name(),
                        "command applied"
                    );
                    if let Some(events) = &self.events {
                        events.notify(EntityEvent::transition(&entity, from));
                    }
                    self.handler.post_actions(&entity, command).await;
                    return Ok(outcome(&entity, true, attempt));
                }
                Err(e) if e.is_conflict() => {
                    debug!(command = command.name(), id, attempt, error = %e, "command conflicted");
                    if attempt < self.max_attempts && !self.retry_backoff.is_zero() {
                        tokio::time::sleep(self.retry_backoff * attempt).await;
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        warn!(
            command = command.name(),
            id,
            attempts = self.max_attempts,
            "command gave up after repeated conflicts"
        );
        Err(CommandError::Conflict {
            id: id.to_string(),
            attempts: self.max_attempts,
        })
    }
}

fn outcome<P: Payload>(entity: &Entity<P>, changed: bool, attempts: u32) -> CommandOutcome {
    CommandOutcome {
        entity_id: entity.id().to_string(),
        changed,
        state: entity.state.name().to_string(),
        version: entity.version(),
        attempts,
    }
}

/// Type-erased handler stored in the registry.
#[async_trait]
trait ErasedHandler: Send + Sync {
    async fn execute_boxed(
        &self,
        command: Box<dyn Any + Send>,
    ) -> Result<CommandOutcome, CommandError>;
}

#[async_trait]
impl<H: CommandHandler> ErasedHandler for EntityCommandHandler<H> {
    async fn execute_boxed(
        &self,
        command: Box<dyn Any + Send>,
    ) -> Result<CommandOutcome, CommandError> {
        let command = command
            .downcast::<H::Command>()
            .map_err(|_| CommandError::NoHandler(type_name::<H::Command>()))?;
        self.execute(&command).await
    }
}

/// Routes commands to handlers by command type.
#[derive(Default)]
pub struct CommandRegistry {
    handlers: HashMap<TypeId, Box<dyn ErasedHandler>>,
    metrics: Option<Arc<Metrics>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Registers `handler` for its command type, replacing any previous one.
    pub fn register<H: CommandHandler>(&mut self, handler: EntityCommandHandler<H>) {
        self.handlers
            .insert(TypeId::of::<H::Command>(), Box::new(handler));
    }

    pub fn is_registered<C: EntityCommand>(&self) -> bool {
        self.handlers.contains_key(&TypeId::of::<C>())
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Executes `command` with its registered handler.
    pub async fn execute<C: EntityCommand>(
        &self,
        command: C,
    ) -> Result<CommandOutcome, CommandError> {
        let name = command.name();
        self.execute_boxed(TypeId::of::<C>(), type_name::<C>(), name, Box::new(command))
            .await
    }

    pub(crate) async fn execute_boxed(
        &self,
        type_id: TypeId,
        command_type: &'static str,
        name: &'static str,
        command: Box<dyn Any + Send>,
    ) -> Result<CommandOutcome, CommandError> {
        let result = match self.handlers.get(&type_id) {
            Some(handler) => handler.execute_boxed(command).await,
            None => Err(CommandError::NoHandler(command_type)),
        };

        if let Some(metrics) = &self.metrics {
            let label = match &result {
                Ok(_) => "ok",
                Err(e) => e.error_code(),
            };
            metrics.commands_total.with_label_values(&[name, label]).inc();
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{clock, seed, store, task, Task, TaskState, START};
    use leasehold_core::{Clock, ManualClock};
    use leasehold_storage::{InMemoryEntityStore, QuerySpec, StoreError};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct Finish {
        id: String,
    }

    impl EntityCommand for Finish {
        fn entity_id(&self) -> &str {
            &self.id
        }

        fn name(&self) -> &'static str {
            "finish"
        }
    }

    struct FinishHandler {
        clock: Arc<ManualClock>,
        post: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl CommandHandler for FinishHandler {
        type Command = Finish;
        type Payload = Task;

        fn modify(&self, entity: &mut Entity<Task>, _c: &Finish) -> Result<bool, CommandError> {
            match entity.state {
                TaskState::Done => Ok(false),
                TaskState::Failed => Err(CommandError::InvalidState {
                    id: entity.id().to_string(),
                    command: "finish",
                    state: entity.state.to_string(),
                }),
                _ => {
                    entity.transition_to(TaskState::Done, self.clock.now_millis());
                    Ok(true)
                }
            }
        }

        async fn post_actions(&self, _entity: &Entity<Task>, _command: &Finish) {
            self.post.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn handler(
        store: &Arc<InMemoryEntityStore<Task>>,
        clock: Arc<ManualClock>,
    ) -> (EntityCommandHandler<FinishHandler>, Arc<AtomicUsize>) {
        let post = Arc::new(AtomicUsize::new(0));
        let h = EntityCommandHandler::new(
            FinishHandler {
                clock,
                post: post.clone(),
            },
            store.clone(),
        );
        (h, post)
    }

    #[tokio::test]
    async fn test_execute_saves_and_runs_post_actions() {
        let clock = clock();
        let store = store(clock.clone());
        seed(&store, 1, TaskState::Working).await;
        let before = store.find("t-000").await.unwrap();
        clock.advance(10);

        let (h, post) = handler(&store, clock);
        let events = Arc::new(EventBroadcaster::new(8));
        let mut rx = events.subscribe_entity("task", "t-000");
        let h = h.events(events);

        let out = h.execute(&Finish { id: "t-000".into() }).await.unwrap();
        assert!(out.changed);
        assert_eq!(out.state, "Done");
        assert_eq!(out.version, before.version() + 1);
        assert_eq!(post.load(Ordering::SeqCst), 1);

        let after = store.find("t-000").await.unwrap();
        assert!(after.updated_at() > before.updated_at());
        let ev = rx.recv().await.unwrap();
        assert_eq!((ev.from_state.as_str(), ev.to_state.as_str()), ("Working", "Done"));
    }

    #[tokio::test]
    async fn test_missing_entity_is_not_found_and_store_unchanged() {
        let clock = clock();
        let store = store(clock.clone());
        seed(&store, 2, TaskState::Working).await;
        let (h, post) = handler(&store, clock);

        let err = h.execute(&Finish { id: "nope".into() }).await.unwrap_err();
        assert!(matches!(&err, CommandError::NotFound { id } if id == "nope"));
        assert_eq!(store.len(), 2);
        assert_eq!(post.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unchanged_skips_save() {
        let clock = clock();
        let store = store(clock.clone());
        let mut e = task("t-1", TaskState::Done, START);
        store.save(&mut e).await.unwrap();
        let (h, post) = handler(&store, clock);

        let out = h.execute(&Finish { id: "t-1".into() }).await.unwrap();
        assert!(!out.changed);
        assert_eq!(out.version, 1);
        assert_eq!(post.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_modify_rejection_propagates() {
        let clock = clock();
        let store = store(clock.clone());
        let mut e = task("t-1", TaskState::Failed, START);
        store.save(&mut e).await.unwrap();
        let (h, _) = handler(&store, clock);

        let err = h.execute(&Finish { id: "t-1".into() }).await.unwrap_err();
        assert_eq!(err.error_code(), "INVALID_STATE");
    }

    #[tokio::test]
    async fn test_foreign_lease_exhausts_attempts() {
        let clock = clock();
        let store = store(clock.clone());
        seed(&store, 1, TaskState::Working).await;
        let other = store.for_instance("node-2");
        other
            .lease_next(TaskState::Working, 1, "node-2")
            .await
            .unwrap();

        let (h, _) = handler(&store, clock);
        let h = h.max_attempts(2).retry_backoff(Duration::ZERO);
        let err = h.execute(&Finish { id: "t-000".into() }).await.unwrap_err();
        assert!(matches!(err, CommandError::Conflict { attempts: 2, .. }));
        assert_eq!(store.find("t-000").await.unwrap().state, TaskState::Working);
    }

    /// Lets another writer update the entity once, right before the first
    /// save goes through.
    struct RacingStore {
        inner: Arc<InMemoryEntityStore<Task>>,
        raced: AtomicBool,
    }

    #[async_trait]
    impl EntityStore<Task> for RacingStore {
        fn holder(&self) -> &str {
            self.inner.holder()
        }

        async fn find(&self, id: &str) -> Result<Entity<Task>, StoreError> {
            self.inner.find(id).await
        }

        async fn save(&self, entity: &mut Entity<Task>) -> Result<(), StoreError> {
            if !self.raced.swap(true, Ordering::SeqCst) {
                let mut other = self.inner.find(entity.id()).await?;
                other.payload.note = "edited concurrently".into();
                self.inner.save(&mut other).await?;
            }
            self.inner.save(entity).await
        }

        async fn lease_next(
            &self,
            state: TaskState,
            max: usize,
            for_instance: &str,
        ) -> Result<Vec<Entity<Task>>, StoreError> {
            self.inner.lease_next(state, max, for_instance).await
        }

        async fn query(
            &self,
            spec: &QuerySpec<TaskState>,
        ) -> Result<Vec<Entity<Task>>, StoreError> {
            self.inner.query(spec).await
        }

        async fn break_lease(&self, id: &str, instance: &str) -> Result<(), StoreError> {
            self.inner.break_lease(id, instance).await
        }

        async fn delete(&self, id: &str) -> Result<(), StoreError> {
            self.inner.delete(id).await
        }
    }

    #[tokio::test]
    async fn test_version_conflict_rereads_and_succeeds() {
        let clock = clock();
        let inner = store(clock.clone());
        seed(&inner, 1, TaskState::Working).await;
        let before = inner.find("t-000").await.unwrap();

        let racing = Arc::new(RacingStore {
            inner: inner.clone(),
            raced: AtomicBool::new(false),
        });
        let post = Arc::new(AtomicUsize::new(0));
        let h = EntityCommandHandler::new(
            FinishHandler {
                clock,
                post: post.clone(),
            },
            racing,
        )
        .retry_backoff(Duration::ZERO);

        let out = h.execute(&Finish { id: "t-000".into() }).await.unwrap();
        assert!(out.changed);
        assert_eq!(out.attempts, 2);
        assert_eq!(post.load(Ordering::SeqCst), 1);

        let after = inner.find("t-000").await.unwrap();
        assert_eq!(after.state, TaskState::Done);
        assert_eq!(after.payload.note, "edited concurrently");
        assert_eq!(after.version(), before.version() + 2);
    }

    #[tokio::test]
    async fn test_registry_routes_by_type() {
        struct Unknown;
        impl EntityCommand for Unknown {
            fn entity_id(&self) -> &str {
                "t-000"
            }
            fn name(&self) -> &'static str {
                "unknown"
            }
        }

        let clock = clock();
        let store = store(clock.clone());
        seed(&store, 1, TaskState::Ready).await;
        let metrics = Arc::new(Metrics::new().unwrap());

        let mut registry = CommandRegistry::new().with_metrics(metrics.clone());
        let (h, _) = handler(&store, clock);
        registry.register(h);
        assert!(registry.is_registered::<Finish>());
        assert!(!registry.is_registered::<Unknown>());

        let out = registry.execute(Finish { id: "t-000".into() }).await.unwrap();
        assert_eq!(out.state, "Done");

        let err = registry.execute(Unknown).await.unwrap_err();
        assert!(matches!(err, CommandError::NoHandler(_)));

        let encoded = String::from_utf8(metrics.encode().unwrap()).unwrap();
        assert!(encoded.contains("leasehold_commands_total{command=\"finish\",outcome=\"ok\"} 1"));
        assert!(encoded
            .contains("leasehold_commands_total{command=\"unknown\",outcome=\"NO_HANDLER\"} 1"));
    }
}
