use super::{TransferProcess, TransferState};
use crate::command::{entity_command, invalid, unpark};
use async_trait::async_trait;
use leasehold_core::{Clock, Entity};
use leasehold_runtime::{
    CommandError, CommandHandler, CommandRegistry, EntityCommandHandler, EventBroadcaster,
};
use leasehold_storage::EntityStore;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

type Transfer = Entity<TransferProcess>;

entity_command! {
    /// Ends a running transfer with a reason sent to the counter-party.
    TerminateTransfer => "terminate_transfer" { reason: String }
}

entity_command! {
    SuspendTransfer => "suspend_transfer" {}
}

entity_command! {
    ResumeTransfer => "resume_transfer" {}
}

entity_command! {
    /// Releases the resources of a completed or terminated transfer.
    DeprovisionTransfer => "deprovision_transfer" {}
}

entity_command! {
    /// Releases a transfer parked for manual action.
    UnparkTransfer => "unpark_transfer" {}
}

entity_command! {
    /// A message received from the counter-party.
    TransferNotification => "transfer_notification" { update: TransferUpdate }
}

/// What the counter-party reported about a transfer.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferUpdate {
    Started,
    Completed,
    Suspended { reason: String },
    Terminated { reason: String },
}

impl TransferUpdate {
    fn label(&self) -> &'static str {
        match self {
            TransferUpdate::Started => "started",
            TransferUpdate::Completed => "completed",
            TransferUpdate::Suspended { .. } => "suspended",
            TransferUpdate::Terminated { .. } => "terminated",
        }
    }
}

/// Handler for transfer command `C`.
pub struct TransferHandler<C> {
    clock: Arc<dyn Clock>,
    _command: PhantomData<fn() -> C>,
}

impl<C> TransferHandler<C> {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            _command: PhantomData,
        }
    }
}

#[async_trait]
impl CommandHandler for TransferHandler<TerminateTransfer> {
    type Command = TerminateTransfer;
    type Payload = TransferProcess;

    fn modify(&self, entity: &mut Transfer, c: &TerminateTransfer) -> Result<bool, CommandError> {
        use TransferState::*;

        match entity.state {
            Terminating => Ok(false),
            Completed | Terminated | Deprovisioning | Deprovisioned | Error => {
                Err(invalid(entity, "terminate_transfer"))
            }
            _ => {
                let now = self.clock.now_millis();
                entity.transition_with_error(Terminating, c.reason.clone(), now);
                Ok(true)
            }
        }
    }
}

#[async_trait]
impl CommandHandler for TransferHandler<SuspendTransfer> {
    type Command = SuspendTransfer;
    type Payload = TransferProcess;

    fn modify(&self, entity: &mut Transfer, _c: &SuspendTransfer) -> Result<bool, CommandError> {
        if entity.state != TransferState::Started {
            return Err(invalid(entity, "suspend_transfer"));
        }
        entity.transition_to(TransferState::Suspending, self.clock.now_millis());
        Ok(true)
    }
}

#[async_trait]
impl CommandHandler for TransferHandler<ResumeTransfer> {
    type Command = ResumeTransfer;
    type Payload = TransferProcess;

    fn modify(&self, entity: &mut Transfer, _c: &ResumeTransfer) -> Result<bool, CommandError> {
        if entity.state != TransferState::Suspended {
            return Err(invalid(entity, "resume_transfer"));
        }
        entity.transition_to(TransferState::Starting, self.clock.now_millis());
        Ok(true)
    }
}

#[async_trait]
impl CommandHandler for TransferHandler<DeprovisionTransfer> {
    type Command = DeprovisionTransfer;
    type Payload = TransferProcess;

    fn modify(
        &self,
        entity: &mut Transfer,
        _c: &DeprovisionTransfer,
    ) -> Result<bool, CommandError> {
        match entity.state {
            TransferState::Deprovisioning => Ok(false),
            TransferState::Completed | TransferState::Terminated => {
                entity.transition_to(TransferState::Deprovisioning, self.clock.now_millis());
                Ok(true)
            }
            _ => Err(invalid(entity, "deprovision_transfer")),
        }
    }
}

#[async_trait]
impl CommandHandler for TransferHandler<UnparkTransfer> {
    type Command = UnparkTransfer;
    type Payload = TransferProcess;

    fn modify(&self, entity: &mut Transfer, _c: &UnparkTransfer) -> Result<bool, CommandError> {
        unpark(entity, "unpark_transfer")
    }
}

#[async_trait]
impl CommandHandler for TransferHandler<TransferNotification> {
    type Command = TransferNotification;
    type Payload = TransferProcess;

    fn modify(
        &self,
        entity: &mut Transfer,
        c: &TransferNotification,
    ) -> Result<bool, CommandError> {
        use TransferState::*;

        let now = self.clock.now_millis();
        match (&c.update, entity.state) {
            (TransferUpdate::Started, Requested | Suspended) => {
                entity.transition_to(Started, now)
            }
            (TransferUpdate::Completed, Started | Suspended) => {
                entity.transition_to(Completed, now)
            }
            (TransferUpdate::Suspended { reason }, Started) => {
                entity.transition_with_error(Suspended, reason.clone(), now)
            }
            (TransferUpdate::Terminated { reason }, state)
                if !entity.is_terminal() && state != Terminated =>
            {
                entity.transition_with_error(Terminated, reason.clone(), now)
            }
            _ => return Err(invalid(entity, c.update.label())),
        }
        Ok(true)
    }
}

/// Registers every transfer command with `registry`.
pub fn register(
    registry: &mut CommandRegistry,
    store: Arc<dyn EntityStore<TransferProcess>>,
    clock: Arc<dyn Clock>,
    max_attempts: u32,
    events: Arc<EventBroadcaster>,
) {
    fn handler<C>(
        store: &Arc<dyn EntityStore<TransferProcess>>,
        clock: &Arc<dyn Clock>,
        max_attempts: u32,
        events: &Arc<EventBroadcaster>,
    ) -> EntityCommandHandler<TransferHandler<C>>
    where
        TransferHandler<C>: CommandHandler<Payload = TransferProcess>,
    {
        EntityCommandHandler::new(TransferHandler::<C>::new(clock.clone()), store.clone())
            .max_attempts(max_attempts)
            .retry_backoff(Duration::from_millis(10))
            .events(events.clone())
    }

    registry.register(handler::<TerminateTransfer>(&store, &clock, max_attempts, &events));
    registry.register(handler::<SuspendTransfer>(&store, &clock, max_attempts, &events));
    registry.register(handler::<ResumeTransfer>(&store, &clock, max_attempts, &events));
    registry.register(handler::<DeprovisionTransfer>(&store, &clock, max_attempts, &events));
    registry.register(handler::<UnparkTransfer>(&store, &clock, max_attempts, &events));
    registry.register(handler::<TransferNotification>(&store, &clock, max_attempts, &events));
}
