use super::{ContractNegotiation, NegotiationState};
use crate::command::{entity_command, invalid, unpark};
use crate::model::{ContractAgreement, ContractOffer, Role};
use async_trait::async_trait;
use leasehold_core::{Clock, Entity, EntityState};
use leasehold_runtime::{
    CommandError, CommandHandler, CommandRegistry, EntityCommandHandler, EventBroadcaster,
};
use leasehold_storage::EntityStore;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

type Negotiation = Entity<ContractNegotiation>;

entity_command! {
    /// Ends a live negotiation; it terminates with reason "Cancelled".
    CancelNegotiation => "cancel_negotiation" {}
}

entity_command! {
    /// Rejects a negotiation outright; it moves straight to ERROR.
    DeclineNegotiation => "decline_negotiation" {}
}

entity_command! {
    /// Ends a live negotiation with a caller-supplied reason.
    TerminateNegotiation => "terminate_negotiation" { reason: String }
}

entity_command! {
    /// Consumer accepts the provider's offer.
    ApproveNegotiation => "approve_negotiation" {}
}

entity_command! {
    /// Provider agrees to the consumer's request.
    AgreeNegotiation => "agree_negotiation" {}
}

entity_command! {
    /// Releases a negotiation parked for manual action.
    UnparkNegotiation => "unpark_negotiation" {}
}

entity_command! {
    /// A message received from the counter-party.
    NegotiationNotification => "negotiation_notification" { update: NegotiationUpdate }
}

/// What the counter-party reported.
#[derive(Debug, Clone, PartialEq)]
pub enum NegotiationUpdate {
    /// Provider made an offer (consumer side).
    Offered { offer: ContractOffer },
    /// Consumer accepted the offer (provider side).
    Approved,
    /// Provider sent the agreement (consumer side).
    Agreed { agreement: ContractAgreement },
    /// Consumer verified the agreement (provider side).
    Verified,
    /// Provider finalized (consumer side).
    Finalized,
    /// Either side terminated.
    Terminated { reason: String },
}

impl NegotiationUpdate {
    fn label(&self) -> &'static str {
        match self {
            NegotiationUpdate::Offered { .. } => "offered",
            NegotiationUpdate::Approved => "approved",
            NegotiationUpdate::Agreed { .. } => "agreed",
            NegotiationUpdate::Verified => "verified",
            NegotiationUpdate::Finalized => "finalized",
            NegotiationUpdate::Terminated { .. } => "terminated",
        }
    }
}

/// Handler for negotiation command `C`.
pub struct NegotiationHandler<C> {
    clock: Arc<dyn Clock>,
    _command: PhantomData<fn() -> C>,
}

impl<C> NegotiationHandler<C> {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            _command: PhantomData,
        }
    }
}

/// Moves a live negotiation to TERMINATING with `reason`.
fn terminate(
    entity: &mut Negotiation,
    reason: &str,
    command: &'static str,
    now: i64,
) -> Result<bool, CommandError> {
    if entity.is_terminal() {
        return Err(invalid(entity, command));
    }
    if entity.state == NegotiationState::Terminating {
        return Ok(false);
    }
    entity.transition_with_error(NegotiationState::Terminating, reason, now);
    Ok(true)
}

fn require_role(
    entity: &Negotiation,
    role: Role,
    command: &'static str,
) -> Result<(), CommandError> {
    if entity.payload.role == role {
        Ok(())
    } else {
        Err(CommandError::Rejected(format!(
            "{command} is a {} operation, negotiation {} is {}",
            role.as_str(),
            entity.id(),
            entity.payload.role.as_str()
        )))
    }
}

#[async_trait]
impl CommandHandler for NegotiationHandler<CancelNegotiation> {
    type Command = CancelNegotiation;
    type Payload = ContractNegotiation;

    fn modify(
        &self,
        entity: &mut Negotiation,
        _c: &CancelNegotiation,
    ) -> Result<bool, CommandError> {
        terminate(entity, "Cancelled", "cancel_negotiation", self.clock.now_millis())
    }
}

#[async_trait]
impl CommandHandler for NegotiationHandler<DeclineNegotiation> {
    type Command = DeclineNegotiation;
    type Payload = ContractNegotiation;

    fn modify(
        &self,
        entity: &mut Negotiation,
        _c: &DeclineNegotiation,
    ) -> Result<bool, CommandError> {
        if entity.is_terminal() {
            return Err(invalid(entity, "decline_negotiation"));
        }
        entity.transition_with_error(NegotiationState::Error, "Declined", self.clock.now_millis());
        Ok(true)
    }
}

#[async_trait]
impl CommandHandler for NegotiationHandler<TerminateNegotiation> {
    type Command = TerminateNegotiation;
    type Payload = ContractNegotiation;

    fn modify(
        &self,
        entity: &mut Negotiation,
        c: &TerminateNegotiation,
    ) -> Result<bool, CommandError> {
        terminate(entity, &c.reason, "terminate_negotiation", self.clock.now_millis())
    }
}

#[async_trait]
impl CommandHandler for NegotiationHandler<ApproveNegotiation> {
    type Command = ApproveNegotiation;
    type Payload = ContractNegotiation;

    fn modify(
        &self,
        entity: &mut Negotiation,
        _c: &ApproveNegotiation,
    ) -> Result<bool, CommandError> {
        require_role(entity, Role::Consumer, "approve_negotiation")?;
        if entity.state != NegotiationState::Offered {
            return Err(invalid(entity, "approve_negotiation"));
        }
        entity.transition_to(NegotiationState::Approving, self.clock.now_millis());
        Ok(true)
    }
}

#[async_trait]
impl CommandHandler for NegotiationHandler<AgreeNegotiation> {
    type Command = AgreeNegotiation;
    type Payload = ContractNegotiation;

    fn modify(
        &self,
        entity: &mut Negotiation,
        _c: &AgreeNegotiation,
    ) -> Result<bool, CommandError> {
        require_role(entity, Role::Provider, "agree_negotiation")?;
        match entity.state {
            NegotiationState::Requested | NegotiationState::Approved => {
                entity.transition_to(NegotiationState::Agreeing, self.clock.now_millis());
                Ok(true)
            }
            _ => Err(invalid(entity, "agree_negotiation")),
        }
    }
}

#[async_trait]
impl CommandHandler for NegotiationHandler<UnparkNegotiation> {
    type Command = UnparkNegotiation;
    type Payload = ContractNegotiation;

    fn modify(
        &self,
        entity: &mut Negotiation,
        _c: &UnparkNegotiation,
    ) -> Result<bool, CommandError> {
        unpark(entity, "unpark_negotiation")
    }
}

#[async_trait]
impl CommandHandler for NegotiationHandler<NegotiationNotification> {
    type Command = NegotiationNotification;
    type Payload = ContractNegotiation;

    fn modify(
        &self,
        entity: &mut Negotiation,
        c: &NegotiationNotification,
    ) -> Result<bool, CommandError> {
        use NegotiationState::*;

        let now = self.clock.now_millis();
        let label = c.update.label();
        let role = entity.payload.role;

        // Mirror the counter-party, then step into the follow-up state the
        // processors pick up.
        match (&c.update, role, entity.state) {
            (NegotiationUpdate::Offered { offer }, Role::Consumer, Requesting | Requested) => {
                entity.payload.offer = offer.clone();
                entity.transition_to(Offered, now);
            }
            (NegotiationUpdate::Approved, Role::Provider, Offered) => {
                entity.transition_to(Approved, now);
                entity.transition_to(Agreeing, now);
            }
            (
                NegotiationUpdate::Agreed { agreement },
                Role::Consumer,
                Requested | Approving | Approved,
            ) => {
                entity.payload.agreement = Some(agreement.clone());
                entity.transition_to(Agreed, now);
                entity.transition_to(Verifying, now);
            }
            (NegotiationUpdate::Verified, Role::Provider, Agreed) => {
                entity.transition_to(Verified, now);
                entity.transition_to(Finalizing, now);
            }
            (NegotiationUpdate::Finalized, Role::Consumer, Verifying | Verified) => {
                entity.transition_to(Finalized, now);
            }
            (NegotiationUpdate::Terminated { reason }, _, state) if !state.is_terminal() => {
                entity.transition_with_error(Terminated, reason.clone(), now);
            }
            _ => return Err(invalid(entity, label)),
        }
        Ok(true)
    }
}

/// Registers every negotiation command with `registry`.
pub fn register(
    registry: &mut CommandRegistry,
    store: Arc<dyn EntityStore<ContractNegotiation>>,
    clock: Arc<dyn Clock>,
    max_attempts: u32,
    events: Arc<EventBroadcaster>,
) {
    fn handler<C>(
        store: &Arc<dyn EntityStore<ContractNegotiation>>,
        clock: &Arc<dyn Clock>,
        max_attempts: u32,
        events: &Arc<EventBroadcaster>,
    ) -> EntityCommandHandler<NegotiationHandler<C>>
    where
        NegotiationHandler<C>: CommandHandler<Payload = ContractNegotiation>,
    {
        EntityCommandHandler::new(NegotiationHandler::<C>::new(clock.clone()), store.clone())
            .max_attempts(max_attempts)
            .retry_backoff(Duration::from_millis(10))
            .events(events.clone())
    }

    registry.register(handler::<CancelNegotiation>(&store, &clock, max_attempts, &events));
    registry.register(handler::<DeclineNegotiation>(&store, &clock, max_attempts, &events));
    registry.register(handler::<TerminateNegotiation>(&store, &clock, max_attempts, &events));
    registry.register(handler::<ApproveNegotiation>(&store, &clock, max_attempts, &events));
    registry.register(handler::<AgreeNegotiation>(&store, &clock, max_attempts, &events));
    registry.register(handler::<UnparkNegotiation>(&store, &clock, max_attempts, &events));
    registry.register(handler::<NegotiationNotification>(&store, &clock, max_attempts, &events));
}
