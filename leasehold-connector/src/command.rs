//! Helpers shared by the machines' command modules.

use leasehold_core::{Entity, Payload};
use leasehold_runtime::CommandError;

/// Declares a command struct addressed by `id` plus its [`EntityCommand`]
/// impl.
///
/// [`EntityCommand`]: leasehold_runtime::EntityCommand
macro_rules! entity_command {
    ($(#[$meta:meta])* $name:ident => $label:literal { $($field:ident : $ty:ty),* $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone)]
        pub struct $name {
            pub id: String,
            $(pub $field: $ty,)*
        }

        impl leasehold_runtime::EntityCommand for $name {
            fn entity_id(&self) -> &str {
                &self.id
            }

            fn name(&self) -> &'static str {
                $label
            }
        }
    };
}

pub(crate) use entity_command;

/// `command` is not allowed in the entity's current state.
pub(crate) fn invalid<P: Payload>(entity: &Entity<P>, command: &'static str) -> CommandError {
    CommandError::InvalidState {
        id: entity.id().to_string(),
        command,
        state: entity.state.to_string(),
    }
}

/// Clears the parked flag so the processors lease the entity again. The
/// pending guard is still consulted on the next lease.
pub(crate) fn unpark<P: Payload>(
    entity: &mut Entity<P>,
    command: &'static str,
) -> Result<bool, CommandError> {
    if entity.is_terminal() {
        return Err(invalid(entity, command));
    }
    if !entity.pending {
        return Ok(false);
    }
    entity.set_pending(false);
    Ok(true)
}
