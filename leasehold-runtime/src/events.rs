//! Broadcast of persisted entity transitions.
//!
//! Observers are in-process only. A lagging receiver loses the oldest events
//! (`broadcast` semantics); nothing here is durable.

use dashmap::DashMap;
use leasehold_core::{Entity, EntityState, Payload};
use serde::Serialize;
use tokio::sync::broadcast;

/// A state change that has been saved.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityEvent {
    pub entity_type: &'static str,
    pub entity_id: String,
    pub from_state: String,
    pub to_state: String,
    pub version: u64,
    /// `updated_at` of the saved entity.
    pub timestamp: i64,
    pub error_detail: Option<String>,
    /// The entity reached a terminal state; no further events follow.
    pub terminal: bool,
}

impl EntityEvent {
    /// Describes `entity` as just saved after leaving `from`.
    pub fn transition<P: Payload>(entity: &Entity<P>, from: P::State) -> Self {
        Self {
            entity_type: P::ENTITY_TYPE,
            entity_id: entity.id().to_string(),
            from_state: from.name().to_string(),
            to_state: entity.state.name().to_string(),
            version: entity.version(),
            timestamp: entity.updated_at(),
            error_detail: entity.error_detail.clone(),
            terminal: entity.is_terminal(),
        }
    }
}

/// Filter for [`EventBroadcaster::subscribe_all`].
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Only these entity types (empty = all).
    pub entity_types: Vec<String>,
    /// Only transitions into these states (empty = all).
    pub to_states: Vec<String>,
}

impl EventFilter {
    pub fn matches(&self, event: &EntityEvent) -> bool {
        (self.entity_types.is_empty() || self.entity_types.iter().any(|t| t == event.entity_type))
            && (self.to_states.is_empty() || self.to_states.contains(&event.to_state))
    }
}

/// Filtered view over the global channel.
pub struct EventSubscription {
    receiver: broadcast::Receiver<EntityEvent>,
    filter: EventFilter,
}

impl EventSubscription {
    /// Waits for the next matching event; `None` once the broadcaster is
    /// dropped.
    pub async fn recv(&mut self) -> Option<EntityEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if self.filter.matches(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Per-entity channel key: ids are only unique within an entity type.
type ChannelKey = (String, String);

fn key(entity_type: &str, entity_id: &str) -> ChannelKey {
    (entity_type.to_string(), entity_id.to_string())
}

/// Fans out entity events to observers.
pub struct EventBroadcaster {
    /// Per-entity channels, created on first subscription and dropped once
    /// the entity goes terminal or its subscribers are gone.
    channels: DashMap<ChannelKey, broadcast::Sender<EntityEvent>>,
    global_sender: broadcast::Sender<EntityEvent>,
    channel_capacity: usize,
}

impl EventBroadcaster {
    pub fn new(channel_capacity: usize) -> Self {
        let (global_sender, _) = broadcast::channel(channel_capacity);
        Self {
            channels: DashMap::new(),
            global_sender,
            channel_capacity,
        }
    }

    /// Subscribes to one entity's events. The receiver closes after the
    /// entity's terminal event.
    pub fn subscribe_entity(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> broadcast::Receiver<EntityEvent> {
        self.prune();
        self.channels
            .entry(key(entity_type, entity_id))
            .or_insert_with(|| broadcast::channel(self.channel_capacity).0)
            .subscribe()
    }

    /// Drops channels nobody listens to any more.
    pub fn prune(&self) {
        self.channels.retain(|_, sender| sender.receiver_count() > 0);
    }

    /// Subscribes to every event passing `filter`.
    pub fn subscribe_all(&self, filter: EventFilter) -> EventSubscription {
        EventSubscription {
            receiver: self.global_sender.subscribe(),
            filter,
        }
    }

    /// Sends to the entity channel and the global channel.
    pub fn notify(&self, event: EntityEvent) {
        let key = key(event.entity_type, &event.entity_id);
        let mut drop_channel = false;
        if let Some(sender) = self.channels.get(&key) {
            drop_channel = sender.send(event.clone()).is_err();
        }
        if event.terminal {
            self.channels.remove(&key);
        } else if drop_channel {
            self.channels
                .remove_if(&key, |_, sender| sender.receiver_count() == 0);
        }

        tracing::trace!(
            entity_type = event.entity_type,
            id = %event.entity_id,
            from = %event.from_state,
            to = %event.to_state,
            "entity event"
        );
        let _ = self.global_sender.send(event);
    }

    /// Number of entities with a dedicated channel.
    pub fn entity_channel_count(&self) -> usize {
        self.channels.len()
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new(1024)
    }
}
