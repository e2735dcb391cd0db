//! Stateful entity model.

use crate::error::EntityError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::{Debug, Display};
use std::hash::Hash;

/// Maximum accepted entity id length.
pub const MAX_ID_LEN: usize = 256;

/// A finite state set with stable integer codes.
///
/// Implement it with [`entity_states!`](crate::entity_states) rather than by
/// hand; the macro keeps codes, names, and terminal flags in one table.
pub trait EntityState:
    Copy + Eq + Hash + Debug + Display + Send + Sync + Serialize + DeserializeOwned + 'static
{
    /// Persisted integer code.
    fn code(self) -> i32;

    /// Decodes a persisted code.
    fn from_code(code: i32) -> Option<Self>;

    /// Variant name, for logs and metrics labels.
    fn name(self) -> &'static str;

    /// No engine-driven transition leaves a terminal state.
    fn is_terminal(self) -> bool;

    /// Every state, in declaration order.
    fn all() -> &'static [Self];
}

/// Decodes a state code into `S`, failing with a typed error.
pub fn parse_state<S: EntityState>(entity_type: &'static str, code: i32) -> Result<S, EntityError> {
    S::from_code(code).ok_or(EntityError::UnknownStateCode { entity_type, code })
}

/// Domain fields carried by an entity.
pub trait Payload: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static {
    /// The machine's state set.
    type State: EntityState;

    /// Entity type name used in logs, metrics, and events.
    const ENTITY_TYPE: &'static str;

    /// State a freshly built entity starts in unless overridden.
    const INITIAL_STATE: Self::State;
}

/// Declares a state enum with integer codes.
///
/// ```
/// leasehold_core::entity_states! {
///     pub enum JobState {
///         Queued = 10,
///         Running = 20,
///         Done = 30 => terminal,
///         Failed = -1 => terminal,
///     }
/// }
///
/// use leasehold_core::EntityState;
/// assert_eq!(JobState::Running.code(), 20);
/// assert!(JobState::Failed.is_terminal());
/// ```
#[macro_export]
macro_rules! entity_states {
    (@terminal terminal) => { true };
    (@terminal) => { false };
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident {
            $(
                $(#[$vmeta:meta])*
                $variant:ident = $code:literal $(=> $term:ident)?
            ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        $vis enum $name {
            $(
                $(#[$vmeta])*
                $variant,
            )+
        }

        impl $crate::EntityState for $name {
            fn code(self) -> i32 {
                match self {
                    $( $name::$variant => $code, )+
                }
            }

            fn from_code(code: i32) -> Option<Self> {
                match code {
                    $( $code => Some($name::$variant), )+
                    _ => None,
                }
            }

            fn name(self) -> &'static str {
                match self {
                    $( $name::$variant => stringify!($variant), )+
                }
            }

            fn is_terminal(self) -> bool {
                match self {
                    $( $name::$variant => $crate::entity_states!(@terminal $($term)?), )+
                }
            }

            fn all() -> &'static [Self] {
                &[ $( $name::$variant, )+ ]
            }
        }

        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                f.write_str($crate::EntityState::name(*self))
            }
        }

        impl $crate::__serde::Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> ::std::result::Result<S::Ok, S::Error>
            where
                S: $crate::__serde::Serializer,
            {
                serializer.serialize_i32($crate::EntityState::code(*self))
            }
        }

        impl<'de> $crate::__serde::Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> ::std::result::Result<Self, D::Error>
            where
                D: $crate::__serde::Deserializer<'de>,
            {
                let code = <i32 as $crate::__serde::Deserialize>::deserialize(deserializer)?;
                <$name as $crate::EntityState>::from_code(code).ok_or_else(|| {
                    <D::Error as $crate::__serde::de::Error>::custom(format!(
                        "unknown {} code {}",
                        stringify!($name),
                        code
                    ))
                })
            }
        }
    };
}

/// A persisted record driven through a finite state machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct Entity<P: Payload> {
    id: String,

    /// Current state.
    pub state: P::State,

    /// Time of the last state change (Unix millis). FIFO key for leasing.
    pub state_timestamp: i64,

    /// Same-state re-entries since the last state change.
    pub state_count: u32,

    /// Reason for the last failed transition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,

    /// Parked for manual action; never leased while set.
    #[serde(default)]
    pub pending: bool,

    /// Tracing propagation headers.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub trace_context: HashMap<String, String>,

    created_at: i64,

    updated_at: i64,

    version: u64,

    /// Domain fields.
    pub payload: P,
}

impl<P: Payload> Entity<P> {
    /// Starts building a new entity around `payload`.
    pub fn builder(payload: P) -> EntityBuilder<P> {
        EntityBuilder::new(payload)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn entity_type(&self) -> &'static str {
        P::ENTITY_TYPE
    }

    pub fn created_at(&self) -> i64 {
        self.created_at
    }

    pub fn updated_at(&self) -> i64 {
        self.updated_at
    }

    /// Store-assigned version; 0 until first persisted.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn is_persisted(&self) -> bool {
        self.version > 0
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Moves to `state`.
    ///
    /// Entering a different state resets `state_count`, clears the error
    /// detail and un-parks the entity; re-entering the current state counts
    /// as a retry.
    pub fn transition_to(&mut self, state: P::State, now: i64) {
        if state == self.state {
            self.state_count = self.state_count.saturating_add(1);
        } else {
            self.state = state;
            self.state_count = 0;
            self.error_detail = None;
            self.pending = false;
        }
        self.state_timestamp = now;
    }

    /// Moves to `state` and records why.
    pub fn transition_with_error(
        &mut self,
        state: P::State,
        detail: impl Into<String>,
        now: i64,
    ) {
        self.transition_to(state, now);
        self.error_detail = Some(detail.into());
    }

    pub fn set_error_detail(&mut self, detail: impl Into<String>) {
        self.error_detail = Some(detail.into());
    }

    pub fn set_pending(&mut self, pending: bool) {
        self.pending = pending;
    }

    /// Records a successful write. Called by store implementations only.
    pub fn record_persisted(&mut self, version: u64, updated_at: i64) {
        self.version = version;
        self.updated_at = updated_at;
    }
}

/// Validating factory for [`Entity`].
#[derive(Debug, Clone)]
pub struct EntityBuilder<P: Payload> {
    id: Option<String>,
    state: P::State,
    state_timestamp: Option<i64>,
    created_at: Option<i64>,
    pending: bool,
    trace_context: HashMap<String, String>,
    payload: P,
}

impl<P: Payload> EntityBuilder<P> {
    pub fn new(payload: P) -> Self {
        Self {
            id: None,
            state: P::INITIAL_STATE,
            state_timestamp: None,
            created_at: None,
            pending: false,
            trace_context: HashMap::new(),
            payload,
        }
    }

    /// Sets the id; a random UUID is used otherwise.
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn state(mut self, state: P::State) -> Self {
        self.state = state;
        self
    }

    /// Overrides the state timestamp (defaults to the build time).
    pub fn state_timestamp(mut self, millis: i64) -> Self {
        self.state_timestamp = Some(millis);
        self
    }

    /// Overrides the creation time (defaults to the build time).
    pub fn created_at(mut self, millis: i64) -> Self {
        self.created_at = Some(millis);
        self
    }

    pub fn pending(mut self, pending: bool) -> Self {
        self.pending = pending;
        self
    }

    pub fn trace_context(mut self, ctx: HashMap<String, String>) -> Self {
        self.trace_context = ctx;
        self
    }

    /// Validates and builds the entity, stamping it with `now`.
    pub fn build(self, now: i64) -> Result<Entity<P>, EntityError> {
        let id = match self.id {
            Some(id) => id,
            None => uuid::Uuid::new_v4().to_string(),
        };
        if id.trim().is_empty() {
            return Err(EntityError::EmptyId);
        }
        if id.len() > MAX_ID_LEN {
            return Err(EntityError::InvalidField {
                field: "id",
                reason: format!("longer than {} bytes", MAX_ID_LEN),
            });
        }

        let created_at = self.created_at.unwrap_or(now);
        Ok(Entity {
            id,
            state: self.state,
            state_timestamp: self.state_timestamp.unwrap_or(now),
            state_count: 0,
            error_detail: None,
            pending: self.pending,
            trace_context: self.trace_context,
            created_at,
            updated_at: created_at,
            version: 0,
            payload: self.payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    crate::entity_states! {
        pub enum JobState {
            Queued = 10,
            Running = 20,
            Done = 30 => terminal,
            Failed = -1 => terminal,
        }
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Job {
        pub name: String,
    }

    impl Payload for Job {
        type State = JobState;
        const ENTITY_TYPE: &'static str = "job";
        const INITIAL_STATE: JobState = JobState::Queued;
    }

    fn job(id: &str) -> Entity<Job> {
        Entity::builder(Job { name: "j".into() })
            .id(id)
            .build(1_000)
            .unwrap()
    }

    #[test]
    fn test_builder_defaults() {
        let e = job("j-1");
        assert_eq!(e.id(), "j-1");
        assert_eq!(e.state, JobState::Queued);
        assert_eq!(e.state_timestamp, 1_000);
        assert_eq!(e.created_at(), 1_000);
        assert_eq!(e.updated_at(), 1_000);
        assert_eq!(e.version(), 0);
        assert!(!e.is_persisted());
        assert_eq!(e.entity_type(), "job");
    }

    #[test]
    fn test_builder_generates_id() {
        let a = Entity::builder(Job { name: "a".into() }).build(0).unwrap();
        let b = Entity::builder(Job { name: "b".into() }).build(0).unwrap();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_builder_rejects_empty_id() {
        let err = Entity::builder(Job { name: "x".into() })
            .id("  ")
            .build(0)
            .unwrap_err();
        assert_eq!(err, EntityError::EmptyId);
    }

    #[test]
    fn test_builder_rejects_long_id() {
        let err = Entity::builder(Job { name: "x".into() })
            .id("x".repeat(MAX_ID_LEN + 1))
            .build(0)
            .unwrap_err();
        assert!(matches!(err, EntityError::InvalidField { field: "id", .. }));
    }

    #[test]
    fn test_transition_resets_count_and_error() {
        let mut e = job("j-1");
        e.transition_to(JobState::Queued, 1_100);
        e.set_error_detail("timeout");
        assert_eq!(e.state_count, 1);

        e.transition_to(JobState::Running, 1_200);
        assert_eq!(e.state, JobState::Running);
        assert_eq!(e.state_count, 0);
        assert_eq!(e.error_detail, None);
        assert_eq!(e.state_timestamp, 1_200);
    }

    #[test]
    fn test_state_change_unparks() {
        let mut e = job("j-1");
        e.set_pending(true);
        e.transition_to(JobState::Queued, 1_100);
        assert!(e.pending);

        e.transition_with_error(JobState::Failed, "cancelled", 1_200);
        assert!(!e.pending);
    }

    #[test]
    fn test_transition_with_error() {
        let mut e = job("j-1");
        e.transition_with_error(JobState::Failed, "boom", 2_000);
        assert_eq!(e.state, JobState::Failed);
        assert_eq!(e.error_detail.as_deref(), Some("boom"));
        assert!(e.is_terminal());
    }

    #[test]
    fn test_state_codes() {
        assert_eq!(JobState::Failed.code(), -1);
        assert_eq!(JobState::from_code(20), Some(JobState::Running));
        assert_eq!(JobState::from_code(99), None);
        assert_eq!(JobState::Done.to_string(), "Done");
        assert_eq!(JobState::all().len(), 4);
        assert!(!JobState::Running.is_terminal());
        assert_eq!(
            parse_state::<JobState>("job", 7),
            Err(EntityError::UnknownStateCode {
                entity_type: "job",
                code: 7
            })
        );
    }

    #[test]
    fn test_json_uses_state_codes() {
        let mut e = job("j-1");
        e.record_persisted(3, 1_500);
        let json = serde_json::to_value(&e).unwrap();
        assert_eq!(json["state"], 10);
        assert_eq!(json["version"], 3);

        let back: Entity<Job> = serde_json::from_value(json).unwrap();
        assert_eq!(back, e);

        let bad = serde_json::json!({
            "id": "x", "state": 42, "state_timestamp": 0, "state_count": 0,
            "created_at": 0, "updated_at": 0, "version": 0, "payload": {"name": "n"}
        });
        assert!(serde_json::from_value::<Entity<Job>>(bad).is_err());
    }

    proptest! {
        #[test]
        fn prop_state_count_counts_same_state_reentries(retries in 0u32..50) {
            let mut e = job("j-1");
            e.transition_to(JobState::Running, 1);
            for i in 0..retries {
                e.transition_to(JobState::Running, 2 + i as i64);
            }
            prop_assert_eq!(e.state_count, retries);
        }
    }
}
