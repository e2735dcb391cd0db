//! Transition functions and guards.

use crate::error::ProcessError;
use futures::future::BoxFuture;
use futures::FutureExt;
use leasehold_core::{Entity, Payload};
use std::future::Future;
use std::sync::Arc;

/// Future returned by a transition function.
///
/// Resolves to `Ok(true)` when the entity was advanced and saved, `Ok(false)`
/// when there was nothing to do.
pub type TransitionFuture = BoxFuture<'static, Result<bool, ProcessError>>;

/// A transition applied to one leased entity.
pub type TransitionFn<P> = Arc<dyn Fn(Entity<P>) -> TransitionFuture + Send + Sync>;

/// Decides whether a guard's alternate transition applies.
pub type Predicate<P> = Arc<dyn Fn(&Entity<P>) -> bool + Send + Sync>;

/// Wraps an async closure as a [`TransitionFn`].
pub fn transition<P, F, Fut>(f: F) -> TransitionFn<P>
where
    P: Payload,
    F: Fn(Entity<P>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<bool, ProcessError>> + Send + 'static,
{
    Arc::new(move |entity| f(entity).boxed())
}

/// A predicate paired with the transition to run instead of the default.
pub struct Guard<P: Payload> {
    name: String,
    predicate: Predicate<P>,
    action: TransitionFn<P>,
}

impl<P: Payload> Guard<P> {
    pub fn new<F>(name: impl Into<String>, predicate: F, action: TransitionFn<P>) -> Self
    where
        F: Fn(&Entity<P>) -> bool + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            predicate: Arc::new(predicate),
            action,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn matches(&self, entity: &Entity<P>) -> bool {
        (self.predicate)(entity)
    }

    pub fn action(&self) -> &TransitionFn<P> {
        &self.action
    }
}

impl<P: Payload> Clone for Guard<P> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            predicate: self.predicate.clone(),
            action: self.action.clone(),
        }
    }
}

impl<P: Payload> std::fmt::Debug for Guard<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Guard").field("name", &self.name).finish()
    }
}

/// Returns the first guard matching `entity`, in registration order.
pub fn select<'a, P: Payload>(guards: &'a [Guard<P>], entity: &Entity<P>) -> Option<&'a Guard<P>> {
    guards.iter().find(|g| g.matches(entity))
}
