//! Query specifications.

use leasehold_core::{Entity, EntityState, Payload};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Default page size.
pub const DEFAULT_LIMIT: usize = 50;

/// Sortable entity fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    #[default]
    StateTimestamp,
    CreatedAt,
    UpdatedAt,
    Id,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

/// Read-only, paginated entity query.
///
/// Empty `states` matches every state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct QuerySpec<S: EntityState> {
    pub states: Vec<S>,
    pub pending: Option<bool>,
    pub has_error: Option<bool>,
    pub sort: SortField,
    pub order: SortOrder,
    pub offset: usize,
    pub limit: usize,
}

impl<S: EntityState> Default for QuerySpec<S> {
    fn default() -> Self {
        Self {
            states: Vec::new(),
            pending: None,
            has_error: None,
            sort: SortField::default(),
            order: SortOrder::default(),
            offset: 0,
            limit: DEFAULT_LIMIT,
        }
    }
}

impl<S: EntityState> QuerySpec<S> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(mut self, state: S) -> Self {
        self.states.push(state);
        self
    }

    pub fn with_pending(mut self, pending: bool) -> Self {
        self.pending = Some(pending);
        self
    }

    pub fn with_error(mut self, has_error: bool) -> Self {
        self.has_error = Some(has_error);
        self
    }

    pub fn sort_by(mut self, field: SortField, order: SortOrder) -> Self {
        self.sort = field;
        self.order = order;
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// Returns true if `entity` passes every filter.
    pub fn matches<P: Payload<State = S>>(&self, entity: &Entity<P>) -> bool {
        (self.states.is_empty() || self.states.contains(&entity.state))
            && self.pending.map_or(true, |p| entity.pending == p)
            && self
                .has_error
                .map_or(true, |e| entity.error_detail.is_some() == e)
    }

    /// Orders two entities by the requested sort.
    pub fn compare<P: Payload<State = S>>(&self, a: &Entity<P>, b: &Entity<P>) -> Ordering {
        let ordering = match self.sort {
            SortField::StateTimestamp => a.state_timestamp.cmp(&b.state_timestamp),
            SortField::CreatedAt => a.created_at().cmp(&b.created_at()),
            SortField::UpdatedAt => a.updated_at().cmp(&b.updated_at()),
            SortField::Id => a.id().cmp(b.id()),
        }
        .then_with(|| a.id().cmp(b.id()));

        match self.order {
            SortOrder::Asc => ordering,
            SortOrder::Desc => ordering.reverse(),
        }
    }

    /// Applies filter, sort, and page to an owned result set.
    pub fn apply<P: Payload<State = S>>(&self, entities: Vec<Entity<P>>) -> Vec<Entity<P>> {
        let mut matched: Vec<_> = entities.into_iter().filter(|e| self.matches(e)).collect();
        matched.sort_by(|a, b| self.compare(a, b));
        matched
            .into_iter()
            .skip(self.offset)
            .take(self.limit)
            .collect()
    }
}
