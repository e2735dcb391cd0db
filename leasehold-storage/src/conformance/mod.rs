//! Conformance suite for `EntityStore` backends.
//!
//! Any backend can run this suite to check the coordination guarantees the
//! engine depends on:
//!
//! - **lease**: mutual exclusion, re-entrant acquire, expiry, pending skip
//! - **fifo**: oldest `state_timestamp` first, batches cover every entity
//! - **save**: versioning, stale writes, foreign leases, lease release
//! - **lifecycle**: `break_lease` and terminal-only `delete`
//! - **query**: filtering, sorting, paging
//!
//! # Usage
//!
//! ```ignore
//! use leasehold_storage::conformance::run_conformance_suite;
//!
//! #[tokio::test]
//! async fn postgres_conformance() {
//!     let report = run_conformance_suite(|clock, lease_ms| async move {
//!         create_test_postgres_store(clock, lease_ms).await
//!     })
//!     .await;
//!     assert!(report.failed == 0, "{report}");
//! }
//! ```

mod fifo;
mod lease;
mod lifecycle;
mod query;
mod save;

use crate::{EntityStore, InMemoryEntityStore};
use leasehold_core::{Entity, ManualClock, Payload};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Lease lifetime every suite store must be created with.
pub const LEASE_MS: i64 = 1_000;

/// Clock start for every test.
pub const START_MILLIS: i64 = 1_000_000;

/// Holder of the handle returned by the factory.
pub const INSTANCE_A: &str = "instance-a";

/// Holder of the second handle.
pub const INSTANCE_B: &str = "instance-b";

leasehold_core::entity_states! {
    /// States used by the suite.
    pub enum TicketState {
        Open = 100,
        Working = 200,
        Offered = 400,
        Closed = 900 => terminal,
    }
}

/// Entity payload used by the suite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticket {
    pub label: String,
}

impl Ticket {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
        }
    }
}

impl Payload for Ticket {
    type State = TicketState;
    const ENTITY_TYPE: &'static str = "ticket";
    const INITIAL_STATE: TicketState = TicketState::Open;
}

/// A backend under test.
///
/// The factory returns a handle acting as [`INSTANCE_A`]; the suite asks it
/// for further handles on the same backing storage.
pub trait ConformanceBackend: EntityStore<Ticket> + Sized + 'static {
    fn for_instance(&self, holder: &str) -> Self;
}

impl ConformanceBackend for InMemoryEntityStore<Ticket> {
    fn for_instance(&self, holder: &str) -> Self {
        InMemoryEntityStore::for_instance(self, holder)
    }
}

/// Result of a single conformance check.
#[derive(Debug, Clone)]
pub struct CheckResult {
    /// Category (e.g. "lease", "save").
    pub category: String,
    /// Check name.
    pub name: String,
    pub passed: bool,
    pub message: Option<String>,
}

impl CheckResult {
    fn from_result(category: &str, name: &str, result: Result<(), String>) -> Self {
        let (passed, message) = match result {
            Ok(()) => (true, None),
            Err(msg) => (false, Some(msg)),
        };
        Self {
            category: category.to_string(),
            name: name.to_string(),
            passed,
            message,
        }
    }
}

/// Aggregated report from a suite run.
#[derive(Debug, Clone)]
pub struct ConformanceReport {
    pub results: Vec<CheckResult>,
    pub passed: usize,
    pub failed: usize,
    pub total: usize,
}

impl fmt::Display for ConformanceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Conformance: {}/{} passed ({} failed)",
            self.passed, self.total, self.failed
        )?;
        for r in self.results.iter().filter(|r| !r.passed) {
            writeln!(
                f,
                "  FAIL [{}/{}]: {}",
                r.category,
                r.name,
                r.message.as_deref().unwrap_or("(no message)")
            )?;
        }
        Ok(())
    }
}

/// Runs every check against fresh stores from `factory`.
///
/// `factory(clock, lease_ms)` must return an empty store acting as
/// [`INSTANCE_A`], reading time from `clock` and granting leases of
/// `lease_ms` milliseconds.
pub async fn run_conformance_suite<S, F, Fut>(factory: F) -> ConformanceReport
where
    S: ConformanceBackend,
    F: Fn(Arc<ManualClock>, i64) -> Fut,
    Fut: Future<Output = S>,
{
    let mut results = Vec::new();

    results.extend(lease::run_lease_checks(&factory).await);
    results.extend(fifo::run_fifo_checks(&factory).await);
    results.extend(save::run_save_checks(&factory).await);
    results.extend(lifecycle::run_lifecycle_checks(&factory).await);
    results.extend(query::run_query_checks(&factory).await);

    let passed = results.iter().filter(|r| r.passed).count();
    let total = results.len();

    ConformanceReport {
        results,
        passed,
        failed: total - passed,
        total,
    }
}

// ── Helpers ─────────────────────────────────────────────────────────────────

async fn fresh<S, F, Fut>(factory: &F) -> (Arc<ManualClock>, S)
where
    S: ConformanceBackend,
    F: Fn(Arc<ManualClock>, i64) -> Fut,
    Fut: Future<Output = S>,
{
    let clock = Arc::new(ManualClock::new(START_MILLIS));
    let store = factory(clock.clone(), LEASE_MS).await;
    (clock, store)
}

fn ticket(id: &str, state: TicketState, state_timestamp: i64) -> Result<Entity<Ticket>, String> {
    Entity::builder(Ticket::new(id))
        .id(id)
        .state(state)
        .state_timestamp(state_timestamp)
        .created_at(START_MILLIS)
        .build(START_MILLIS)
        .map_err(|e| format!("build {id}: {e}"))
}

/// Saves `count` entities in `state` with increasing state timestamps.
async fn seed<S: ConformanceBackend>(
    store: &S,
    prefix: &str,
    count: usize,
    state: TicketState,
) -> Result<Vec<Entity<Ticket>>, String> {
    let mut saved = Vec::with_capacity(count);
    for i in 0..count {
        let mut e = ticket(
            &format!("{prefix}-{i:03}"),
            state,
            START_MILLIS - 10_000 + i as i64,
        )?;
        store
            .save(&mut e)
            .await
            .map_err(|err| format!("seed save: {err}"))?;
        saved.push(e);
    }
    Ok(saved)
}

fn ids(entities: &[Entity<Ticket>]) -> Vec<String> {
    entities.iter().map(|e| e.id().to_string()).collect()
}

fn ensure(condition: bool, msg: impl FnOnce() -> String) -> Result<(), String> {
    if condition {
        Ok(())
    } else {
        Err(msg())
    }
}
