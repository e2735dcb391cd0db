use std::future::Future;
use std::sync::Arc;

use super::{
    ensure, fresh, ticket, seed, CheckResult, ConformanceBackend, TicketState, INSTANCE_A,
    INSTANCE_B, START_MILLIS,
};
use crate::{ConflictKind, StoreError};
use leasehold_core::ManualClock;

pub(super) async fn run_save_checks<S, F, Fut>(factory: &F) -> Vec<CheckResult>
where
    S: ConformanceBackend,
    F: Fn(Arc<ManualClock>, i64) -> Fut,
    Fut: Future<Output = S>,
{
    vec![
        CheckResult::from_result(
            "save",
            "insert_assigns_first_version",
            insert_assigns_first_version(factory).await,
        ),
        CheckResult::from_result(
            "save",
            "stale_version_conflicts",
            stale_version_conflicts(factory).await,
        ),
        CheckResult::from_result(
            "save",
            "updated_at_strictly_increases",
            updated_at_strictly_increases(factory).await,
        ),
        CheckResult::from_result(
            "save",
            "foreign_lease_blocks_save",
            foreign_lease_blocks_save(factory).await,
        ),
        CheckResult::from_result(
            "save",
            "save_releases_own_lease",
            save_releases_own_lease(factory).await,
        ),
        CheckResult::from_result(
            "save",
            "find_returns_detached_copy",
            find_returns_detached_copy(factory).await,
        ),
        CheckResult::from_result(
            "save",
            "find_missing_is_not_found",
            find_missing_is_not_found(factory).await,
        ),
    ]
}

async fn insert_assigns_first_version<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ConformanceBackend,
    F: Fn(Arc<ManualClock>, i64) -> Fut,
    Fut: Future<Output = S>,
{
    let (_clock, a) = fresh(factory).await;
    let mut e = ticket("e-1", TicketState::Open, START_MILLIS)?;
    a.save(&mut e).await.map_err(|err| format!("save: {err}"))?;
    ensure(e.version() == 1, || format!("version {}", e.version()))?;

    let stored = a.find("e-1").await.map_err(|err| format!("find: {err}"))?;
    ensure(stored.version() == 1, || {
        format!("stored version {}", stored.version())
    })
}

/// Two copies read at the same version; the second writer must lose.
async fn stale_version_conflicts<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ConformanceBackend,
    F: Fn(Arc<ManualClock>, i64) -> Fut,
    Fut: Future<Output = S>,
{
    let (_clock, a) = fresh(factory).await;
    seed(&a, "e", 1, TicketState::Open).await?;

    let mut first = a.find("e-000").await.map_err(|e| format!("find: {e}"))?;
    let mut second = first.clone();

    first.transition_to(TicketState::Working, START_MILLIS);
    a.save(&mut first)
        .await
        .map_err(|e| format!("first save: {e}"))?;

    second.transition_to(TicketState::Closed, START_MILLIS);
    match a.save(&mut second).await {
        Err(StoreError::Conflict {
            kind: ConflictKind::VersionMismatch { .. },
            ..
        }) => {}
        other => return Err(format!("expected version conflict, got {other:?}")),
    }

    let stored = a.find("e-000").await.map_err(|e| format!("find: {e}"))?;
    ensure(stored.state == TicketState::Working, || {
        format!("lost update: stored state {}", stored.state)
    })
}

/// The clock is frozen; `updated_at` must still move forward.
async fn updated_at_strictly_increases<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ConformanceBackend,
    F: Fn(Arc<ManualClock>, i64) -> Fut,
    Fut: Future<Output = S>,
{
    let (_clock, a) = fresh(factory).await;
    let mut e = ticket("e-1", TicketState::Open, START_MILLIS)?;
    a.save(&mut e).await.map_err(|err| format!("save 1: {err}"))?;
    let first = e.updated_at();

    e.transition_to(TicketState::Working, START_MILLIS);
    a.save(&mut e).await.map_err(|err| format!("save 2: {err}"))?;
    ensure(e.updated_at() > first, || {
        format!("updated_at {} not after {}", e.updated_at(), first)
    })?;
    ensure(e.version() == 2, || format!("version {}", e.version()))
}

async fn foreign_lease_blocks_save<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ConformanceBackend,
    F: Fn(Arc<ManualClock>, i64) -> Fut,
    Fut: Future<Output = S>,
{
    let (_clock, a) = fresh(factory).await;
    let b = a.for_instance(INSTANCE_B);
    seed(&a, "e", 1, TicketState::Open).await?;

    b.lease_next(TicketState::Open, 1, INSTANCE_B)
        .await
        .map_err(|e| format!("lease b: {e}"))?;

    let mut e = a.find("e-000").await.map_err(|e| format!("find: {e}"))?;
    e.transition_to(TicketState::Closed, START_MILLIS);
    match a.save(&mut e).await {
        Err(StoreError::Conflict {
            kind: ConflictKind::LeasedByOther { holder },
            ..
        }) if holder == INSTANCE_B => Ok(()),
        other => Err(format!("expected lease conflict, got {other:?}")),
    }
}

async fn save_releases_own_lease<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ConformanceBackend,
    F: Fn(Arc<ManualClock>, i64) -> Fut,
    Fut: Future<Output = S>,
{
    let (_clock, a) = fresh(factory).await;
    let b = a.for_instance(INSTANCE_B);
    seed(&a, "e", 1, TicketState::Open).await?;

    let mut leased = a
        .lease_next(TicketState::Open, 1, INSTANCE_A)
        .await
        .map_err(|e| format!("lease a: {e}"))?;
    let mut e = leased.pop().ok_or("nothing leased")?;
    e.set_error_detail("transient");
    a.save(&mut e).await.map_err(|err| format!("save: {err}"))?;

    let by_b = b
        .lease_next(TicketState::Open, 1, INSTANCE_B)
        .await
        .map_err(|e| format!("lease b: {e}"))?;
    ensure(by_b.len() == 1, || "lease not released by save".to_string())
}

async fn find_returns_detached_copy<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ConformanceBackend,
    F: Fn(Arc<ManualClock>, i64) -> Fut,
    Fut: Future<Output = S>,
{
    let (_clock, a) = fresh(factory).await;
    seed(&a, "e", 1, TicketState::Open).await?;

    let mut copy = a.find("e-000").await.map_err(|e| format!("find: {e}"))?;
    copy.transition_to(TicketState::Closed, START_MILLIS);
    copy.payload.label = "mutated".into();

    let stored = a.find("e-000").await.map_err(|e| format!("find: {e}"))?;
    ensure(
        stored.state == TicketState::Open && stored.payload.label == "e-000",
        || "unsaved mutation visible through find".to_string(),
    )
}

async fn find_missing_is_not_found<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ConformanceBackend,
    F: Fn(Arc<ManualClock>, i64) -> Fut,
    Fut: Future<Output = S>,
{
    let (_clock, a) = fresh(factory).await;
    match a.find("missing").await {
        Err(StoreError::NotFound { id }) if id == "missing" => Ok(()),
        other => Err(format!("expected NotFound, got {other:?}")),
    }
}
