use std::future::Future;
use std::sync::Arc;

use super::{
    ensure, fresh, ticket, seed, CheckResult, ConformanceBackend, TicketState, INSTANCE_A,
    INSTANCE_B, LEASE_MS, START_MILLIS,
};
use crate::{ConflictKind, StoreError};
use leasehold_core::ManualClock;

pub(super) async fn run_lifecycle_checks<S, F, Fut>(factory: &F) -> Vec<CheckResult>
where
    S: ConformanceBackend,
    F: Fn(Arc<ManualClock>, i64) -> Fut,
    Fut: Future<Output = S>,
{
    vec![
        CheckResult::from_result(
            "lifecycle",
            "break_lease_frees_entity",
            break_lease_frees_entity(factory).await,
        ),
        CheckResult::from_result(
            "lifecycle",
            "break_foreign_lease_conflicts",
            break_foreign_lease_conflicts(factory).await,
        ),
        CheckResult::from_result(
            "lifecycle",
            "break_expired_or_absent_lease_succeeds",
            break_expired_or_absent_lease_succeeds(factory).await,
        ),
        CheckResult::from_result(
            "lifecycle",
            "break_lease_missing_is_not_found",
            break_lease_missing_is_not_found(factory).await,
        ),
        CheckResult::from_result(
            "lifecycle",
            "delete_requires_terminal_state",
            delete_requires_terminal_state(factory).await,
        ),
        CheckResult::from_result(
            "lifecycle",
            "delete_terminal_removes_entity",
            delete_terminal_removes_entity(factory).await,
        ),
    ]
}

async fn break_lease_frees_entity<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ConformanceBackend,
    F: Fn(Arc<ManualClock>, i64) -> Fut,
    Fut: Future<Output = S>,
{
    let (_clock, a) = fresh(factory).await;
    let b = a.for_instance(INSTANCE_B);
    seed(&a, "e", 1, TicketState::Open).await?;

    a.lease_next(TicketState::Open, 1, INSTANCE_A)
        .await
        .map_err(|e| format!("lease a: {e}"))?;
    a.break_lease("e-000", INSTANCE_A)
        .await
        .map_err(|e| format!("break: {e}"))?;

    let by_b = b
        .lease_next(TicketState::Open, 1, INSTANCE_B)
        .await
        .map_err(|e| format!("lease b: {e}"))?;
    ensure(by_b.len() == 1, || "broken lease still blocks".to_string())
}

async fn break_foreign_lease_conflicts<S, F, Fut>(factory: &F) -> Result<(), String>
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
    match a.break_lease("e-000", INSTANCE_A).await {
        Err(StoreError::Conflict {
            kind: ConflictKind::LeasedByOther { holder },
            ..
        }) if holder == INSTANCE_B => Ok(()),
        other => Err(format!("expected lease conflict, got {other:?}")),
    }
}

async fn break_expired_or_absent_lease_succeeds<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ConformanceBackend,
    F: Fn(Arc<ManualClock>, i64) -> Fut,
    Fut: Future<Output = S>,
{
    let (clock, a) = fresh(factory).await;
    let b = a.for_instance(INSTANCE_B);
    seed(&a, "e", 1, TicketState::Open).await?;

    a.break_lease("e-000", INSTANCE_A)
        .await
        .map_err(|e| format!("break unleased: {e}"))?;

    b.lease_next(TicketState::Open, 1, INSTANCE_B)
        .await
        .map_err(|e| format!("lease b: {e}"))?;
    clock.advance(LEASE_MS + 1);
    a.break_lease("e-000", INSTANCE_A)
        .await
        .map_err(|e| format!("break expired: {e}"))
}

async fn break_lease_missing_is_not_found<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ConformanceBackend,
    F: Fn(Arc<ManualClock>, i64) -> Fut,
    Fut: Future<Output = S>,
{
    let (_clock, a) = fresh(factory).await;
    match a.break_lease("missing", INSTANCE_A).await {
        Err(StoreError::NotFound { id }) if id == "missing" => Ok(()),
        other => Err(format!("expected NotFound, got {other:?}")),
    }
}

async fn delete_requires_terminal_state<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ConformanceBackend,
    F: Fn(Arc<ManualClock>, i64) -> Fut,
    Fut: Future<Output = S>,
{
    let (_clock, a) = fresh(factory).await;
    seed(&a, "e", 1, TicketState::Working).await?;

    match a.delete("e-000").await {
        Err(StoreError::InvalidState { .. }) => {}
        other => return Err(format!("expected InvalidState, got {other:?}")),
    }
    a.find("e-000")
        .await
        .map(|_| ())
        .map_err(|e| format!("entity gone after rejected delete: {e}"))
}

async fn delete_terminal_removes_entity<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ConformanceBackend,
    F: Fn(Arc<ManualClock>, i64) -> Fut,
    Fut: Future<Output = S>,
{
    let (_clock, a) = fresh(factory).await;
    let mut e = ticket("done", TicketState::Closed, START_MILLIS)?;
    a.save(&mut e).await.map_err(|err| format!("save: {err}"))?;

    a.delete("done")
        .await
        .map_err(|err| format!("delete: {err}"))?;
    match a.find("done").await {
        Err(StoreError::NotFound { .. }) => {}
        other => return Err(format!("expected NotFound after delete, got {other:?}")),
    }
    match a.delete("done").await {
        Err(StoreError::NotFound { .. }) => Ok(()),
        other => Err(format!("second delete: expected NotFound, got {other:?}")),
    }
}
