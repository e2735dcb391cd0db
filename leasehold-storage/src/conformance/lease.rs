use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use super::{
    ensure, fresh, ids, ticket, seed, CheckResult, ConformanceBackend, TicketState, INSTANCE_A,
    INSTANCE_B, LEASE_MS,
};
use leasehold_core::ManualClock;

/// Distinct instances racing in the concurrent check.
const RACERS: usize = 8;

pub(super) async fn run_lease_checks<S, F, Fut>(factory: &F) -> Vec<CheckResult>
where
    S: ConformanceBackend,
    F: Fn(Arc<ManualClock>, i64) -> Fut,
    Fut: Future<Output = S>,
{
    vec![
        CheckResult::from_result(
            "lease",
            "leased_entity_hidden_from_other_instance",
            leased_entity_hidden_from_other_instance(factory).await,
        ),
        CheckResult::from_result(
            "lease",
            "holder_reacquires_own_lease",
            holder_reacquires_own_lease(factory).await,
        ),
        CheckResult::from_result(
            "lease",
            "lease_live_at_expiry_boundary",
            lease_live_at_expiry_boundary(factory).await,
        ),
        CheckResult::from_result(
            "lease",
            "expired_lease_reclaimable_by_any_instance",
            expired_lease_reclaimable_by_any_instance(factory).await,
        ),
        CheckResult::from_result(
            "lease",
            "pending_entities_not_leased",
            pending_entities_not_leased(factory).await,
        ),
        CheckResult::from_result(
            "lease",
            "lease_next_respects_state_and_max",
            lease_next_respects_state_and_max(factory).await,
        ),
        CheckResult::from_result(
            "lease",
            "concurrent_lease_next_is_mutually_exclusive",
            concurrent_lease_next_is_mutually_exclusive(factory).await,
        ),
    ]
}

async fn leased_entity_hidden_from_other_instance<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ConformanceBackend,
    F: Fn(Arc<ManualClock>, i64) -> Fut,
    Fut: Future<Output = S>,
{
    let (_clock, a) = fresh(factory).await;
    let b = a.for_instance(INSTANCE_B);
    seed(&a, "e", 1, TicketState::Open).await?;

    let first = a
        .lease_next(TicketState::Open, 5, INSTANCE_A)
        .await
        .map_err(|e| format!("lease a: {e}"))?;
    ensure(first.len() == 1, || format!("a leased {}", first.len()))?;

    let second = b
        .lease_next(TicketState::Open, 5, INSTANCE_B)
        .await
        .map_err(|e| format!("lease b: {e}"))?;
    ensure(second.is_empty(), || {
        format!("b leased {:?} while a holds it", ids(&second))
    })
}

async fn holder_reacquires_own_lease<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ConformanceBackend,
    F: Fn(Arc<ManualClock>, i64) -> Fut,
    Fut: Future<Output = S>,
{
    let (_clock, a) = fresh(factory).await;
    seed(&a, "e", 1, TicketState::Open).await?;

    let first = a
        .lease_next(TicketState::Open, 5, INSTANCE_A)
        .await
        .map_err(|e| format!("lease 1: {e}"))?;
    let again = a
        .lease_next(TicketState::Open, 5, INSTANCE_A)
        .await
        .map_err(|e| format!("lease 2: {e}"))?;
    ensure(ids(&first) == ids(&again), || {
        format!("re-acquire returned {:?}, first {:?}", ids(&again), ids(&first))
    })
}

async fn lease_live_at_expiry_boundary<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ConformanceBackend,
    F: Fn(Arc<ManualClock>, i64) -> Fut,
    Fut: Future<Output = S>,
{
    let (clock, a) = fresh(factory).await;
    let b = a.for_instance(INSTANCE_B);
    seed(&a, "e", 1, TicketState::Open).await?;

    a.lease_next(TicketState::Open, 1, INSTANCE_A)
        .await
        .map_err(|e| format!("lease a: {e}"))?;
    clock.advance(LEASE_MS);

    let stolen = b
        .lease_next(TicketState::Open, 1, INSTANCE_B)
        .await
        .map_err(|e| format!("lease b: {e}"))?;
    ensure(stolen.is_empty(), || {
        "lease taken at leased_at + lease_duration; expiry must be strict".to_string()
    })
}

async fn expired_lease_reclaimable_by_any_instance<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ConformanceBackend,
    F: Fn(Arc<ManualClock>, i64) -> Fut,
    Fut: Future<Output = S>,
{
    let (clock, a) = fresh(factory).await;
    let b = a.for_instance(INSTANCE_B);
    seed(&a, "e", 1, TicketState::Open).await?;

    a.lease_next(TicketState::Open, 1, INSTANCE_A)
        .await
        .map_err(|e| format!("lease a: {e}"))?;
    clock.advance(LEASE_MS + 1);

    let by_b = b
        .lease_next(TicketState::Open, 1, INSTANCE_B)
        .await
        .map_err(|e| format!("lease b: {e}"))?;
    ensure(by_b.len() == 1, || "b could not reclaim expired lease".to_string())?;

    clock.advance(LEASE_MS + 1);
    let by_a = a
        .lease_next(TicketState::Open, 1, INSTANCE_A)
        .await
        .map_err(|e| format!("lease a again: {e}"))?;
    ensure(by_a.len() == 1, || {
        "original holder could not reclaim after b's lease expired".to_string()
    })
}

async fn pending_entities_not_leased<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ConformanceBackend,
    F: Fn(Arc<ManualClock>, i64) -> Fut,
    Fut: Future<Output = S>,
{
    let (_clock, a) = fresh(factory).await;
    let mut parked = ticket("parked", TicketState::Open, 1)?;
    parked.set_pending(true);
    a.save(&mut parked)
        .await
        .map_err(|e| format!("save: {e}"))?;

    let leased = a
        .lease_next(TicketState::Open, 5, INSTANCE_A)
        .await
        .map_err(|e| format!("lease: {e}"))?;
    ensure(leased.is_empty(), || "pending entity was leased".to_string())
}

async fn lease_next_respects_state_and_max<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ConformanceBackend,
    F: Fn(Arc<ManualClock>, i64) -> Fut,
    Fut: Future<Output = S>,
{
    let (_clock, a) = fresh(factory).await;
    seed(&a, "open", 5, TicketState::Open).await?;
    seed(&a, "work", 3, TicketState::Working).await?;

    let leased = a
        .lease_next(TicketState::Working, 2, INSTANCE_A)
        .await
        .map_err(|e| format!("lease: {e}"))?;
    ensure(leased.len() == 2, || format!("expected 2, got {}", leased.len()))?;
    ensure(
        leased.iter().all(|e| e.state == TicketState::Working),
        || format!("wrong state in {:?}", ids(&leased)),
    )?;

    let none = a
        .lease_next(TicketState::Working, 0, INSTANCE_A)
        .await
        .map_err(|e| format!("lease zero: {e}"))?;
    ensure(none.is_empty(), || "max = 0 leased entities".to_string())
}

/// Distinct instances race `lease_next` over the same rows. Every entity must
/// be handed out exactly once.
async fn concurrent_lease_next_is_mutually_exclusive<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ConformanceBackend,
    F: Fn(Arc<ManualClock>, i64) -> Fut,
    Fut: Future<Output = S>,
{
    let (_clock, a) = fresh(factory).await;
    let total = 50;
    seed(&a, "e", total, TicketState::Open).await?;

    let mut handles = Vec::new();
    for i in 0..RACERS {
        let holder = format!("racer-{i}");
        let store = Arc::new(a.for_instance(&holder));
        handles.push(tokio::spawn(async move {
            store
                .lease_next(TicketState::Open, 10, &holder)
                .await
                .map(|leased| ids(&leased))
        }));
    }

    let mut seen = HashSet::new();
    for handle in handles {
        let leased = handle
            .await
            .map_err(|e| format!("task panic: {e}"))?
            .map_err(|e| format!("lease: {e}"))?;
        for id in leased {
            ensure(seen.insert(id.clone()), || format!("{id} leased twice"))?;
        }
    }
    ensure(seen.len() == total, || {
        format!("{} of {} entities leased", seen.len(), total)
    })
}
