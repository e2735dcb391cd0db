use std::future::Future;
use std::sync::Arc;

use super::{ensure, fresh, ids, seed, CheckResult, ConformanceBackend, TicketState};
use crate::{QuerySpec, SortField, SortOrder};
use leasehold_core::ManualClock;

pub(super) async fn run_query_checks<S, F, Fut>(factory: &F) -> Vec<CheckResult>
where
    S: ConformanceBackend,
    F: Fn(Arc<ManualClock>, i64) -> Fut,
    Fut: Future<Output = S>,
{
    vec![
        CheckResult::from_result(
            "query",
            "filters_by_state_and_flags",
            filters_by_state_and_flags(factory).await,
        ),
        CheckResult::from_result(
            "query",
            "sorts_and_paginates",
            sorts_and_paginates(factory).await,
        ),
    ]
}

async fn filters_by_state_and_flags<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ConformanceBackend,
    F: Fn(Arc<ManualClock>, i64) -> Fut,
    Fut: Future<Output = S>,
{
    let (_clock, a) = fresh(factory).await;
    seed(&a, "open", 3, TicketState::Open).await?;
    let mut work = seed(&a, "work", 2, TicketState::Working).await?;

    let mut parked = work.remove(0);
    parked.set_pending(true);
    parked.set_error_detail("needs approval");
    a.save(&mut parked)
        .await
        .map_err(|e| format!("save: {e}"))?;

    let working = a
        .query(&QuerySpec::new().with_state(TicketState::Working))
        .await
        .map_err(|e| format!("query state: {e}"))?;
    ensure(ids(&working) == ["work-000", "work-001"], || {
        format!("state filter {:?}", ids(&working))
    })?;

    let pending = a
        .query(&QuerySpec::new().with_pending(true))
        .await
        .map_err(|e| format!("query pending: {e}"))?;
    ensure(ids(&pending) == ["work-000"], || {
        format!("pending filter {:?}", ids(&pending))
    })?;

    let clean = a
        .query(&QuerySpec::new().with_error(false))
        .await
        .map_err(|e| format!("query error: {e}"))?;
    ensure(clean.len() == 4, || format!("error filter {:?}", ids(&clean)))
}

async fn sorts_and_paginates<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ConformanceBackend,
    F: Fn(Arc<ManualClock>, i64) -> Fut,
    Fut: Future<Output = S>,
{
    let (_clock, a) = fresh(factory).await;
    seed(&a, "e", 7, TicketState::Open).await?;

    let page = a
        .query(
            &QuerySpec::new()
                .sort_by(SortField::StateTimestamp, SortOrder::Desc)
                .offset(2)
                .limit(3),
        )
        .await
        .map_err(|e| format!("query: {e}"))?;
    ensure(ids(&page) == ["e-004", "e-003", "e-002"], || {
        format!("page {:?}", ids(&page))
    })?;

    let past_end = a
        .query(&QuerySpec::new().offset(10))
        .await
        .map_err(|e| format!("query past end: {e}"))?;
    ensure(past_end.is_empty(), || {
        format!("offset past end returned {:?}", ids(&past_end))
    })
}
