use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use super::{
    ensure, fresh, ids, ticket, seed, CheckResult, ConformanceBackend, TicketState, INSTANCE_A,
    START_MILLIS,
};
use leasehold_core::ManualClock;

pub(super) async fn run_fifo_checks<S, F, Fut>(factory: &F) -> Vec<CheckResult>
where
    S: ConformanceBackend,
    F: Fn(Arc<ManualClock>, i64) -> Fut,
    Fut: Future<Output = S>,
{
    vec![
        CheckResult::from_result(
            "fifo",
            "lease_next_orders_by_state_timestamp",
            lease_next_orders_by_state_timestamp(factory).await,
        ),
        CheckResult::from_result(
            "fifo",
            "successive_batches_cover_all_in_order",
            successive_batches_cover_all_in_order(factory).await,
        ),
    ]
}

/// Inserted out of order; must come back oldest first.
async fn lease_next_orders_by_state_timestamp<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ConformanceBackend,
    F: Fn(Arc<ManualClock>, i64) -> Fut,
    Fut: Future<Output = S>,
{
    let (_clock, a) = fresh(factory).await;
    for (id, ts) in [("c", 300), ("a", 100), ("d", 400), ("b", 200)] {
        let mut e = ticket(id, TicketState::Offered, START_MILLIS - 1_000 + ts)?;
        a.save(&mut e).await.map_err(|e| format!("save: {e}"))?;
    }

    let leased = a
        .lease_next(TicketState::Offered, 4, INSTANCE_A)
        .await
        .map_err(|e| format!("lease: {e}"))?;
    let got = ids(&leased);
    ensure(got == ["a", "b", "c", "d"], || format!("order {got:?}"))
}

/// Ten entities drained three at a time, each batch moved on by `save`,
/// arrive in strictly increasing `state_timestamp` with no repeats.
async fn successive_batches_cover_all_in_order<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ConformanceBackend,
    F: Fn(Arc<ManualClock>, i64) -> Fut,
    Fut: Future<Output = S>,
{
    let (_clock, a) = fresh(factory).await;
    seed(&a, "offer", 10, TicketState::Offered).await?;

    let mut timestamps = Vec::new();
    let mut seen = HashSet::new();
    for round in 0..4 {
        let batch = a
            .lease_next(TicketState::Offered, 3, INSTANCE_A)
            .await
            .map_err(|e| format!("lease round {round}: {e}"))?;
        for mut e in batch {
            ensure(seen.insert(e.id().to_string()), || {
                format!("{} repeated in round {round}", e.id())
            })?;
            timestamps.push(e.state_timestamp);
            e.transition_to(TicketState::Working, START_MILLIS);
            a.save(&mut e)
                .await
                .map_err(|err| format!("save round {round}: {err}"))?;
        }
    }

    ensure(seen.len() == 10, || format!("{} of 10 leased", seen.len()))?;
    ensure(timestamps.windows(2).all(|w| w[0] < w[1]), || {
        format!("not strictly increasing: {timestamps:?}")
    })
}
