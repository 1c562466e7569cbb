//! Bounded-concurrency task runner
//!
//! Tasks are started in input order with at most `limit` in flight. Results
//! come back in input order regardless of completion order.
//!
//! The first failing task fails the whole run. Tasks that were already
//! started keep running on the runtime until they finish; their results are
//! dropped. Tasks that were never started are never started.

use futures::stream::{FuturesUnordered, StreamExt};
use std::future::Future;
use tracing::{debug, trace};

use crate::error::Result;

/// Run `tasks` with at most `limit` of them in flight at once.
///
/// Each task is a closure producing the future to run, so nothing executes
/// before a slot frees up. A `limit` of zero is treated as one.
pub async fn run_with_concurrency<T, F, Fut>(tasks: Vec<F>, limit: usize) -> Result<Vec<T>>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    let limit = limit.max(1);
    let total = tasks.len();
    debug!(total = total, limit = limit, "Running tasks with bounded concurrency");

    let mut results: Vec<Option<T>> = (0..total).map(|_| None).collect();
    let mut queue = tasks.into_iter().enumerate();
    let mut in_flight = FuturesUnordered::new();

    loop {
        while in_flight.len() < limit {
            let Some((index, task)) = queue.next() else { break };
            trace!(index = index, "Starting task");
            let handle = tokio::spawn(task());
            in_flight.push(async move { (index, handle.await) });
        }

        let Some((index, joined)) = in_flight.next().await else { break };
        match joined {
            Ok(Ok(value)) => results[index] = Some(value),
            Ok(Err(e)) => {
                debug!(index = index, error = %e, still_running = in_flight.len(), "Task failed, abandoning run");
                return Err(e);
            }
            Err(join_err) => return Err(join_err.into()),
        }
    }

    Ok(results.into_iter().flatten().collect())
}
