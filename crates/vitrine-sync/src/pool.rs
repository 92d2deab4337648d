//! Fixed-size worker pool over a shared cursor.
//!
//! Workers claim the next unprocessed index with an atomic increment and run
//! independently; nothing else is shared between them. Results come back in
//! item order, but items may finish in any order.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures::future::join_all;

/// Process every item exactly once with at most `workers` in flight.
///
/// `f` receives the worker number and the item.
pub async fn run_bounded<T, R, F, Fut>(items: &[T], workers: usize, f: F) -> Vec<R>
where
    F: Fn(usize, &T) -> Fut,
    Fut: Future<Output = R>,
{
    let cursor = AtomicUsize::new(0);
    let workers = workers.max(1).min(items.len().max(1));

    let per_worker = join_all((0..workers).map(|worker| {
        let cursor = &cursor;
        let f = &f;
        async move {
            let mut done = Vec::new();
            loop {
                let index = cursor.fetch_add(1, Ordering::SeqCst);
                let Some(item) = items.get(index) else {
                    break;
                };
                done.push((index, f(worker, item).await));
            }
            done
        }
    }))
    .await;

    let mut results: Vec<(usize, R)> = per_worker.into_iter().flatten().collect();
    results.sort_by_key(|(index, _)| *index);
    results.into_iter().map(|(_, r)| r).collect()
}
