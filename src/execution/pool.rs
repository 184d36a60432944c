//! Bounded Worker Pool
//!
//! Runs a list of jobs with at most `limit` in flight, using scoped
//! threads and a completion channel. Results come back in input order.

use std::sync::mpsc::channel;
use std::thread;

use log::{debug, error};

/// Runs `work` over every item, `limit` at a time, and returns the
/// results in the order of `items`.
///
/// Every item runs even if earlier ones fail; callers decide what a
/// failed result means.
pub fn run_bounded<T, R, F>(items: Vec<T>, limit: usize, work: F) -> Vec<R>
where
    T: Send,
    R: Send,
    F: Fn(usize, T) -> R + Sync,
{
    let total = items.len();
    if total == 0 {
        return Vec::new();
    }

    let limit = limit.max(1);
    let work = &work;
    let mut results: Vec<Option<R>> = (0..total).map(|_| None).collect();

    thread::scope(|scope| {
        let (tx, rx) = channel::<(usize, R)>();
        let mut tx = Some(tx);
        let mut pending = items.into_iter().enumerate();
        let mut running_count = 0;

        loop {
            while running_count < limit && tx.is_some() {
                let Some((index, item)) = pending.next() else {
                    // Everything is spawned; let recv fail once workers are gone.
                    tx = None;
                    break;
                };
                let Some(sender) = tx.clone() else { break };

                scope.spawn(move || {
                    let result = work(index, item);
                    if let Err(e) = sender.send((index, result)) {
                        error!("Failed to send completion signal: {}", e);
                    }
                });
                running_count += 1;
            }

            if running_count == 0 {
                break;
            }

            match rx.recv() {
                Ok((index, result)) => {
                    results[index] = Some(result);
                    running_count -= 1;
                    debug!("Job {} of {} finished ({} running)", index + 1, total, running_count);
                }
                Err(_) => break,
            }
        }
    });

    results.into_iter().flatten().collect()
}
