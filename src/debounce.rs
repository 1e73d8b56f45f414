use std::collections::HashMap;
use std::future;
use std::hash::Hash;
use std::time::Duration;

use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tokio_stream::wrappers::UnboundedReceiverStream;

struct Pending<T> {
    deadline: Instant,
    seq: u64,
    item: T,
}

async fn sleep_until_some(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => future::pending().await,
    }
}

/// Emits an item once `quiet` has passed without a newer item of the same
/// key. Newer items replace the pending one, pending items are flushed when
/// the input ends.
pub fn debounce_by_key<S, K, F>(
    stream: S,
    quiet: Duration,
    mut key_fn: F,
) -> UnboundedReceiverStream<S::Item>
where
    S: Stream + Send + 'static,
    S::Item: Send + 'static,
    K: Eq + Hash + Clone + Send + 'static,
    F: FnMut(&S::Item) -> K + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let mut stream = Box::pin(stream);
        let mut pending: HashMap<K, Pending<S::Item>> = HashMap::new();
        let mut seq = 0u64;

        loop {
            let next_deadline = pending.values().map(|p| p.deadline).min();

            tokio::select! {
                item = stream.next() => {
                    let Some(item) = item else { break };
                    let key = key_fn(&item);
                    seq += 1;
                    pending.insert(key, Pending { deadline: Instant::now() + quiet, seq, item });
                }
                _ = sleep_until_some(next_deadline) => {
                    let now = Instant::now();
                    let due: Vec<K> = pending
                        .iter()
                        .filter(|(_, p)| p.deadline <= now)
                        .map(|(key, _)| key.clone())
                        .collect();
                    let mut items: Vec<_> = due.iter().filter_map(|key| pending.remove(key)).collect();
                    items.sort_by_key(|p| (p.deadline, p.seq));

                    for p in items {
                        if tx.send(p.item).is_err() {
                            return;
                        }
                    }
                }
            }
        }

        let mut rest: Vec<_> = pending.into_values().collect();
        rest.sort_by_key(|p| (p.deadline, p.seq));
        for p in rest {
            let _ = tx.send(p.item);
        }
    });

    UnboundedReceiverStream::new(rx)
}
