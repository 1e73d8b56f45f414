//! Per-key throttling that lets an item through only after enough items
//! *and* enough time have passed since the previous one.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use futures::{future, Stream, StreamExt};
use rand::Rng;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SkipConfig {
    pub min_skip: u32,
    pub max_skip: u32,
    pub min_wait: Duration,
    pub max_wait: Duration,
}

impl Default for SkipConfig {
    fn default() -> Self {
        Self {
            min_skip: 60,
            max_skip: 180,
            min_wait: Duration::from_secs(60),
            max_wait: Duration::from_secs(120),
        }
    }
}

/// Counters of one key between two emissions.
#[derive(Debug)]
struct Cycle {
    skipped: u32,
    to_skip: u32,
    started: Instant,
    to_wait: Duration,
}

impl Cycle {
    fn start(config: &SkipConfig, now: Instant) -> Self {
        let mut rng = rand::rng();
        let to_skip = rng.random_range(config.min_skip..=config.max_skip.max(config.min_skip));
        let spread = config.max_wait.saturating_sub(config.min_wait);
        let to_wait = config.min_wait + spread.mul_f64(rng.random::<f64>());

        Self {
            skipped: 0,
            to_skip,
            started: now,
            to_wait,
        }
    }

    fn is_due(&self, now: Instant) -> bool {
        self.skipped >= self.to_skip && now.duration_since(self.started) >= self.to_wait
    }
}

pub struct SkipSome<K, F> {
    config: SkipConfig,
    key_fn: F,
    cycles: HashMap<K, Cycle>,
}

impl<K: Eq + Hash, F> SkipSome<K, F> {
    pub fn new(config: SkipConfig, key_fn: F) -> Self {
        Self {
            config,
            key_fn,
            cycles: HashMap::new(),
        }
    }

    /// Feeds one item through the state machine of its key.
    ///
    /// The first item of a key only seeds its cycle and is never returned.
    pub fn admit<T>(&mut self, item: T) -> Option<T>
    where
        F: FnMut(&T) -> K,
    {
        let key = (self.key_fn)(&item);
        let now = Instant::now();

        match self.cycles.entry(key) {
            Entry::Vacant(entry) => {
                entry.insert(Cycle::start(&self.config, now));
                None
            }
            Entry::Occupied(mut entry) => {
                let cycle = entry.get_mut();
                if cycle.is_due(now) {
                    *cycle = Cycle::start(&self.config, now);
                    Some(item)
                } else {
                    cycle.skipped += 1;
                    None
                }
            }
        }
    }
}

/// Stream adapter around [`SkipSome`]. Order is kept and the output ends
/// when the input ends.
pub fn skip_some<S, K, F>(stream: S, config: SkipConfig, key_fn: F) -> impl Stream<Item = S::Item>
where
    S: Stream,
    K: Eq + Hash,
    F: FnMut(&S::Item) -> K,
{
    let mut state = SkipSome::new(config, key_fn);
    stream.filter_map(move |item| future::ready(state.admit(item)))
}
