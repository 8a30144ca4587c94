//! Request collapsing: concurrent identical requests share one execution.
//!
//! The first caller for a key becomes the leader and runs the work inline;
//! later callers for the same key wait on a watch channel for the leader's
//! outcome. Completion clears the slot, so a request arriving afterwards
//! starts a new generation instead of queueing behind the old one.
//!
//! If the leader's future is dropped mid-flight, its guard publishes
//! `Error::Cancelled` to every waiter and frees the slot.

use crate::error::{Error, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

type Outcome<V> = Option<Result<V>>;

struct Slot<V> {
    generation: u64,
    receiver: watch::Receiver<Outcome<V>>,
}

enum Role<V> {
    Leader(LeaderGuard<V>),
    Follower(watch::Receiver<Outcome<V>>),
}

/// Collapses concurrent executions per key. Strictly process-local.
pub struct RequestCollapser<V> {
    in_flight: Arc<DashMap<String, Slot<V>>>,
    generation: AtomicU64,
}

impl<V> Default for RequestCollapser<V> {
    fn default() -> Self {
        RequestCollapser {
            in_flight: Arc::new(DashMap::new()),
            generation: AtomicU64::new(0),
        }
    }
}

impl<V: Clone + Send + Sync + 'static> RequestCollapser<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys with an execution in flight.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Run `work` for `key`, or wait for the execution already in flight.
    ///
    /// Every caller of one generation receives a clone of the same outcome,
    /// error included.
    pub async fn run<F, Fut>(&self, key: &str, work: F) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        let role = match self.in_flight.entry(key.to_string()) {
            Entry::Occupied(slot) => Role::Follower(slot.get().receiver.clone()),
            Entry::Vacant(free) => {
                let (sender, receiver) = watch::channel(None);
                let generation = self.generation.fetch_add(1, Ordering::Relaxed);
                free.insert(Slot {
                    generation,
                    receiver,
                });
                Role::Leader(LeaderGuard {
                    in_flight: Arc::clone(&self.in_flight),
                    key: key.to_string(),
                    generation,
                    sender: Some(sender),
                })
            }
        };

        match role {
            Role::Leader(mut guard) => {
                let outcome = work().await;
                guard.complete(outcome.clone());
                outcome
            }
            Role::Follower(receiver) => {
                debug!("Collapsing request for {} onto in-flight execution", key);
                wait_for_outcome(receiver).await
            }
        }
    }
}

async fn wait_for_outcome<V: Clone>(mut receiver: watch::Receiver<Outcome<V>>) -> Result<V> {
    loop {
        let current = receiver.borrow_and_update().clone();
        if let Some(outcome) = current {
            return outcome;
        }
        if receiver.changed().await.is_err() {
            let last = receiver.borrow().clone();
            return last.unwrap_or(Err(Error::Cancelled));
        }
    }
}

struct LeaderGuard<V> {
    in_flight: Arc<DashMap<String, Slot<V>>>,
    key: String,
    generation: u64,
    sender: Option<watch::Sender<Outcome<V>>>,
}

impl<V> LeaderGuard<V> {
    fn complete(&mut self, outcome: Result<V>) {
        if let Some(sender) = self.sender.take() {
            let generation = self.generation;
            self.in_flight
                .remove_if(&self.key, |_, slot| slot.generation == generation);
            sender.send_replace(Some(outcome));
        }
    }
}

impl<V> Drop for LeaderGuard<V> {
    fn drop(&mut self) {
        if self.sender.is_some() {
            debug!("✗ Collapsed execution for {} dropped before completion", self.key);
            self.complete(Err(Error::Cancelled));
        }
    }
}
