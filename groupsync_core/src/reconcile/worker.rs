//! Keyed worker pool for group events.
//!
//! Events for the same group are serialized; distinct groups reconcile in
//! parallel. An event arriving while its group is in flight is coalesced
//! into one follow-up run. Failed passes and passes asking for a requeue
//! are re-enqueued on a timer.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error, info};

use super::{GroupReconciler, REQUEUE_ON_ERROR};
use crate::resources::GroupEvent;

/// Drives the reconciler from an event channel.
pub struct WorkerPool {
    reconciler: Arc<GroupReconciler>,
    events_tx: mpsc::Sender<GroupEvent>,
}

impl WorkerPool {
    /// Create a pool that re-enqueues follow-up work on `events_tx`, the
    /// sender side of the channel whose receiver is passed to
    /// [`run`](Self::run).
    pub fn new(reconciler: Arc<GroupReconciler>, events_tx: mpsc::Sender<GroupEvent>) -> Self {
        Self {
            reconciler,
            events_tx,
        }
    }

    /// Consume events until the channel closes and all in-flight work has
    /// drained.
    pub async fn run(&self, mut events: mpsc::Receiver<GroupEvent>) {
        let (done_tx, mut done_rx) = mpsc::channel::<String>(64);
        let mut in_flight: HashSet<String> = HashSet::new();
        let mut pending: HashSet<String> = HashSet::new();
        let mut open = true;

        info!("group worker pool started");
        while open || !in_flight.is_empty() {
            tokio::select! {
                event = events.recv(), if open => match event {
                    Some(event) => {
                        if in_flight.contains(&event.name) {
                            // coalesce: one follow-up run covers any
                            // number of events that arrived meanwhile
                            debug!(group = %event.name, "reconcile in flight, coalescing event");
                            pending.insert(event.name);
                        } else {
                            in_flight.insert(event.name.to_owned());
                            self.spawn(event.name, done_tx.clone());
                        }
                    }
                    None => open = false,
                },
                Some(name) = done_rx.recv() => {
                    in_flight.remove(&name);
                    if pending.remove(&name) {
                        in_flight.insert(name.to_owned());
                        self.spawn(name, done_tx.clone());
                    }
                }
            }
        }
        info!("group worker pool drained");
    }

    fn spawn(&self, name: String, done_tx: mpsc::Sender<String>) {
        let reconciler = Arc::clone(&self.reconciler);
        let events_tx = self.events_tx.clone();
        tokio::spawn(async move {
            let requeue_after = match reconciler.reconcile(&name).await {
                Ok(outcome) => outcome.requeue_after,
                Err(err) => {
                    error!(group = %name, error = %format!("{err:#}"), "reconcile failed");
                    Some(REQUEUE_ON_ERROR)
                }
            };

            if let Some(delay) = requeue_after {
                schedule_requeue(events_tx, name.to_owned(), delay);
            }
            // the pool only needs to know the slot is free; if it's gone,
            // it is shutting down
            done_tx.send(name).await.ok();
        });
    }
}

fn schedule_requeue(events_tx: mpsc::Sender<GroupEvent>, name: String, delay: Duration) {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        debug!(group = %name, "requeueing group");
        events_tx.send(GroupEvent { name }).await.ok();
    });
}
