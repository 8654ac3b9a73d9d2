//! Event dispatcher: one worker per identity, bounded concurrency overall.
//!
//! Events for the same identity are handled in arrival order by that
//! identity's worker. Workers for different identities run in parallel,
//! limited by a shared semaphore. A worker retires as soon as its queue is
//! empty, so the map only holds identities with work in flight.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{Mutex, Semaphore, mpsc};
use tokio::task::JoinHandle;

use crate::channels::EventStream;
use crate::review::engine::ReviewEngine;
use crate::review::event::{Identity, InboundEvent};

/// Consumer of inbound events.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    async fn handle_event(&self, event: InboundEvent);
}

#[async_trait]
impl EventHandler for ReviewEngine {
    async fn handle_event(&self, event: InboundEvent) {
        ReviewEngine::handle_event(self, event).await;
    }
}

struct Worker {
    id: u64,
    tx: mpsc::UnboundedSender<InboundEvent>,
    handle: JoinHandle<()>,
}

type WorkerMap = Arc<Mutex<HashMap<Identity, Worker>>>;

pub struct Dispatcher {
    handler: Arc<dyn EventHandler>,
    permits: Arc<Semaphore>,
    workers: WorkerMap,
    next_id: AtomicU64,
}

impl Dispatcher {
    pub fn new(handler: Arc<dyn EventHandler>, max_concurrent: usize) -> Self {
        Self {
            handler,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            workers: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
        }
    }

    /// Queue an event on its sender's worker, spawning the worker if needed.
    ///
    /// Sends happen under the map lock, which is also where a worker checks
    /// its queue one last time before retiring.
    pub async fn dispatch(&self, event: InboundEvent) {
        let mut workers = self.workers.lock().await;
        let identity = event.sender.clone();

        let event = match workers.get(&identity) {
            Some(worker) => match worker.tx.send(event) {
                Ok(()) => return,
                // Worker exited; replace it below.
                Err(mpsc::error::SendError(event)) => event,
            },
            None => event,
        };

        let worker = self.spawn_worker(identity.clone());
        if worker.tx.send(event).is_err() {
            tracing::error!(identity = %identity, "New worker rejected event");
        }
        workers.insert(identity, worker);
    }

    /// Dispatch every event of `stream` until it ends.
    pub async fn run(&self, mut stream: EventStream) {
        while let Some(event) = stream.next().await {
            self.dispatch(event).await;
        }
        tracing::info!("Event stream ended");
    }

    /// Number of live identity workers.
    pub async fn worker_count(&self) -> usize {
        self.workers.lock().await.len()
    }

    /// Stop accepting events and wait for every queued one to be handled.
    pub async fn shutdown(&self) {
        let workers: Vec<Worker> = self.workers.lock().await.drain().map(|(_, w)| w).collect();
        let handles: Vec<JoinHandle<()>> = workers
            .into_iter()
            .map(|Worker { tx, handle, .. }| {
                drop(tx);
                handle
            })
            .collect();
        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                tracing::error!("Worker task failed: {e}");
            }
        }
        tracing::info!("Dispatcher drained");
    }

    fn spawn_worker(&self, identity: Identity) -> Worker {
        let (tx, mut rx) = mpsc::unbounded_channel::<InboundEvent>();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handler = Arc::clone(&self.handler);
        let permits = Arc::clone(&self.permits);
        let workers = Arc::clone(&self.workers);

        let handle = tokio::spawn(async move {
            loop {
                let event = match rx.try_recv() {
                    Ok(event) => event,
                    Err(TryRecvError::Disconnected) => break,
                    Err(TryRecvError::Empty) => {
                        let mut workers = workers.lock().await;
                        match rx.try_recv() {
                            Ok(event) => event,
                            Err(_) => {
                                // A replacement may already own the slot.
                                if workers.get(&identity).is_some_and(|w| w.id == id) {
                                    workers.remove(&identity);
                                }
                                break;
                            }
                        }
                    }
                };
                let Ok(_permit) = permits.acquire().await else {
                    break;
                };
                handler.handle_event(event).await;
            }
            tracing::debug!(identity = %identity, "Worker stopped");
        });

        Worker { id, tx, handle }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::review::event::EventKind;

    #[derive(Default)]
    struct RecordingHandler {
        seen: std::sync::Mutex<Vec<(String, String)>>,
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl EventHandler for RecordingHandler {
        async fn handle_event(&self, event: InboundEvent) {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);

            let text = match &event.kind {
                EventKind::Text(t) => t.clone(),
                other => other.label().to_string(),
            };
            // First message of each sender is the slowest.
            let delay = if text == "A" { 30 } else { 5 };
            tokio::time::sleep(Duration::from_millis(delay)).await;

            self.seen
                .lock()
                .unwrap()
                .push((event.sender.key().to_string(), text));
            self.running.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn same_identity_events_keep_arrival_order() {
        let handler = Arc::new(RecordingHandler::default());
        let dispatcher = Dispatcher::new(handler.clone(), 4);

        dispatcher.dispatch(InboundEvent::text("u1", "c1", "A")).await;
        dispatcher.dispatch(InboundEvent::text("u1", "c1", "B")).await;
        dispatcher.shutdown().await;

        let seen = handler.seen.lock().unwrap();
        let texts: Vec<&str> = seen.iter().map(|(_, t)| t.as_str()).collect();
        assert_eq!(texts, vec!["A", "B"]);
    }

    #[tokio::test]
    async fn different_identities_run_in_parallel() {
        let handler = Arc::new(RecordingHandler::default());
        let dispatcher = Dispatcher::new(handler.clone(), 4);

        for sender in ["u1", "u2", "u3"] {
            dispatcher.dispatch(InboundEvent::text(sender, "c", "A")).await;
        }
        dispatcher.shutdown().await;

        assert_eq!(handler.seen.lock().unwrap().len(), 3);
        assert!(handler.peak.load(Ordering::SeqCst) > 1);
    }

    #[tokio::test]
    async fn concurrency_is_bounded() {
        let handler = Arc::new(RecordingHandler::default());
        let dispatcher = Dispatcher::new(handler.clone(), 2);

        for i in 0..8 {
            let sender = format!("u{i}");
            dispatcher
                .dispatch(InboundEvent::text(&sender, "c", "A"))
                .await;
        }
        assert_eq!(dispatcher.worker_count().await, 8);
        dispatcher.shutdown().await;

        assert_eq!(handler.seen.lock().unwrap().len(), 8);
        assert!(handler.peak.load(Ordering::SeqCst) <= 2);
    }

    async fn wait_until_idle(dispatcher: &Dispatcher) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while dispatcher.worker_count().await > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("workers did not retire");
    }

    #[tokio::test]
    async fn workers_retire_once_their_queue_is_empty() {
        let handler = Arc::new(RecordingHandler::default());
        let dispatcher = Dispatcher::new(handler.clone(), 4);

        for i in 0..50 {
            let sender = format!("stranger{i}");
            dispatcher
                .dispatch(InboundEvent::text(&sender, "c", "B"))
                .await;
        }
        wait_until_idle(&dispatcher).await;

        assert_eq!(dispatcher.worker_count().await, 0);
        assert_eq!(handler.seen.lock().unwrap().len(), 50);
    }

    #[tokio::test]
    async fn identity_gets_a_fresh_worker_after_retiring() {
        let handler = Arc::new(RecordingHandler::default());
        let dispatcher = Dispatcher::new(handler.clone(), 4);

        dispatcher.dispatch(InboundEvent::text("u1", "c", "A")).await;
        wait_until_idle(&dispatcher).await;

        dispatcher.dispatch(InboundEvent::text("u1", "c", "B")).await;
        dispatcher.shutdown().await;

        let seen = handler.seen.lock().unwrap();
        let texts: Vec<&str> = seen.iter().map(|(_, t)| t.as_str()).collect();
        assert_eq!(texts, vec!["A", "B"]);
    }

    #[tokio::test]
    async fn identities_differing_only_in_case_share_a_worker() {
        let handler = Arc::new(RecordingHandler::default());
        let dispatcher = Dispatcher::new(handler.clone(), 4);

        dispatcher.dispatch(InboundEvent::text("@Ana", "c", "A")).await;
        dispatcher.dispatch(InboundEvent::text("ana", "c", "B")).await;
        assert_eq!(dispatcher.worker_count().await, 1);
        dispatcher.shutdown().await;

        let seen = handler.seen.lock().unwrap();
        assert_eq!(seen[0].1, "A");
        assert_eq!(seen[1].1, "B");
    }
}
