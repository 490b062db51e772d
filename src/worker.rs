use crate::ack::AckCoordinator;
use crate::batch::BatchAccumulator;
use crate::source::{Delivery, MessageSource};
use crate::stats::Counters;
use crate::store::EventStore;
use crate::writer::Writer;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const FETCH_ERROR_PAUSE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSettings {
    pub batch_size: usize,
    pub batch_timeout: Duration,
    pub fetch_wait: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Running,
    Flushing,
    ShuttingDown,
    Stopped,
}

pub struct Worker<M: ?Sized, S: ?Sized> {
    id: usize,
    source: Arc<M>,
    writer: Writer<S>,
    acks: AckCoordinator<M>,
    counters: Arc<Counters>,
    settings: WorkerSettings,
    accumulator: BatchAccumulator,
    state: WorkerState,
}

impl<M, S> Worker<M, S>
where
    M: MessageSource + ?Sized,
    S: EventStore + ?Sized,
{
    pub fn new(
        id: usize,
        source: Arc<M>,
        writer: Writer<S>,
        counters: Arc<Counters>,
        settings: WorkerSettings,
        max_deliver: u32,
    ) -> Self {
        Self {
            id,
            acks: AckCoordinator::new(source.clone(), counters.clone(), max_deliver, id),
            source,
            writer,
            counters,
            settings,
            accumulator: BatchAccumulator::new(settings.batch_size, settings.batch_timeout),
            state: WorkerState::Running,
        }
    }

    /// Fetches, buffers and flushes until `cancel` fires, then flushes what is
    /// left exactly once.
    pub async fn run(mut self, cancel: CancellationToken) -> WorkerState {
        info!(worker_id = self.id, "worker started");
        self.accumulator.reset_timer();

        while !cancel.is_cancelled() {
            if self.accumulator.is_due() {
                self.flush().await;
                continue;
            }

            let until_flush = self
                .accumulator
                .deadline()
                .saturating_duration_since(Instant::now());
            let wait = self.settings.fetch_wait.min(until_flush);
            let max = self.accumulator.remaining();

            let fetched = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                fetched = self.source.fetch(max, wait) => fetched,
            };

            match fetched {
                Ok(deliveries) => self.absorb(deliveries).await,
                Err(error) => {
                    warn!(worker_id = self.id, error = %error, "fetch failed");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = sleep(FETCH_ERROR_PAUSE) => {}
                    }
                }
            }
        }

        self.state = WorkerState::ShuttingDown;
        if !self.accumulator.is_empty() {
            info!(
                worker_id = self.id,
                batch_len = self.accumulator.len(),
                "flushing buffered events before shutdown"
            );
            self.flush().await;
        }

        self.state = WorkerState::Stopped;
        info!(worker_id = self.id, "worker stopped");
        self.state
    }

    async fn absorb(&mut self, deliveries: Vec<Delivery>) {
        let mut rejected = false;
        for delivery in deliveries {
            match delivery.decoded {
                Ok(event) => {
                    self.counters.record_processed(1);
                    if self.accumulator.push(event, delivery.handle) {
                        self.flush().await;
                    }
                }
                Err(malformed) => {
                    self.acks.reject(&delivery.handle, &malformed).await;
                    rejected = true;
                }
            }
        }

        if rejected {
            self.acks.commit().await;
        }
    }

    async fn flush(&mut self) {
        let batch = self.accumulator.take();
        if batch.is_empty() {
            return;
        }

        let previous = self.state;
        if previous == WorkerState::Running {
            self.state = WorkerState::Flushing;
        }

        let started = Instant::now();
        match self.writer.insert(&batch, self.id).await {
            Ok(attempts) => {
                self.acks.ack_all(&batch).await;
                let elapsed = started.elapsed();
                debug!(
                    worker_id = self.id,
                    batch_len = batch.len(),
                    attempts,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "batch flushed"
                );
            }
            Err(failure) => self.acks.nak_all(&batch, &failure).await,
        }

        self.accumulator.reset_timer();
        self.state = previous;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{LogBroker, MemoryBroker, ScriptedStore};
    use crate::writer::RetryPolicy;
    use tokio::task::JoinHandle;

    fn settings(batch_size: usize, batch_timeout_secs: u64) -> WorkerSettings {
        WorkerSettings {
            batch_size,
            batch_timeout: Duration::from_secs(batch_timeout_secs),
            fetch_wait: Duration::from_secs(1),
        }
    }

    fn spawn_worker<B: MessageSource + Clone + 'static>(
        broker: &B,
        store: &Arc<ScriptedStore>,
        settings: WorkerSettings,
        max_deliver: u32,
        cancel: &CancellationToken,
    ) -> (JoinHandle<WorkerState>, Arc<Counters>) {
        let counters = Arc::new(Counters::default());
        let worker = Worker::new(
            0,
            Arc::new(broker.clone()),
            Writer::new(store.clone(), RetryPolicy::default()),
            counters.clone(),
            settings,
            max_deliver,
        );
        (tokio::spawn(worker.run(cancel.clone())), counters)
    }

    fn batch_lens(store: &ScriptedStore) -> Vec<usize> {
        store.inserted_batches().iter().map(Vec::len).collect()
    }

    fn inserted_agents(store: &ScriptedStore) -> Vec<String> {
        let mut agents = store
            .inserted_batches()
            .into_iter()
            .flatten()
            .map(|row| row.agent_id)
            .collect::<Vec<_>>();
        agents.sort();
        agents
    }

    #[tokio::test(start_paused = true)]
    async fn size_trigger_flushes_full_batch_and_buffers_rest() {
        let broker = MemoryBroker::new();
        broker.publish_events(5);
        let store = Arc::new(ScriptedStore::healthy());
        let cancel = CancellationToken::new();
        let (handle, _) = spawn_worker(&broker, &store, settings(3, 60), 5, &cancel);

        sleep(Duration::from_secs(2)).await;
        assert_eq!(batch_lens(&store), vec![3]);
        assert_eq!(broker.acked(), vec![0, 1, 2]);

        cancel.cancel();
        assert_eq!(handle.await.unwrap(), WorkerState::Stopped);
        assert_eq!(batch_lens(&store), vec![3, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn timer_flushes_partial_batch() {
        let broker = MemoryBroker::new();
        broker.publish_events(2);
        let store = Arc::new(ScriptedStore::healthy());
        let cancel = CancellationToken::new();
        let (handle, _) = spawn_worker(&broker, &store, settings(3, 5), 5, &cancel);

        sleep(Duration::from_secs(4)).await;
        assert!(store.inserted_batches().is_empty());

        sleep(Duration::from_secs(2)).await;
        assert_eq!(batch_lens(&store), vec![2]);

        sleep(Duration::from_secs(20)).await;
        assert_eq!(store.attempts(), 1);

        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(store.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_flushes_buffer_exactly_once() {
        let broker = MemoryBroker::new();
        broker.publish_events(2);
        let store = Arc::new(ScriptedStore::healthy());
        let cancel = CancellationToken::new();
        let (handle, counters) = spawn_worker(&broker, &store, settings(10, 60), 5, &cancel);

        sleep(Duration::from_secs(1)).await;
        assert_eq!(store.attempts(), 0);

        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(store.attempts(), 1);
        assert_eq!(batch_lens(&store), vec![2]);
        assert_eq!(broker.acked(), vec![0, 1]);
        assert_eq!(counters.snapshot().inserted, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_store_failures_still_ack_once() {
        let broker = MemoryBroker::new();
        broker.publish_events(4);
        let store = Arc::new(ScriptedStore::failing(2));
        let cancel = CancellationToken::new();
        let (handle, counters) = spawn_worker(&broker, &store, settings(4, 60), 5, &cancel);

        sleep(Duration::from_secs(10)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(batch_lens(&store), vec![4]);
        assert_eq!(broker.acked(), vec![0, 1, 2, 3]);
        assert!(broker.naked().is_empty());
        assert_eq!(counters.snapshot().errors, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_nak_whole_batch_for_redelivery() {
        let broker = MemoryBroker::new();
        broker.publish_events(2);
        let store = Arc::new(ScriptedStore::failing(4));
        let cancel = CancellationToken::new();
        let (handle, counters) = spawn_worker(&broker, &store, settings(2, 60), 5, &cancel);

        // 1s + 2s + 3s of backoff for the first batch.
        sleep(Duration::from_secs(7)).await;
        assert_eq!(broker.naked(), vec![0, 1]);

        sleep(Duration::from_secs(3)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(store.attempts(), 5);
        assert_eq!(batch_lens(&store), vec![2]);
        assert_eq!(broker.acked(), vec![0, 1]);
        let totals = counters.snapshot();
        assert_eq!(totals.errors, 2);
        assert_eq!(totals.inserted, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_messages_skip_the_batch_and_reach_dead_letter() {
        let broker = MemoryBroker::new();
        broker.publish(b"{not json".to_vec());
        broker.publish_events(1);
        let store = Arc::new(ScriptedStore::healthy());
        let cancel = CancellationToken::new();
        let (handle, counters) = spawn_worker(&broker, &store, settings(10, 2), 3, &cancel);

        sleep(Duration::from_secs(10)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(broker.naked(), vec![0, 0]);
        assert_eq!(broker.dead_lettered(), vec![0]);
        assert_eq!(broker.acked(), vec![0, 1]);
        assert_eq!(store.inserted_rows(), 1);
        assert_eq!(counters.snapshot().errors, 3);
        assert_eq!(counters.snapshot().processed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_errors_pause_then_resume() {
        let broker = MemoryBroker::new();
        broker.fail_next_fetches(2);
        broker.publish_events(3);
        let store = Arc::new(ScriptedStore::healthy());
        let cancel = CancellationToken::new();
        let (handle, _) = spawn_worker(&broker, &store, settings(3, 60), 5, &cancel);

        sleep(Duration::from_secs(3)).await;
        assert_eq!(batch_lens(&store), vec![3]);

        cancel.cancel();
        handle.await.unwrap();
        assert!(broker.naked().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_fetch_error_pause_stops_promptly() {
        let broker = MemoryBroker::new();
        broker.fail_next_fetches(u32::MAX);
        let store = Arc::new(ScriptedStore::healthy());
        let cancel = CancellationToken::new();
        let (handle, _) = spawn_worker(&broker, &store, settings(3, 60), 5, &cancel);

        sleep(Duration::from_millis(500)).await;
        let started = Instant::now();
        cancel.cancel();
        assert_eq!(handle.await.unwrap(), WorkerState::Stopped);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(store.attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn decode_failure_mid_fetch_leaves_neighbours_written_once() {
        let broker = LogBroker::new();
        broker.append_events(0..1);
        broker.append(b"{not json".to_vec());
        broker.append_events(1..3);
        let store = Arc::new(ScriptedStore::healthy());
        let cancel = CancellationToken::new();
        let (handle, counters) = spawn_worker(&broker, &store, settings(10, 2), 3, &cancel);

        sleep(Duration::from_secs(20)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(batch_lens(&store), vec![3]);
        assert_eq!(inserted_agents(&store), vec!["agent-0", "agent-1", "agent-2"]);
        assert_eq!(broker.reads(), 4);
        assert_eq!(broker.dead_lettered(), vec![1]);
        assert_eq!(broker.committed(), 4);
        assert_eq!(counters.snapshot().errors, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn undeliverable_message_without_limit_holds_commit_but_not_neighbours() {
        let broker = LogBroker::new();
        broker.append(b"{not json".to_vec());
        broker.append_events(0..3);
        let store = Arc::new(ScriptedStore::healthy());
        let cancel = CancellationToken::new();
        let (handle, _) = spawn_worker(&broker, &store, settings(10, 2), 0, &cancel);

        sleep(Duration::from_secs(30)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(store.inserted_rows(), 3);
        assert_eq!(broker.reads(), 4);
        assert_eq!(broker.committed(), 0);
        assert!(broker.dead_lettered().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_batch_is_redelivered_without_rereading_the_log() {
        let broker = LogBroker::new();
        broker.append_events(0..6);
        let store = Arc::new(ScriptedStore::failing(4));
        let cancel = CancellationToken::new();
        let (handle, counters) = spawn_worker(&broker, &store, settings(3, 60), 5, &cancel);

        sleep(Duration::from_secs(20)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(store.attempts(), 6);
        assert_eq!(batch_lens(&store), vec![3, 3]);
        assert_eq!(
            inserted_agents(&store),
            (0..6).map(|id| format!("agent-{id}")).collect::<Vec<_>>()
        );
        assert_eq!(broker.reads(), 6);
        assert_eq!(broker.committed(), 6);
        let totals = counters.snapshot();
        assert_eq!(totals.errors, 3);
        assert_eq!(totals.inserted, 6);
    }

    #[tokio::test(start_paused = true)]
    async fn replacement_consumer_resumes_unwritten_events_from_commit() {
        let broker = LogBroker::new();
        broker.append_events(0..3);
        let failing = Arc::new(ScriptedStore::failing(4));
        let cancel = CancellationToken::new();
        let (handle, _) = spawn_worker(&broker, &failing, settings(10, 60), 5, &cancel);

        sleep(Duration::from_secs(2)).await;
        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(failing.attempts(), 4);
        assert_eq!(failing.inserted_rows(), 0);
        assert_eq!(broker.committed(), 0);

        broker.restart();
        let healthy = Arc::new(ScriptedStore::healthy());
        let cancel = CancellationToken::new();
        let (handle, _) = spawn_worker(&broker, &healthy, settings(10, 2), 5, &cancel);

        sleep(Duration::from_secs(5)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(batch_lens(&healthy), vec![3]);
        assert_eq!(broker.committed(), 3);
        assert_eq!(broker.reads(), 6);
    }
}
