use crate::source::MessageSource;
use crate::stats::Counters;
use crate::store::EventStore;
use crate::worker::{Worker, WorkerSettings};
use crate::writer::Writer;
use futures_util::future::join_all;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Liveness of the worker pool, shared with the health endpoints.
#[derive(Debug, Default)]
pub struct PoolStatus {
    expected: AtomicUsize,
    live: AtomicUsize,
    shutting_down: AtomicBool,
}

impl PoolStatus {
    pub fn expected(&self) -> usize {
        self.expected.load(Ordering::SeqCst)
    }

    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    pub fn is_ready(&self) -> bool {
        let expected = self.expected();
        expected > 0 && self.live() == expected && !self.is_shutting_down()
    }
}

/// Decrements the live count when a worker task ends, including by panic.
struct LiveGuard(Arc<PoolStatus>);

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.live.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct WorkerPool<S: ?Sized> {
    writer: Writer<S>,
    counters: Arc<Counters>,
    settings: WorkerSettings,
    max_deliver: u32,
    status: Arc<PoolStatus>,
}

impl<S> WorkerPool<S>
where
    S: EventStore + ?Sized + 'static,
{
    pub fn new(
        writer: Writer<S>,
        counters: Arc<Counters>,
        settings: WorkerSettings,
        max_deliver: u32,
    ) -> Self {
        Self {
            writer,
            counters,
            settings,
            max_deliver,
            status: Arc::new(PoolStatus::default()),
        }
    }

    pub fn status(&self) -> Arc<PoolStatus> {
        self.status.clone()
    }

    /// Runs one worker per source until `cancel` fires and every worker has
    /// finished its final flush.
    pub async fn run<M>(self, sources: Vec<Arc<M>>, cancel: CancellationToken)
    where
        M: MessageSource + ?Sized + 'static,
    {
        let worker_count = sources.len();
        self.status.expected.store(worker_count, Ordering::SeqCst);
        info!(workers = worker_count, "starting consumer workers");

        let mut handles = Vec::with_capacity(worker_count);
        for (worker_id, source) in sources.into_iter().enumerate() {
            let worker = Worker::new(
                worker_id,
                source,
                self.writer.clone(),
                self.counters.clone(),
                self.settings,
                self.max_deliver,
            );

            self.status.live.fetch_add(1, Ordering::SeqCst);
            let guard = LiveGuard(self.status.clone());
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                let _guard = guard;
                worker.run(cancel).await
            }));
        }

        let status = self.status.clone();
        let watcher = cancel.clone();
        let shutdown_flag = tokio::spawn(async move {
            watcher.cancelled().await;
            status.shutting_down.store(true, Ordering::SeqCst);
        });

        for (worker_id, result) in join_all(handles).await.into_iter().enumerate() {
            if let Err(join_error) = result {
                error!(worker_id, error = %join_error, "worker task ended abnormally");
            }
        }
        shutdown_flag.abort();
        self.status.shutting_down.store(true, Ordering::SeqCst);

        info!("all consumer workers stopped");
    }
}
