use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Process-wide pipeline counters. Monotonic; never reset.
#[derive(Debug, Default)]
pub struct Counters {
    processed: AtomicU64,
    inserted: AtomicU64,
    batches: AtomicU64,
    errors: AtomicU64,
}

impl Counters {
    pub fn record_processed(&self, count: u64) {
        self.processed.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_inserted(&self, count: u64) {
        self.inserted.fetch_add(count, Ordering::Relaxed);
        self.batches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_errors(&self, count: u64) {
        self.errors.fetch_add(count, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            inserted: self.inserted.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub processed: u64,
    pub inserted: u64,
    pub batches: u64,
    pub errors: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rates {
    pub processed_per_sec: f64,
    pub inserted_per_sec: f64,
    pub batches_per_sec: f64,
}

/// Previous cumulative values, used to turn totals into per-interval rates.
#[derive(Debug, Default)]
pub struct RateWindow {
    baseline: CounterSnapshot,
}

impl RateWindow {
    pub fn advance(&mut self, current: CounterSnapshot, elapsed: Duration) -> Rates {
        let seconds = elapsed.as_secs_f64();
        let rate = |now: u64, before: u64| {
            if seconds > 0.0 {
                now.saturating_sub(before) as f64 / seconds
            } else {
                0.0
            }
        };

        let rates = Rates {
            processed_per_sec: rate(current.processed, self.baseline.processed),
            inserted_per_sec: rate(current.inserted, self.baseline.inserted),
            batches_per_sec: rate(current.batches, self.baseline.batches),
        };
        self.baseline = current;
        rates
    }
}

pub struct StatsReporter {
    interval: Duration,
}

impl StatsReporter {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    pub async fn run(self, counters: &Counters, cancel: CancellationToken) {
        let mut window = RateWindow::default();
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_tick = Instant::now();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let now = Instant::now();
                    let current = counters.snapshot();
                    let rates = window.advance(current, now - last_tick);
                    last_tick = now;

                    info!(
                        processed_per_sec = round2(rates.processed_per_sec),
                        inserted_per_sec = round2(rates.inserted_per_sec),
                        batches_per_sec = round2(rates.batches_per_sec),
                        total_processed = current.processed,
                        total_inserted = current.inserted,
                        total_errors = current.errors,
                        "pipeline stats"
                    );
                }
            }
        }
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

pub fn log_final(counters: &Counters) {
    let totals = counters.snapshot();
    info!(
        total_processed = totals.processed,
        total_inserted = totals.inserted,
        total_batches = totals.batches,
        total_errors = totals.errors,
        "final pipeline stats"
    );
}
