//! In-memory broker and store used by the pipeline tests.

use crate::error::{SourceError, StoreError};
use crate::source::ledger::OffsetLedger;
use crate::source::{Delivery, MessageHandle, MessageSource};
use crate::store::{EventStore, TelemetryRow};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use telemetry_core::model::Event;
use tokio::time::sleep;

pub fn event(id: usize, event_type: &str) -> Event {
    Event {
        agent_id: format!("agent-{id}"),
        timestamp: 1_700_000_000_000 + id as i64,
        event_type: event_type.to_string(),
        mitre_tactic: String::new(),
        mitre_technique: String::new(),
        severity: 1,
        payload: format!("{{\"seq\":{id}}}"),
        tenant_id: "tenant-a".to_string(),
        hostname: "host-1".to_string(),
        os_type: "linux".to_string(),
    }
}

pub fn encoded(id: usize, event_type: &str) -> Vec<u8> {
    serde_json::to_vec(&event(id, event_type)).unwrap()
}

#[derive(Debug, Default)]
struct BrokerState {
    next_id: i64,
    queue: VecDeque<(i64, u32)>,
    payloads: HashMap<i64, Vec<u8>>,
    acked: Vec<i64>,
    naked: Vec<i64>,
    dead_lettered: Vec<i64>,
    commits: usize,
    failing_fetches: u32,
    failing_dead_letters: bool,
}

/// A single shared queue with competing consumers: a nak puts the message
/// back with its delivery count bumped.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, payload: Vec<u8>) -> i64 {
        let mut state = self.state.lock().unwrap();
        let id = state.next_id;
        state.next_id += 1;
        state.payloads.insert(id, payload);
        state.queue.push_back((id, 1));
        id
    }

    pub fn publish_events(&self, count: usize) {
        for id in 0..count {
            self.publish(encoded(id, "PROCESS_START"));
        }
    }

    pub fn fail_next_fetches(&self, count: u32) {
        self.state.lock().unwrap().failing_fetches = count;
    }

    pub fn fail_dead_letters(&self) {
        self.state.lock().unwrap().failing_dead_letters = true;
    }

    pub fn acked(&self) -> Vec<i64> {
        self.state.lock().unwrap().acked.clone()
    }

    pub fn naked(&self) -> Vec<i64> {
        self.state.lock().unwrap().naked.clone()
    }

    pub fn dead_lettered(&self) -> Vec<i64> {
        self.state.lock().unwrap().dead_lettered.clone()
    }

    pub fn commits(&self) -> usize {
        self.state.lock().unwrap().commits
    }

    pub fn queued(&self) -> usize {
        self.state.lock().unwrap().queue.len()
    }

    fn take(&self, max: usize) -> Result<Vec<Delivery>, SourceError> {
        let mut state = self.state.lock().unwrap();
        if state.failing_fetches > 0 {
            state.failing_fetches -= 1;
            return Err(SourceError::Closed);
        }

        let mut deliveries = Vec::new();
        while deliveries.len() < max {
            let Some((id, count)) = state.queue.pop_front() else {
                break;
            };
            let payload = state.payloads.get(&id).cloned();
            deliveries.push(Delivery::decode(
                MessageHandle::new(0, id, count),
                payload.as_deref(),
            ));
        }
        Ok(deliveries)
    }
}

#[async_trait]
impl MessageSource for MemoryBroker {
    async fn fetch(&self, max: usize, wait: Duration) -> Result<Vec<Delivery>, SourceError> {
        let deliveries = self.take(max)?;
        if !deliveries.is_empty() {
            return Ok(deliveries);
        }
        sleep(wait).await;
        self.take(max)
    }

    async fn ack(&self, handle: &MessageHandle) -> Result<(), SourceError> {
        self.state.lock().unwrap().acked.push(handle.offset());
        Ok(())
    }

    async fn nak(&self, handle: &MessageHandle) -> Result<(), SourceError> {
        let mut state = self.state.lock().unwrap();
        state.naked.push(handle.offset());
        state
            .queue
            .push_back((handle.offset(), handle.delivery_count() + 1));
        Ok(())
    }

    async fn commit(&self) -> Result<(), SourceError> {
        self.state.lock().unwrap().commits += 1;
        Ok(())
    }

    async fn dead_letter(
        &self,
        handle: &MessageHandle,
        _raw: &[u8],
        _reason: &str,
    ) -> Result<(), SourceError> {
        let mut state = self.state.lock().unwrap();
        if state.failing_dead_letters {
            return Err(SourceError::DeadLetter("dlq unavailable".into()));
        }
        state.dead_lettered.push(handle.offset());
        Ok(())
    }
}

#[derive(Debug, Default)]
struct LogState {
    log: Vec<Vec<u8>>,
    position: i64,
    committed: i64,
    reads: usize,
    ledger: OffsetLedger,
    dead_lettered: Vec<i64>,
}

/// One append-only partition read the way `KafkaSource` reads it: a position
/// that only moves forward, acks and naks folded through an `OffsetLedger`,
/// and a committed offset that a restarted consumer resumes from.
#[derive(Clone, Default)]
pub struct LogBroker {
    state: Arc<Mutex<LogState>>,
}

impl LogBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, payload: Vec<u8>) {
        self.state.lock().unwrap().log.push(payload);
    }

    pub fn append_events(&self, ids: std::ops::Range<usize>) {
        for id in ids {
            self.append(encoded(id, "NETWORK_CONN"));
        }
    }

    /// Total records read from the log, re-reads after a restart included.
    pub fn reads(&self) -> usize {
        self.state.lock().unwrap().reads
    }

    pub fn committed(&self) -> i64 {
        self.state.lock().unwrap().committed
    }

    pub fn dead_lettered(&self) -> Vec<i64> {
        self.state.lock().unwrap().dead_lettered.clone()
    }

    /// Drops everything in flight and resumes from the committed offset, as a
    /// replacement consumer would.
    pub fn restart(&self) {
        let mut state = self.state.lock().unwrap();
        state.position = state.committed;
        state.ledger = OffsetLedger::default();
    }

    fn read(&self, max: usize, deliveries: &mut Vec<Delivery>) {
        let mut state = self.state.lock().unwrap();
        while deliveries.len() < max {
            let offset = state.position;
            let Some(payload) = state.log.get(offset as usize).cloned() else {
                break;
            };
            state.position += 1;
            state.reads += 1;
            let count = state.ledger.delivered(0, offset, Some(&payload));
            deliveries.push(Delivery::decode(
                MessageHandle::new(0, offset, count),
                Some(&payload),
            ));
        }
    }
}

#[async_trait]
impl MessageSource for LogBroker {
    async fn fetch(&self, max: usize, wait: Duration) -> Result<Vec<Delivery>, SourceError> {
        let mut deliveries = self.state.lock().unwrap().ledger.take_redeliveries(max);
        self.read(max, &mut deliveries);
        if deliveries.len() < max {
            sleep(wait).await;
            self.read(max, &mut deliveries);
        }
        Ok(deliveries)
    }

    async fn ack(&self, handle: &MessageHandle) -> Result<(), SourceError> {
        let mut state = self.state.lock().unwrap();
        state.ledger.ack(handle.partition(), handle.offset());
        Ok(())
    }

    async fn nak(&self, handle: &MessageHandle) -> Result<(), SourceError> {
        let mut state = self.state.lock().unwrap();
        state.ledger.nak(handle.partition(), handle.offset());
        Ok(())
    }

    async fn commit(&self) -> Result<(), SourceError> {
        let mut state = self.state.lock().unwrap();
        for (_, offset) in state.ledger.take_commits() {
            state.committed = offset;
        }
        Ok(())
    }

    async fn dead_letter(
        &self,
        handle: &MessageHandle,
        _raw: &[u8],
        _reason: &str,
    ) -> Result<(), SourceError> {
        self.state
            .lock()
            .unwrap()
            .dead_lettered
            .push(handle.offset());
        Ok(())
    }
}

#[derive(Debug, Default)]
struct StoreState {
    failures_left: u32,
    attempted: Vec<Vec<TelemetryRow>>,
    inserted: Vec<Vec<TelemetryRow>>,
}

/// Store that fails a scripted number of inserts before succeeding.
#[derive(Debug, Default)]
pub struct ScriptedStore {
    state: Mutex<StoreState>,
}

impl ScriptedStore {
    pub fn healthy() -> Self {
        Self::default()
    }

    pub fn failing(failures: u32) -> Self {
        Self {
            state: Mutex::new(StoreState {
                failures_left: failures,
                ..StoreState::default()
            }),
        }
    }

    pub fn attempts(&self) -> usize {
        self.state.lock().unwrap().attempted.len()
    }

    pub fn attempted_batches(&self) -> Vec<Vec<TelemetryRow>> {
        self.state.lock().unwrap().attempted.clone()
    }

    pub fn inserted_batches(&self) -> Vec<Vec<TelemetryRow>> {
        self.state.lock().unwrap().inserted.clone()
    }

    pub fn inserted_rows(&self) -> usize {
        self.state.lock().unwrap().inserted.iter().map(Vec::len).sum()
    }
}

#[async_trait]
impl EventStore for ScriptedStore {
    async fn insert(&self, rows: &[TelemetryRow]) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        state.attempted.push(rows.to_vec());
        if state.failures_left > 0 {
            state.failures_left -= 1;
            return Err(StoreError::Rejected("scripted failure".into()));
        }
        state.inserted.push(rows.to_vec());
        Ok(())
    }
}
