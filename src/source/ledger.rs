//! Per-partition offset bookkeeping for a Kafka consumer.
//!
//! Kafka only understands a committed position per partition, so individual
//! acks and naks are folded into a commit frontier: the lowest delivered
//! offset that has not been acked. A nak keeps its offset pending (holding the
//! frontier back) and queues that one message for local redelivery; the
//! partition is never rewound, so neighbours that were already read are not
//! read again. Payloads are retained until their offset is acked.

use super::{Delivery, MessageHandle};
use std::collections::{BTreeMap, BTreeSet, HashMap};

#[derive(Debug, Default)]
pub struct OffsetLedger {
    partitions: HashMap<i32, PartitionLedger>,
}

#[derive(Debug)]
struct InFlight {
    payload: Option<Vec<u8>>,
    deliveries: u32,
}

#[derive(Debug, Default)]
struct PartitionLedger {
    pending: BTreeMap<i64, InFlight>,
    redeliver: BTreeSet<i64>,
    next_offset: Option<i64>,
    committed: Option<i64>,
}

impl PartitionLedger {
    fn frontier(&self) -> Option<i64> {
        self.pending
            .first_key_value()
            .map(|(offset, _)| *offset)
            .or(self.next_offset)
    }
}

impl OffsetLedger {
    pub fn assign(&mut self, partition: i32) {
        self.partitions.entry(partition).or_default();
    }

    /// Forgets the partition, queued redeliveries included, and returns the
    /// frontier still to be committed for it.
    pub fn revoke(&mut self, partition: i32) -> Option<i64> {
        let ledger = self.partitions.remove(&partition)?;
        let frontier = ledger.frontier()?;
        (Some(frontier) != ledger.committed).then_some(frontier)
    }

    /// Records a delivery read from the broker and returns how many times this
    /// offset has been handed out.
    pub fn delivered(&mut self, partition: i32, offset: i64, payload: Option<&[u8]>) -> u32 {
        let ledger = self.partitions.entry(partition).or_default();
        ledger.next_offset = Some(
            ledger
                .next_offset
                .map_or(offset + 1, |next| next.max(offset + 1)),
        );
        ledger.redeliver.remove(&offset);

        let in_flight = ledger.pending.entry(offset).or_insert_with(|| InFlight {
            payload: payload.map(<[u8]>::to_vec),
            deliveries: 0,
        });
        in_flight.deliveries += 1;
        in_flight.deliveries
    }

    pub fn ack(&mut self, partition: i32, offset: i64) -> bool {
        match self.partitions.get_mut(&partition) {
            Some(ledger) => {
                ledger.redeliver.remove(&offset);
                ledger.pending.remove(&offset).is_some()
            }
            None => false,
        }
    }

    pub fn nak(&mut self, partition: i32, offset: i64) -> bool {
        let Some(ledger) = self.partitions.get_mut(&partition) else {
            return false;
        };

        if !ledger.pending.contains_key(&offset) {
            return false;
        }

        ledger.redeliver.insert(offset);
        true
    }

    /// Hands nak'd messages out again, lowest partition and offset first, with
    /// their delivery count bumped.
    pub fn take_redeliveries(&mut self, max: usize) -> Vec<Delivery> {
        let mut partitions = self.partitions.keys().copied().collect::<Vec<_>>();
        partitions.sort_unstable();

        let mut deliveries = Vec::new();
        for partition in partitions {
            let Some(ledger) = self.partitions.get_mut(&partition) else {
                continue;
            };

            while deliveries.len() < max {
                let Some(offset) = ledger.redeliver.pop_first() else {
                    break;
                };
                let Some(in_flight) = ledger.pending.get_mut(&offset) else {
                    continue;
                };

                in_flight.deliveries += 1;
                let handle = MessageHandle::new(partition, offset, in_flight.deliveries);
                deliveries.push(Delivery::decode(handle, in_flight.payload.as_deref()));
            }
        }
        deliveries
    }

    /// Partitions whose commit frontier moved since the last call.
    pub fn take_commits(&mut self) -> Vec<(i32, i64)> {
        let mut commits = Vec::new();
        for (partition, ledger) in self.partitions.iter_mut() {
            let Some(frontier) = ledger.frontier() else {
                continue;
            };

            if ledger.committed.is_some_and(|committed| committed >= frontier) {
                continue;
            }

            ledger.committed = Some(frontier);
            commits.push((*partition, frontier));
        }
        commits.sort_unstable();
        commits
    }
}
