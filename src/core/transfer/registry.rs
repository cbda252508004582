//! Per-handler transfer table.
//!
//! The registry is the single owner of every `Transfer` record and, for
//! inbound transfers, of the received chunk payloads. Removal is the one
//! place that authorizes a terminal report: whoever removes a record
//! reports its outcome, so no transfer is ever failed twice.

use super::types::{Direction, Transfer};
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};

#[derive(Debug)]
pub struct TransferRecord {
    pub transfer: Transfer,
    /// Inbound only: chunk index to payload.
    pub chunks: BTreeMap<u32, Bytes>,
    seq: u64,
}

#[derive(Debug, Default)]
pub struct TransferRegistry {
    records: HashMap<String, TransferRecord>,
    next_seq: u64,
}

impl TransferRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a fresh record. Returns `false` (and leaves the table alone)
    /// when the id is already taken.
    pub fn insert(&mut self, transfer: Transfer) -> bool {
        if self.records.contains_key(&transfer.id) {
            return false;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.records.insert(
            transfer.id.clone(),
            TransferRecord {
                transfer,
                chunks: BTreeMap::new(),
                seq,
            },
        );
        true
    }

    pub fn get(&self, id: &str) -> Option<&TransferRecord> {
        self.records.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut TransferRecord> {
        self.records.get_mut(id)
    }

    pub fn remove(&mut self, id: &str) -> Option<TransferRecord> {
        self.records.remove(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.records.contains_key(id)
    }

    /// Ids of every transfer tied to `peer`, oldest first.
    pub fn ids_for_peer(&self, peer: &str, direction: Direction) -> Vec<String> {
        let mut matching: Vec<&TransferRecord> = self
            .records
            .values()
            .filter(|r| r.transfer.peer == peer && r.transfer.direction == direction)
            .collect();
        matching.sort_by_key(|r| r.seq);
        matching.iter().map(|r| r.transfer.id.clone()).collect()
    }

    /// Oldest inbound transfer from `peer` still waiting for chunks.
    pub fn oldest_incomplete_inbound(&self, peer: &str) -> Option<String> {
        self.records
            .values()
            .filter(|r| {
                r.transfer.peer == peer
                    && r.transfer.direction == Direction::Inbound
                    && r.transfer.received_chunks < r.transfer.total_chunks
            })
            .min_by_key(|r| r.seq)
            .map(|r| r.transfer.id.clone())
    }

    /// Every live transfer, oldest first.
    #[cfg(test)]
    pub fn transfers(&self) -> impl Iterator<Item = &Transfer> {
        let mut records: Vec<&TransferRecord> = self.records.values().collect();
        records.sort_by_key(|r| r.seq);
        records.into_iter().map(|r| &r.transfer)
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }
}
