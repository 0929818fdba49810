// Copyright (C) 2022-2025 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of tracing-gelf.
//
// tracing-gelf is free software: you can redistribute it and/or modify it under the terms of the
// GNU General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// tracing-gelf is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with tracing-gelf.  If
// not, see <http://www.gnu.org/licenses/>.

//! Chunk reassembly.
//!
//! [`ReassemblyTable`] collects the chunks of in-flight messages, keyed by [`MessageId`], and
//! hands back the compressed payload once every chunk of a message has arrived. Chunks may arrive
//! in any order; a repeated chunk simply replaces its earlier copy.
//!
//! Sets that stay incomplete for longer than the staleness threshold are dropped on the floor.
//! UDP makes no delivery promises, so there is no one to tell; the loss is only counted (see
//! [`ReassemblyStats`]) & logged.
//!
//! The table does no locking of its own: it is meant to be owned by exactly one reader loop.

use crate::chunk::{unframe, Chunk, MessageId};

use bytes::Bytes;
use tracing::{debug, warn};

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

/// How long an incomplete message may go without receiving a chunk before it is evicted
pub const STALENESS_THRESHOLD: Duration = Duration::from_secs(5);

/// Running totals describing what the table has done
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReassemblyStats {
    /// messages fully reassembled
    pub completed: u64,
    /// incomplete messages evicted for staleness
    pub expired: u64,
    /// chunks that repeated an index we already held
    pub duplicates: u64,
    /// chunks whose count disagreed with the rest of their message
    pub rejected: u64,
}

struct Entry {
    count: u8,
    bodies: Vec<Option<Bytes>>,
    received: usize,
    updated: Instant,
}

impl Entry {
    fn new(count: u8, now: Instant) -> Entry {
        Entry {
            count,
            bodies: vec![None; usize::from(count)],
            received: 0,
            updated: now,
        }
    }
}

pub struct ReassemblyTable {
    entries: HashMap<MessageId, Entry>,
    staleness: Duration,
    stats: ReassemblyStats,
}

impl std::default::Default for ReassemblyTable {
    fn default() -> Self {
        ReassemblyTable::with_staleness(STALENESS_THRESHOLD)
    }
}

impl ReassemblyTable {
    pub fn new() -> ReassemblyTable {
        ReassemblyTable::default()
    }
    pub fn with_staleness(staleness: Duration) -> ReassemblyTable {
        ReassemblyTable {
            entries: HashMap::new(),
            staleness,
            stats: ReassemblyStats::default(),
        }
    }
    /// Number of messages currently in flight
    pub fn len(&self) -> usize {
        self.entries.len()
    }
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
    pub fn stats(&self) -> ReassemblyStats {
        self.stats
    }
    /// Record `chunk`; if that completes its message, return the reassembled compressed payload.
    pub fn insert(&mut self, chunk: Chunk) -> Option<Vec<u8>> {
        self.insert_at(chunk, Instant::now())
    }
    /// [`insert`](ReassemblyTable::insert), with the current time supplied by the caller
    pub fn insert_at(&mut self, chunk: Chunk, now: Instant) -> Option<Vec<u8>> {
        self.evict_stale(now);

        let entry = self
            .entries
            .entry(chunk.id)
            .or_insert_with(|| Entry::new(chunk.count, now));
        if entry.count != chunk.count {
            warn!(
                message_id = %chunk.id,
                expected = entry.count,
                got = chunk.count,
                "Dropping chunk whose sequence count disagrees with its message."
            );
            self.stats.rejected += 1;
            return None;
        }

        let slot = &mut entry.bodies[usize::from(chunk.index)];
        if slot.is_none() {
            entry.received += 1;
        } else {
            self.stats.duplicates += 1;
        }
        *slot = Some(chunk.body);
        entry.updated = now;

        if entry.received < usize::from(entry.count) {
            return None;
        }

        let entry = self.entries.remove(&chunk.id)?;
        self.stats.completed += 1;
        debug!(
            message_id = %chunk.id,
            chunk_count = entry.count,
            "Reassembled GELF message."
        );
        Some(unframe(entry.bodies.into_iter().flatten()))
    }
    /// Drop every incomplete message that hasn't seen a chunk within the staleness threshold.
    /// Returns the number of messages dropped.
    pub fn evict_stale(&mut self, now: Instant) -> usize {
        let staleness = self.staleness;
        let before = self.entries.len();
        self.entries.retain(|id, entry| {
            let keep = now.saturating_duration_since(entry.updated) <= staleness;
            if !keep {
                debug!(
                    message_id = %id,
                    received = entry.received,
                    chunk_count = entry.count,
                    "Evicting stale, incomplete GELF message."
                );
            }
            keep
        });
        let evicted = before - self.entries.len();
        self.stats.expired += evicted as u64;
        evicted
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::chunk::{frame_with_id, Framed, HEADER_LEN};

    use proptest::prelude::*;
    use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

    fn chunks_of(payload: &[u8], body: usize, id: MessageId) -> Vec<Chunk> {
        match frame_with_id(Bytes::copy_from_slice(payload), HEADER_LEN + body, id).unwrap() {
            Framed::Chunked(chunks) => chunks,
            Framed::Whole(_) => panic!("expected chunks"),
        }
    }

    #[test]
    fn test_in_order() {
        let payload = b"abcdefghijklmnopqrstuvwxyz";
        let mut table = ReassemblyTable::new();
        let mut chunks = chunks_of(payload, 5, MessageId([1; 8]));
        let last = chunks.pop().unwrap();
        for chunk in chunks {
            assert!(table.insert(chunk).is_none());
        }
        assert_eq!(table.len(), 1);
        assert_eq!(table.insert(last).unwrap(), payload.to_vec());
        assert!(table.is_empty());
        assert_eq!(table.stats().completed, 1);
    }

    #[test]
    fn test_duplicates() {
        let payload = b"0123456789";
        let mut table = ReassemblyTable::new();
        let chunks = chunks_of(payload, 4, MessageId([2; 8]));
        assert_eq!(chunks.len(), 3);
        // Feeding chunk 0 three times must not look like three distinct chunks
        for _ in 0..3 {
            assert!(table.insert(chunks[0].clone()).is_none());
        }
        assert!(table.insert(chunks[2].clone()).is_none());
        assert_eq!(table.stats().duplicates, 2);
        assert_eq!(table.insert(chunks[1].clone()).unwrap(), payload.to_vec());
    }

    #[test]
    fn test_interleaved() {
        let a = b"the quick brown fox";
        let b = b"jumps over the lazy dog";
        let ca = chunks_of(a, 3, MessageId([3; 8]));
        let cb = chunks_of(b, 3, MessageId([4; 8]));
        let mut table = ReassemblyTable::new();
        let mut done = Vec::new();
        for pair in ca.iter().zip(cb.iter()) {
            done.extend(table.insert(pair.0.clone()));
            done.extend(table.insert(pair.1.clone()));
        }
        for chunk in cb.iter().skip(ca.len()) {
            done.extend(table.insert(chunk.clone()));
        }
        assert_eq!(done, vec![a.to_vec(), b.to_vec()]);
    }

    #[test]
    fn test_count_mismatch() {
        let mut table = ReassemblyTable::new();
        let id = MessageId([5; 8]);
        let chunks = chunks_of(b"0123456789", 4, id);
        assert!(table.insert(chunks[0].clone()).is_none());
        let imposter = Chunk {
            id,
            index: 1,
            count: 2,
            body: Bytes::from_static(b"xx"),
        };
        assert!(table.insert(imposter).is_none());
        assert_eq!(table.stats().rejected, 1);
        assert!(table.insert(chunks[1].clone()).is_none());
        assert_eq!(table.insert(chunks[2].clone()).unwrap(), b"0123456789".to_vec());
    }

    #[test]
    fn test_staleness() {
        let payload = b"0123456789";
        let id = MessageId([6; 8]);
        let chunks = chunks_of(payload, 4, id);
        let mut table = ReassemblyTable::with_staleness(Duration::from_secs(5));
        let t0 = Instant::now();

        assert!(table.insert_at(chunks[0].clone(), t0).is_none());
        assert!(table.insert_at(chunks[1].clone(), t0).is_none());
        // Still fresh...
        assert_eq!(table.evict_stale(t0 + Duration::from_secs(5)), 0);
        // but not for long.
        assert_eq!(table.evict_stale(t0 + Duration::from_secs(6)), 1);
        assert!(table.is_empty());
        assert_eq!(table.stats().expired, 1);

        // The straggler alone doesn't complete anything; it starts a new set...
        let t1 = t0 + Duration::from_secs(7);
        assert!(table.insert_at(chunks[2].clone(), t1).is_none());
        // & a full retransmission under the same id is treated as a fresh message.
        assert!(table.insert_at(chunks[0].clone(), t1).is_none());
        assert_eq!(
            table.insert_at(chunks[1].clone(), t1).unwrap(),
            payload.to_vec()
        );
    }

    #[test]
    fn test_eviction_on_access() {
        let mut table = ReassemblyTable::with_staleness(Duration::from_secs(1));
        let t0 = Instant::now();
        let old = chunks_of(b"0123456789", 4, MessageId([7; 8]));
        let new = chunks_of(b"abcdefghij", 4, MessageId([8; 8]));
        assert!(table.insert_at(old[0].clone(), t0).is_none());
        assert!(table
            .insert_at(new[0].clone(), t0 + Duration::from_secs(2))
            .is_none());
        assert_eq!(table.len(), 1);
        assert_eq!(table.stats().expired, 1);
    }

    proptest! {
        #[test]
        fn reassembly_is_order_independent(
            payload in proptest::collection::vec(any::<u8>(), 1..2048),
            body in 16usize..64,
            seed in any::<u64>())
        {
            let mut chunks = chunks_of_any(&payload, body);
            chunks.shuffle(&mut StdRng::seed_from_u64(seed));
            let mut table = ReassemblyTable::new();
            let n = chunks.len();
            for (i, chunk) in chunks.into_iter().enumerate() {
                match table.insert(chunk) {
                    Some(out) => {
                        prop_assert_eq!(i, n - 1);
                        prop_assert_eq!(&out, &payload);
                    }
                    None => prop_assert!(i < n - 1),
                }
            }
            prop_assert!(table.is_empty());
        }
    }

    // Like `chunks_of`, but tolerates payloads small enough to go out whole.
    fn chunks_of_any(payload: &[u8], body: usize) -> Vec<Chunk> {
        match frame_with_id(Bytes::copy_from_slice(payload), HEADER_LEN + body, MessageId::random())
            .unwrap()
        {
            Framed::Chunked(chunks) => chunks,
            Framed::Whole(b) => vec![Chunk {
                id: MessageId::random(),
                index: 0,
                count: 1,
                body: b,
            }],
        }
    }
}
