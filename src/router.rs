//! Partition selection for outbound events
//!
//! Key-hash routing uses SipHash-1-3 with fixed keys, so a routing key maps
//! to the same partition in every process and across Rust releases (the
//! std `DefaultHasher` makes no such promise). Round-robin routing uses a
//! counter owned by the router instance.

use crate::config::RoutingPolicy;
use crate::error::{IngestError, IngestResult};
use crate::event::{Event, PartitionId};
use siphasher::sip::SipHasher13;
use std::hash::Hasher;
use std::sync::atomic::{AtomicU64, Ordering};

/// Chooses the partition each event is appended to
#[derive(Debug)]
pub struct EventRouter {
    policy: RoutingPolicy,
    partition_count: u32,
    round_robin_fallback: bool,
    next: AtomicU64,
}

impl EventRouter {
    /// Create a router; a zero partition count is a configuration error
    pub fn new(
        policy: RoutingPolicy,
        partition_count: u32,
        round_robin_fallback: bool,
    ) -> IngestResult<Self> {
        if partition_count == 0 {
            return Err(IngestError::Config(
                "router requires at least one partition".to_string(),
            ));
        }
        Ok(Self {
            policy,
            partition_count,
            round_robin_fallback,
            next: AtomicU64::new(0),
        })
    }

    /// Routing policy in use
    pub fn policy(&self) -> RoutingPolicy {
        self.policy
    }

    /// Number of partitions routed over
    pub fn partition_count(&self) -> u32 {
        self.partition_count
    }

    /// Whether events must carry a routing key
    pub fn requires_key(&self) -> bool {
        self.policy == RoutingPolicy::KeyHash && !self.round_robin_fallback
    }

    /// Partition for a routing key
    pub fn partition_for_key(&self, key: &str) -> PartitionId {
        let mut hasher = SipHasher13::new();
        hasher.write(key.as_bytes());
        (hasher.finish() % self.partition_count as u64) as PartitionId
    }

    /// Next round-robin partition
    pub fn next_partition(&self) -> PartitionId {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        (n % self.partition_count as u64) as PartitionId
    }

    /// Select the partition for one event
    pub fn route(&self, event: &Event) -> IngestResult<PartitionId> {
        match (self.policy, event.routing_key.as_deref()) {
            (RoutingPolicy::KeyHash, Some(key)) => Ok(self.partition_for_key(key)),
            (RoutingPolicy::KeyHash, None) if self.round_robin_fallback => {
                Ok(self.next_partition())
            }
            (RoutingPolicy::KeyHash, None) => Err(IngestError::MissingRoutingKey {
                id: event.id.clone(),
            }),
            (RoutingPolicy::RoundRobin, _) => Ok(self.next_partition()),
        }
    }

    /// Split a pre-formed batch into per-partition groups
    ///
    /// Round-robin sends the whole batch to one partition. Key-hash groups
    /// events by partition, keeping their relative order; keyless events in
    /// the batch share a single fallback partition.
    pub fn partition_batch(
        &self,
        events: Vec<Event>,
    ) -> IngestResult<Vec<(PartitionId, Vec<Event>)>> {
        self.partition_items(events, |event| event)
    }

    /// Like [`partition_batch`](Self::partition_batch) for items that wrap an event
    pub fn partition_items<T, F>(
        &self,
        items: Vec<T>,
        event_of: F,
    ) -> IngestResult<Vec<(PartitionId, Vec<T>)>>
    where
        F: Fn(&T) -> &Event,
    {
        if items.is_empty() {
            return Ok(Vec::new());
        }

        if self.policy == RoutingPolicy::RoundRobin {
            return Ok(vec![(self.next_partition(), items)]);
        }

        let mut groups: Vec<(PartitionId, Vec<T>)> = Vec::new();
        let mut fallback: Option<PartitionId> = None;

        for item in items {
            let event = event_of(&item);
            let partition = match event.routing_key.as_deref() {
                Some(key) => self.partition_for_key(key),
                None if self.round_robin_fallback => {
                    *fallback.get_or_insert_with(|| self.next_partition())
                }
                None => {
                    return Err(IngestError::MissingRoutingKey {
                        id: event.id.clone(),
                    });
                }
            };

            match groups.iter_mut().find(|(p, _)| *p == partition) {
                Some((_, group)) => group.push(item),
                None => groups.push((partition, vec![item])),
            }
        }

        groups.sort_by_key(|(partition, _)| *partition);
        Ok(groups)
    }

    /// Per-partition histogram for a population of routing keys
    ///
    /// A handful of distinct keys collapses most traffic onto a few
    /// partitions; callers use this to sanity-check key cardinality.
    pub fn spread<'a, I>(&self, keys: I) -> Vec<usize>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut counts = vec![0usize; self.partition_count as usize];
        for key in keys {
            counts[self.partition_for_key(key) as usize] += 1;
        }
        counts
    }
}
