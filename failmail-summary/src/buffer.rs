//! The time-windowed message buffer.
//!
//! Incoming messages are folded into summaries-in-progress keyed by batch
//! key, each holding groups keyed by group key. A summary becomes due once it
//! has been quiet for the wait period or has aged past the cap; `flush`
//! removes and returns the due ones.

use std::{collections::hash_map::Entry, sync::Arc};

use ahash::AHashMap;
use chrono::{DateTime, TimeDelta, Utc};
use failmail_common::message::ReceivedMessage;
use serde::Serialize;

use crate::grouping::GroupBy;

/// Messages within a summary that share a group key, collapsed into one row.
#[derive(Debug)]
pub struct Group {
    key: String,
    subject: String,
    first: DateTime<Utc>,
    last: DateTime<Utc>,
    count: usize,
    messages: Vec<Arc<ReceivedMessage>>,
}

impl Group {
    fn new(key: String, message: Arc<ReceivedMessage>) -> Self {
        Self {
            key,
            subject: message.subject().to_string(),
            first: message.received_at(),
            last: message.received_at(),
            count: 1,
            messages: vec![message],
        }
    }

    fn add(&mut self, message: Arc<ReceivedMessage>) {
        self.first = self.first.min(message.received_at());
        self.last = self.last.max(message.received_at());
        self.count += 1;
        self.messages.push(message);
    }

    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    #[must_use]
    pub fn subject(&self) -> &str {
        &self.subject
    }

    #[must_use]
    pub const fn first(&self) -> DateTime<Utc> {
        self.first
    }

    #[must_use]
    pub const fn last(&self) -> DateTime<Utc> {
        self.last
    }

    #[must_use]
    pub const fn count(&self) -> usize {
        self.count
    }

    /// Member messages in arrival order.
    #[must_use]
    pub fn messages(&self) -> &[Arc<ReceivedMessage>] {
        &self.messages
    }
}

/// One summary email in the making: every message sharing a batch key since
/// the last flush.
#[derive(Debug)]
pub struct Summary {
    batch_key: String,
    start: DateTime<Utc>,
    last_update: DateTime<Utc>,
    groups: AHashMap<String, Group>,
}

impl Summary {
    fn new(batch_key: String) -> Self {
        Self {
            batch_key,
            start: DateTime::<Utc>::MAX_UTC,
            last_update: DateTime::<Utc>::MIN_UTC,
            groups: AHashMap::new(),
        }
    }

    fn add(&mut self, group_key: String, message: Arc<ReceivedMessage>) {
        self.start = self.start.min(message.received_at());
        self.last_update = self.last_update.max(message.received_at());

        match self.groups.entry(group_key) {
            Entry::Occupied(mut group) => group.get_mut().add(message),
            Entry::Vacant(slot) => {
                let group = Group::new(slot.key().clone(), message);
                slot.insert(group);
            }
        }
    }

    fn due(&self, now: DateTime<Utc>, wait_period: TimeDelta, max_wait: TimeDelta) -> bool {
        now - self.last_update >= wait_period || now - self.start >= max_wait
    }

    /// The wall time at which this summary becomes due.
    fn deadline(&self, wait_period: TimeDelta, max_wait: TimeDelta) -> DateTime<Utc> {
        let quiet = self
            .last_update
            .checked_add_signed(wait_period)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let cap = self
            .start
            .checked_add_signed(max_wait)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        quiet.min(cap)
    }

    #[must_use]
    pub fn batch_key(&self) -> &str {
        &self.batch_key
    }

    #[must_use]
    pub const fn start(&self) -> DateTime<Utc> {
        self.start
    }

    #[must_use]
    pub const fn last_update(&self) -> DateTime<Utc> {
        self.last_update
    }

    #[must_use]
    pub fn groups(&self) -> impl Iterator<Item = &Group> {
        self.groups.values()
    }

    /// Groups in rendering order: descending count, ties by earliest first
    /// seen.
    #[must_use]
    pub fn sorted_groups(&self) -> Vec<&Group> {
        let mut groups: Vec<&Group> = self.groups.values().collect();
        groups.sort_by(|a, b| b.count.cmp(&a.count).then(a.first.cmp(&b.first)));
        groups
    }

    /// Total messages across all groups.
    #[must_use]
    pub fn message_count(&self) -> usize {
        self.groups.values().map(Group::count).sum()
    }
}

/// Read-only snapshot for the status endpoint.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct BufferStats {
    /// Summaries currently accumulating.
    pub summaries: usize,
    /// Messages held across all of them.
    pub messages: usize,
    /// When the next summary becomes due, if any are pending.
    pub next_deadline: Option<DateTime<Utc>>,
}

/// The coordinator-owned buffer. All operations are called from the single
/// event loop, so there is no interior locking.
#[derive(Debug)]
pub struct MessageBuffer {
    wait_period: TimeDelta,
    max_wait: TimeDelta,
    batch: GroupBy,
    group: GroupBy,
    summaries: AHashMap<String, Summary>,
}

impl MessageBuffer {
    #[must_use]
    pub fn new(
        wait_period: std::time::Duration,
        max_wait: std::time::Duration,
        batch: GroupBy,
        group: GroupBy,
    ) -> Self {
        Self {
            wait_period: TimeDelta::from_std(wait_period).unwrap_or(TimeDelta::MAX),
            max_wait: TimeDelta::from_std(max_wait).unwrap_or(TimeDelta::MAX),
            batch,
            group,
            summaries: AHashMap::new(),
        }
    }

    /// Fold a message into its summary and group, creating both as needed.
    ///
    /// Not idempotent: two identical messages add two entries with their own
    /// receive times.
    pub fn add(&mut self, message: Arc<ReceivedMessage>) {
        let batch_key = self.batch.key(&message);
        let group_key = self.group.key(&message);

        tracing::debug!(target: "failmail", %batch_key, %group_key, "buffering message");

        self.summaries
            .entry(batch_key.clone())
            .or_insert_with(|| Summary::new(batch_key))
            .add(group_key, message);
    }

    /// Remove and return every summary due at `now` (all of them when
    /// `force` is set), sorted by start time for deterministic output.
    pub fn flush(&mut self, force: bool, now: DateTime<Utc>) -> Vec<Summary> {
        let due: Vec<String> = self
            .summaries
            .iter()
            .filter(|(_, summary)| force || summary.due(now, self.wait_period, self.max_wait))
            .map(|(key, _)| key.clone())
            .collect();

        let mut flushed: Vec<Summary> = due
            .into_iter()
            .filter_map(|key| self.summaries.remove(&key))
            .collect();
        flushed.sort_by_key(Summary::start);

        flushed
    }

    /// Snapshot for the status endpoint.
    #[must_use]
    pub fn stats(&self) -> BufferStats {
        BufferStats {
            summaries: self.summaries.len(),
            messages: self.summaries.values().map(Summary::message_count).sum(),
            next_deadline: self
                .summaries
                .values()
                .map(|summary| summary.deadline(self.wait_period, self.max_wait))
                .min(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn at(seconds: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(seconds, 0).unwrap()
    }

    fn message_at(raw: &[u8], seconds: i64) -> Arc<ReceivedMessage> {
        Arc::new(ReceivedMessage::new(
            "a@x",
            vec!["b@y".to_string()],
            raw.to_vec(),
            at(seconds),
        ))
    }

    fn buffer(wait_secs: u64, max_secs: u64) -> MessageBuffer {
        MessageBuffer::new(
            Duration::from_secs(wait_secs),
            Duration::from_secs(max_secs),
            GroupBy::Header {
                name: "X-Failmail-Split".to_string(),
                default: String::new(),
            },
            GroupBy::SameSubject,
        )
    }

    #[test]
    fn quiet_period_flushes_one_summary() {
        let mut buffer = buffer(30, 300);
        for t in 0..3 {
            buffer.add(message_at(b"Subject: X\r\n\r\nbody", t));
        }

        assert!(buffer.flush(false, at(2)).is_empty());
        assert!(buffer.flush(false, at(31)).is_empty());

        let flushed = buffer.flush(false, at(32));
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].message_count(), 3);
        assert_eq!(flushed[0].start(), at(0));
        assert_eq!(flushed[0].last_update(), at(2));

        let group = &flushed[0].sorted_groups()[0];
        assert_eq!(group.count(), 3);
        assert_eq!(group.count(), group.messages().len());
    }

    #[test]
    fn age_cap_forces_a_busy_summary_out() {
        let mut buffer = buffer(30, 60);
        for n in 0..7 {
            buffer.add(message_at(b"Subject: X\r\n\r\nbody", n * 10));
        }

        let flushed = buffer.flush(false, at(60));
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].message_count(), 7);
    }

    #[test]
    fn distinct_batch_headers_become_distinct_summaries() {
        let mut buffer = MessageBuffer::new(
            Duration::from_secs(30),
            Duration::from_secs(300),
            GroupBy::Header {
                name: "X-Split".to_string(),
                default: String::new(),
            },
            GroupBy::SameSubject,
        );

        buffer.add(message_at(b"X-Split: one\r\nSubject: s\r\n\r\nb", 0));
        buffer.add(message_at(b"X-Split: two\r\nSubject: s\r\n\r\nb", 1));

        let flushed = buffer.flush(true, at(1));
        assert_eq!(flushed.len(), 2);
        assert_eq!(flushed[0].batch_key(), "one");
        assert_eq!(flushed[1].batch_key(), "two");
    }

    #[test]
    fn drain_empties_the_buffer_and_loses_nothing() {
        let mut buffer = buffer(30, 300);
        let added = 25;
        for n in 0..added {
            let raw = format!("Subject: job {} failed\r\n\r\nb", n % 5);
            buffer.add(message_at(raw.as_bytes(), i64::from(n)));
        }

        let flushed = buffer.flush(true, at(0));
        let total: usize = flushed.iter().map(Summary::message_count).sum();
        assert_eq!(total, added as usize);

        assert_eq!(buffer.stats(), BufferStats::default());
    }

    #[test]
    fn group_timestamps_bound_member_receive_times() {
        let mut buffer = buffer(30, 300);
        buffer.add(message_at(b"Subject: X\r\n\r\nb", 5));
        buffer.add(message_at(b"Subject: X\r\n\r\nb", 1));
        buffer.add(message_at(b"Subject: X\r\n\r\nb", 9));

        let flushed = buffer.flush(true, at(9));
        let summary = &flushed[0];
        assert_eq!(summary.start(), at(1));
        assert_eq!(summary.last_update(), at(9));

        let group = &summary.sorted_groups()[0];
        assert_eq!(group.first(), at(1));
        assert_eq!(group.last(), at(9));
        for message in group.messages() {
            assert!(group.first() <= message.received_at());
            assert!(message.received_at() <= group.last());
        }
    }

    #[test]
    fn flush_output_is_sorted_by_start() {
        let mut buffer = MessageBuffer::new(
            Duration::from_secs(30),
            Duration::from_secs(300),
            GroupBy::Header {
                name: "X-Split".to_string(),
                default: String::new(),
            },
            GroupBy::SameSubject,
        );

        buffer.add(message_at(b"X-Split: late\r\nSubject: s\r\n\r\nb", 50));
        buffer.add(message_at(b"X-Split: early\r\nSubject: s\r\n\r\nb", 10));

        let flushed = buffer.flush(true, at(50));
        assert_eq!(flushed[0].batch_key(), "early");
        assert_eq!(flushed[1].batch_key(), "late");
    }

    #[test]
    fn stats_report_pending_counts_and_deadline() {
        let mut buffer = buffer(30, 300);
        assert_eq!(buffer.stats(), BufferStats::default());

        buffer.add(message_at(b"Subject: X\r\n\r\nb", 0));
        buffer.add(message_at(b"Subject: Y\r\n\r\nb", 10));

        let stats = buffer.stats();
        assert_eq!(stats.summaries, 1);
        assert_eq!(stats.messages, 2);
        // Quiet deadline: 30s after the last arrival.
        assert_eq!(stats.next_deadline, Some(at(40)));
    }

    #[test]
    fn quiet_period_restarts_on_each_arrival() {
        let mut buffer = buffer(30, 300);
        buffer.add(message_at(b"Subject: X\r\n\r\nb", 0));
        buffer.add(message_at(b"Subject: X\r\n\r\nb", 25));

        // 30s after the first arrival, but only 5s after the second.
        assert!(buffer.flush(false, at(30)).is_empty());
        assert_eq!(buffer.flush(false, at(55)).len(), 1);
    }
}
