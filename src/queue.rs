//! Prefetch queue: a debounced, paced FIFO of topics waiting for their first
//! preview.
//!
//! The queue is a pure state machine. The driver feeds it the clock and a
//! liveness check; it answers with at most one item to extract at a time.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::topic::TopicId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueItem {
    pub topic: TopicId,
    pub topic_url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainState {
    Idle,
    Draining,
}

#[derive(Debug)]
pub struct PrefetchQueue {
    items: VecDeque<QueueItem>,
    in_flight: Option<TopicId>,
    state: DrainState,
    debounce: Duration,
    pacing: Duration,
    drain_due: Option<Instant>,
    next_start_at: Option<Instant>,
}

impl PrefetchQueue {
    pub fn new(debounce: Duration, pacing: Duration) -> Self {
        Self {
            items: VecDeque::new(),
            in_flight: None,
            state: DrainState::Idle,
            debounce,
            pacing,
            drain_due: None,
            next_start_at: None,
        }
    }

    /// Adds `item` unless the same topic is already queued or in flight.
    /// Every call restarts the debounce timer.
    pub fn enqueue(&mut self, item: QueueItem, now: Instant) -> bool {
        let duplicate = self.in_flight.as_ref() == Some(&item.topic)
            || self.items.iter().any(|queued| queued.topic == item.topic);
        self.drain_due = Some(now + self.debounce);
        if duplicate {
            return false;
        }
        debug!(topic = %item.topic, queued = self.items.len() + 1, "enqueued preview fetch");
        self.items.push_back(item);
        true
    }

    /// Next item to extract, if one may start at `now`. Items whose row has
    /// left the page are dropped without counting against the pacing delay.
    pub fn next_due<F>(&mut self, now: Instant, mut is_live: F) -> Option<QueueItem>
    where
        F: FnMut(&QueueItem) -> bool,
    {
        match self.state {
            DrainState::Idle => {
                let due = self.drain_due.is_some_and(|due| now >= due);
                if !due || self.items.is_empty() {
                    return None;
                }
                self.state = DrainState::Draining;
                self.drain_due = None;
                self.next_start_at = None;
            }
            DrainState::Draining => {
                // A trigger while draining is absorbed by the running drain.
                self.drain_due = None;
            }
        }

        if self.in_flight.is_some() || self.next_start_at.is_some_and(|at| now < at) {
            return None;
        }

        while let Some(item) = self.items.pop_front() {
            if !is_live(&item) {
                debug!(topic = %item.topic, "skipping preview fetch for detached row");
                continue;
            }
            self.in_flight = Some(item.topic.clone());
            return Some(item);
        }

        self.finish_drain();
        None
    }

    /// Marks the in-flight extraction for `topic` as done.
    pub fn complete(&mut self, topic: &TopicId, now: Instant) {
        if self.in_flight.as_ref() != Some(topic) {
            return;
        }
        self.in_flight = None;
        if self.items.is_empty() {
            self.finish_drain();
        } else {
            self.next_start_at = Some(now + self.pacing);
        }
    }

    fn finish_drain(&mut self) {
        self.state = DrainState::Idle;
        self.next_start_at = None;
    }

    pub fn state(&self) -> DrainState {
        self.state
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn in_flight(&self) -> Option<&TopicId> {
        self.in_flight.as_ref()
    }

    /// Nothing queued and nothing running.
    pub fn is_idle(&self) -> bool {
        self.items.is_empty() && self.in_flight.is_none()
    }

    /// Earliest instant at which [`PrefetchQueue::next_due`] may yield.
    pub fn next_wakeup(&self) -> Option<Instant> {
        if self.items.is_empty() || self.in_flight.is_some() {
            return None;
        }
        match self.state {
            DrainState::Idle => self.drain_due,
            DrainState::Draining => self.next_start_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEBOUNCE: Duration = Duration::from_millis(100);
    const PACING: Duration = Duration::from_millis(700);

    fn item(id: u64) -> QueueItem {
        QueueItem {
            topic: TopicId::from_number(id),
            topic_url: format!("https://f/t/x/{id}"),
        }
    }

    fn live(_: &QueueItem) -> bool {
        true
    }

    #[test]
    fn duplicates_are_ignored() {
        let t0 = Instant::now();
        let mut queue = PrefetchQueue::new(DEBOUNCE, PACING);
        assert!(queue.enqueue(item(1), t0));
        assert!(!queue.enqueue(item(1), t0));
        assert_eq!(queue.len(), 1);

        let started = queue.next_due(t0 + DEBOUNCE, live).unwrap();
        assert!(!queue.enqueue(item(1), t0 + DEBOUNCE));
        queue.complete(&started.topic, t0 + DEBOUNCE);
        assert!(queue.is_idle());
    }

    #[test]
    fn debounce_restarts_on_enqueue() {
        let t0 = Instant::now();
        let mut queue = PrefetchQueue::new(DEBOUNCE, PACING);
        queue.enqueue(item(1), t0);
        queue.enqueue(item(2), t0 + Duration::from_millis(80));
        assert!(queue.next_due(t0 + Duration::from_millis(150), live).is_none());
        assert_eq!(queue.state(), DrainState::Idle);
        assert_eq!(
            queue.next_due(t0 + Duration::from_millis(180), live),
            Some(item(1))
        );
        assert_eq!(queue.state(), DrainState::Draining);
    }

    #[test]
    fn drains_in_order_with_pacing() {
        let t0 = Instant::now();
        let mut queue = PrefetchQueue::new(DEBOUNCE, PACING);
        for id in 1..=3 {
            queue.enqueue(item(id), t0);
        }
        let mut now = t0 + DEBOUNCE;
        let mut starts = Vec::new();
        while starts.len() < 3 {
            if let Some(next) = queue.next_due(now, live) {
                starts.push((next.topic.clone(), now));
                now += Duration::from_millis(50);
                queue.complete(&next.topic, now);
            }
            now += Duration::from_millis(10);
        }
        let order: Vec<_> = starts.iter().map(|(t, _)| t.as_str().to_string()).collect();
        assert_eq!(order, vec!["t1", "t2", "t3"]);
        for pair in starts.windows(2) {
            assert!(pair[1].1 - pair[0].1 >= PACING);
        }
        assert_eq!(queue.state(), DrainState::Idle);
    }

    #[test]
    fn only_one_in_flight() {
        let t0 = Instant::now();
        let mut queue = PrefetchQueue::new(DEBOUNCE, PACING);
        queue.enqueue(item(1), t0);
        queue.enqueue(item(2), t0);
        assert!(queue.next_due(t0 + DEBOUNCE, live).is_some());
        assert!(queue.next_due(t0 + Duration::from_secs(5), live).is_none());
        assert_eq!(queue.in_flight(), Some(&TopicId::from_number(1)));
    }

    #[test]
    fn detached_rows_are_skipped_silently() {
        let t0 = Instant::now();
        let mut queue = PrefetchQueue::new(DEBOUNCE, PACING);
        queue.enqueue(item(1), t0);
        queue.enqueue(item(2), t0);
        let next = queue.next_due(t0 + DEBOUNCE, |i| i.topic != TopicId::from_number(1));
        assert_eq!(next, Some(item(2)));

        let mut queue = PrefetchQueue::new(DEBOUNCE, PACING);
        queue.enqueue(item(3), t0);
        assert!(queue.next_due(t0 + DEBOUNCE, |_| false).is_none());
        assert!(queue.is_idle());
        assert_eq!(queue.state(), DrainState::Idle);
    }
}
