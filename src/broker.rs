use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Per-subscriber queue depth. Each message is typically one output line
/// or one PTY chunk (~4 KiB), so this bounds a stalled subscriber at a few
/// MiB before events for it start being dropped. Dropped events are counted
/// and reported to the subscriber as [`SubscriptionEvent::Lagged`].
pub const SUBSCRIBER_CAPACITY: usize = 1024;

/// The process an event came from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Source {
    Server { project_id: String },
    Session { session_id: u32 },
}

impl Source {
    pub fn server(project_id: impl Into<String>) -> Self {
        Source::Server {
            project_id: project_id.into(),
        }
    }

    pub fn session(session_id: u32) -> Self {
        Source::Session { session_id }
    }
}

/// A push event from a supervised process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    /// One chunk of output. `seq` increases by one per chunk per source.
    Output { source: Source, seq: u64, data: Bytes },
    /// The process exited. Published at most once per process.
    Exit { source: Source, exit_code: Option<i32> },
}

impl ProcessEvent {
    pub fn source(&self) -> &Source {
        match self {
            ProcessEvent::Output { source, .. } | ProcessEvent::Exit { source, .. } => source,
        }
    }
}

/// One item received from a [`Subscription`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionEvent {
    Event(ProcessEvent),
    /// The subscriber fell behind and this many events were dropped at this
    /// point in the stream. Consumers should re-query state.
    Lagged(u64),
}

impl SubscriptionEvent {
    /// The event, or `None` for a lag notice.
    pub fn into_event(self) -> Option<ProcessEvent> {
        match self {
            SubscriptionEvent::Event(event) => Some(event),
            SubscriptionEvent::Lagged(_) => None,
        }
    }
}

enum Delivery {
    Event(ProcessEvent),
    Lagged(u64),
}

impl Delivery {
    fn received(self) -> SubscriptionEvent {
        match self {
            Delivery::Event(event) => SubscriptionEvent::Event(event),
            Delivery::Lagged(n) => SubscriptionEvent::Lagged(n),
        }
    }
}

/// What a subscription listens to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Topic {
    /// Every event from every process.
    All,
    /// Events from a single process.
    Source(Source),
}

pub type SubscriptionId = u64;

struct Subscriber {
    id: SubscriptionId,
    tx: mpsc::Sender<Delivery>,
    /// Events dropped since the last lag notice. Shared with the
    /// subscription so a drop right before close is still reported.
    missed: Arc<AtomicU64>,
}

#[derive(Default)]
struct BrokerInner {
    next_id: SubscriptionId,
    all: Vec<Subscriber>,
    by_source: HashMap<Source, Vec<Subscriber>>,
}

/// Fan-out of process events to explicit, per-source subscriber lists.
///
/// Subscribers are removed by [`Broker::unsubscribe`], by dropping their
/// [`Subscription`], or (for per-source lists) right after that source's
/// exit event is delivered.
#[derive(Clone, Default)]
pub struct Broker {
    inner: Arc<Mutex<BrokerInner>>,
}

impl Broker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, topic: Topic) -> Subscription {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
        let missed = Arc::new(AtomicU64::new(0));
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        let subscriber = Subscriber {
            id,
            tx,
            missed: missed.clone(),
        };
        match topic {
            Topic::All => inner.all.push(subscriber),
            Topic::Source(source) => inner.by_source.entry(source).or_default().push(subscriber),
        }
        Subscription {
            id,
            rx,
            missed,
            broker: self.clone(),
        }
    }

    /// Remove a subscriber. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.all.len();
        inner.all.retain(|s| s.id != id);
        if inner.all.len() != before {
            return true;
        }
        let mut removed = false;
        inner.by_source.retain(|_, subs| {
            let len = subs.len();
            subs.retain(|s| s.id != id);
            removed |= subs.len() != len;
            !subs.is_empty()
        });
        removed
    }

    /// Deliver an event to every matching subscriber without blocking.
    ///
    /// Safe to call from blocking threads. A full subscriber queue drops the
    /// event for that subscriber only and counts it; the count is delivered
    /// as a lag notice ahead of the next event that fits. A closed
    /// subscriber is pruned.
    pub fn publish(&self, event: ProcessEvent) {
        let mut inner = self.inner.lock();
        let is_exit = matches!(event, ProcessEvent::Exit { .. });
        let source = event.source().clone();

        deliver(&mut inner.all, &event);
        if let Some(subs) = inner.by_source.get_mut(&source) {
            deliver(subs, &event);
        }
        if is_exit {
            inner.by_source.remove(&source);
        } else if inner.by_source.get(&source).is_some_and(|s| s.is_empty()) {
            inner.by_source.remove(&source);
        }
    }

    pub fn subscriber_count(&self, source: &Source) -> usize {
        self.inner.lock().by_source.get(source).map_or(0, |s| s.len())
    }
}

fn deliver(subs: &mut Vec<Subscriber>, event: &ProcessEvent) {
    subs.retain(|sub| {
        let pending = sub.missed.swap(0, Ordering::AcqRel);
        if pending > 0 {
            match sub.tx.try_send(Delivery::Lagged(pending)) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    sub.missed.fetch_add(pending + 1, Ordering::AcqRel);
                    return true;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => return false,
            }
        }
        match sub.tx.try_send(Delivery::Event(event.clone())) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                if sub.missed.fetch_add(1, Ordering::AcqRel) == 0 {
                    tracing::warn!(subscription = sub.id, "subscriber queue full, dropping events");
                }
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    });
}

/// A live subscription. Dropping it unsubscribes.
pub struct Subscription {
    id: SubscriptionId,
    rx: mpsc::Receiver<Delivery>,
    missed: Arc<AtomicU64>,
    broker: Broker,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Next event, or `None` once the subscription has been removed and
    /// drained.
    ///
    /// Drops that happened after the queue was last full are reported as
    /// soon as everything queued before them has been received.
    pub async fn recv(&mut self) -> Option<SubscriptionEvent> {
        match self.rx.try_recv() {
            Ok(delivery) => return Some(delivery.received()),
            Err(mpsc::error::TryRecvError::Empty) => {
                if let Some(lag) = self.take_missed() {
                    return Some(lag);
                }
            }
            Err(mpsc::error::TryRecvError::Disconnected) => return self.take_missed(),
        }
        match self.rx.recv().await {
            Some(delivery) => Some(delivery.received()),
            None => self.take_missed(),
        }
    }

    pub fn try_recv(&mut self) -> Option<SubscriptionEvent> {
        match self.rx.try_recv() {
            Ok(delivery) => Some(delivery.received()),
            Err(_) => self.take_missed(),
        }
    }

    fn take_missed(&self) -> Option<SubscriptionEvent> {
        match self.missed.swap(0, Ordering::AcqRel) {
            0 => None,
            n => Some(SubscriptionEvent::Lagged(n)),
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.broker.unsubscribe(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(e: ProcessEvent) -> Option<SubscriptionEvent> {
        Some(SubscriptionEvent::Event(e))
    }

    fn output(source: Source, seq: u64, data: &'static str) -> ProcessEvent {
        ProcessEvent::Output {
            source,
            seq,
            data: Bytes::from(data),
        }
    }

    #[tokio::test]
    async fn publish_with_no_subscribers() {
        let broker = Broker::new();
        broker.publish(output(Source::session(1), 1, "hello"));
    }

    #[tokio::test]
    async fn source_subscriber_only_sees_its_source() {
        let broker = Broker::new();
        let mut one = broker.subscribe(Topic::Source(Source::session(1)));
        let mut two = broker.subscribe(Topic::Source(Source::session(2)));

        broker.publish(output(Source::session(1), 1, "for one"));

        assert_eq!(one.recv().await, event(output(Source::session(1), 1, "for one")));
        assert!(two.try_recv().is_none());
    }

    #[tokio::test]
    async fn all_subscriber_sees_every_source() {
        let broker = Broker::new();
        let mut all = broker.subscribe(Topic::All);

        broker.publish(output(Source::session(1), 1, "a"));
        broker.publish(output(Source::server("todo"), 1, "b"));

        let first = all.recv().await.and_then(SubscriptionEvent::into_event).unwrap();
        let second = all.recv().await.and_then(SubscriptionEvent::into_event).unwrap();
        assert_eq!(first.source(), &Source::session(1));
        assert_eq!(second.source(), &Source::server("todo"));
    }

    #[tokio::test]
    async fn explicit_unsubscribe_stops_delivery() {
        let broker = Broker::new();
        let mut sub = broker.subscribe(Topic::Source(Source::session(7)));
        assert!(broker.unsubscribe(sub.id()));
        assert!(!broker.unsubscribe(sub.id()));

        broker.publish(output(Source::session(7), 1, "lost"));
        assert_eq!(sub.recv().await, None);
    }

    #[tokio::test]
    async fn dropping_subscription_unsubscribes() {
        let broker = Broker::new();
        let source = Source::server("todo");
        let sub = broker.subscribe(Topic::Source(source.clone()));
        assert_eq!(broker.subscriber_count(&source), 1);
        drop(sub);
        assert_eq!(broker.subscriber_count(&source), 0);
    }

    #[tokio::test]
    async fn exit_event_closes_source_subscriptions() {
        let broker = Broker::new();
        let source = Source::session(9);
        let mut sub = broker.subscribe(Topic::Source(source.clone()));

        broker.publish(ProcessEvent::Exit {
            source: source.clone(),
            exit_code: Some(0),
        });

        assert!(matches!(
            sub.recv().await,
            Some(SubscriptionEvent::Event(ProcessEvent::Exit { .. }))
        ));
        assert_eq!(sub.recv().await, None);
        assert_eq!(broker.subscriber_count(&source), 0);
    }

    #[tokio::test]
    async fn preserves_order_per_subscriber() {
        let broker = Broker::new();
        let mut sub = broker.subscribe(Topic::All);
        for i in 0..200u64 {
            broker.publish(ProcessEvent::Output {
                source: Source::session(1),
                seq: i,
                data: Bytes::from(format!("msg-{i}")),
            });
        }
        for i in 0..200u64 {
            match sub.recv().await.unwrap() {
                SubscriptionEvent::Event(ProcessEvent::Output { seq, .. }) => assert_eq!(seq, i),
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    fn publish_outputs(broker: &Broker, source: &Source, seqs: std::ops::RangeInclusive<u64>) {
        for seq in seqs {
            broker.publish(ProcessEvent::Output {
                source: source.clone(),
                seq,
                data: Bytes::from("x"),
            });
        }
    }

    #[tokio::test]
    async fn stalled_subscriber_is_told_how_much_it_missed() {
        let broker = Broker::new();
        let source = Source::session(3);
        let mut sub = broker.subscribe(Topic::Source(source.clone()));

        publish_outputs(&broker, &source, 1..=3000);

        let mut last_seq = 0;
        let mut missed = 0;
        while let Some(item) = sub.try_recv() {
            match item {
                SubscriptionEvent::Event(ProcessEvent::Output { seq, .. }) => {
                    assert_eq!(seq, last_seq + missed + 1, "gap without a lag notice");
                    last_seq = seq;
                    missed = 0;
                }
                SubscriptionEvent::Lagged(n) => missed += n,
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(last_seq as usize, SUBSCRIBER_CAPACITY);
        assert_eq!(missed, 3000 - SUBSCRIBER_CAPACITY as u64);
    }

    #[tokio::test]
    async fn lag_notice_precedes_events_published_after_the_gap() {
        let broker = Broker::new();
        let source = Source::session(4);
        let mut sub = broker.subscribe(Topic::Source(source.clone()));
        let capacity = SUBSCRIBER_CAPACITY as u64;

        publish_outputs(&broker, &source, 1..=capacity + 10);
        for _ in 0..5 {
            sub.recv().await.unwrap();
        }
        publish_outputs(&broker, &source, capacity + 11..=capacity + 11);

        let mut items = Vec::new();
        while let Some(item) = sub.try_recv() {
            items.push(item);
        }
        let tail = &items[items.len() - 2..];
        assert_eq!(tail[0], SubscriptionEvent::Lagged(10));
        assert!(matches!(
            tail[1],
            SubscriptionEvent::Event(ProcessEvent::Output { seq, .. }) if seq == capacity + 11
        ));
    }

    #[tokio::test]
    async fn lag_before_exit_is_reported_on_close() {
        let broker = Broker::new();
        let source = Source::session(5);
        let mut sub = broker.subscribe(Topic::Source(source.clone()));

        publish_outputs(&broker, &source, 1..=SUBSCRIBER_CAPACITY as u64);
        broker.publish(ProcessEvent::Exit {
            source: source.clone(),
            exit_code: Some(0),
        });

        let mut last = None;
        while let Some(item) = sub.recv().await {
            last = Some(item);
        }
        assert_eq!(last, Some(SubscriptionEvent::Lagged(1)));
    }

    #[test]
    fn source_serializes_with_kind_tag() {
        let json = serde_json::to_value(Source::session(12)).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "session", "session_id": 12}));
        let json = serde_json::to_value(Source::server("todo")).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "server", "project_id": "todo"}));
    }
}
