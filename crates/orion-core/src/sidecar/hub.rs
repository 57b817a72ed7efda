//! Fan-out of decoded sidecar events.
//!
//! Each subscriber owns an unbounded queue, so the reader thread never waits
//! on a slow consumer. Plain and per-request subscriptions are lossless; they
//! feed session state, where a missing chunk would corrupt message content.
//! Observer subscriptions may shed partial text/thinking chunks: once one
//! holds `max_pending_partials` unread partials, newer partials for it are
//! dropped and counted. Terminal and tool events always reach every
//! subscriber.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};

use crate::ids::RequestId;
use crate::protocol::Event;

#[derive(Debug, Clone)]
enum Filter {
    All,
    Request(RequestId),
}

impl Filter {
    fn matches(&self, event: &Event) -> bool {
        match self {
            Filter::All => true,
            Filter::Request(id) => event.request_id() == Some(id),
        }
    }
}

#[derive(Default)]
struct Counters {
    pending_partials: AtomicUsize,
    dropped: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    Lossless,
    Shed,
}

struct Subscriber {
    filter: Filter,
    delivery: Delivery,
    tx: UnboundedSender<Event>,
    counters: Arc<Counters>,
}

pub struct EventHub {
    subscribers: Mutex<Vec<Subscriber>>,
    max_pending_partials: usize,
}

impl EventHub {
    /// `max_pending_partials == 0` disables shedding for observers too.
    pub fn new(max_pending_partials: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            max_pending_partials,
        }
    }

    /// Every event, in emission order. Never sheds.
    pub fn subscribe(&self) -> Subscription {
        self.add(Filter::All, Delivery::Lossless)
    }

    /// Every event, except partial chunks beyond the pending allowance.
    /// For displays and taps that can tolerate gaps.
    pub fn subscribe_observer(&self) -> Subscription {
        self.add(Filter::All, Delivery::Shed)
    }

    /// Events of one request. The subscription ends after its terminal event.
    pub fn subscribe_request(&self, request_id: RequestId) -> Subscription {
        self.add(Filter::Request(request_id), Delivery::Lossless)
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().iter().filter(|s| !s.tx.is_closed()).count()
    }

    /// Deliver `event` to every matching subscriber.
    pub fn publish(&self, event: &Event) {
        let partial = event.is_partial();
        let terminal = event.is_terminal();
        let limit = self.max_pending_partials;

        self.lock().retain(|sub| {
            if sub.tx.is_closed() {
                return false;
            }
            if !sub.filter.matches(event) {
                return true;
            }

            if partial {
                let pending = sub.counters.pending_partials.load(Ordering::SeqCst);
                if sub.delivery == Delivery::Shed && limit > 0 && pending >= limit {
                    let dropped = sub.counters.dropped.fetch_add(1, Ordering::SeqCst) + 1;
                    log::warn!(
                        "Subscriber lagging ({pending} unread chunks); dropped {} chunk (total {dropped})",
                        event.kind()
                    );
                    return true;
                }
                sub.counters.pending_partials.fetch_add(1, Ordering::SeqCst);
            }

            if sub.tx.send(event.clone()).is_err() {
                return false;
            }

            !(terminal && matches!(sub.filter, Filter::Request(_)))
        });
    }

    fn add(&self, filter: Filter, delivery: Delivery) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let counters = Arc::new(Counters::default());
        self.lock().push(Subscriber {
            filter,
            delivery,
            tx,
            counters: Arc::clone(&counters),
        });
        Subscription { rx, counters }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Subscriber>> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Receiving end of an [`EventHub`] subscription.
pub struct Subscription {
    rx: UnboundedReceiver<Event>,
    counters: Arc<Counters>,
}

impl Subscription {
    /// Next event, or `None` once the hub side is gone.
    pub async fn recv(&mut self) -> Option<Event> {
        let event = self.rx.recv().await;
        self.account(event.as_ref());
        event
    }

    /// Next event without waiting.
    pub fn try_recv(&mut self) -> Option<Event> {
        match self.rx.try_recv() {
            Ok(event) => {
                self.account(Some(&event));
                Some(event)
            }
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Blocking receive for use outside an async runtime.
    pub fn blocking_recv(&mut self) -> Option<Event> {
        let event = self.rx.blocking_recv();
        self.account(event.as_ref());
        event
    }

    /// Partial chunks shed for this subscriber so far. Always zero for a
    /// lossless subscription.
    pub fn dropped(&self) -> u64 {
        self.counters.dropped.load(Ordering::SeqCst)
    }

    fn account(&self, event: Option<&Event>) {
        if event.is_some_and(Event::is_partial) {
            self.counters.pending_partials.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(id: &str, text: &str) -> Event {
        Event::Text {
            request_id: RequestId::from(id),
            content: text.to_string(),
            is_partial: true,
        }
    }

    fn complete(id: &str) -> Event {
        Event::Complete {
            request_id: RequestId::from(id),
            session_id: None,
            cost_usd: 0.0,
            token_count: 0,
            duration_ms: 0,
        }
    }

    mod fan_out {
        use super::*;

        #[test]
        fn every_subscriber_sees_every_event_in_order() {
            let hub = EventHub::new(0);
            let mut a = hub.subscribe();
            let mut b = hub.subscribe();

            hub.publish(&chunk("r1", "a"));
            hub.publish(&chunk("r2", "b"));
            hub.publish(&Event::Pong);

            for sub in [&mut a, &mut b] {
                assert_eq!(sub.try_recv(), Some(chunk("r1", "a")));
                assert_eq!(sub.try_recv(), Some(chunk("r2", "b")));
                assert_eq!(sub.try_recv(), Some(Event::Pong));
                assert_eq!(sub.try_recv(), None);
            }
        }

        #[test]
        fn request_subscription_filters_and_closes() {
            let hub = EventHub::new(0);
            let mut sub = hub.subscribe_request(RequestId::from("r1"));

            hub.publish(&chunk("r2", "other"));
            hub.publish(&chunk("r1", "mine"));
            hub.publish(&complete("r1"));
            hub.publish(&chunk("r1", "late"));

            assert_eq!(sub.blocking_recv(), Some(chunk("r1", "mine")));
            assert_eq!(sub.blocking_recv(), Some(complete("r1")));
            assert_eq!(sub.blocking_recv(), None);
            assert_eq!(hub.subscriber_count(), 0);
        }

        #[test]
        fn dropped_subscriptions_are_pruned() {
            let hub = EventHub::new(0);
            let sub = hub.subscribe();
            let _keep = hub.subscribe();
            drop(sub);

            hub.publish(&Event::Pong);
            assert_eq!(hub.subscriber_count(), 1);
        }
    }

    mod backpressure {
        use super::*;

        #[test]
        fn plain_subscription_never_sheds() {
            let hub = EventHub::new(2);
            let mut sub = hub.subscribe();
            let mut observer = hub.subscribe_observer();

            for i in 0..10 {
                hub.publish(&chunk("r1", &i.to_string()));
            }
            hub.publish(&complete("r1"));

            for i in 0..10 {
                assert_eq!(sub.try_recv(), Some(chunk("r1", &i.to_string())));
            }
            assert_eq!(sub.try_recv(), Some(complete("r1")));
            assert_eq!(sub.dropped(), 0);
            assert_eq!(observer.dropped(), 8);
            assert_eq!(observer.try_recv(), Some(chunk("r1", "0")));
        }

        #[test]
        fn sheds_partials_beyond_allowance() {
            let hub = EventHub::new(2);
            let mut sub = hub.subscribe_observer();

            hub.publish(&chunk("r1", "1"));
            hub.publish(&chunk("r1", "2"));
            hub.publish(&chunk("r1", "3"));
            hub.publish(&complete("r1"));

            assert_eq!(sub.try_recv(), Some(chunk("r1", "1")));
            assert_eq!(sub.try_recv(), Some(chunk("r1", "2")));
            assert_eq!(sub.try_recv(), Some(complete("r1")));
            assert_eq!(sub.try_recv(), None);
            assert_eq!(sub.dropped(), 1);
        }

        #[test]
        fn allowance_refills_as_consumer_catches_up() {
            let hub = EventHub::new(1);
            let mut sub = hub.subscribe_observer();

            hub.publish(&chunk("r1", "1"));
            assert_eq!(sub.try_recv(), Some(chunk("r1", "1")));
            hub.publish(&chunk("r1", "2"));
            assert_eq!(sub.try_recv(), Some(chunk("r1", "2")));
            assert_eq!(sub.dropped(), 0);
        }

        #[test]
        fn slow_subscriber_does_not_affect_fast_one() {
            let hub = EventHub::new(1);
            let mut slow = hub.subscribe_observer();
            let mut fast = hub.subscribe_observer();

            hub.publish(&chunk("r1", "1"));
            assert_eq!(fast.try_recv(), Some(chunk("r1", "1")));
            hub.publish(&chunk("r1", "2"));
            assert_eq!(fast.try_recv(), Some(chunk("r1", "2")));

            assert_eq!(slow.try_recv(), Some(chunk("r1", "1")));
            assert_eq!(slow.try_recv(), None);
            assert_eq!(slow.dropped(), 1);
            assert_eq!(fast.dropped(), 0);
        }
    }

    #[tokio::test]
    async fn async_recv() {
        let hub = EventHub::new(0);
        let mut sub = hub.subscribe();
        hub.publish(&Event::Pong);
        assert_eq!(sub.recv().await, Some(Event::Pong));
    }
}
