//! Fan-out dispatcher for bus notifications.
//!
//! A single reader task consumes the raw notification channel, decodes each
//! payload once, and routes the typed [`Notification`] through a routing
//! table: first by signal name, then by correlation key. A waiter registered
//! for key K never sees notifications tagged with any other key, so
//! unrelated operations sharing the bus cannot satisfy or terminate its wait.

use crate::bus::{RawSignal, Transport};
use crate::error::{Error, Result, ResultExt};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use vmorch_protocol::{CorrelationKey, MatchRule, Notification};

/// What a waiter receives from the dispatcher.
#[derive(Debug, Clone)]
pub enum Delivery {
    /// A decoded notification.
    Notification(Notification),
    /// A payload for this signal could not be decoded.
    DecodeFailed {
        /// Signal the payload was delivered under.
        signal: String,
        /// Decoder error.
        reason: String,
    },
}

impl Delivery {
    /// Signal name of the delivery.
    pub fn signal(&self) -> &str {
        match self {
            Delivery::Notification(n) => n.signal(),
            Delivery::DecodeFailed { signal, .. } => signal,
        }
    }

    fn passes(&self, filter: Option<&str>) -> bool {
        filter.map_or(true, |name| name == self.signal())
    }
}

struct Waiter {
    id: u64,
    key: Option<CorrelationKey>,
    tx: mpsc::UnboundedSender<Delivery>,
}

impl Waiter {
    fn deliver(&self, delivery: Delivery) {
        if let Err(e) = self.tx.send(delivery) {
            // Receiver already dropped; its route is removed with it.
            tracing::trace!(
                waiter = self.id,
                signal = e.0.signal(),
                "dropping delivery for closed waiter"
            );
        }
    }
}

#[derive(Default)]
struct Routes {
    next_id: u64,
    closed: bool,
    by_signal: HashMap<String, Vec<Waiter>>,
}

struct Shared {
    routes: Mutex<Routes>,
    transport: Arc<dyn Transport>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    fn route(&self, raw: RawSignal) {
        let routes = self.routes.lock();
        let Some(waiters) = routes.by_signal.get(&raw.member) else {
            tracing::trace!(signal = %raw.member, "no waiters for notification");
            return;
        };

        match Notification::decode(&raw.member, &raw.payload) {
            Ok(notification) => {
                let key = notification.key();
                for waiter in waiters {
                    if waiter.key.as_ref().map_or(true, |k| k == key) {
                        waiter.deliver(Delivery::Notification(notification.clone()));
                    }
                }
            }
            Err(e) => {
                tracing::warn!(signal = %raw.member, error = %e, "failed to decode notification");
                for waiter in waiters {
                    waiter.deliver(Delivery::DecodeFailed {
                        signal: raw.member.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }
    }

    fn remove_waiter(&self, id: u64) {
        let mut routes = self.routes.lock();
        routes.by_signal.retain(|_, waiters| {
            waiters.retain(|w| w.id != id);
            !waiters.is_empty()
        });
    }

    /// Drop every waiter so pending receivers observe the closed stream.
    fn close(&self) {
        let mut routes = self.routes.lock();
        routes.closed = true;
        routes.by_signal.clear();
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
    }
}

/// Routes bus notifications to subscribed waiters.
#[derive(Clone)]
pub struct Dispatcher {
    shared: Arc<Shared>,
}

impl Dispatcher {
    /// Start the reader task over a raw notification channel.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(
        transport: Arc<dyn Transport>,
        raw_signals: mpsc::UnboundedReceiver<RawSignal>,
    ) -> Self {
        let shared = Arc::new(Shared {
            routes: Mutex::new(Routes::default()),
            transport,
            reader: Mutex::new(None),
        });

        let reader = tokio::spawn(read_loop(Arc::downgrade(&shared), raw_signals));
        *shared.reader.lock() = Some(reader);

        Self { shared }
    }

    /// Register interest in `signals`, optionally scoped to one correlation key.
    ///
    /// The bus match rules are registered before this returns, so a request
    /// issued afterwards cannot race ahead of the subscription.
    pub async fn subscribe(
        &self,
        signals: &[&str],
        key: Option<CorrelationKey>,
    ) -> Result<Subscription> {
        let (tx, rx) = mpsc::unbounded_channel();

        let id = {
            let mut routes = self.shared.routes.lock();
            if routes.closed {
                return Err(Error::transport("subscribe", "notification stream closed"));
            }
            routes.next_id += 1;
            let id = routes.next_id;
            for signal in signals {
                routes
                    .by_signal
                    .entry(signal.to_string())
                    .or_default()
                    .push(Waiter {
                        id,
                        key: key.clone(),
                        tx: tx.clone(),
                    });
            }
            id
        };

        let mut rules = Vec::with_capacity(signals.len());
        for signal in signals {
            let rule = MatchRule::container_signal(signal);
            if let Err(e) = self.shared.transport.add_match(&rule).await {
                self.shared.remove_waiter(id);
                release_rules(self.shared.transport.as_ref(), rules).await;
                return Err(e).with_context(|| format!("subscribe to {}", signal));
            }
            rules.push(rule);
        }

        tracing::debug!(signals = ?signals, key = ?key, "subscribed");

        Ok(Subscription {
            id,
            rx,
            deferred: VecDeque::new(),
            rules,
            key,
            shared: Arc::clone(&self.shared),
            released: false,
        })
    }

    /// Number of live subscriptions.
    pub fn waiter_count(&self) -> usize {
        let routes = self.shared.routes.lock();
        let mut ids: Vec<u64> = routes
            .by_signal
            .values()
            .flat_map(|waiters| waiters.iter().map(|w| w.id))
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids.len()
    }
}

async fn read_loop(shared: Weak<Shared>, mut raw_signals: mpsc::UnboundedReceiver<RawSignal>) {
    while let Some(raw) = raw_signals.recv().await {
        let Some(shared) = shared.upgrade() else {
            return;
        };
        shared.route(raw);
    }

    tracing::debug!("notification stream ended");
    if let Some(shared) = shared.upgrade() {
        shared.close();
    }
}

async fn release_rules(transport: &dyn Transport, rules: Vec<MatchRule>) -> Option<Error> {
    let mut first_error = None;
    for rule in rules {
        if let Err(e) = transport.remove_match(&rule).await {
            tracing::warn!(rule = %rule, error = %e, "failed to release match rule");
            first_error.get_or_insert(e);
        }
    }
    first_error
}

/// A registered interest in one or more signals.
///
/// Each subscription owns its own delivery channel, so several waiters can
/// observe the same notification independently. Release it with
/// [`Subscription::close`]; dropping it releases too, with the bus-side
/// cleanup scheduled on the current runtime.
pub struct Subscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<Delivery>,
    deferred: VecDeque<Delivery>,
    rules: Vec<MatchRule>,
    key: Option<CorrelationKey>,
    shared: Arc<Shared>,
    released: bool,
}

impl Subscription {
    /// Correlation key this subscription is scoped to.
    pub fn key(&self) -> Option<&CorrelationKey> {
        self.key.as_ref()
    }

    /// Next delivery passing `filter`.
    ///
    /// Deliveries that fail the filter stay queued on this subscription for
    /// a later call with a different filter. Returns `None` once the
    /// notification stream has closed.
    pub(crate) async fn next_delivery(&mut self, filter: Option<&str>) -> Option<Delivery> {
        if let Some(pos) = self.deferred.iter().position(|d| d.passes(filter)) {
            return self.deferred.remove(pos);
        }

        loop {
            let delivery = self.rx.recv().await?;
            if delivery.passes(filter) {
                return Some(delivery);
            }
            tracing::trace!(signal = delivery.signal(), filter = ?filter, "deferring delivery");
            self.deferred.push_back(delivery);
        }
    }

    /// Release the subscription and its bus match rules.
    pub async fn close(mut self) -> Result<()> {
        self.released = true;
        self.shared.remove_waiter(self.id);
        let rules = std::mem::take(&mut self.rules);
        match release_rules(self.shared.transport.as_ref(), rules).await {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.shared.remove_waiter(self.id);

        let rules = std::mem::take(&mut self.rules);
        if rules.is_empty() {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let transport = Arc::clone(&self.shared.transport);
                handle.spawn(async move {
                    release_rules(transport.as_ref(), rules).await;
                });
            }
            Err(_) => {
                tracing::warn!(
                    count = rules.len(),
                    "no runtime to release match rules; they stay registered until disconnect"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use std::time::Duration;
    use vmorch_protocol::{signals, ContainerStartedSignal};

    fn started(vm: &str, container: &str, owner: &str) -> ContainerStartedSignal {
        ContainerStartedSignal {
            key: CorrelationKey::new(vm, container, owner),
            container_username: "testuser".into(),
            ipv4_address: None,
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn test_routes_only_matching_key() {
        let (bus, raw) = MemoryBus::new();
        let dispatcher = Dispatcher::spawn(bus.clone(), raw);

        let key2 = CorrelationKey::new("vm2", "c2", "owner2");
        let mut sub = dispatcher
            .subscribe(&[signals::CONTAINER_STARTED], Some(key2.clone()))
            .await
            .unwrap();

        assert!(bus.emit(started("vm1", "c1", "owner1")));
        assert!(bus.emit(started("vm2", "c2", "owner2")));

        match sub.next_delivery(None).await.unwrap() {
            Delivery::Notification(n) => assert_eq!(n.key(), &key2),
            other => panic!("unexpected delivery: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unscoped_waiter_sees_every_key() {
        let (bus, raw) = MemoryBus::new();
        let dispatcher = Dispatcher::spawn(bus.clone(), raw);
        let mut sub = dispatcher
            .subscribe(&[signals::CONTAINER_STARTED], None)
            .await
            .unwrap();

        bus.emit(started("vm1", "c1", "owner1"));
        bus.emit(started("vm2", "c2", "owner2"));

        assert!(sub.next_delivery(None).await.is_some());
        assert!(sub.next_delivery(None).await.is_some());
    }

    #[tokio::test]
    async fn test_closed_waiter_does_not_block_others() {
        let (bus, raw) = MemoryBus::new();
        let dispatcher = Dispatcher::spawn(bus.clone(), raw);
        let mut sub = dispatcher
            .subscribe(&[signals::CONTAINER_STARTED], None)
            .await
            .unwrap();

        let (dead_tx, dead_rx) = mpsc::unbounded_channel();
        drop(dead_rx);
        dispatcher
            .shared
            .routes
            .lock()
            .by_signal
            .entry(signals::CONTAINER_STARTED.to_string())
            .or_default()
            .insert(
                0,
                Waiter {
                    id: u64::MAX,
                    key: None,
                    tx: dead_tx,
                },
            );

        bus.emit(started("vm1", "c1", "owner1"));

        match sub.next_delivery(None).await.unwrap() {
            Delivery::Notification(n) => {
                assert_eq!(n.key(), &CorrelationKey::new("vm1", "c1", "owner1"))
            }
            other => panic!("unexpected delivery: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_decode_failure_is_delivered() {
        let (bus, raw) = MemoryBus::new();
        let dispatcher = Dispatcher::spawn(bus.clone(), raw);
        let mut sub = dispatcher
            .subscribe(&[signals::CONTAINER_STARTED], None)
            .await
            .unwrap();

        bus.emit_raw(signals::CONTAINER_STARTED, Vec::new());

        match sub.next_delivery(None).await.unwrap() {
            Delivery::DecodeFailed { signal, reason } => {
                assert_eq!(signal, signals::CONTAINER_STARTED);
                assert!(reason.contains("empty"));
            }
            other => panic!("unexpected delivery: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_drop_releases_everything_without_notifications() {
        let (bus, raw) = MemoryBus::new();
        let dispatcher = Dispatcher::spawn(bus.clone(), raw);

        let sub = dispatcher
            .subscribe(
                &[signals::LXD_CONTAINER_CREATED, signals::LXD_CONTAINER_DOWNLOADING],
                Some(CorrelationKey::new("vm1", "c1", "owner1")),
            )
            .await
            .unwrap();
        assert_eq!(bus.active_matches(), 2);
        assert_eq!(dispatcher.waiter_count(), 1);

        drop(sub);
        assert_eq!(dispatcher.waiter_count(), 0);
        settle().await;
        assert_eq!(bus.active_matches(), 0);
    }

    #[tokio::test]
    async fn test_close_releases_match_rules() {
        let (bus, raw) = MemoryBus::new();
        let dispatcher = Dispatcher::spawn(bus.clone(), raw);

        let sub = dispatcher
            .subscribe(&[signals::CONTAINER_STARTED], None)
            .await
            .unwrap();
        sub.close().await.unwrap();
        assert_eq!(bus.active_matches(), 0);
        assert_eq!(dispatcher.waiter_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_registration_rolls_back() {
        let (bus, raw) = MemoryBus::new();
        let dispatcher = Dispatcher::spawn(bus.clone(), raw);
        bus.fail_add_match(true);

        let result = dispatcher
            .subscribe(&[signals::CONTAINER_STARTED], None)
            .await;
        let err = result.err().unwrap();
        assert!(matches!(err.root(), Error::Transport { .. }));
        assert!(err.to_string().contains("subscribe to ContainerStarted"));
        assert_eq!(dispatcher.waiter_count(), 0);
        assert_eq!(bus.active_matches(), 0);
    }

    #[tokio::test]
    async fn test_filtered_deliveries_are_deferred_not_lost() {
        let (bus, raw) = MemoryBus::new();
        let dispatcher = Dispatcher::spawn(bus.clone(), raw);
        let mut sub = dispatcher
            .subscribe(
                &[signals::CONTAINER_STARTED, signals::LXD_CONTAINER_STARTING],
                None,
            )
            .await
            .unwrap();

        bus.emit(started("vm1", "c1", "owner1"));
        bus.emit(vmorch_protocol::LxdContainerStartingSignal {
            key: CorrelationKey::new("vm1", "c1", "owner1"),
            status: vmorch_protocol::StartingStatus::Started,
            failure_reason: String::new(),
        });

        let first = sub
            .next_delivery(Some(signals::LXD_CONTAINER_STARTING))
            .await
            .unwrap();
        assert_eq!(first.signal(), signals::LXD_CONTAINER_STARTING);

        let second = sub
            .next_delivery(Some(signals::CONTAINER_STARTED))
            .await
            .unwrap();
        assert_eq!(second.signal(), signals::CONTAINER_STARTED);
    }

    #[tokio::test]
    async fn test_stream_close_ends_waiters() {
        let (bus, raw) = MemoryBus::new();
        let dispatcher = Dispatcher::spawn(bus.clone(), raw);
        let mut sub = dispatcher
            .subscribe(&[signals::CONTAINER_STARTED], None)
            .await
            .unwrap();

        bus.disconnect();
        assert!(sub.next_delivery(None).await.is_none());

        let again = dispatcher
            .subscribe(&[signals::CONTAINER_STARTED], None)
            .await;
        assert!(again.is_err());
    }
}
