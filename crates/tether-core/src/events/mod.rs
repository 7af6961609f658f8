//! In-process publish/subscribe bus for lifecycle and progress notifications.
//!
//! Every subscriber owns a typed queue. [`EventBus::publish`] snapshots the
//! listener list for the event's channel and enqueues into each queue in
//! registration order, so a listener that registers while a publish is in
//! flight does not see that publication. Dropping a [`Subscription`]
//! unregisters it.

mod sink;

pub use sink::spawn_log_sink;

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};

use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::runtime_table::RunningRuntime;
use crate::supervisor::{OutputStream, ProcessRole};

/// Phase of a setup/launch sequence, emitted in causal order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ProgressEvent {
    InitializingKeystore,
    StartingKeystore,
    StartingRuntime,
    Ready,
}

/// One line of child process output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogLine {
    pub role: ProcessRole,
    pub stream: OutputStream,
    pub line: String,
}

/// Named channel an event is published on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventChannel {
    Progress,
    Log,
    RuntimeReady,
}

/// Everything that travels over the bus.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "channel", content = "payload", rename_all = "camelCase")]
pub enum LauncherEvent {
    Progress(ProgressEvent),
    Log(LogLine),
    RuntimeReady(RunningRuntime),
}

impl LauncherEvent {
    pub fn channel(&self) -> EventChannel {
        match self {
            Self::Progress(_) => EventChannel::Progress,
            Self::Log(_) => EventChannel::Log,
            Self::RuntimeReady(_) => EventChannel::RuntimeReady,
        }
    }
}

/// Identifier of one registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

struct Listener {
    id: SubscriberId,
    channel: EventChannel,
    tx: mpsc::UnboundedSender<LauncherEvent>,
}

type Listeners = Mutex<Vec<Listener>>;

fn lock(listeners: &Listeners) -> MutexGuard<'_, Vec<Listener>> {
    listeners.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Cloneable handle to one bus; clones share listeners.
#[derive(Clone, Default)]
pub struct EventBus {
    listeners: Arc<Listeners>,
    next_id: Arc<AtomicU64>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &lock(&self.listeners).len())
            .finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh listener id.
    pub fn next_subscriber_id(&self) -> SubscriberId {
        SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Deliver `event` to every listener currently registered on its channel.
    ///
    /// Returns the number of listeners that received it. Listeners whose
    /// receiving side is gone are pruned.
    pub fn publish(&self, event: LauncherEvent) -> usize {
        let channel = event.channel();
        let targets: Vec<(SubscriberId, mpsc::UnboundedSender<LauncherEvent>)> =
            lock(&self.listeners)
                .iter()
                .filter(|l| l.channel == channel)
                .map(|l| (l.id, l.tx.clone()))
                .collect();

        match &event {
            LauncherEvent::Log(_) => trace!(?channel, listeners = targets.len(), "publish"),
            _ => debug!(?event, listeners = targets.len(), "publish"),
        }

        let mut delivered = 0;
        let mut closed = Vec::new();
        for (id, tx) in targets {
            if tx.send(event.clone()).is_ok() {
                delivered += 1;
            } else {
                closed.push(id);
            }
        }

        if !closed.is_empty() {
            lock(&self.listeners).retain(|l| !closed.contains(&l.id));
        }
        delivered
    }

    /// Register `tx` under `id` on `channel`.
    ///
    /// Returns `false` and leaves the existing registration untouched if
    /// `id` is already registered.
    pub fn listen(
        &self,
        id: SubscriberId,
        channel: EventChannel,
        tx: mpsc::UnboundedSender<LauncherEvent>,
    ) -> bool {
        let mut listeners = lock(&self.listeners);
        if listeners.iter().any(|l| l.id == id) {
            return false;
        }
        listeners.push(Listener { id, channel, tx });
        true
    }

    /// Remove a listener. Returns `false` if it was not registered.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let mut listeners = lock(&self.listeners);
        let before = listeners.len();
        listeners.retain(|l| l.id != id);
        listeners.len() != before
    }

    /// Subscribe to `channel` with a new queue. Dropping the returned
    /// [`Subscription`] unsubscribes.
    pub fn subscribe(&self, channel: EventChannel) -> Subscription {
        self.subscribe_all(&[channel])
    }

    /// Subscribe to several channels through one queue, so events arrive
    /// in publication order regardless of channel.
    pub fn subscribe_all(&self, channels: &[EventChannel]) -> Subscription {
        let id = self.next_subscriber_id();
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut listeners = lock(&self.listeners);
            for &channel in channels {
                if !listeners.iter().any(|l| l.id == id && l.channel == channel) {
                    listeners.push(Listener {
                        id,
                        channel,
                        tx: tx.clone(),
                    });
                }
            }
        }
        Subscription {
            id,
            rx,
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    pub fn listener_count(&self, channel: EventChannel) -> usize {
        lock(&self.listeners)
            .iter()
            .filter(|l| l.channel == channel)
            .count()
    }

    pub fn progress(&self, phase: ProgressEvent) {
        self.publish(LauncherEvent::Progress(phase));
    }
}

/// Receiving end of one bus registration.
pub struct Subscription {
    id: SubscriberId,
    rx: mpsc::UnboundedReceiver<LauncherEvent>,
    listeners: Weak<Listeners>,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Wait for the next event. Returns `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<LauncherEvent> {
        self.rx.recv().await
    }

    /// Take an already-queued event without waiting.
    pub fn try_recv(&mut self) -> Option<LauncherEvent> {
        self.rx.try_recv().ok()
    }
}

impl Stream for Subscription {
    type Item = LauncherEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(listeners) = self.listeners.upgrade() {
            lock(&listeners).retain(|l| l.id != self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(sub: &mut Subscription) -> Vec<LauncherEvent> {
        std::iter::from_fn(|| sub.try_recv()).collect()
    }

    #[test]
    fn publish_reaches_only_matching_channel() {
        let bus = EventBus::new();
        let mut progress = bus.subscribe(EventChannel::Progress);
        let mut logs = bus.subscribe(EventChannel::Log);

        assert_eq!(bus.publish(LauncherEvent::Progress(ProgressEvent::StartingKeystore)), 1);

        assert_eq!(
            drain(&mut progress),
            vec![LauncherEvent::Progress(ProgressEvent::StartingKeystore)]
        );
        assert!(drain(&mut logs).is_empty());
    }

    #[test]
    fn late_subscriber_gets_no_replay() {
        let bus = EventBus::new();
        let mut early = bus.subscribe(EventChannel::Progress);
        bus.progress(ProgressEvent::StartingKeystore);

        let mut late = bus.subscribe(EventChannel::Progress);
        bus.progress(ProgressEvent::StartingRuntime);

        assert_eq!(drain(&mut early).len(), 2);
        assert_eq!(
            drain(&mut late),
            vec![LauncherEvent::Progress(ProgressEvent::StartingRuntime)]
        );
    }

    #[test]
    fn two_subscribers_see_same_order() {
        let bus = EventBus::new();
        let mut a = bus.subscribe(EventChannel::Progress);
        let mut b = bus.subscribe(EventChannel::Progress);

        for phase in [
            ProgressEvent::InitializingKeystore,
            ProgressEvent::StartingKeystore,
            ProgressEvent::StartingRuntime,
            ProgressEvent::Ready,
        ] {
            bus.progress(phase);
        }

        let seen_a = drain(&mut a);
        assert_eq!(seen_a.len(), 4);
        assert_eq!(seen_a, drain(&mut b));
    }

    #[test]
    fn multi_channel_subscription_keeps_publication_order() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe_all(&[EventChannel::RuntimeReady, EventChannel::Progress]);
        let runtime = crate::runtime_table::RunningRuntime {
            mode: crate::data_root::RuntimeMode::BuiltIn {
                version: "0.2.3".to_string(),
            },
            data_root: crate::data_root::DataRoot::Partition {
                name: "default".to_string(),
            },
            admin_port: 4000,
            endpoint: "ws://127.0.0.1:4000".to_string(),
        };

        bus.progress(ProgressEvent::StartingRuntime);
        bus.progress(ProgressEvent::Ready);
        bus.publish(LauncherEvent::RuntimeReady(runtime.clone()));
        bus.progress(ProgressEvent::StartingRuntime);

        assert_eq!(
            drain(&mut sub),
            vec![
                LauncherEvent::Progress(ProgressEvent::StartingRuntime),
                LauncherEvent::Progress(ProgressEvent::Ready),
                LauncherEvent::RuntimeReady(runtime),
                LauncherEvent::Progress(ProgressEvent::StartingRuntime),
            ]
        );

        drop(sub);
        assert_eq!(bus.listener_count(EventChannel::Progress), 0);
        assert_eq!(bus.listener_count(EventChannel::RuntimeReady), 0);
    }

    #[test]
    fn dropping_subscription_unsubscribes() {
        let bus = EventBus::new();
        let sub = bus.subscribe(EventChannel::Progress);
        assert_eq!(bus.listener_count(EventChannel::Progress), 1);
        drop(sub);
        assert_eq!(bus.listener_count(EventChannel::Progress), 0);
        assert_eq!(bus.publish(LauncherEvent::Progress(ProgressEvent::Ready)), 0);
    }

    #[test]
    fn listen_and_unsubscribe_are_idempotent() {
        let bus = EventBus::new();
        let id = bus.next_subscriber_id();
        let (tx, mut rx) = mpsc::unbounded_channel();

        assert!(bus.listen(id, EventChannel::Progress, tx.clone()));
        assert!(!bus.listen(id, EventChannel::Progress, tx));
        assert_eq!(bus.listener_count(EventChannel::Progress), 1);

        bus.progress(ProgressEvent::Ready);
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err(), "registered twice would deliver twice");

        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
    }

    #[test]
    fn closed_receivers_are_pruned() {
        let bus = EventBus::new();
        let id = bus.next_subscriber_id();
        let (tx, rx) = mpsc::unbounded_channel();
        bus.listen(id, EventChannel::Progress, tx);
        drop(rx);

        assert_eq!(bus.publish(LauncherEvent::Progress(ProgressEvent::Ready)), 0);
        assert_eq!(bus.listener_count(EventChannel::Progress), 0);
    }

    #[test]
    fn progress_serializes_as_camel_case_tag() {
        let json = serde_json::to_string(&ProgressEvent::InitializingKeystore).unwrap();
        assert_eq!(json, "\"initializingKeystore\"");
        let event = serde_json::to_value(LauncherEvent::Progress(ProgressEvent::StartingRuntime))
            .unwrap();
        assert_eq!(
            event,
            serde_json::json!({"channel": "progress", "payload": "startingRuntime"})
        );
    }

    #[tokio::test]
    async fn subscription_is_a_stream() {
        use futures::StreamExt;

        let bus = EventBus::new();
        let mut sub = bus.subscribe(EventChannel::Progress);
        bus.progress(ProgressEvent::StartingKeystore);
        assert_eq!(
            sub.next().await,
            Some(LauncherEvent::Progress(ProgressEvent::StartingKeystore))
        );
    }
}
