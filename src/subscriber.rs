use std::sync::{Arc, Weak};
use tokio::{
    sync::{mpsc, RwLock},
    task::JoinHandle,
};
use tracing::{debug, trace};

use crate::types::{Rssi, WatcherError, WatcherState};

/// Listener for watcher events
///
/// Callbacks run on the watcher's dispatch task, one at a time and in the
/// order the watcher applied its transitions. A slow subscriber delays only
/// later callbacks, never the watcher itself.
pub trait Subscriber: Send + Sync + 'static {
    /// The watcher changed state
    fn on_state_changed(&self, state: WatcherState, error: WatcherError);

    /// A new signal strength sample arrived while connected
    fn on_signal_strength(&self, rssi: Rssi);
}

/// A watcher notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherEvent {
    /// The watcher changed state
    StateChanged {
        /// New state
        state: WatcherState,
        /// Error accompanying the state, `Okay` unless `state` is `Error`
        error: WatcherError,
    },
    /// A new signal strength sample
    SignalStrength(Rssi),
}

impl WatcherEvent {
    fn deliver(self, subscriber: &dyn Subscriber) {
        match self {
            Self::StateChanged { state, error } => subscriber.on_state_changed(state, error),
            Self::SignalStrength(rssi) => subscriber.on_signal_strength(rssi),
        }
    }
}

/// Subscriber that forwards every event into a channel
///
/// For owners that would rather poll or `select!` on events than implement
/// [`Subscriber`]. The watcher only holds a weak reference, so keep the
/// returned `Arc` alive for as long as events should flow.
#[derive(Debug)]
pub struct ChannelSubscriber {
    sender: mpsc::UnboundedSender<WatcherEvent>,
}

impl ChannelSubscriber {
    /// Create a subscriber and the receiver its events arrive on
    #[must_use]
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<WatcherEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Arc::new(Self { sender }), receiver)
    }
}

impl Subscriber for ChannelSubscriber {
    fn on_state_changed(&self, state: WatcherState, error: WatcherError) {
        let _ = self.sender.send(WatcherEvent::StateChanged { state, error });
    }

    fn on_signal_strength(&self, rssi: Rssi) {
        let _ = self.sender.send(WatcherEvent::SignalStrength(rssi));
    }
}

type Slot = Arc<RwLock<Option<Weak<dyn Subscriber>>>>;

/// Ordered, fire-and-forget delivery to the current subscriber
pub(crate) struct Dispatcher {
    slot: Slot,
    queue: mpsc::UnboundedSender<WatcherEvent>,
    task: JoinHandle<()>,
}

impl Dispatcher {
    /// Spawn the dispatch task
    ///
    /// Must be called from within a Tokio runtime.
    pub(crate) fn spawn(subscriber: Option<Weak<dyn Subscriber>>) -> Self {
        let slot: Slot = Arc::new(RwLock::new(subscriber));
        let (queue, mut receiver) = mpsc::unbounded_channel::<WatcherEvent>();

        let task_slot = slot.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                // Held across delivery so replace() waits for an in-flight callback.
                let current = task_slot.read().await;
                match current.as_ref().and_then(Weak::upgrade) {
                    Some(subscriber) => {
                        trace!("Delivering {:?}", event);
                        event.deliver(subscriber.as_ref());
                    }
                    None => trace!("No subscriber for {:?}", event),
                }
            }
            debug!("Dispatcher stopped");
        });

        Self { slot, queue, task }
    }

    /// Queue an event for delivery
    pub(crate) fn notify(&self, event: WatcherEvent) {
        let _ = self.queue.send(event);
    }

    /// Replace the subscriber; the previous one receives nothing further
    ///
    /// Waits for a callback already running on the previous subscriber.
    pub(crate) async fn replace(&self, subscriber: Option<Weak<dyn Subscriber>>) {
        *self.slot.write().await = subscriber;
    }

    /// Stop delivering events
    pub(crate) fn close(&self) {
        self.task.abort();
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Mutex, thread, time::Duration};
    use tokio::{sync::Notify, time::timeout};

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<WatcherEvent>>,
    }

    impl Subscriber for Recorder {
        fn on_state_changed(&self, state: WatcherState, error: WatcherError) {
            self.events
                .lock()
                .unwrap()
                .push(WatcherEvent::StateChanged { state, error });
        }

        fn on_signal_strength(&self, rssi: Rssi) {
            self.events
                .lock()
                .unwrap()
                .push(WatcherEvent::SignalStrength(rssi));
        }
    }

    /// Records events slowly, announcing each callback as it begins
    struct SlowRecorder {
        entered: Arc<Notify>,
        events: Mutex<Vec<WatcherEvent>>,
    }

    impl Subscriber for SlowRecorder {
        fn on_state_changed(&self, state: WatcherState, error: WatcherError) {
            self.entered.notify_one();
            thread::sleep(Duration::from_millis(50));
            self.events
                .lock()
                .unwrap()
                .push(WatcherEvent::StateChanged { state, error });
        }

        fn on_signal_strength(&self, rssi: Rssi) {
            self.entered.notify_one();
            self.events
                .lock()
                .unwrap()
                .push(WatcherEvent::SignalStrength(rssi));
        }
    }

    fn searching() -> WatcherEvent {
        WatcherEvent::StateChanged {
            state: WatcherState::Searching,
            error: WatcherError::Okay,
        }
    }

    #[tokio::test]
    async fn test_delivery_preserves_order() {
        let (subscriber, mut events) = ChannelSubscriber::new();
        let weak: Weak<dyn Subscriber> = Arc::<ChannelSubscriber>::downgrade(&subscriber);
        let dispatcher = Dispatcher::spawn(Some(weak));

        dispatcher.notify(searching());
        dispatcher.notify(WatcherEvent::SignalStrength(Rssi(-60)));
        dispatcher.notify(WatcherEvent::SignalStrength(Rssi(-61)));

        assert_eq!(events.recv().await, Some(searching()));
        assert_eq!(events.recv().await, Some(WatcherEvent::SignalStrength(Rssi(-60))));
        assert_eq!(events.recv().await, Some(WatcherEvent::SignalStrength(Rssi(-61))));
    }

    #[tokio::test]
    async fn test_replaced_subscriber_is_detached() {
        let first = Arc::new(Recorder::default());
        let (second, mut second_events) = ChannelSubscriber::new();

        let weak: Weak<dyn Subscriber> = Arc::<Recorder>::downgrade(&first);
        let dispatcher = Dispatcher::spawn(Some(weak));
        dispatcher.notify(searching());
        tokio::time::sleep(Duration::from_millis(20)).await;

        let weak: Weak<dyn Subscriber> = Arc::<ChannelSubscriber>::downgrade(&second);
        dispatcher.replace(Some(weak)).await;
        dispatcher.notify(WatcherEvent::SignalStrength(Rssi(-50)));

        assert_eq!(
            second_events.recv().await,
            Some(WatcherEvent::SignalStrength(Rssi(-50)))
        );
        assert_eq!(*first.events.lock().unwrap(), vec![searching()]);
    }

    #[tokio::test]
    async fn test_dropped_subscriber_is_skipped() {
        let (subscriber, mut events) = ChannelSubscriber::new();
        let weak: Weak<dyn Subscriber> = Arc::<ChannelSubscriber>::downgrade(&subscriber);
        let dispatcher = Dispatcher::spawn(Some(weak));

        drop(subscriber);
        dispatcher.notify(searching());

        // The only sender lived inside the subscriber.
        assert_eq!(timeout(Duration::from_secs(1), events.recv()).await, Ok(None));
    }

    #[tokio::test]
    async fn test_closed_dispatcher_delivers_nothing() {
        let (subscriber, mut events) = ChannelSubscriber::new();
        let weak: Weak<dyn Subscriber> = Arc::<ChannelSubscriber>::downgrade(&subscriber);
        let dispatcher = Dispatcher::spawn(Some(weak));

        dispatcher.close();
        dispatcher.notify(searching());

        assert!(timeout(Duration::from_millis(100), events.recv())
            .await
            .is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_replace_waits_for_running_callback() {
        let entered = Arc::new(Notify::new());
        let first = Arc::new(SlowRecorder {
            entered: entered.clone(),
            events: Mutex::new(Vec::new()),
        });
        let (second, mut second_events) = ChannelSubscriber::new();

        let weak: Weak<dyn Subscriber> = Arc::<SlowRecorder>::downgrade(&first);
        let dispatcher = Dispatcher::spawn(Some(weak));
        dispatcher.notify(searching());
        entered.notified().await;

        let weak: Weak<dyn Subscriber> = Arc::<ChannelSubscriber>::downgrade(&second);
        dispatcher.replace(Some(weak)).await;
        assert_eq!(*first.events.lock().unwrap(), vec![searching()]);

        dispatcher.notify(WatcherEvent::SignalStrength(Rssi(-52)));
        assert_eq!(
            timeout(Duration::from_secs(1), second_events.recv()).await,
            Ok(Some(WatcherEvent::SignalStrength(Rssi(-52))))
        );
        assert_eq!(first.events.lock().unwrap().len(), 1);
    }
}
