use std::sync::{Arc, Weak};
use tokio::{
    sync::{mpsc, Mutex, RwLock},
    task::JoinHandle,
    time::{sleep, timeout},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    ble::BtleplugRadio,
    error::{LeashError, Result},
    machine::{self, Effect, Input},
    radio::{EventSink, Radio, SessionEvent},
    subscriber::{Dispatcher, Subscriber, WatcherEvent},
    types::{Rssi, Target, WatcherConfig, WatcherError, WatcherSnapshot, WatcherState},
};

/// Watches presence and signal strength of one Bluetooth Low Energy wearable
///
/// The watcher owns a connection state machine that is driven by
/// [`start`](Self::start), [`stop`](Self::stop) and events from its
/// [`Radio`]. Every state change, and every signal strength sample taken while
/// connected, is delivered to the registered [`Subscriber`].
///
/// # Concurrency
///
/// Transitions are applied one at a time under a single lock, and the
/// accessors only ever observe completed transitions. `stop()` may be called
/// at any moment, including while `start()` is still activating the radio or a
/// connection attempt is pending; the watcher always settles in
/// [`WatcherState::Off`].
///
/// # Examples
///
/// ```no_run
/// use pebbleash::{ChannelSubscriber, ProximityWatcher, WatcherConfig, WatcherEvent};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let (subscriber, mut events) = ChannelSubscriber::new();
///     let watcher = ProximityWatcher::with_bluetooth(WatcherConfig::default());
///     watcher.set_subscriber(&subscriber).await;
///
///     watcher.start().await;
///     while let Some(event) = events.recv().await {
///         if let WatcherEvent::SignalStrength(rssi) = event {
///             println!("Wearable at {rssi}");
///         }
///     }
///
///     watcher.stop().await?;
///     Ok(())
/// }
/// ```
pub struct ProximityWatcher<R: Radio> {
    shared: Arc<Shared<R>>,
    shutdown: CancellationToken,
}

struct Shared<R> {
    radio: R,
    config: WatcherConfig,
    core: RwLock<Core>,
    /// Held by `start()` and for the whole of `stop()`
    lifecycle: Mutex<()>,
    dispatcher: Dispatcher,
}

/// One activation, from `start()` until `stop()`
struct Session {
    epoch: u64,
    cancel: CancellationToken,
    events: EventSink,
    driver: JoinHandle<()>,
}

#[derive(Default)]
struct Core {
    state: WatcherState,
    error: WatcherError,
    signal_strength: Option<Rssi>,
    target: Option<Target>,
    epoch: u64,
    session: Option<Session>,
    /// Driver of a session that shut itself down, still releasing the radio
    retiring: Option<JoinHandle<()>>,
}

impl Core {
    fn is_current(&self, epoch: u64) -> bool {
        self.session.as_ref().is_some_and(|s| s.epoch == epoch)
    }

    /// Run `input` through the state machine and publish the result
    fn apply(&mut self, input: Input, config: &WatcherConfig, dispatcher: &Dispatcher) -> Option<Effect> {
        let transition = machine::step(self.state, input, config.revocation)?;

        let changed = transition.state != self.state || transition.error != self.error;
        if changed {
            match transition.error {
                WatcherError::Okay => info!("Watcher state: {} -> {}", self.state, transition.state),
                error => error!("Watcher state: {} -> {} ({})", self.state, transition.state, error),
            }
        }

        self.state = transition.state;
        self.error = transition.error;
        if self.state != WatcherState::Connected {
            self.signal_strength = None;
        }
        match &transition.effect {
            Effect::Connect(target) => self.target = Some(target.clone()),
            _ if !matches!(self.state, WatcherState::Connecting | WatcherState::Connected) => {
                self.target = None;
            }
            _ => {}
        }

        if changed {
            dispatcher.notify(WatcherEvent::StateChanged {
                state: self.state,
                error: self.error,
            });
        }

        Some(transition.effect)
    }
}

impl<R: Radio> Shared<R> {
    /// Apply an input on behalf of session `epoch`
    async fn apply(&self, epoch: u64, input: Input) -> Option<Effect> {
        let mut core = self.core.write().await;
        if !core.is_current(epoch) {
            debug!("Dropping {:?} from ended session {}", input, epoch);
            return None;
        }

        let effect = core.apply(input, &self.config, &self.dispatcher)?;
        if core.state == WatcherState::Off {
            if let Some(session) = core.session.take() {
                session.cancel.cancel();
                core.retiring = Some(session.driver);
            }
        }
        Some(effect)
    }

    async fn record_sample(&self, epoch: u64, rssi: Rssi) {
        let mut core = self.core.write().await;
        if !core.is_current(epoch) {
            return;
        }
        if core.state != WatcherState::Connected {
            debug!("Ignoring signal sample {} while {}", rssi, core.state);
            return;
        }

        debug!("Signal strength: {}", rssi);
        core.signal_strength = Some(rssi);
        self.dispatcher.notify(WatcherEvent::SignalStrength(rssi));
    }

    async fn deactivate(&self) -> Result<()> {
        info!("Deactivating radio");
        self.radio.request_deactivation().await.inspect_err(|e| {
            warn!("Radio deactivation failed: {}", e);
        })
    }
}

/// Per-session task feeding radio events through the state machine
struct Driver<R: Radio> {
    shared: Arc<Shared<R>>,
    epoch: u64,
    sink: EventSink,
    cancel: CancellationToken,
    pending_connect: Option<CancellationToken>,
}

impl<R: Radio> Driver<R> {
    async fn run(mut self, mut events: mpsc::UnboundedReceiver<SessionEvent>) {
        debug!("Session {} started", self.epoch);

        let activation = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return,
            result = self.shared.radio.request_activation(self.sink.clone(), &self.shared.config) => result,
        };
        if let Err(e) = activation {
            error!("Radio activation failed: {}", e);
            // Anything that keeps the radio from starting leaves nothing to retry.
            let error = e.watcher_error().unwrap_or(WatcherError::Unsupported);
            self.handle(Input::Denied(error)).await;
        }

        loop {
            let event = tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            match event {
                SessionEvent::Internal(input) => self.handle(input).await,
                SessionEvent::Radio(event) => match event.into_input() {
                    Ok(input) => self.handle(input).await,
                    Err(rssi) => self.shared.record_sample(self.epoch, rssi).await,
                },
            }
        }

        self.cancel_connect();
        debug!("Session {} ended", self.epoch);
    }

    async fn handle(&mut self, input: Input) {
        if let Some(effect) = self.shared.apply(self.epoch, input).await {
            self.execute(effect).await;
        }
    }

    async fn execute(&mut self, effect: Effect) {
        match effect {
            Effect::None | Effect::Activate => {}
            Effect::Deactivate => {
                self.cancel_connect();
                let _ = self.shared.deactivate().await;
            }
            Effect::Scan => {
                self.cancel_connect();
                self.scan().await;
            }
            Effect::RetryScan => self.retry_scan(),
            Effect::Connect(target) => self.connect(target).await,
            Effect::Abandon => self.cancel_connect(),
        }
    }

    async fn scan(&self) {
        info!("Scanning for {:?}", self.shared.config.target.name_prefix);

        let result = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return,
            result = self.shared.radio.scan() => result,
        };

        let input = match result {
            Ok(()) => Input::ScanStarted,
            Err(e) if e.is_recoverable() => {
                warn!("Scan failed: {}", e);
                Input::ScanFailed
            }
            Err(e) => {
                error!("Scan refused: {}", e);
                Input::Denied(e.watcher_error().unwrap_or(WatcherError::Unsupported))
            }
        };
        self.sink.internal(input);
    }

    fn retry_scan(&self) {
        let delay = self.shared.config.scan_retry_delay();
        let cancel = self.cancel.clone();
        let sink = self.sink.clone();

        debug!("Retrying scan in {}ms", delay.as_millis());
        tokio::spawn(async move {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {}
                () = sleep(delay) => {
                    sink.internal(Input::RadioReady);
                }
            }
        });
    }

    async fn connect(&mut self, target: Target) {
        if let Err(e) = self.shared.radio.stop_scan().await {
            warn!("Failed to stop scan before connecting: {}", e);
        }

        self.cancel_connect();
        let cancel = self.cancel.child_token();
        self.pending_connect = Some(cancel.clone());

        let shared = self.shared.clone();
        let sink = self.sink.clone();
        info!("Connecting to {}", target);

        tokio::spawn(async move {
            let attempt = async {
                match shared.config.connect_timeout() {
                    Some(limit) => timeout(limit, shared.radio.connect(&target))
                        .await
                        .unwrap_or_else(|_| {
                            Err(LeashError::Timeout {
                                timeout_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                            })
                        }),
                    None => shared.radio.connect(&target).await,
                }
            };

            let result = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    debug!("Connection attempt to {} cancelled", target);
                    return;
                }
                result = attempt => result,
            };

            let input = match result {
                Ok(()) => Input::LinkEstablished,
                Err(e) if e.is_connection_error() => {
                    warn!("Connection to {} failed: {}", target, e);
                    Input::ConnectFailed
                }
                Err(e) if e.is_recoverable() => {
                    warn!("Unexpected error connecting to {}: {}", target, e);
                    Input::ConnectFailed
                }
                Err(e) => {
                    error!("Connection to {} refused: {}", target, e);
                    Input::Denied(e.watcher_error().unwrap_or(WatcherError::Unsupported))
                }
            };
            sink.internal(input);
        });
    }

    fn cancel_connect(&mut self) {
        if let Some(pending) = self.pending_connect.take() {
            pending.cancel();
        }
    }
}

impl<R: Radio> ProximityWatcher<R> {
    /// Create a watcher driving `radio`, with no subscriber
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    #[must_use]
    pub fn new(radio: R, config: WatcherConfig) -> Self {
        Self::build(radio, config, None)
    }

    /// Create a watcher driving `radio` that reports to `subscriber`
    ///
    /// Only a weak reference to the subscriber is kept.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    #[must_use]
    pub fn with_subscriber<S: Subscriber>(radio: R, config: WatcherConfig, subscriber: &Arc<S>) -> Self {
        let subscriber: Weak<dyn Subscriber> = Arc::<S>::downgrade(subscriber);
        Self::build(radio, config, Some(subscriber))
    }

    fn build(radio: R, config: WatcherConfig, subscriber: Option<Weak<dyn Subscriber>>) -> Self {
        Self {
            shared: Arc::new(Shared {
                radio,
                config,
                core: RwLock::new(Core::default()),
                lifecycle: Mutex::new(()),
                dispatcher: Dispatcher::spawn(subscriber),
            }),
            shutdown: CancellationToken::new(),
        }
    }

    /// Activate the radio and start watching
    ///
    /// Does nothing unless the watcher is `Off` or `Idle`. From `Off`, the
    /// watcher moves to `Unknown` and activates the radio in the background;
    /// from `Idle` it asks the radio to scan again.
    pub async fn start(&self) {
        let _lifecycle = self.shared.lifecycle.lock().await;
        let mut core = self.shared.core.write().await;

        match core.state {
            WatcherState::Off => {
                // The radio must be released before it is activated again.
                if let Some(retiring) = core.retiring.take() {
                    debug!("Waiting for the previous session to release the radio");
                    if let Err(e) = retiring.await {
                        error!("Retiring session driver failed: {}", e);
                    }
                }

                if core
                    .apply(Input::Start, &self.shared.config, &self.shared.dispatcher)
                    .is_none()
                {
                    return;
                }

                core.epoch += 1;
                let epoch = core.epoch;
                let (sender, receiver) = mpsc::unbounded_channel();
                let events = EventSink::new(sender);
                let cancel = self.shutdown.child_token();

                let driver = Driver {
                    shared: self.shared.clone(),
                    epoch,
                    sink: events.clone(),
                    cancel: cancel.clone(),
                    pending_connect: None,
                };
                let driver = tokio::spawn(driver.run(receiver));

                core.session = Some(Session {
                    epoch,
                    cancel,
                    events,
                    driver,
                });
            }
            WatcherState::Idle => {
                if let Some(session) = &core.session {
                    session.events.internal(Input::Start);
                }
            }
            state if state.is_active() => debug!("start() ignored, already {}", state),
            state => debug!("start() ignored while {}, stop() first", state),
        }
    }

    /// Deactivate the radio and settle in `Off`
    ///
    /// Cancels any scan or connection attempt in flight. Calling `stop()`
    /// while already `Off` does nothing.
    ///
    /// # Errors
    ///
    /// Returns the radio's error if deactivation fails. The watcher is `Off`
    /// regardless.
    pub async fn stop(&self) -> Result<()> {
        // A concurrent start() must not activate the radio before it is released.
        let _lifecycle = self.shared.lifecycle.lock().await;
        let (session, retiring) = {
            let mut core = self.shared.core.write().await;
            let _ = core.apply(Input::Stop, &self.shared.config, &self.shared.dispatcher);
            (core.session.take(), core.retiring.take())
        };

        if let Some(retiring) = retiring {
            if let Err(e) = retiring.await {
                error!("Retiring session driver failed: {}", e);
            }
        }

        let Some(session) = session else {
            return Ok(());
        };

        session.cancel.cancel();
        if let Err(e) = session.driver.await {
            error!("Session {} driver failed: {}", session.epoch, e);
        }

        self.shared.deactivate().await
    }

    /// Current state
    pub async fn state(&self) -> WatcherState {
        self.shared.core.read().await.state
    }

    /// Current error, `Okay` unless the state is `Error`
    pub async fn error(&self) -> WatcherError {
        self.shared.core.read().await.error
    }

    /// Latest signal strength, `None` unless the state is `Connected`
    pub async fn signal_strength(&self) -> Option<Rssi> {
        self.shared.core.read().await.signal_strength
    }

    /// State, error and signal strength from the same transition
    pub async fn snapshot(&self) -> WatcherSnapshot {
        let core = self.shared.core.read().await;
        WatcherSnapshot {
            state: core.state,
            error: core.error,
            signal_strength: core.signal_strength,
        }
    }

    /// The wearable being connected to or linked with
    pub async fn target(&self) -> Option<Target> {
        self.shared.core.read().await.target.clone()
    }

    /// Register `subscriber`, detaching the previous one
    ///
    /// Only a weak reference is kept; once the subscriber is dropped, events
    /// are discarded.
    pub async fn set_subscriber<S: Subscriber>(&self, subscriber: &Arc<S>) {
        let subscriber: Weak<dyn Subscriber> = Arc::<S>::downgrade(subscriber);
        self.shared.dispatcher.replace(Some(subscriber)).await;
    }

    /// Detach the current subscriber
    pub async fn clear_subscriber(&self) {
        self.shared.dispatcher.replace(None).await;
    }

    /// The radio this watcher drives
    #[must_use]
    pub fn radio(&self) -> &R {
        &self.shared.radio
    }

    /// The watcher configuration
    #[must_use]
    pub fn config(&self) -> &WatcherConfig {
        &self.shared.config
    }
}

impl ProximityWatcher<BtleplugRadio> {
    /// Create a watcher on the system Bluetooth stack
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    #[must_use]
    pub fn with_bluetooth(config: WatcherConfig) -> Self {
        Self::new(BtleplugRadio::new(), config)
    }
}

impl<R: Radio> Drop for ProximityWatcher<R> {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.shared.dispatcher.close();

        let shared = self.shared.clone();
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                let session = shared.core.write().await.session.take();
                if session.is_some() {
                    let _ = shared.deactivate().await;
                }
            });
        }
    }
}
