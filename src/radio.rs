use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::trace;

use crate::{
    error::Result,
    machine::Input,
    types::{Rssi, Target, WatcherConfig},
};

/// Asynchronous notifications from the radio stack
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioEvent {
    /// The radio is powered on and usable
    Ready,
    /// The radio is powered off
    PoweredOff,
    /// The application may not use the radio
    Unauthorized,
    /// The hardware cannot do Bluetooth Low Energy
    Unsupported,
    /// A wearable matching the active filter was discovered
    TargetFound(Target),
    /// The link to the wearable is up
    LinkEstablished,
    /// A connection attempt failed
    ConnectFailed,
    /// The link to the wearable went down
    LinkLost,
    /// A signal strength sample for the linked wearable
    SignalSample(Rssi),
}

impl RadioEvent {
    /// The state machine input this event carries, or the sample it holds
    pub(crate) fn into_input(self) -> std::result::Result<Input, Rssi> {
        use crate::types::WatcherError;

        Ok(match self {
            Self::Ready => Input::RadioReady,
            Self::PoweredOff => Input::RadioPoweredOff,
            Self::Unauthorized => Input::Denied(WatcherError::Unauthorized),
            Self::Unsupported => Input::Denied(WatcherError::Unsupported),
            Self::TargetFound(target) => Input::TargetFound(target),
            Self::LinkEstablished => Input::LinkEstablished,
            Self::ConnectFailed => Input::ConnectFailed,
            Self::LinkLost => Input::LinkLost,
            Self::SignalSample(rssi) => return Err(rssi),
        })
    }
}

/// Message on a session's event queue
#[derive(Debug)]
pub(crate) enum SessionEvent {
    /// Reported by the radio
    Radio(RadioEvent),
    /// Produced by the watcher itself
    Internal(Input),
}

/// Where a radio delivers its events during one activation
///
/// The sink stops accepting events once the session it belongs to has ended,
/// so a radio may keep a clone around without leaking events into a later
/// session.
#[derive(Debug, Clone)]
pub struct EventSink {
    sender: mpsc::UnboundedSender<SessionEvent>,
}

impl EventSink {
    pub(crate) const fn new(sender: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self { sender }
    }

    /// Create a sink together with the receiving end of its queue
    #[cfg(test)]
    pub(crate) fn channel() -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self::new(sender), receiver)
    }

    /// Deliver an event to the watcher
    ///
    /// Returns `false` if the session has ended and the event was dropped.
    pub fn emit(&self, event: RadioEvent) -> bool {
        trace!("Radio event: {:?}", event);
        self.sender.send(SessionEvent::Radio(event)).is_ok()
    }

    /// Check whether the session this sink belongs to has ended
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    pub(crate) fn internal(&self, input: Input) -> bool {
        self.sender.send(SessionEvent::Internal(input)).is_ok()
    }
}

/// The radio stack a watcher drives
///
/// Requests are issued by the watcher one at a time per session, except
/// [`Radio::request_deactivation`], which may race any other request and
/// must leave the radio idle regardless.
#[async_trait]
pub trait Radio: Send + Sync + 'static {
    /// Power up the radio and start reporting events to `events`
    ///
    /// Readiness is reported asynchronously with [`RadioEvent::Ready`] or
    /// [`RadioEvent::PoweredOff`]. An error that classifies as unauthorized
    /// or unsupported (see [`crate::LeashError::watcher_error`]) ends the
    /// session in the error state.
    async fn request_activation(&self, events: EventSink, config: &WatcherConfig) -> Result<()>;

    /// Stop scanning, drop any link and stop reporting events
    async fn request_deactivation(&self) -> Result<()>;

    /// Start scanning for wearables matching the configured filter
    async fn scan(&self) -> Result<()>;

    /// Stop scanning
    async fn stop_scan(&self) -> Result<()>;

    /// Connect to a discovered wearable
    ///
    /// Resolves once the link is established. While linked, the radio
    /// reports [`RadioEvent::SignalSample`] and eventually
    /// [`RadioEvent::LinkLost`].
    async fn connect(&self, target: &Target) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::WatcherError;

    #[test]
    fn test_event_to_input() {
        assert_eq!(RadioEvent::Ready.into_input(), Ok(Input::RadioReady));
        assert_eq!(
            RadioEvent::Unauthorized.into_input(),
            Ok(Input::Denied(WatcherError::Unauthorized))
        );
        assert_eq!(RadioEvent::SignalSample(Rssi(-70)).into_input(), Err(Rssi(-70)));
    }

    #[tokio::test]
    async fn test_sink_closes_with_session() {
        let (sink, mut receiver) = EventSink::channel();
        assert!(sink.emit(RadioEvent::Ready));
        assert!(matches!(
            receiver.recv().await,
            Some(SessionEvent::Radio(RadioEvent::Ready))
        ));

        drop(receiver);
        assert!(sink.is_closed());
        assert!(!sink.emit(RadioEvent::LinkLost));
    }
}
