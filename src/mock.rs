//! In-memory radio for tests.
//!
//! [`MockRadio`] records every request the watcher makes and lets a test
//! script the radio's answers and inject [`RadioEvent`]s.

use async_trait::async_trait;
use btleplug::api::BDAddr;
use std::{sync::Arc, time::Duration};
use tokio::{sync::Mutex, time::sleep};

use crate::{
    error::{LeashError, Result},
    radio::{EventSink, Radio, RadioEvent},
    types::{Target, WatcherConfig},
};

/// How the mock answers an activation request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    /// Succeed and report the radio ready
    Ready,
    /// Succeed and report the radio powered off
    PoweredOff,
    /// Succeed without reporting anything
    Silent,
    /// Fail as unauthorized
    Unauthorized,
    /// Fail as unsupported
    Unsupported,
}

/// How the mock answers a connection request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connect {
    /// Establish the link
    Succeed,
    /// Fail the attempt
    Fail,
    /// Never resolve
    Hang,
}

/// A request the watcher made
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioCall {
    /// `request_activation`
    Activate,
    /// `request_deactivation`
    Deactivate,
    /// `scan`
    Scan,
    /// `stop_scan`
    StopScan,
    /// `connect`
    Connect(BDAddr),
}

#[derive(Debug)]
struct MockState {
    activation: Activation,
    connect: Connect,
    scan_failures: u32,
    deactivation_delay: Duration,
    active: bool,
    sink: Option<EventSink>,
    calls: Vec<RadioCall>,
}

/// Scriptable radio; clones share the same state
#[derive(Debug, Clone)]
pub struct MockRadio {
    state: Arc<Mutex<MockState>>,
}

impl MockRadio {
    /// Radio that becomes ready on activation and accepts connections
    #[must_use]
    pub fn new() -> Self {
        Self::scripted(Activation::Ready, Connect::Succeed)
    }

    /// Radio answering activation and connection requests as given
    #[must_use]
    pub fn scripted(activation: Activation, connect: Connect) -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                activation,
                connect,
                scan_failures: 0,
                deactivation_delay: Duration::ZERO,
                active: false,
                sink: None,
                calls: Vec::new(),
            })),
        }
    }

    /// Fail the next `count` scan requests with a transient error
    pub async fn fail_scans(&self, count: u32) {
        self.state.lock().await.scan_failures = count;
    }

    /// Change how later connection requests are answered
    pub async fn set_connect(&self, connect: Connect) {
        self.state.lock().await.connect = connect;
    }

    /// Make deactivation requests take `delay` before the radio goes idle
    pub async fn set_deactivation_delay(&self, delay: Duration) {
        self.state.lock().await.deactivation_delay = delay;
    }

    /// Whether the radio is activated and not yet deactivated
    pub async fn is_active(&self) -> bool {
        self.state.lock().await.active
    }

    /// Inject an event into the current session
    ///
    /// Returns `false` if there is no session or it has ended.
    pub async fn emit(&self, event: RadioEvent) -> bool {
        self.state
            .lock()
            .await
            .sink
            .as_ref()
            .is_some_and(|sink| sink.emit(event))
    }

    /// The sink of the latest activation
    pub async fn sink(&self) -> Option<EventSink> {
        self.state.lock().await.sink.clone()
    }

    /// Every request made so far
    pub async fn calls(&self) -> Vec<RadioCall> {
        self.state.lock().await.calls.clone()
    }

    /// Number of requests equal to `call`
    pub async fn count(&self, call: RadioCall) -> usize {
        self.state
            .lock()
            .await
            .calls
            .iter()
            .filter(|c| **c == call)
            .count()
    }
}

impl Default for MockRadio {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Radio for MockRadio {
    async fn request_activation(&self, events: EventSink, _config: &WatcherConfig) -> Result<()> {
        let mut state = self.state.lock().await;
        state.calls.push(RadioCall::Activate);
        state.sink = Some(events.clone());
        state.active = matches!(
            state.activation,
            Activation::Ready | Activation::PoweredOff | Activation::Silent
        );

        match state.activation {
            Activation::Ready => {
                events.emit(RadioEvent::Ready);
                Ok(())
            }
            Activation::PoweredOff => {
                events.emit(RadioEvent::PoweredOff);
                Ok(())
            }
            Activation::Silent => Ok(()),
            Activation::Unauthorized => Err(LeashError::Unauthorized),
            Activation::Unsupported => Err(LeashError::Unsupported("mock radio".to_string())),
        }
    }

    async fn request_deactivation(&self) -> Result<()> {
        let delay = {
            let mut state = self.state.lock().await;
            state.calls.push(RadioCall::Deactivate);
            state.deactivation_delay
        };

        if !delay.is_zero() {
            sleep(delay).await;
        }
        self.state.lock().await.active = false;
        Ok(())
    }

    async fn scan(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        state.calls.push(RadioCall::Scan);
        if state.scan_failures > 0 {
            state.scan_failures -= 1;
            return Err(LeashError::Other("scan rejected".to_string()));
        }
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.state.lock().await.calls.push(RadioCall::StopScan);
        Ok(())
    }

    async fn connect(&self, target: &Target) -> Result<()> {
        let behavior = {
            let mut state = self.state.lock().await;
            state.calls.push(RadioCall::Connect(target.address));
            state.connect
        };

        match behavior {
            Connect::Succeed => Ok(()),
            Connect::Fail => Err(LeashError::ConnectionFailed(format!("{target} refused"))),
            Connect::Hang => std::future::pending().await,
        }
    }
}
