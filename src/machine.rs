//! The watcher's transition function.
//!
//! [`step`] maps the current [`WatcherState`] and one [`Input`] to the next
//! state, the error that accompanies it, and the radio [`Effect`] the watcher
//! must carry out. It has no side effects; the watcher serializes calls to it
//! and executes the effects.
//!
//! ```text
//! Off --start--> Unknown
//! Unknown --radio ready--> Idle --scan started--> Searching
//! Unknown --unauthorized/unsupported--> Error
//! Searching --target found--> Connecting --link established--> Connected
//! Connecting --failure/timeout--> Searching
//! Connected --link lost--> Searching
//! any --stop--> Off
//! ```

use crate::types::{RevocationPolicy, Target, WatcherError, WatcherState};

/// Something that can move the watcher between states
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    /// `start()` was called
    Start,
    /// `stop()` was called
    Stop,
    /// The radio is powered on and usable
    RadioReady,
    /// The radio is powered off
    RadioPoweredOff,
    /// The radio refused the session
    Denied(WatcherError),
    /// A scan request succeeded
    ScanStarted,
    /// A scan request failed for a transient reason
    ScanFailed,
    /// A matching wearable was discovered
    TargetFound(Target),
    /// The link to the wearable is up
    LinkEstablished,
    /// Connecting failed or timed out
    ConnectFailed,
    /// The link to the wearable went down
    LinkLost,
}

/// Radio work required by a transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Nothing to do
    None,
    /// Request radio activation
    Activate,
    /// Request radio deactivation, cancelling any scan or connection attempt
    Deactivate,
    /// Start scanning for the wearable
    Scan,
    /// Retry scanning after the configured delay
    RetryScan,
    /// Stop scanning and connect to the target
    Connect(Target),
    /// Drop any pending connection attempt and forget the target
    Abandon,
}

/// Result of applying one input
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    /// State after the input
    pub state: WatcherState,
    /// Error after the input, `Okay` unless `state` is `Error`
    pub error: WatcherError,
    /// Radio work to carry out
    pub effect: Effect,
}

impl Transition {
    const fn to(state: WatcherState, effect: Effect) -> Self {
        Self {
            state,
            error: WatcherError::Okay,
            effect,
        }
    }

    const fn failed(error: WatcherError) -> Self {
        Self {
            state: WatcherState::Error,
            error,
            effect: Effect::Deactivate,
        }
    }
}

/// Apply `input` to `state`
///
/// Returns `None` when the input has no meaning in the current state; such
/// inputs are dropped without notifying anyone. `Denied(Okay)` is never a
/// valid denial and is ignored.
#[must_use]
pub fn step(state: WatcherState, input: Input, policy: RevocationPolicy) -> Option<Transition> {
    use WatcherState::{Connected, Connecting, Idle, Off, Searching, Unknown};

    match (state, input) {
        (Off, Input::Stop) => None,
        (_, Input::Stop) => Some(Transition::to(Off, Effect::Deactivate)),

        (Off, Input::Start) => Some(Transition::to(Unknown, Effect::Activate)),
        (Idle, Input::Start | Input::RadioReady) => Some(Transition::to(Idle, Effect::Scan)),
        (Unknown, Input::RadioReady) => Some(Transition::to(Idle, Effect::Scan)),

        (_, Input::Denied(WatcherError::Okay)) => None,
        (Unknown, Input::Denied(error)) => Some(Transition::failed(error)),
        (Idle | Searching | Connecting | Connected, Input::Denied(error)) => match policy {
            RevocationPolicy::Error => Some(Transition::failed(error)),
            RevocationPolicy::Shutdown => Some(Transition::to(Off, Effect::Deactivate)),
        },

        (Unknown, Input::RadioPoweredOff) => Some(Transition::to(Idle, Effect::None)),
        (Searching | Connecting | Connected, Input::RadioPoweredOff) => {
            Some(Transition::to(Idle, Effect::Abandon))
        }

        (Idle, Input::ScanStarted) => Some(Transition::to(Searching, Effect::None)),
        (Idle | Searching, Input::ScanFailed) => Some(Transition::to(Idle, Effect::RetryScan)),

        (Searching, Input::TargetFound(target)) => {
            Some(Transition::to(Connecting, Effect::Connect(target)))
        }
        (Connecting, Input::LinkEstablished) => Some(Transition::to(Connected, Effect::None)),
        (Connecting, Input::ConnectFailed | Input::LinkLost) | (Connected, Input::LinkLost) => {
            Some(Transition::to(Searching, Effect::Scan))
        }

        _ => None,
    }
}
