//! Explicit connection state machine.
//!
//! Every state change a connection makes goes through
//! [`ConnectionState::on`], so an input that makes no sense in the current
//! state (a frame while `Idle`, a second open while `Open`) is reported as
//! an [`IllegalTransition`] instead of silently bending the state.

use serde::Serialize;
use thiserror::Error;

/// Lifecycle state of one transport connection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Not connected and not trying to be
    #[default]
    Idle,
    /// A transport is being constructed
    Connecting,
    /// Transport open, frames flowing
    Open,
    /// Transport lost, waiting for the next attempt
    Reconnecting,
    /// Reconnect attempts exhausted; terminal until a manual reconnect
    Fallback,
}

/// Inputs that drive [`ConnectionState`] transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Start constructing a transport
    Connect,
    /// Transport finished opening
    TransportOpened,
    /// A frame arrived
    FrameReceived,
    /// Transport closed, errored, failed to construct, or missed a pong
    TransportLost,
    /// The reconnect policy refused another attempt
    RetriesExhausted,
    /// Owner tore the connection down
    Close,
}

/// An input that is not valid in the current state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("illegal transition: {signal:?} while {from:?}")]
pub struct IllegalTransition {
    pub from: ConnectionState,
    pub signal: Signal,
}

impl ConnectionState {
    /// Transition function.
    ///
    /// ```text
    /// Idle | Reconnecting | Fallback --Connect--> Connecting
    /// Connecting --TransportOpened--> Open
    /// Open --FrameReceived--> Open
    /// Connecting | Open --TransportLost--> Reconnecting
    /// Reconnecting --RetriesExhausted--> Fallback
    /// any --Close--> Idle
    /// ```
    pub fn on(self, signal: Signal) -> Result<ConnectionState, IllegalTransition> {
        use ConnectionState::*;

        let next = match (self, signal) {
            (_, Signal::Close) => Idle,
            (Idle | Reconnecting | Fallback, Signal::Connect) => Connecting,
            (Connecting, Signal::TransportOpened) => Open,
            (Open, Signal::FrameReceived) => Open,
            (Connecting | Open, Signal::TransportLost) => Reconnecting,
            (Reconnecting, Signal::RetriesExhausted) => Fallback,
            (from, signal) => return Err(IllegalTransition { from, signal }),
        };
        Ok(next)
    }

    /// Whether frames can be sent right now
    pub fn is_open(self) -> bool {
        self == ConnectionState::Open
    }

    /// Coarse status shown to users and used to decide on polling
    pub fn connectivity(self) -> ConnectivityStatus {
        match self {
            ConnectionState::Idle | ConnectionState::Connecting => ConnectivityStatus::Connecting,
            ConnectionState::Open => ConnectivityStatus::Connected,
            ConnectionState::Reconnecting => ConnectivityStatus::Reconnecting,
            ConnectionState::Fallback => ConnectivityStatus::Polling,
        }
    }
}

/// Connectivity as exposed to UI callers.
///
/// `Polling` means push delivery gave up and the caller should pull
/// periodically instead; this crate does not poll on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectivityStatus {
    Connecting,
    Connected,
    Reconnecting,
    Polling,
}

impl ConnectivityStatus {
    /// Whether the periodic-pull fallback should be running
    pub fn should_poll(self) -> bool {
        self == ConnectivityStatus::Polling
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionState::*;

    #[test]
    fn test_happy_path() {
        let state = Idle.on(Signal::Connect).unwrap();
        assert_eq!(state, Connecting);
        let state = state.on(Signal::TransportOpened).unwrap();
        assert_eq!(state, Open);
        assert_eq!(state.on(Signal::FrameReceived).unwrap(), Open);
    }

    #[test]
    fn test_reconnect_loop_and_fallback() {
        let state = Open.on(Signal::TransportLost).unwrap();
        assert_eq!(state, Reconnecting);
        assert_eq!(state.on(Signal::Connect).unwrap(), Connecting);
        assert_eq!(Connecting.on(Signal::TransportLost).unwrap(), Reconnecting);

        let state = Reconnecting.on(Signal::RetriesExhausted).unwrap();
        assert_eq!(state, Fallback);
        assert_eq!(state.on(Signal::Connect).unwrap(), Connecting);
    }

    #[test]
    fn test_close_from_any_state() {
        for state in [Idle, Connecting, Open, Reconnecting, Fallback] {
            assert_eq!(state.on(Signal::Close).unwrap(), Idle);
        }
    }

    #[test]
    fn test_illegal_transitions_detected() {
        let err = Idle.on(Signal::FrameReceived).unwrap_err();
        assert_eq!(err.from, Idle);
        assert_eq!(err.signal, Signal::FrameReceived);

        assert!(Open.on(Signal::Connect).is_err());
        assert!(Fallback.on(Signal::TransportLost).is_err());
        assert!(Idle.on(Signal::RetriesExhausted).is_err());
        assert!(Reconnecting.on(Signal::TransportOpened).is_err());
    }

    #[test]
    fn test_connectivity_mapping() {
        assert_eq!(Idle.connectivity(), ConnectivityStatus::Connecting);
        assert_eq!(Open.connectivity(), ConnectivityStatus::Connected);
        assert_eq!(Reconnecting.connectivity(), ConnectivityStatus::Reconnecting);
        assert!(Fallback.connectivity().should_poll());
        assert!(!Open.connectivity().should_poll());
    }
}
