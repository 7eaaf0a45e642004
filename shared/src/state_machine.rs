//! Link State Machine
//!
//! Defines the valid connection state transitions of a delivery channel.

use std::fmt;

/// Lifecycle state of the physical link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No session; re-enterable at any time
    #[default]
    Disconnected,
    /// A single explicit connect attempt is in flight
    Connecting,
    /// A session is live and writes go to the transport
    Connected,
    /// The link was lost (or never came up) and backoff retries are running
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Reconnecting => write!(f, "reconnecting"),
        }
    }
}

/// Events that can trigger state transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    /// Caller asked for a single connect attempt
    ConnectRequested,
    /// Retry loop started, either at startup or after losing the link
    ReconnectRequested,
    /// Transport connect succeeded
    Established,
    /// Transport connect failed
    AttemptFailed,
    /// Live session failed and no reconnection is wanted
    Lost,
    /// Caller closed the channel
    Closed,
}

/// Result of a state transition attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionResult {
    /// Transition was valid and state changed (or stayed, if the table says so)
    Success(ConnectionState),
    /// Transition was invalid from current state
    Invalid { from: ConnectionState, event: LinkEvent },
}

/// State machine for one connection manager
#[derive(Debug, Default)]
pub struct LinkStateMachine {
    current_state: ConnectionState,
}

impl LinkStateMachine {
    /// Create a new state machine in Disconnected state
    pub fn new() -> Self {
        Self::default()
    }

    /// Get current state
    pub fn state(&self) -> ConnectionState {
        self.current_state
    }

    /// Process an event and return the transition result
    pub fn process_event(&mut self, event: LinkEvent) -> TransitionResult {
        match self.get_next_state(event) {
            Some(state) => {
                self.current_state = state;
                TransitionResult::Success(state)
            }
            None => TransitionResult::Invalid {
                from: self.current_state,
                event,
            },
        }
    }

    /// Get the next state for a given event, if the transition is valid
    fn get_next_state(&self, event: LinkEvent) -> Option<ConnectionState> {
        use ConnectionState::*;
        use LinkEvent::*;

        match (self.current_state, event) {
            // Close always wins
            (_, Closed) => Some(Disconnected),

            // From Disconnected
            (Disconnected, ConnectRequested) => Some(Connecting),
            (Disconnected, ReconnectRequested) => Some(Reconnecting),

            // From Connecting
            (Connecting, Established) => Some(Connected),
            (Connecting, AttemptFailed) => Some(Disconnected),

            // From Reconnecting
            (Reconnecting, Established) => Some(Connected),
            (Reconnecting, AttemptFailed) => Some(Reconnecting),

            // From Connected
            (Connected, Lost) => Some(Disconnected),
            (Connected, ReconnectRequested) => Some(Reconnecting),

            _ => None,
        }
    }
}

/// Check if a transition from one state to another is generally valid
pub fn is_valid_transition(from: ConnectionState, to: ConnectionState) -> bool {
    use ConnectionState::*;

    match (from, to) {
        (a, b) if a == b => true,

        // Disconnected can be reached from anywhere
        (_, Disconnected) => true,

        (Disconnected, Connecting | Reconnecting) => true,
        (Connecting | Reconnecting, Connected) => true,
        (Connected, Reconnecting) => true,

        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let fsm = LinkStateMachine::new();
        assert_eq!(fsm.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_explicit_connect_flow() {
        let mut fsm = LinkStateMachine::new();

        let result = fsm.process_event(LinkEvent::ConnectRequested);
        assert_eq!(result, TransitionResult::Success(ConnectionState::Connecting));

        let result = fsm.process_event(LinkEvent::Established);
        assert_eq!(result, TransitionResult::Success(ConnectionState::Connected));

        let result = fsm.process_event(LinkEvent::Lost);
        assert_eq!(result, TransitionResult::Success(ConnectionState::Disconnected));
    }

    #[test]
    fn test_failed_connect_returns_to_disconnected() {
        let mut fsm = LinkStateMachine::new();
        fsm.process_event(LinkEvent::ConnectRequested);

        let result = fsm.process_event(LinkEvent::AttemptFailed);
        assert_eq!(result, TransitionResult::Success(ConnectionState::Disconnected));
    }

    #[test]
    fn test_reconnect_flow() {
        let mut fsm = LinkStateMachine::new();
        fsm.process_event(LinkEvent::ConnectRequested);
        fsm.process_event(LinkEvent::Established);

        let result = fsm.process_event(LinkEvent::ReconnectRequested);
        assert_eq!(result, TransitionResult::Success(ConnectionState::Reconnecting));

        // Failed attempts keep retrying
        let result = fsm.process_event(LinkEvent::AttemptFailed);
        assert_eq!(result, TransitionResult::Success(ConnectionState::Reconnecting));

        let result = fsm.process_event(LinkEvent::Established);
        assert_eq!(result, TransitionResult::Success(ConnectionState::Connected));
    }

    #[test]
    fn test_connect_rejected_while_busy() {
        let mut fsm = LinkStateMachine::new();
        fsm.process_event(LinkEvent::ConnectRequested);

        let result = fsm.process_event(LinkEvent::ConnectRequested);
        assert_eq!(
            result,
            TransitionResult::Invalid {
                from: ConnectionState::Connecting,
                event: LinkEvent::ConnectRequested,
            }
        );
        assert_eq!(fsm.state(), ConnectionState::Connecting);
    }

    #[test]
    fn test_close_from_any_state() {
        for event in [
            LinkEvent::ConnectRequested,
            LinkEvent::ReconnectRequested,
        ] {
            let mut fsm = LinkStateMachine::new();
            fsm.process_event(event);
            assert_eq!(
                fsm.process_event(LinkEvent::Closed),
                TransitionResult::Success(ConnectionState::Disconnected)
            );
        }
    }

    #[test]
    fn test_is_valid_transition() {
        use ConnectionState::*;

        assert!(is_valid_transition(Disconnected, Connecting));
        assert!(is_valid_transition(Reconnecting, Connected));
        assert!(is_valid_transition(Connected, Disconnected));
        assert!(!is_valid_transition(Disconnected, Connected));
        assert!(!is_valid_transition(Connecting, Reconnecting));
    }
}
