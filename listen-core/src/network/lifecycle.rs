//! Connection lifecycle of a single peer connection

use super::transport::TransportState;

/// `Fresh -> Connecting -> Connected -> {Disconnected | Failed | Closed}`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Fresh,
    Connecting,
    Connected,
    /// May recover on its own
    Disconnected,
    /// ICE failed; restarted once per drop
    Failed,
    Closed,
}

/// What the owner should do after a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEffect {
    None,
    Connected,
    Reconnected,
    RestartIce,
    Closed,
}

#[derive(Debug, Clone)]
pub struct Lifecycle {
    phase: ConnectionPhase,
    has_been_connected: bool,
    /// An ICE restart was requested since the last time we were connected
    restart_attempted: bool,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            phase: ConnectionPhase::Fresh,
            has_been_connected: false,
            restart_attempted: false,
        }
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.phase
    }

    pub fn is_closed(&self) -> bool {
        self.phase == ConnectionPhase::Closed
    }

    /// Feed a transport state change
    pub fn on_transport_state(&mut self, state: TransportState) -> LifecycleEffect {
        if self.is_closed() {
            return LifecycleEffect::None;
        }

        let next = match state {
            TransportState::New => return LifecycleEffect::None,
            TransportState::Connecting => ConnectionPhase::Connecting,
            TransportState::Connected => ConnectionPhase::Connected,
            TransportState::Disconnected => ConnectionPhase::Disconnected,
            TransportState::Failed => ConnectionPhase::Failed,
            TransportState::Closed => ConnectionPhase::Closed,
        };
        if next == self.phase {
            return LifecycleEffect::None;
        }
        self.phase = next;

        match next {
            ConnectionPhase::Connected => {
                self.restart_attempted = false;
                if self.has_been_connected {
                    LifecycleEffect::Reconnected
                } else {
                    self.has_been_connected = true;
                    LifecycleEffect::Connected
                }
            }
            ConnectionPhase::Failed if self.restart_attempted => LifecycleEffect::None,
            ConnectionPhase::Failed => {
                self.restart_attempted = true;
                LifecycleEffect::RestartIce
            }
            ConnectionPhase::Closed => LifecycleEffect::Closed,
            _ => LifecycleEffect::None,
        }
    }

    /// Close locally. Returns true the first time only.
    pub fn close(&mut self) -> bool {
        if self.is_closed() {
            return false;
        }
        self.phase = ConnectionPhase::Closed;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_connect_then_reconnect() {
        let mut l = Lifecycle::new();
        assert_eq!(l.on_transport_state(TransportState::New), LifecycleEffect::None);
        assert_eq!(l.on_transport_state(TransportState::Connecting), LifecycleEffect::None);
        assert_eq!(l.on_transport_state(TransportState::Connected), LifecycleEffect::Connected);
        assert_eq!(l.on_transport_state(TransportState::Connected), LifecycleEffect::None);
        assert_eq!(l.on_transport_state(TransportState::Disconnected), LifecycleEffect::None);
        assert_eq!(l.phase(), ConnectionPhase::Disconnected);
        assert_eq!(l.on_transport_state(TransportState::Connected), LifecycleEffect::Reconnected);
    }

    #[test]
    fn test_failure_requests_ice_restart_once() {
        let mut l = Lifecycle::new();
        l.on_transport_state(TransportState::Connected);
        assert_eq!(l.on_transport_state(TransportState::Failed), LifecycleEffect::RestartIce);
        assert_eq!(l.on_transport_state(TransportState::Failed), LifecycleEffect::None);
        assert_eq!(l.on_transport_state(TransportState::Connected), LifecycleEffect::Reconnected);
    }

    #[test]
    fn test_failed_restart_is_not_repeated() {
        let mut l = Lifecycle::new();
        l.on_transport_state(TransportState::Connected);
        assert_eq!(l.on_transport_state(TransportState::Failed), LifecycleEffect::RestartIce);
        assert_eq!(l.on_transport_state(TransportState::Connecting), LifecycleEffect::None);
        assert_eq!(l.on_transport_state(TransportState::Failed), LifecycleEffect::None);
        assert_eq!(l.phase(), ConnectionPhase::Failed);

        // Recovering earns another restart
        assert_eq!(l.on_transport_state(TransportState::Connected), LifecycleEffect::Reconnected);
        assert_eq!(l.on_transport_state(TransportState::Failed), LifecycleEffect::RestartIce);
    }

    #[test]
    fn test_closed_is_terminal() {
        let mut l = Lifecycle::new();
        assert_eq!(l.on_transport_state(TransportState::Closed), LifecycleEffect::Closed);
        assert_eq!(l.on_transport_state(TransportState::Connected), LifecycleEffect::None);
        assert!(!l.close());

        let mut l = Lifecycle::new();
        assert!(l.close());
        assert!(!l.close());
        assert_eq!(l.on_transport_state(TransportState::Closed), LifecycleEffect::None);
    }
}
