//! Connection lifecycle decisions, independent of any network client.
//!
//! The MQTT event loop reports what happened; the supervisor answers with
//! the next state and what to do about it.

use std::time::Duration;

use fieldlink_core::RetryPolicy;

use super::ConnectionState;

/// What the event loop should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorAction {
    /// Session is up: (re-)establish the sensor subscription.
    Subscribe,
    /// Session is down: wait this long, then poll again.
    Backoff(Duration),
    /// Leave the event loop.
    Stop,
}

/// Tracks session state and reconnect attempts.
#[derive(Debug, Clone)]
pub struct ConnectionSupervisor {
    state: ConnectionState,
    policy: RetryPolicy,
    /// Consecutive failed attempts since the last successful session
    attempt: u32,
    /// Sessions re-established after a loss
    reconnects: u64,
    ever_connected: bool,
}

impl ConnectionSupervisor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            state: ConnectionState::Connecting,
            policy,
            attempt: 0,
            reconnects: 0,
            ever_connected: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reconnects(&self) -> u64 {
        self.reconnects
    }

    /// The broker accepted a session.
    pub fn on_connected(&mut self) -> SupervisorAction {
        if self.state == ConnectionState::Disconnected {
            return SupervisorAction::Stop;
        }
        if self.ever_connected {
            self.reconnects += 1;
        }
        self.ever_connected = true;
        self.attempt = 0;
        self.state = ConnectionState::Connected;
        SupervisorAction::Subscribe
    }

    /// The session failed or could not be established.
    pub fn on_error(&mut self) -> SupervisorAction {
        if self.state == ConnectionState::Disconnected {
            return SupervisorAction::Stop;
        }
        self.attempt = self.attempt.saturating_add(1);
        if !self.policy.should_retry(self.attempt) {
            self.state = ConnectionState::Disconnected;
            return SupervisorAction::Stop;
        }
        self.state = if self.ever_connected {
            ConnectionState::Reconnecting
        } else {
            ConnectionState::Connecting
        };
        SupervisorAction::Backoff(self.policy.delay_for_attempt(self.attempt))
    }

    /// Shutdown was requested.
    pub fn on_shutdown(&mut self) -> SupervisorAction {
        self.state = ConnectionState::Disconnected;
        SupervisorAction::Stop
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldlink_core::Jitter;

    fn policy() -> RetryPolicy {
        RetryPolicy::exponential(u32::MAX, Duration::from_secs(1), Duration::from_secs(30))
            .with_jitter(Jitter::None)
    }

    #[test]
    fn test_initial_failures_stay_connecting() {
        let mut sup = ConnectionSupervisor::new(policy());
        assert_eq!(sup.state(), ConnectionState::Connecting);
        assert_eq!(sup.on_error(), SupervisorAction::Backoff(Duration::from_secs(1)));
        assert_eq!(sup.on_error(), SupervisorAction::Backoff(Duration::from_secs(2)));
        assert_eq!(sup.state(), ConnectionState::Connecting);
        assert_eq!(sup.reconnects(), 0);
    }

    #[test]
    fn test_loss_then_recovery_resubscribes() {
        let mut sup = ConnectionSupervisor::new(policy());
        assert_eq!(sup.on_connected(), SupervisorAction::Subscribe);
        assert_eq!(sup.state(), ConnectionState::Connected);

        assert_eq!(sup.on_error(), SupervisorAction::Backoff(Duration::from_secs(1)));
        assert_eq!(sup.state(), ConnectionState::Reconnecting);
        assert_eq!(sup.on_error(), SupervisorAction::Backoff(Duration::from_secs(2)));
        assert_eq!(sup.on_error(), SupervisorAction::Backoff(Duration::from_secs(4)));

        // Every new session gets the subscription back
        assert_eq!(sup.on_connected(), SupervisorAction::Subscribe);
        assert_eq!(sup.state(), ConnectionState::Connected);
        assert_eq!(sup.reconnects(), 1);
        assert_eq!(sup.attempt(), 0);

        // Backoff restarts from the base after a successful session
        assert_eq!(sup.on_error(), SupervisorAction::Backoff(Duration::from_secs(1)));
    }

    #[test]
    fn test_backoff_is_capped() {
        let mut sup = ConnectionSupervisor::new(policy());
        sup.on_connected();
        let mut last = SupervisorAction::Stop;
        for _ in 0..20 {
            last = sup.on_error();
        }
        assert_eq!(last, SupervisorAction::Backoff(Duration::from_secs(30)));
    }

    #[test]
    fn test_bounded_policy_gives_up() {
        let bounded = RetryPolicy::exponential(2, Duration::from_millis(10), Duration::from_millis(10))
            .with_jitter(Jitter::None);
        let mut sup = ConnectionSupervisor::new(bounded);
        assert!(matches!(sup.on_error(), SupervisorAction::Backoff(_)));
        assert_eq!(sup.on_error(), SupervisorAction::Stop);
        assert_eq!(sup.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_shutdown_is_terminal() {
        let mut sup = ConnectionSupervisor::new(policy());
        sup.on_connected();
        assert_eq!(sup.on_shutdown(), SupervisorAction::Stop);
        assert_eq!(sup.on_error(), SupervisorAction::Stop);
        assert_eq!(sup.on_connected(), SupervisorAction::Stop);
        assert_eq!(sup.state(), ConnectionState::Disconnected);
    }
}
