//! Reconnection policy for terminal clients.
//!
//! A pure state machine: feed it connection events, it answers with what to
//! do next. No timers or sockets live here, so any transport can drive it.

use std::time::Duration;

use cg_core::config::ReconnectConfig;

use crate::protocol::CloseKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl ReconnectPolicy {
    /// Backoff before retry number `attempt` (1-based): `base * 2^(attempt-1)`
    /// capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << shift)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectConfig::default().into()
    }
}

impl From<ReconnectConfig> for ReconnectPolicy {
    fn from(cfg: ReconnectConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts,
            base_delay: Duration::from_millis(cfg.base_delay_ms),
            max_delay: Duration::from_millis(cfg.max_delay_ms),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadReason {
    /// The server said the shell is gone.
    ShellGone,
    /// Transient failures used up every attempt.
    RetriesExhausted,
    /// Closed normally (superseded, or closed by us).
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Connecting,
    Connected,
    BackingOff { attempt: u32, delay: Duration },
    Dead(DeadReason),
}

/// What the driver should do after an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Nothing,
    /// Wait this long, then call [`Reconnector::retry`] and reconnect.
    RetryAfter(Duration),
    /// Stop reconnecting and ask the API for a fresh shell.
    RequestReplacement,
    /// Stop; nothing further to do.
    Stop,
}

#[derive(Debug, Clone)]
pub struct Reconnector {
    policy: ReconnectPolicy,
    state: ConnState,
    failures: u32,
}

impl Reconnector {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            state: ConnState::Connecting,
            failures: 0,
        }
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn is_dead(&self) -> bool {
        matches!(self.state, ConnState::Dead(_))
    }

    /// The socket opened. Resets the failure count.
    pub fn on_open(&mut self) {
        if !self.is_dead() {
            self.state = ConnState::Connected;
            self.failures = 0;
        }
    }

    /// The socket closed with `code`.
    pub fn on_close(&mut self, code: u16) -> Action {
        if self.is_dead() {
            return Action::Nothing;
        }
        match CloseKind::classify(code) {
            CloseKind::Gone => {
                self.state = ConnState::Dead(DeadReason::ShellGone);
                Action::RequestReplacement
            }
            CloseKind::Normal => {
                self.state = ConnState::Dead(DeadReason::Closed);
                Action::Stop
            }
            CloseKind::Transient => self.back_off(),
        }
    }

    /// The connection attempt failed before opening.
    pub fn on_connect_error(&mut self) -> Action {
        if self.is_dead() {
            return Action::Nothing;
        }
        self.back_off()
    }

    /// The backoff delay elapsed; move on to connecting. Returns false when
    /// there is nothing to retry.
    pub fn retry(&mut self) -> bool {
        match self.state {
            ConnState::BackingOff { .. } => {
                self.state = ConnState::Connecting;
                true
            }
            _ => false,
        }
    }

    fn back_off(&mut self) -> Action {
        self.failures += 1;
        if self.failures > self.policy.max_attempts {
            self.state = ConnState::Dead(DeadReason::RetriesExhausted);
            return Action::RequestReplacement;
        }
        let delay = self.policy.delay_for(self.failures);
        self.state = ConnState::BackingOff {
            attempt: self.failures,
            delay,
        };
        Action::RetryAfter(delay)
    }
}
