use std::time::Duration;

use switchboard_core::events::DisconnectReason;

/// What to do after a socket closes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Schedule exactly one reconnect attempt after `after`.
    Retry { after: Duration },
    /// Logged out; the session stays DISCONNECTED until recreated.
    Terminal,
}

/// Fixed-delay reconnect policy. No backoff curve and no retry cap: each
/// transient close schedules one attempt, and a failed attempt lands the
/// session in ERROR.
#[derive(Clone, Copy, Debug)]
pub struct ReconnectPolicy {
    delay: Duration,
}

impl ReconnectPolicy {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn on_close(&self, reason: DisconnectReason) -> ReconnectDecision {
        if reason.is_logged_out() {
            ReconnectDecision::Terminal
        } else {
            ReconnectDecision::Retry { after: self.delay }
        }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}
