//! ---
//! shdr_section: "04-agent-client"
//! shdr_subsection: "module"
//! shdr_type: "source"
//! shdr_scope: "code"
//! shdr_description: "Agent-side SHDR client and line routing."
//! shdr_version: "v0.0.0-prealpha"
//! shdr_owner: "tbd"
//! ---
use std::time::{Duration, Instant};

/// PING scheduling for one connection.
///
/// A PING is due once more than one heartbeat has passed since the last PONG,
/// and never more than once per heartbeat period. Missing PONGs only cause
/// re-pings; they never end the connection.
#[derive(Debug, Clone)]
pub struct HeartbeatState {
    heartbeat: Duration,
    last_pong: Instant,
    last_ping: Option<Instant>,
}

impl HeartbeatState {
    /// Start tracking at `now` with the configured default heartbeat.
    pub fn new(heartbeat: Duration, now: Instant) -> Self {
        Self {
            heartbeat,
            last_pong: now,
            last_ping: None,
        }
    }

    /// Current heartbeat period.
    pub fn heartbeat(&self) -> Duration {
        self.heartbeat
    }

    /// Record a PONG. A missing or unparseable period keeps the current one.
    /// Returns true when the period changed.
    pub fn on_pong(&mut self, heartbeat: Option<Duration>, now: Instant) -> bool {
        self.last_pong = now;
        match heartbeat {
            Some(heartbeat) if heartbeat != self.heartbeat => {
                self.heartbeat = heartbeat;
                true
            }
            _ => false,
        }
    }

    /// Record that a PING was written.
    pub fn on_ping_sent(&mut self, now: Instant) {
        self.last_ping = Some(now);
    }

    /// True when a PING should be written at `now`.
    pub fn should_ping(&self, now: Instant) -> bool {
        let silent = now.saturating_duration_since(self.last_pong) > self.heartbeat;
        let spaced = self
            .last_ping
            .map_or(true, |ping| now.saturating_duration_since(ping) >= self.heartbeat);
        silent && spaced
    }

    /// How long to wait before [`HeartbeatState::should_ping`] can next be true.
    pub fn time_until_ping(&self, now: Instant) -> Duration {
        if self.should_ping(now) {
            return Duration::ZERO;
        }
        let after_pong = self.last_pong + self.heartbeat + Duration::from_millis(1);
        let due = match self.last_ping {
            Some(ping) => after_pong.max(ping + self.heartbeat),
            None => after_pong,
        };
        due.saturating_duration_since(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEFAULT: Duration = Duration::from_millis(60_000);

    #[test]
    fn pong_sets_heartbeat() {
        let start = Instant::now();
        let mut state = HeartbeatState::new(DEFAULT, start);
        assert!(state.on_pong(Some(Duration::from_millis(5_000)), start));
        assert_eq!(state.heartbeat(), Duration::from_millis(5_000));
        assert!(!state.on_pong(None, start));
        assert_eq!(state.heartbeat(), Duration::from_millis(5_000));
    }

    #[test]
    fn exactly_one_ping_after_idle_heartbeat() {
        let start = Instant::now();
        let mut state = HeartbeatState::new(DEFAULT, start);
        state.on_ping_sent(start);
        state.on_pong(Some(Duration::from_millis(5_000)), start);

        let mut pings = 0;
        for ms in (0..=9_000).step_by(100) {
            let now = start + Duration::from_millis(ms);
            if state.should_ping(now) {
                pings += 1;
                state.on_ping_sent(now);
            }
        }
        assert_eq!(pings, 1);
        assert!(!state.should_ping(start + Duration::from_millis(5_000)));
    }

    #[test]
    fn pings_repeat_once_per_period_without_pongs() {
        let start = Instant::now();
        let heartbeat = Duration::from_millis(1_000);
        let mut state = HeartbeatState::new(heartbeat, start);
        state.on_ping_sent(start);

        let mut pings = 0;
        for ms in (0..=4_500).step_by(50) {
            let now = start + Duration::from_millis(ms);
            if state.should_ping(now) {
                pings += 1;
                state.on_ping_sent(now);
            }
        }
        assert_eq!(pings, 4);
    }

    #[test]
    fn wait_time_points_at_the_next_ping() {
        let start = Instant::now();
        let heartbeat = Duration::from_millis(1_000);
        let mut state = HeartbeatState::new(heartbeat, start);
        state.on_ping_sent(start);
        assert_eq!(state.time_until_ping(start), Duration::from_millis(1_001));

        let later = start + Duration::from_millis(1_001);
        assert!(state.should_ping(later));
        assert_eq!(state.time_until_ping(later), Duration::ZERO);
    }
}
