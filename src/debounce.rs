//! Burst coalescing for raw change events.
//!
//! The debouncer never sees paths: it only decides *when* the accumulated
//! changes have settled enough to classify and dispatch. It is a plain state
//! machine driven by timestamps so the watch loop owns the clock.

use std::time::Duration;

use clap::ValueEnum;
use serde::Deserialize;
use tokio::time::Instant;

/// How bursts are detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum DebounceMode {
    /// Fire once no event has arrived for a full window (trailing edge).
    /// Sustained bursts are capped by `max_wait`.
    #[default]
    Silence,
    /// Fire one window after the first event that follows a quiet gap of at
    /// least one window. Events closer together than the window only extend
    /// the gap timer, so an uninterrupted stream never fires.
    LeadingEdge,
}

#[derive(Debug)]
pub struct Debouncer {
    mode: DebounceMode,
    window: Duration,
    max_wait: Option<Duration>,
    last_event_at: Option<Instant>,
    burst_started_at: Option<Instant>,
    deadline: Option<Instant>,
}

impl Debouncer {
    pub fn new(mode: DebounceMode, window: Duration, max_wait: Option<Duration>) -> Self {
        Self {
            mode,
            window,
            max_wait,
            last_event_at: None,
            burst_started_at: None,
            deadline: None,
        }
    }

    /// Record an event observed at `now`.
    pub fn observe(&mut self, now: Instant) {
        match self.mode {
            DebounceMode::Silence => {
                let started = *self.burst_started_at.get_or_insert(now);
                let mut deadline = now + self.window;
                if let Some(max_wait) = self.max_wait {
                    deadline = deadline.min(started + max_wait);
                }
                self.deadline = Some(deadline);
            }
            DebounceMode::LeadingEdge => {
                let quiet_gap = self
                    .last_event_at
                    .is_none_or(|last| now.saturating_duration_since(last) >= self.window);
                if quiet_gap && self.deadline.is_none() {
                    self.deadline = Some(now + self.window);
                }
            }
        }
        self.last_event_at = Some(now);
    }

    /// When the next trigger is due, if one is armed.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Consume the armed trigger if it is due at `now`.
    pub fn take_trigger(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if now >= deadline => {
                self.deadline = None;
                self.burst_started_at = None;
                true
            }
            _ => false,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn mode(&self) -> DebounceMode {
        self.mode
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const W: Duration = Duration::from_secs(2);

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_silence_fires_after_quiet_window() {
        let t0 = Instant::now();
        let mut d = Debouncer::new(DebounceMode::Silence, W, None);

        d.observe(t0);
        d.observe(t0 + ms(500));
        assert_eq!(d.deadline(), Some(t0 + ms(2500)));

        assert!(!d.take_trigger(t0 + ms(2000)));
        assert!(d.take_trigger(t0 + ms(2500)));
        assert_eq!(d.deadline(), None);
    }

    #[test]
    fn test_silence_caps_sustained_burst() {
        let t0 = Instant::now();
        let mut d = Debouncer::new(DebounceMode::Silence, W, Some(ms(5000)));

        // An event every second for ten seconds never leaves a quiet window.
        for i in 0..10 {
            d.observe(t0 + ms(i * 1000));
        }
        assert_eq!(d.deadline(), Some(t0 + ms(5000)));
        assert!(d.take_trigger(t0 + ms(9000)));

        // The cap is measured from the first event of the next burst.
        d.observe(t0 + ms(9500));
        assert_eq!(d.deadline(), Some(t0 + ms(11_500)));
    }

    #[test]
    fn test_leading_edge_first_event_schedules_settle() {
        let t0 = Instant::now();
        let mut d = Debouncer::new(DebounceMode::LeadingEdge, W, None);

        d.observe(t0);
        assert_eq!(d.deadline(), Some(t0 + W));

        // Later events in the settle period do not move the trigger.
        d.observe(t0 + ms(1500));
        assert_eq!(d.deadline(), Some(t0 + W));
        assert!(d.take_trigger(t0 + W));
    }

    #[test]
    fn test_leading_edge_tight_stream_never_fires() {
        let t0 = Instant::now();
        let mut d = Debouncer::new(DebounceMode::LeadingEdge, W, None);

        // One event per second: the first arms the settle trigger, every
        // later gap is below the window.
        d.observe(t0);
        d.observe(t0 + ms(1000));
        assert!(d.take_trigger(t0 + W));
        for i in 2..20 {
            d.observe(t0 + ms(i * 1000));
            assert_eq!(d.deadline(), None);
        }

        // Only a quiet gap re-arms it.
        let resumed = t0 + ms(19_000) + W;
        d.observe(resumed);
        assert_eq!(d.deadline(), Some(resumed + W));
    }
}
