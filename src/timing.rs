use std::{sync::OnceLock, time::Duration};

use tokio::time::Instant;

use crate::event::Epoch;

/// Maps capture time onto replay time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimingReference {
    capture_origin: Epoch,
    replay_origin: Instant,
}

impl TimingReference {
    pub fn new(capture_origin: Epoch, replay_origin: Instant) -> Self {
        Self {
            capture_origin,
            replay_origin,
        }
    }

    pub fn capture_origin(&self) -> Epoch {
        self.capture_origin
    }

    pub fn replay_origin(&self) -> Instant {
        self.replay_origin
    }

    /// How long to wait at `now` before an event captured at `epoch` is due.
    /// `None` means the event is already due; late events are never skipped.
    pub fn delay_until(&self, epoch: Epoch, now: Instant) -> Option<Duration> {
        let captured_offset = epoch.saturating_duration_since(self.capture_origin);
        let elapsed_replay = now.saturating_duration_since(self.replay_origin);
        captured_offset
            .checked_sub(elapsed_replay)
            .filter(|delay| !delay.is_zero())
    }
}

/// Set-once holder for the [`TimingReference`] of one replay run.
#[derive(Debug)]
pub struct ReplayClock {
    started: Instant,
    reference: OnceLock<TimingReference>,
}

impl ReplayClock {
    pub fn new(started: Instant) -> Self {
        Self {
            started,
            reference: OnceLock::new(),
        }
    }

    pub fn started(&self) -> Instant {
        self.started
    }

    /// Returns the established reference, fixing the capture origin to
    /// `epoch` if this is the first call. Later calls ignore their argument.
    pub fn establish(&self, epoch: Epoch) -> TimingReference {
        *self
            .reference
            .get_or_init(|| TimingReference::new(epoch, self.started))
    }

    pub fn get(&self) -> Option<TimingReference> {
        self.reference.get().copied()
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use tokio::time::Instant;

    use super::{ReplayClock, TimingReference};
    use crate::event::Epoch;

    fn epoch(text: &str) -> Epoch {
        text.parse().unwrap()
    }

    #[test]
    fn delay_subtracts_elapsed_replay_time() {
        let origin = Instant::now();
        let reference = TimingReference::new(epoch("100.0"), origin);

        assert_eq!(reference.delay_until(epoch("100.0"), origin), None);
        assert_eq!(
            reference.delay_until(epoch("100.5"), origin),
            Some(Duration::from_millis(500))
        );
        assert_eq!(
            reference.delay_until(epoch("101.2"), origin + Duration::from_millis(200)),
            Some(Duration::from_secs(1))
        );
    }

    #[test]
    fn late_events_are_due_immediately() {
        let origin = Instant::now();
        let reference = TimingReference::new(epoch("100.0"), origin);

        assert_eq!(
            reference.delay_until(epoch("100.5"), origin + Duration::from_secs(2)),
            None
        );
        assert_eq!(
            reference.delay_until(epoch("99.0"), origin),
            None,
            "events before the capture origin never wait"
        );
    }

    #[test]
    fn clock_keeps_first_capture_origin() {
        let started = Instant::now();
        let clock = ReplayClock::new(started);
        assert_eq!(clock.get(), None);

        let first = clock.establish(epoch("100.0"));
        let second = clock.establish(epoch("250.0"));
        assert_eq!(first, second);
        assert_eq!(first.capture_origin(), epoch("100.0"));
        assert_eq!(first.replay_origin(), started);
        assert_eq!(clock.get(), Some(first));
    }

    #[test]
    fn concurrent_establish_agrees_on_one_reference() {
        let clock = Arc::new(ReplayClock::new(Instant::now()));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let clock = Arc::clone(&clock);
                std::thread::spawn(move || clock.establish(Epoch::from_nanos(i)))
            })
            .collect();
        let observed: Vec<_> = handles
            .into_iter()
            .map(|handle| handle.join().expect("thread should not panic"))
            .collect();
        assert!(observed.windows(2).all(|pair| pair[0] == pair[1]));
    }
}
