use rand::Rng;
use std::time::Duration;

/// Restart pacing: the delay doubles per attempt up to `max`, drawn uniformly below that
/// ceiling when jittered. A `limit` ends the sequence after that many delays.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter: bool,
    limit: Option<u32>,
    attempt: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(30))
    }
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            jitter: true,
            limit: None,
            attempt: 0,
        }
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// `None` never gives up.
    pub fn with_limit(mut self, limit: Option<u32>) -> Self {
        self.limit = limit;
        self
    }

    /// Delays handed out so far.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// `None` once the limit is used up.
    pub fn next_delay(&mut self) -> Option<Duration> {
        let mut rng = rand::thread_rng();
        self.next_delay_with_rng(&mut rng)
    }

    pub fn next_delay_with_rng<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Option<Duration> {
        if self.limit.is_some_and(|limit| self.attempt >= limit) {
            return None;
        }
        let ceiling = self.ceiling(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        if self.jitter && !ceiling.is_zero() {
            Some(rng.gen_range(Duration::ZERO..=ceiling))
        } else {
            Some(ceiling)
        }
    }

    fn ceiling(&self, attempt: u32) -> Duration {
        self.base
            .checked_mul(1 << attempt.min(16))
            .map_or(self.max, |delay| delay.min(self.max))
    }
}
