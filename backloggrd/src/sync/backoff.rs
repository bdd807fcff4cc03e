use rand::Rng;
use std::time::Duration;

/// Capped exponential retry delay with optional full jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter: bool,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(2), Duration::from_secs(300), true)
    }
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, jitter: bool) -> Self {
        Self { base, max, jitter }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let mut rng = rand::thread_rng();
        self.delay_with_rng(attempt, &mut rng)
    }

    pub fn delay_with_rng<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let ceiling = self.ceiling(attempt);
        if !self.jitter {
            return ceiling;
        }
        let ceiling_ms = ceiling.as_millis().min(u128::from(u64::MAX)) as u64;
        // Never retry sooner than the base delay.
        let floor_ms = self.base.as_millis().min(u128::from(ceiling_ms)) as u64;
        Duration::from_millis(rng.gen_range(floor_ms..=ceiling_ms))
    }

    /// The un-jittered delay for `attempt`, also the upper bound with jitter.
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let base_ms = self.base.as_millis().min(u128::from(u64::MAX)) as u64;
        let max_ms = self.max.as_millis().min(u128::from(u64::MAX)) as u64;
        let shift = attempt.min(16);
        Duration::from_millis(base_ms.saturating_mul(1u64 << shift).min(max_ms))
    }

    /// Unix second at which an operation that failed `attempt` times may run again.
    pub fn retry_at(&self, attempt: u32, now: i64) -> i64 {
        let delay = self.delay(attempt);
        let secs = delay.as_secs() + u64::from(delay.subsec_nanos() > 0);
        now.saturating_add(secs.min(i64::MAX as u64) as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn defaults_start_at_two_seconds_and_cap_at_five_minutes() {
        let backoff = Backoff::default();
        assert_eq!(backoff.ceiling(0), Duration::from_secs(2));
        assert_eq!(backoff.ceiling(1), Duration::from_secs(4));
        assert_eq!(backoff.ceiling(7), Duration::from_secs(256));
        assert_eq!(backoff.ceiling(8), Duration::from_secs(300));
        assert_eq!(backoff.ceiling(40), Duration::from_secs(300));
    }

    #[test]
    fn jittered_delay_stays_between_base_and_ceiling() {
        let backoff = Backoff::default();
        let mut rng = StdRng::seed_from_u64(7);
        for attempt in 0..12 {
            let delay = backoff.delay_with_rng(attempt, &mut rng);
            assert!(delay >= Duration::from_secs(2));
            assert!(delay <= backoff.ceiling(attempt));
        }
    }

    #[test]
    fn retry_at_rounds_up_to_whole_seconds() {
        let backoff = Backoff::new(Duration::from_millis(1500), Duration::from_secs(60), false);
        assert_eq!(backoff.retry_at(0, 1_000), 1_002);
        assert_eq!(backoff.retry_at(1, 1_000), 1_003);
    }
}
