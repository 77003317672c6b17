use std::cmp::min;
use std::time::Duration;

use crate::util::random::Random;


/// Randomized exponential backoff for reconnect attempts. The delay doubles with every failed
///  attempt up to `max`, and the actual delay is drawn from the upper half of that interval so
///  that connections failing together do not retry in lockstep.
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    initial: Duration,
    max: Duration,
}

impl ReconnectBackoff {
    const MAX_EXPONENT: u32 = 16;

    pub fn new(initial: Duration, max: Duration) -> ReconnectBackoff {
        ReconnectBackoff {
            initial,
            max: max.max(initial),
        }
    }

    /// upper bound of the delay after `failed_attempts` consecutive failures
    pub fn ceiling(&self, failed_attempts: u32) -> Duration {
        let factor = 1u32 << min(failed_attempts, Self::MAX_EXPONENT);
        min(self.initial.saturating_mul(factor), self.max)
    }

    pub fn delay(&self, failed_attempts: u32, random: &dyn Random) -> Duration {
        self.ceiling(failed_attempts).mul_f64(random.gen_f64_range(0.5..1.0))
    }
}

#[cfg(test)]
mod test {
    use rstest::rstest;

    use crate::util::random::MockRandom;
    use super::*;

    #[rstest]
    #[case::first(0, 1_000)]
    #[case::second(1, 2_000)]
    #[case::third(2, 4_000)]
    #[case::capped(6, 60_000)]
    #[case::far_beyond(1_000, 60_000)]
    fn test_ceiling(#[case] failed_attempts: u32, #[case] expected_millis: u64) {
        let backoff = ReconnectBackoff::new(Duration::from_secs(1), Duration::from_secs(60));
        assert_eq!(backoff.ceiling(failed_attempts), Duration::from_millis(expected_millis));
    }

    #[rstest]
    #[case::lower(0.5, 2_000)]
    #[case::upper(1.0, 4_000)]
    #[case::between(0.75, 3_000)]
    fn test_delay_is_randomized(#[case] factor: f64, #[case] expected_millis: u64) {
        let mut random = MockRandom::new();
        random.expect_gen_f64_range()
            .once()
            .return_const(factor);

        let backoff = ReconnectBackoff::new(Duration::from_secs(1), Duration::from_secs(60));
        assert_eq!(backoff.delay(2, &random), Duration::from_millis(expected_millis));
    }

    #[test]
    fn test_max_below_initial() {
        let backoff = ReconnectBackoff::new(Duration::from_secs(5), Duration::from_secs(1));
        assert_eq!(backoff.ceiling(3), Duration::from_secs(5));
    }
}
