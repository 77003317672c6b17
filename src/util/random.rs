use std::ops::Range;
use std::sync::Mutex;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};


/// Source of randomness for connection and endpoint selection. Containers hold their own
///  instance so tests can inject a seeded or mocked one.
#[cfg_attr(test, mockall::automock)]
pub trait Random: Send + Sync {
    fn gen_f64_range(&self, range: Range<f64>) -> f64;
    fn gen_usize_range(&self, range: Range<usize>) -> usize;
    fn gen_u64_range(&self, range: Range<u64>) -> u64;
}

pub struct RngRandom {}
impl Random for RngRandom {
    fn gen_f64_range(&self, range: Range<f64>) -> f64 {
        rand::thread_rng().gen_range(range)
    }

    fn gen_usize_range(&self, range: Range<usize>) -> usize {
        rand::thread_rng().gen_range(range)
    }

    fn gen_u64_range(&self, range: Range<u64>) -> u64 {
        rand::thread_rng().gen_range(range)
    }
}

/// Deterministic sequence for reproducible selection
pub struct SeededRandom {
    rng: Mutex<StdRng>,
}
impl SeededRandom {
    pub fn new(seed: u64) -> SeededRandom {
        SeededRandom {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    fn with_rng<T>(&self, f: impl FnOnce(&mut StdRng) -> T) -> T {
        let mut rng = self.rng.lock()
            .unwrap_or_else(|e| e.into_inner());
        f(&mut rng)
    }
}
impl Random for SeededRandom {
    fn gen_f64_range(&self, range: Range<f64>) -> f64 {
        self.with_rng(|rng| rng.gen_range(range))
    }

    fn gen_usize_range(&self, range: Range<usize>) -> usize {
        self.with_rng(|rng| rng.gen_range(range))
    }

    fn gen_u64_range(&self, range: Range<u64>) -> u64 {
        self.with_rng(|rng| rng.gen_range(range))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_seeded_is_reproducible() {
        let a = SeededRandom::new(42);
        let b = SeededRandom::new(42);
        for _ in 0..20 {
            assert_eq!(a.gen_usize_range(0..1000), b.gen_usize_range(0..1000));
        }
    }

    #[test]
    fn test_ranges() {
        let r = RngRandom {};
        for _ in 0..100 {
            assert!((3..7).contains(&r.gen_usize_range(3..7)));
            let f = r.gen_f64_range(0.5..1.0);
            assert!(f >= 0.5 && f < 1.0);
        }
    }
}
