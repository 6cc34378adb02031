//! # clock
//!
//! why: measure elapsed time for election and heartbeat timeouts
//! relations: owned by node.rs and client.rs, one clock per timeout
//! what: Clock handle over a monotonic instant, randomized timeout draws, tick pacing speeds

use std::fmt;
use std::thread;
use std::time::{Duration, Instant};

use rand::Rng;

/// Monotonic stopwatch. `elapsed` never goes negative and `reset` rebases it to now.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    start: Instant,
}

impl Clock {
    /// Capture the current instant.
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// True once strictly more than `timeout` has passed since the last reset.
    pub fn exceeded(&self, timeout: Duration) -> bool {
        self.elapsed() > timeout
    }

    pub fn reset(&mut self) {
        self.start = Instant::now();
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::start()
    }
}

/// Draw an election timeout uniformly from `[min_ms, max_ms]`.
pub fn random_timeout<R: Rng + ?Sized>(rng: &mut R, min_ms: u64, max_ms: u64) -> Duration {
    let (low, high) = if min_ms <= max_ms {
        (min_ms, max_ms)
    } else {
        (max_ms, min_ms)
    };
    Duration::from_millis(rng.gen_range(low..=high))
}

/// Pacing of a run loop: the pause taken before every tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Speed {
    High,
    Medium,
    Low,
}

impl Speed {
    pub fn delay(self) -> Duration {
        match self {
            Speed::High => Duration::ZERO,
            Speed::Medium => Duration::from_millis(250),
            Speed::Low => Duration::from_millis(500),
        }
    }

    /// `"low"` and `"medium"` are recognised, anything else runs at full speed.
    pub fn from_name(name: &str) -> Self {
        match name.trim() {
            "low" => Speed::Low,
            "medium" => Speed::Medium,
            _ => Speed::High,
        }
    }
}

impl fmt::Display for Speed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Speed::High => write!(f, "HIGH"),
            Speed::Medium => write!(f, "MEDIUM"),
            Speed::Low => write!(f, "LOW"),
        }
    }
}

/// Pause between two ticks of a run loop.
pub fn wait(delay: Duration) {
    if !delay.is_zero() {
        thread::sleep(delay);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn elapsed_grows_and_reset_rebases() {
        let mut clock = Clock::start();
        wait(Duration::from_millis(5));
        assert!(clock.elapsed() >= Duration::from_millis(5));

        clock.reset();
        assert!(clock.elapsed() < Duration::from_millis(5));
    }

    #[test]
    fn exceeded_is_strict() {
        let clock = Clock::start();
        assert!(!clock.exceeded(Duration::from_secs(60)));
        wait(Duration::from_millis(2));
        assert!(clock.exceeded(Duration::from_millis(1)));
    }

    #[test]
    fn speed_names_and_delays() {
        assert_eq!(Speed::from_name("low"), Speed::Low);
        assert_eq!(Speed::from_name("medium"), Speed::Medium);
        assert_eq!(Speed::from_name("high"), Speed::High);
        assert_eq!(Speed::from_name("warp"), Speed::High);
        assert_eq!(Speed::Medium.delay(), Duration::from_millis(250));
        assert_eq!(Speed::Low.delay(), Duration::from_millis(500));
        assert!(Speed::High.delay().is_zero());
        assert_eq!(Speed::Low.to_string(), "LOW");
    }

    #[test]
    fn random_timeout_stays_in_range() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let timeout = random_timeout(&mut rng, 200, 400);
            assert!(timeout >= Duration::from_millis(200));
            assert!(timeout <= Duration::from_millis(400));
        }
    }

    #[test]
    fn random_timeout_accepts_swapped_bounds() {
        let mut rng = StdRng::seed_from_u64(1);
        let timeout = random_timeout(&mut rng, 50, 10);
        assert!(timeout >= Duration::from_millis(10) && timeout <= Duration::from_millis(50));
    }
}
