//! Latency injection for chaos testing
//!
//! The `nfs_permission` exit probe can stall the calling task for a short,
//! bounded time before it is timed, making the injected delay visible in the
//! client operation latencies.

use crate::constants::MAX_DELAY_SPINS;

/// Pseudo-random injection decision from the low digits of the clock
///
/// `probability` is a percentage; 0 disables injection.
#[inline(always)]
pub const fn should_inject(now: u64, probability: u64) -> bool {
    probability != 0 && now % 100 < probability
}

#[inline(always)]
pub const fn delay_deadline(now: u64, delay_us: u32) -> u64 {
    now.saturating_add(delay_us as u64 * 1000)
}

/// Busy-wait until `clock()` reaches `deadline`
///
/// Gives up after [`MAX_DELAY_SPINS`] reads. Returns the number of reads.
#[inline(always)]
pub fn spin_until<F: FnMut() -> u64>(deadline: u64, mut clock: F) -> u32 {
    let mut spins = 0;
    while spins < MAX_DELAY_SPINS {
        spins += 1;
        if clock() >= deadline {
            break;
        }
    }
    spins
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_probability_never_injects() {
        for now in 0..200 {
            assert!(!should_inject(now, 0));
        }
    }

    #[test]
    fn test_probability_is_a_percentage() {
        let hits = (0..1000).filter(|&now| should_inject(now, 25)).count();
        assert_eq!(hits, 250);
        assert!((0..100).all(|now| should_inject(now, 100)));
    }

    #[test]
    fn test_spin_stops_at_deadline() {
        let mut t = 0;
        let spins = spin_until(delay_deadline(0, 1), || {
            t += 100;
            t
        });
        assert_eq!(spins, 10);
    }

    #[test]
    fn test_spin_is_bounded() {
        assert_eq!(spin_until(u64::MAX, || 0), MAX_DELAY_SPINS);
    }
}
