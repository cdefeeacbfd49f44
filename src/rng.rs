//! Per-worker random numbers
//!
//! The randomised tree structures draw child indices from a thread-local
//! generator so that workers never share generator state on the hot path.

use core::cell::RefCell;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

std::thread_local! {
    static RNG: RefCell<SmallRng> = RefCell::new(SmallRng::from_entropy());
}

/// Returns a random integer in `[lo, hi)`.
#[inline]
pub fn random_int(lo: usize, hi: usize) -> usize {
    debug_assert!(lo < hi);
    RNG.with(|r| r.borrow_mut().gen_range(lo..hi))
}
