use std::time::Duration;
use rand::{Rng, SeedableRng};

pub type XoshiroRng = rand_xoshiro::Xoshiro256PlusPlus;

/// Inits random number generator from an optional seed.
pub fn init_rng(seed: Option<u64>) -> XoshiroRng {
    if let Some(seed) = seed {
        XoshiroRng::seed_from_u64(seed)
    } else {
        let mut buffer = [0_u8; 8];
        if getrandom::getrandom(&mut buffer).is_err() {
            log::warn!("Could not obtain random seed from the system, using a fixed seed");
        }
        XoshiroRng::seed_from_u64(u64::from_le_bytes(buffer))
    }
}

/// Exponential backoff with full jitter: uniform in `[0, min(max, base * 2^(attempt - 1))]`.
pub fn backoff_delay(rng: &mut impl Rng, base: Duration, max: Duration, attempt: u32) -> Duration {
    if base.is_zero() {
        return Duration::ZERO;
    }
    let factor = 1_u32 << attempt.saturating_sub(1).min(16);
    let upper = base.saturating_mul(factor).min(max);
    upper.mul_f64(rng.gen::<f64>())
}
