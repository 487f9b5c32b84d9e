//! Factor kernel: find one nontrivial factor of an integer within a bounded effort.
//!
//! The kernel is pure. It owns no state between calls and performs no I/O, so
//! the worker can run it in short slices on a blocking thread and throw a
//! slice away when the task it belongs to has already been solved elsewhere.
//!
//! [`PollardRho`] first tries division by small primes, then rejects probable
//! primes with Miller-Rabin, and only then runs Brent's variant of Pollard's
//! rho with a random polynomial and starting point. An `Exhausted` result is
//! not a failure: the caller retries with a fresh seed.

use rand::RngCore;

use crate::bignum::BigNum;

const SMALL_PRIMES: [u32; 25] = [
    2, 3, 5, 7, 11, 13, 17, 19, 23, 29, 31, 37, 41, 43, 47, 53, 59, 61, 67, 71, 73, 79, 83, 89, 97,
];

/// Witnesses that make Miller-Rabin deterministic below 3.3 * 10^24.
const FIXED_WITNESSES: [u32; 12] = [2, 3, 5, 7, 11, 13, 17, 19, 23, 29, 31, 37];

/// Extra random witnesses for inputs beyond the deterministic range.
const RANDOM_WITNESSES: usize = 8;

/// Iterations between gcd checks in Brent's loop.
const GCD_BATCH: u64 = 128;

/// Upper bound on rho iterations for one kernel call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Effort {
    pub max_iterations: u64,
}

impl Effort {
    pub const fn iterations(max_iterations: u64) -> Self {
        Self { max_iterations }
    }
}

impl Default for Effort {
    fn default() -> Self {
        Self::iterations(20_000)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FactorOutcome {
    /// `1 < factor < |n|` and `factor` divides `n`.
    Found { factor: BigNum, iterations: u64 },
    /// Nothing found within the budget. `iterations == 0` means the kernel did
    /// not search at all because `n` is prime or degenerate.
    Exhausted { iterations: u64 },
}

impl FactorOutcome {
    pub fn iterations(&self) -> u64 {
        match self {
            FactorOutcome::Found { iterations, .. } | FactorOutcome::Exhausted { iterations } => {
                *iterations
            }
        }
    }

    /// `true` when retrying can never succeed for this input.
    pub fn is_hopeless(&self) -> bool {
        matches!(self, FactorOutcome::Exhausted { iterations: 0 })
    }
}

/// A pluggable factoring algorithm.
pub trait FactorKernel: Send + Sync + 'static {
    fn find_factor(&self, n: &BigNum, effort: Effort, rng: &mut dyn RngCore) -> FactorOutcome;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PollardRho;

impl FactorKernel for PollardRho {
    fn find_factor(&self, n: &BigNum, effort: Effort, rng: &mut dyn RngCore) -> FactorOutcome {
        let n = n.abs();
        if n < BigNum::from(4) {
            return FactorOutcome::Exhausted { iterations: 0 };
        }

        if let Some(factor) = small_prime_factor(&n) {
            return FactorOutcome::Found {
                factor,
                iterations: 0,
            };
        }

        if is_probable_prime(&n, rng) {
            return FactorOutcome::Exhausted { iterations: 0 };
        }

        brent_rho(&n, effort, rng)
    }
}

/// Convenience entry point using [`PollardRho`].
pub fn find_factor(n: &BigNum, effort: Effort, rng: &mut dyn RngCore) -> FactorOutcome {
    PollardRho.find_factor(n, effort, rng)
}

fn small_prime_factor(n: &BigNum) -> Option<BigNum> {
    SMALL_PRIMES
        .iter()
        .map(|&p| BigNum::from(p))
        .find(|p| p < n && n.is_multiple_of(p))
}

/// Miller-Rabin on `|n|`. Exact below 3.3 * 10^24, probabilistic above.
pub fn is_probable_prime(n: &BigNum, rng: &mut dyn RngCore) -> bool {
    let n = n.abs();
    let two = BigNum::from(2);
    if n < two {
        return false;
    }
    for p in SMALL_PRIMES.iter().map(|&p| BigNum::from(p)) {
        if n == p {
            return true;
        }
        if n.is_multiple_of(&p) {
            return false;
        }
    }

    let one = BigNum::one();
    let n_minus_one = &n - &one;
    let mut d = n_minus_one.clone();
    let mut s = 0u32;
    while d.is_even() {
        d = d.checked_div(&two).unwrap_or_default();
        s += 1;
    }

    let is_witness = |a: &BigNum| -> bool {
        let Some(mut x) = a.pow_mod(&d, &n) else {
            return false;
        };
        if x == one || x == n_minus_one {
            return false;
        }
        for _ in 1..s {
            x = (&x * &x).modulo(&n).unwrap_or_default();
            if x == n_minus_one {
                return false;
            }
        }
        true
    };

    if FIXED_WITNESSES
        .iter()
        .map(|&a| BigNum::from(a))
        .any(|a| is_witness(&a))
    {
        return false;
    }

    if n.bits() > 81 {
        let high = &n - &one;
        for _ in 0..RANDOM_WITNESSES {
            let a = BigNum::random_range(&two, &high, rng);
            if is_witness(&a) {
                return false;
            }
        }
    }

    true
}

/// Brent's cycle detection over `x -> x^2 + c (mod n)` with batched gcds.
///
/// `n` must be odd, composite and at least 4.
fn brent_rho(n: &BigNum, effort: Effort, rng: &mut dyn RngCore) -> FactorOutcome {
    let one = BigNum::one();
    let c = BigNum::random_range(&one, n, rng);
    let step = |v: &BigNum| (&(v * v) + &c).modulo(n).unwrap_or_default();

    let mut y = BigNum::random_range(&BigNum::zero(), n, rng);
    let mut x = y.clone();
    let mut ys = y.clone();
    let mut q = one.clone();
    let mut g = one.clone();
    let mut r = 1u64;
    let mut iterations = 0u64;

    while g.is_one() {
        x = y.clone();
        for _ in 0..r {
            y = step(&y);
            iterations += 1;
            if iterations >= effort.max_iterations {
                return FactorOutcome::Exhausted { iterations };
            }
        }

        let mut k = 0u64;
        while k < r && g.is_one() {
            ys = y.clone();
            for _ in 0..GCD_BATCH.min(r - k) {
                y = step(&y);
                q = (&q * &(&x - &y).abs()).modulo(n).unwrap_or_default();
                iterations += 1;
            }
            g = q.gcd(n);
            k += GCD_BATCH;
            if g.is_one() && iterations >= effort.max_iterations {
                return FactorOutcome::Exhausted { iterations };
            }
        }
        r = r.saturating_mul(2);
    }

    // The batch overshot: the accumulated product hit every prime factor of n
    // at once. Replay the last batch one step at a time.
    if &g == n {
        g = one.clone();
        for _ in 0..GCD_BATCH.min(r) {
            ys = step(&ys);
            iterations += 1;
            g = (&x - &ys).abs().gcd(n);
            if !g.is_one() {
                break;
            }
        }
    }

    if g.is_one() || &g == n {
        FactorOutcome::Exhausted { iterations }
    } else {
        FactorOutcome::Found {
            factor: g,
            iterations,
        }
    }
}
