//! Curve sampling
//!
//! Sampling is a pluggable capability: the scheduler only needs
//! `sample(modulus) -> (a, b, score)`. Implementations must reject
//! singular curves and curves whose rational point group is not cyclic by
//! resampling internally; there is no bound on how long that takes, which
//! is accepted as part of the contract.
//!
//! The crate ships [`SmallFieldSampler`], a number-theory reference
//! implementation for prime fields in `u64` range, so the binary works end
//! to end without a computer-algebra system. Production deployments on
//! large fields plug a CAS-backed implementation into the same trait;
//! which one runs is a deployment concern, not a protocol concern.

use crate::Result;
use anyhow::{bail, Context};
use num_bigint::BigUint;
use num_traits::ToPrimitive;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// One sampled curve and its smoothness score
#[derive(Debug, Clone, PartialEq)]
pub struct CurveSample {
    /// Curve coefficient a
    pub a: BigUint,

    /// Curve coefficient b
    pub b: BigUint,

    /// log2 of the largest prime-power factor of the group order
    pub score: f64,
}

/// Curve sampling capability
pub trait CurveSampler: Send {
    /// Sample one valid curve over the field of the given size.
    ///
    /// Errors are fatal to the owning worker (allocation failure,
    /// unsupported field), never a "try again" signal — retrying happens
    /// inside the implementation.
    fn sample(&mut self, modulus: &BigUint) -> Result<CurveSample>;
}

/// Largest modulus the reference sampler accepts.
///
/// Point counting is O(p); beyond this a single sample takes minutes and
/// a CAS-backed sampler is the right tool.
const MAX_SMALL_MODULUS: u64 = 1 << 26;

/// How many random points to try before rejecting a curve as non-cyclic.
///
/// On a cyclic group a uniformly random point generates with probability
/// phi(N)/N >= 1/(e^gamma ln ln N + 3/ln ln N), so eight misses in a row
/// on a cyclic group is vanishingly unlikely; rejecting and resampling is
/// always safe, only wasteful.
const GENERATOR_ATTEMPTS: usize = 8;

/// Reference sampler for small prime fields
pub struct SmallFieldSampler {
    rng: StdRng,
}

impl SmallFieldSampler {
    /// Create a sampler seeded from system entropy
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    /// Create a deterministic sampler (tests)
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl Default for SmallFieldSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl CurveSampler for SmallFieldSampler {
    fn sample(&mut self, modulus: &BigUint) -> Result<CurveSample> {
        let p = modulus
            .to_u64()
            .filter(|&p| p <= MAX_SMALL_MODULUS)
            .with_context(|| {
                format!(
                    "modulus {} too large for the small-field sampler (max {})",
                    modulus, MAX_SMALL_MODULUS
                )
            })?;

        if p < 5 || !is_prime(p) {
            bail!("small-field sampler requires a prime modulus >= 5, got {}", p);
        }

        loop {
            // Reject singular curves
            let (a, b) = loop {
                let a = self.rng.gen_range(0..p);
                let b = self.rng.gen_range(0..p);
                if discriminant_nonzero(p, a, b) {
                    break (a, b);
                }
            };

            let order = curve_order(p, a, b);
            let factors = factor(order);

            // Reject curves whose group structure splits
            if !has_generator(&mut self.rng, p, a, b, order, &factors) {
                continue;
            }

            return Ok(CurveSample {
                a: BigUint::from(a),
                b: BigUint::from(b),
                score: smoothness_score(&factors),
            });
        }
    }
}

/// log2 of the largest prime-power factor
pub fn smoothness_score(factors: &[(u64, u32)]) -> f64 {
    factors
        .iter()
        .map(|&(prime, exp)| (prime as f64).log2() * exp as f64)
        .fold(0.0, f64::max)
}

/// 4a^3 + 27b^2 != 0 (mod p)
fn discriminant_nonzero(p: u64, a: u64, b: u64) -> bool {
    let a3 = mod_mul(mod_mul(a, a, p), a, p);
    let b2 = mod_mul(b, b, p);
    (mod_mul(4, a3, p) + mod_mul(27, b2, p)) % p != 0
}

/// #E(F_p) = p + 1 + sum over x of the Legendre symbol of x^3 + ax + b
fn curve_order(p: u64, a: u64, b: u64) -> u64 {
    let mut order = p as i64 + 1;
    for x in 0..p {
        let rhs = rhs_at(p, a, b, x);
        order += legendre(rhs, p) as i64;
    }
    order as u64
}

fn rhs_at(p: u64, a: u64, b: u64, x: u64) -> u64 {
    let x2 = mod_mul(x, x, p);
    let x3 = mod_mul(x2, x, p);
    (x3 + mod_mul(a, x, p) + b) % p
}

/// Monte Carlo cyclicity check: look for a point of full order.
///
/// A point generates iff (order/q)P != O for every prime q dividing the
/// order. Finding one proves the group cyclic; failing to find one in a
/// handful of draws rejects the curve.
fn has_generator(
    rng: &mut StdRng,
    p: u64,
    a: u64,
    b: u64,
    order: u64,
    factors: &[(u64, u32)],
) -> bool {
    for _ in 0..GENERATOR_ATTEMPTS {
        let point = match random_point(rng, p, a, b) {
            Some(point) => point,
            None => continue,
        };

        let generates = factors
            .iter()
            .all(|&(q, _)| scalar_mul(order / q, Some(point), p, a).is_some());
        if generates {
            return true;
        }
    }
    false
}

/// Draw a random affine point on the curve
fn random_point(rng: &mut StdRng, p: u64, a: u64, b: u64) -> Option<(u64, u64)> {
    // Rejection sample x until x^3 + ax + b is a square
    for _ in 0..128 {
        let x = rng.gen_range(0..p);
        let rhs = rhs_at(p, a, b, x);
        if rhs == 0 {
            return Some((x, 0));
        }
        if legendre(rhs, p) == 1 {
            let y = sqrt_mod(rhs, p)?;
            return Some((x, y));
        }
    }
    None
}

// --- Affine Weierstrass arithmetic over F_p, u128 intermediates ---

type Point = Option<(u64, u64)>;

fn point_add(lhs: Point, rhs: Point, p: u64, a: u64) -> Point {
    let (x1, y1) = match lhs {
        Some(point) => point,
        None => return rhs,
    };
    let (x2, y2) = match rhs {
        Some(point) => point,
        None => return lhs,
    };

    let lambda = if x1 == x2 {
        if (y1 + y2) % p == 0 {
            return None;
        }
        // Tangent: (3x^2 + a) / 2y
        let num = (mod_mul(3, mod_mul(x1, x1, p), p) + a) % p;
        mod_mul(num, mod_inv(mod_mul(2, y1, p), p), p)
    } else {
        // Chord: (y2 - y1) / (x2 - x1)
        let num = (p + y2 - y1) % p;
        let den = (p + x2 - x1) % p;
        mod_mul(num, mod_inv(den, p), p)
    };

    let x3 = (mod_mul(lambda, lambda, p) + 2 * p - x1 - x2) % p;
    let y3 = (mod_mul(lambda, (p + x1 - x3) % p, p) + p - y1) % p;
    Some((x3, y3))
}

fn scalar_mul(mut k: u64, mut point: Point, p: u64, a: u64) -> Point {
    let mut acc = None;
    while k > 0 {
        if k & 1 == 1 {
            acc = point_add(acc, point, p, a);
        }
        point = point_add(point, point, p, a);
        k >>= 1;
    }
    acc
}

// --- Modular arithmetic helpers ---

fn mod_mul(a: u64, b: u64, p: u64) -> u64 {
    ((a as u128 * b as u128) % p as u128) as u64
}

fn mod_pow(mut base: u64, mut exp: u64, p: u64) -> u64 {
    let mut result = 1 % p;
    base %= p;
    while exp > 0 {
        if exp & 1 == 1 {
            result = mod_mul(result, base, p);
        }
        base = mod_mul(base, base, p);
        exp >>= 1;
    }
    result
}

/// Inverse via Fermat (p prime, a != 0)
fn mod_inv(a: u64, p: u64) -> u64 {
    mod_pow(a, p - 2, p)
}

/// Legendre symbol: 1 for squares, -1 for non-squares, 0 for zero
fn legendre(a: u64, p: u64) -> i32 {
    if a % p == 0 {
        return 0;
    }
    if mod_pow(a, (p - 1) / 2, p) == 1 {
        1
    } else {
        -1
    }
}

/// Tonelli-Shanks square root modulo an odd prime
fn sqrt_mod(n: u64, p: u64) -> Option<u64> {
    match legendre(n, p) {
        0 => return Some(0),
        -1 => return None,
        _ => {}
    }

    if p % 4 == 3 {
        return Some(mod_pow(n, (p + 1) / 4, p));
    }

    // p - 1 = q * 2^s with q odd
    let mut q = p - 1;
    let mut s = 0u32;
    while q % 2 == 0 {
        q /= 2;
        s += 1;
    }

    // Any quadratic non-residue will do
    let mut z = 2;
    while legendre(z, p) != -1 {
        z += 1;
    }

    let mut m = s;
    let mut c = mod_pow(z, q, p);
    let mut t = mod_pow(n, q, p);
    let mut r = mod_pow(n, (q + 1) / 2, p);

    while t != 1 {
        let mut i = 0u32;
        let mut t2 = t;
        while t2 != 1 {
            t2 = mod_mul(t2, t2, p);
            i += 1;
        }

        let exp = 1u64 << (m - i - 1);
        let base = mod_pow(c, exp, p);
        m = i;
        c = mod_mul(base, base, p);
        t = mod_mul(t, c, p);
        r = mod_mul(r, base, p);
    }

    Some(r)
}

/// Deterministic primality by trial division (inputs are small)
fn is_prime(n: u64) -> bool {
    if n < 2 {
        return false;
    }
    if n % 2 == 0 {
        return n == 2;
    }
    let mut d = 3;
    while d * d <= n {
        if n % d == 0 {
            return false;
        }
        d += 2;
    }
    true
}

/// Factor by trial division into (prime, exponent) pairs
fn factor(mut n: u64) -> Vec<(u64, u32)> {
    let mut factors = Vec::new();
    let mut d = 2;
    while d as u128 * d as u128 <= n as u128 {
        if n % d == 0 {
            let mut exp = 0;
            while n % d == 0 {
                n /= d;
                exp += 1;
            }
            factors.push((d, exp));
        }
        d += 1;
    }
    if n > 1 {
        factors.push((n, 1));
    }
    factors
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factor_and_score() {
        assert_eq!(factor(360), vec![(2, 3), (3, 2), (5, 1)]);
        assert_eq!(factor(97), vec![(97, 1)]);

        // Largest prime-power factor of 360 = 2^3 * 3^2 * 5 is 3^2 = 9
        let score = smoothness_score(&factor(360));
        assert!((score - 9f64.log2()).abs() < 1e-12);

        // Prime order: score = log2(order)
        let score = smoothness_score(&factor(97));
        assert!((score - 97f64.log2()).abs() < 1e-12);
    }

    #[test]
    fn test_mod_helpers() {
        let p = 1_000_003;
        for a in [1u64, 2, 17, 999_999] {
            assert_eq!(mod_mul(a, mod_inv(a, p), p), 1);
        }
        assert_eq!(mod_pow(2, 10, 1_000_003), 1024);
    }

    #[test]
    fn test_sqrt_mod_both_branches() {
        // p = 3 mod 4
        let p = 103;
        for n in 1..p {
            if legendre(n, p) == 1 {
                let r = sqrt_mod(n, p).unwrap();
                assert_eq!(mod_mul(r, r, p), n);
            }
        }

        // p = 1 mod 4 exercises full Tonelli-Shanks
        let p = 113;
        for n in 1..p {
            if legendre(n, p) == 1 {
                let r = sqrt_mod(n, p).unwrap();
                assert_eq!(mod_mul(r, r, p), n);
            } else {
                assert!(sqrt_mod(n, p).is_none());
            }
        }
    }

    #[test]
    fn test_curve_order_matches_naive_count() {
        let (p, a, b) = (101, 2, 3);
        assert!(discriminant_nonzero(p, a, b));

        // Independent count: 1 (infinity) + all (x, y) satisfying the equation
        let mut count = 1u64;
        for x in 0..p {
            for y in 0..p {
                if mod_mul(y, y, p) == rhs_at(p, a, b, x) {
                    count += 1;
                }
            }
        }
        assert_eq!(curve_order(p, a, b), count);
    }

    #[test]
    fn test_scalar_mul_annihilates_at_order() {
        let (p, a, b) = (101, 2, 3);
        let order = curve_order(p, a, b);
        let mut rng = StdRng::seed_from_u64(7);

        // Lagrange: order * P = O for every point P
        for _ in 0..10 {
            if let Some(point) = random_point(&mut rng, p, a, b) {
                assert!(scalar_mul(order, Some(point), p, a).is_none());
            }
        }
    }

    #[test]
    fn test_sample_returns_valid_scored_curve() {
        let mut sampler = SmallFieldSampler::with_seed(42);
        let modulus = BigUint::from(1009u32);

        let sample = sampler.sample(&modulus).unwrap();
        let a = sample.a.to_u64().unwrap();
        let b = sample.b.to_u64().unwrap();

        assert!(discriminant_nonzero(1009, a, b));

        // Score matches an independent recomputation from the group order
        let expected = smoothness_score(&factor(curve_order(1009, a, b)));
        assert_eq!(sample.score, expected);

        // Hasse bound on any prime-power factor of the order
        assert!(sample.score <= ((1009.0 + 1.0 + 2.0 * (1009f64).sqrt()).log2()));
    }

    #[test]
    fn test_sample_rejects_bad_moduli() {
        let mut sampler = SmallFieldSampler::with_seed(1);
        assert!(sampler.sample(&BigUint::from(4u32)).is_err()); // composite
        assert!(sampler.sample(&BigUint::from(2u32)).is_err()); // too small
        let huge = BigUint::from(u64::MAX) * BigUint::from(u64::MAX);
        assert!(sampler.sample(&huge).is_err()); // beyond u64
    }
}
