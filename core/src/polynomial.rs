//! Polynomials over GF(2), packed into a `u64`.
//!
//! Each repository picks one random irreducible polynomial of degree 53 at
//! init time. The chunker is keyed by it, so chunk boundaries of the same
//! content differ between repositories.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const POLYNOMIAL_DEGREE: u32 = 53;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Polynomial(u64);

impl Polynomial {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    /// Degree of the polynomial, or -1 for the zero polynomial.
    pub fn degree(&self) -> i32 {
        degree(self.0 as u128)
    }

    /// Draws random degree-53 polynomials until one is irreducible.
    pub fn random() -> Self {
        let mut rng = rand::thread_rng();
        loop {
            let mut value = rng.next_u64() & ((1 << POLYNOMIAL_DEGREE) - 1);
            value |= 1 << POLYNOMIAL_DEGREE;
            // x does not divide an irreducible polynomial
            value |= 1;
            let candidate = Polynomial(value);
            if candidate.is_irreducible() {
                return candidate;
            }
        }
    }

    /// Ben-Or test: `f` is irreducible iff gcd(f, x^(2^i) - x mod f) == 1
    /// for every i up to deg(f)/2.
    pub fn is_irreducible(&self) -> bool {
        let d = self.degree();
        if d < 1 {
            return false;
        }
        (1..=d / 2).all(|i| gcd(self.0, qp(i as u32, self.0)) == 1)
    }
}

impl fmt::Debug for Polynomial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Polynomial({:#x})", self.0)
    }
}

impl fmt::Display for Polynomial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

fn degree(x: u128) -> i32 {
    127 - x.leading_zeros() as i32
}

fn modulo(mut x: u128, m: u64) -> u64 {
    let dm = degree(m as u128);
    while degree(x) >= dm {
        x ^= (m as u128) << (degree(x) - dm);
    }
    x as u64
}

fn mul(a: u64, b: u64) -> u128 {
    let mut result = 0u128;
    for i in 0..64 {
        if (b >> i) & 1 == 1 {
            result ^= (a as u128) << i;
        }
    }
    result
}

fn mul_mod(a: u64, b: u64, m: u64) -> u64 {
    modulo(mul(a, b), m)
}

fn gcd(a: u64, b: u64) -> u64 {
    if b == 0 {
        a
    } else {
        gcd(b, modulo(a as u128, b))
    }
}

/// x^(2^p) - x mod g
fn qp(p: u32, g: u64) -> u64 {
    let mut result = 2u64;
    for _ in 0..p {
        result = mul_mod(result, result, g);
    }
    modulo((result ^ 2) as u128, g)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_irreducible() {
        assert!(Polynomial::new(0x3DA3358B4DC173).is_irreducible());
        // x^2 + x + 1
        assert!(Polynomial::new(0b111).is_irreducible());
    }

    #[test]
    fn test_reducible_rejected() {
        // x^2 and x^2 + 1 = (x + 1)^2
        assert!(!Polynomial::new(0b100).is_irreducible());
        assert!(!Polynomial::new(0b101).is_irreducible());
        // (x^2 + x + 1)(x^3 + x + 1)
        let product = mul(0b111, 0b1011) as u64;
        assert!(!Polynomial::new(product).is_irreducible());
        assert!(!Polynomial::new(0).is_irreducible());
        assert!(!Polynomial::new(1).is_irreducible());
    }

    #[test]
    fn test_random_is_irreducible_degree_53() {
        let pol = Polynomial::random();
        assert_eq!(pol.degree(), 53);
        assert!(pol.is_irreducible());
    }

    #[test]
    fn test_degree() {
        assert_eq!(Polynomial::new(0).degree(), -1);
        assert_eq!(Polynomial::new(1).degree(), 0);
        assert_eq!(Polynomial::new(0x3DA3358B4DC173).degree(), 53);
    }
}
