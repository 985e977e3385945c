//! Polynomial arithmetic over GF(2)[x].
//!
//! A [`Pol`] is a `u64` whose bits are the coefficients of a polynomial over
//! GF(2): bit i is the coefficient of x^i. Addition is XOR, multiplication is
//! shift-and-XOR, and division is long division over GF(2). Irreducibility is
//! decided with the Ben-Or test. The Rabin chunker derives its fingerprint
//! tables from these operations; key creation draws fresh random irreducible
//! polynomials of degree 53.

#![deny(unsafe_code)]

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::ops::{Add, BitXor, Mul};
use std::str::FromStr;
use thiserror::Error;

/// Errors from polynomial construction and arithmetic.
#[derive(Debug, Error)]
pub enum PolError {
    /// Product does not fit in 64 coefficient bits.
    #[error("multiplication would overflow 64-bit polynomial")]
    Overflow,
    /// Division or reduction by the zero polynomial.
    #[error("division by zero polynomial")]
    DivideByZero,
    /// The OS random source failed while drawing candidates.
    #[error("rng failure: {0}")]
    Rng(String),
    /// No irreducible polynomial was found within the retry budget.
    #[error("no irreducible polynomial found in {0} tries")]
    NoIrreducibleFound(u32),
    /// Hex form could not be parsed back into a polynomial.
    #[error("invalid polynomial hex: {0}")]
    InvalidHex(String),
}

/// Number of candidate draws before [`Pol::random_irreducible`] gives up.
///
/// Roughly 7.5% of degree-53 candidates are irreducible, so exhausting the
/// budget signals a broken random source rather than bad luck.
pub const RANDOM_IRREDUCIBLE_TRIES: u32 = 1_000_000;

/// A polynomial over GF(2) with coefficients packed into a `u64`.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pol(u64);

impl Pol {
    /// The zero polynomial.
    pub const ZERO: Pol = Pol(0);

    /// The polynomial `x`.
    pub const X: Pol = Pol(2);

    /// Construct from raw coefficient bits.
    pub const fn new(bits: u64) -> Self {
        Self(bits)
    }

    /// Raw coefficient bits.
    pub const fn bits(self) -> u64 {
        self.0
    }

    /// Degree of the polynomial, or -1 for the zero polynomial.
    pub fn deg(self) -> i32 {
        63 - self.0.leading_zeros() as i32
    }

    /// Sum (XOR) of `self` and `rhs`.
    pub fn add(self, rhs: Pol) -> Pol {
        Pol(self.0 ^ rhs.0)
    }

    /// Product of `self` and `rhs`, or [`PolError::Overflow`] when the result
    /// would exceed 64 coefficient bits.
    pub fn checked_mul(self, rhs: Pol) -> Result<Pol, PolError> {
        if self.0 == 0 || rhs.0 == 0 {
            return Ok(Pol::ZERO);
        }
        // Leading terms cannot cancel in GF(2), so the product degree is
        // exactly deg(self) + deg(rhs).
        if self.deg() + rhs.deg() > 63 {
            return Err(PolError::Overflow);
        }
        let mut res = 0u64;
        for i in 0..=rhs.deg() {
            if (rhs.0 >> i) & 1 == 1 {
                res ^= self.0 << i;
            }
        }
        Ok(Pol(res))
    }

    /// Quotient and remainder of `self` divided by `d`.
    pub fn divmod(self, d: Pol) -> Result<(Pol, Pol), PolError> {
        if d.0 == 0 {
            return Err(PolError::DivideByZero);
        }
        Ok(self.divmod_nonzero(d))
    }

    /// Quotient of `self` divided by `d`.
    pub fn div(self, d: Pol) -> Result<Pol, PolError> {
        Ok(self.divmod(d)?.0)
    }

    /// Remainder of `self` modulo `d`.
    pub fn rem(self, d: Pol) -> Result<Pol, PolError> {
        Ok(self.divmod(d)?.1)
    }

    // Long division with a guaranteed nonzero divisor.
    fn divmod_nonzero(self, d: Pol) -> (Pol, Pol) {
        debug_assert!(d.0 != 0);
        if self.0 == 0 {
            return (Pol::ZERO, Pol::ZERO);
        }
        let big_d = d.deg();
        let mut x = self.0;
        let mut q = 0u64;
        loop {
            let diff = Pol(x).deg() - big_d;
            if diff < 0 {
                return (Pol(q), Pol(x));
            }
            q |= 1 << diff;
            x ^= d.0 << diff;
        }
    }

    fn rem_nonzero(self, d: Pol) -> Pol {
        self.divmod_nonzero(d).1
    }

    /// Greatest common divisor of `self` and `f`.
    pub fn gcd(self, f: Pol) -> Pol {
        let (mut x, mut f) = (self, f);
        while f.0 != 0 {
            let r = x.rem_nonzero(f);
            x = f;
            f = r;
        }
        x
    }

    /// `(self * f) mod g`, computed bit by bit so intermediate products never
    /// overflow the 64 coefficient bits.
    pub fn mul_mod(self, f: Pol, g: Pol) -> Result<Pol, PolError> {
        if g.0 == 0 {
            return Err(PolError::DivideByZero);
        }
        if self.0 == 0 || f.0 == 0 {
            return Ok(Pol::ZERO);
        }
        let mut res = Pol::ZERO;
        for i in 0..=f.deg() {
            if (f.0 >> i) & 1 == 1 {
                let mut a = self;
                for _ in 0..i {
                    a = Pol(a.0 << 1).rem_nonzero(g);
                }
                res = res.add(a).rem_nonzero(g);
            }
        }
        Ok(res)
    }

    // x^(2^p) + x, reduced modulo g, by repeated squaring.
    fn qp(p: u32, g: Pol) -> Result<Pol, PolError> {
        let num = 1u64 << p;
        let mut i = 1u64;
        let mut res = Pol::X;
        while i < num {
            res = res.mul_mod(res, g)?;
            i *= 2;
        }
        Ok(res.add(Pol::X).rem(g)?)
    }

    /// Ben-Or irreducibility test: `self` is irreducible iff
    /// `gcd(self, x^(2^i) - x mod self) == 1` for all `i` in `1..=deg/2`.
    pub fn irreducible(self) -> bool {
        if self.deg() < 1 {
            return false;
        }
        for i in 1..=(self.deg() / 2) as u32 {
            // qp cannot fail here: self is nonzero.
            let Ok(q) = Self::qp(i, self) else {
                return false;
            };
            if self.gcd(q) != Pol(1) {
                return false;
            }
        }
        true
    }

    /// Draw a random irreducible polynomial of degree 53 from the OS random
    /// source.
    ///
    /// Each candidate is masked to 54 bits with bit 53 and bit 0 forced set,
    /// fixing the degree at 53 and excluding the trivial factor x. Retries up
    /// to [`RANDOM_IRREDUCIBLE_TRIES`] times before reporting
    /// [`PolError::NoIrreducibleFound`].
    pub fn random_irreducible() -> Result<Pol, PolError> {
        Self::random_irreducible_from(&mut OsRng)
    }

    /// [`Pol::random_irreducible`] with a caller-supplied random source.
    pub fn random_irreducible_from<R: RngCore>(rng: &mut R) -> Result<Pol, PolError> {
        for _ in 0..RANDOM_IRREDUCIBLE_TRIES {
            let mut buf = [0u8; 8];
            rng.try_fill_bytes(&mut buf).map_err(|e| PolError::Rng(e.to_string()))?;
            let mut f = u64::from_le_bytes(buf);
            f &= (1 << 54) - 1;
            f |= (1 << 53) | 1;
            let pol = Pol(f);
            if pol.irreducible() {
                return Ok(pol);
            }
        }
        Err(PolError::NoIrreducibleFound(RANDOM_IRREDUCIBLE_TRIES))
    }

    /// Parse from the lowercase hex form used in persisted key files.
    pub fn from_hex(s: &str) -> Result<Self, PolError> {
        u64::from_str_radix(s, 16).map(Pol).map_err(|_| PolError::InvalidHex(s.to_owned()))
    }
}

impl fmt::Debug for Pol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pol({:x})", self.0)
    }
}

impl fmt::Display for Pol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

impl fmt::LowerHex for Pol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

impl From<u64> for Pol {
    fn from(bits: u64) -> Self {
        Pol(bits)
    }
}

impl From<Pol> for u64 {
    fn from(p: Pol) -> Self {
        p.0
    }
}

impl Add for Pol {
    type Output = Pol;

    fn add(self, rhs: Pol) -> Pol {
        Pol::add(self, rhs)
    }
}

impl BitXor for Pol {
    type Output = Pol;

    fn bitxor(self, rhs: Pol) -> Pol {
        Pol::add(self, rhs)
    }
}

impl Mul for Pol {
    type Output = Pol;

    /// Product of two polynomials. Panics on overflow; use
    /// [`Pol::checked_mul`] when the degrees are not known to fit.
    fn mul(self, rhs: Pol) -> Pol {
        match self.checked_mul(rhs) {
            Ok(p) => p,
            Err(e) => panic!("{e}"),
        }
    }
}

impl FromStr for Pol {
    type Err = PolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

// Rendered as lowercase hex without a 0x prefix when embedded in JSON.
impl Serialize for Pol {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{:x}", self.0))
    }
}

impl<'de> Deserialize<'de> for Pol {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Pol::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const POLY: Pol = Pol::new(0x3DA3358B4DC173);

    #[test]
    fn degree() {
        assert_eq!(Pol::ZERO.deg(), -1);
        assert_eq!(Pol::new(1).deg(), 0);
        assert_eq!(Pol::X.deg(), 1);
        assert_eq!(POLY.deg(), 53);
        assert_eq!(Pol::new(u64::MAX).deg(), 63);
    }

    #[test]
    fn add_is_xor() {
        assert_eq!(Pol::new(0b1011) + Pol::new(0b0110), Pol::new(0b1101));
        assert_eq!(POLY + POLY, Pol::ZERO);
    }

    #[test]
    fn mul_known_products() {
        assert_eq!(Pol::new(0x23) * Pol::new(0x2), Pol::new(0x46));
        assert_eq!(Pol::new(0x2) * Pol::new(0x23), Pol::new(0x46));
        assert_eq!(Pol::new(0x3f2) * Pol::new(0x21), Pol::new(0x7db2));
        assert_eq!(Pol::new(0x3) * Pol::new(0x3), Pol::new(0x5));
    }

    #[test]
    fn mul_overflow_is_reported() {
        let big = Pol::new(1 << 63);
        assert!(matches!(big.checked_mul(Pol::X), Err(PolError::Overflow)));
        assert_eq!(big.checked_mul(Pol::new(1)).unwrap(), big);
    }

    #[test]
    fn divmod_known_values() {
        let (q, r) = Pol::new(0x40000000000000).divmod(POLY).unwrap();
        assert_eq!(q, Pol::new(0x3));
        assert_eq!(r, Pol::new(0x6e55e9dd64395));

        let (q, r) = Pol::new(0x943ae).divmod(Pol::new(0x64)).unwrap();
        assert_eq!(q, Pol::new(0x3b28));
        assert_eq!(r, Pol::new(0xe));
    }

    #[test]
    fn divide_by_zero_is_reported() {
        assert!(matches!(POLY.divmod(Pol::ZERO), Err(PolError::DivideByZero)));
        assert!(matches!(POLY.rem(Pol::ZERO), Err(PolError::DivideByZero)));
    }

    #[test]
    fn gcd_known_values() {
        assert_eq!(POLY.gcd(Pol::new(0x3da3358b4dc171)), Pol::new(1));
        assert_eq!(Pol::new(0x230).gcd(Pol::new(0x50)), Pol::new(0x10));
        assert_eq!(Pol::ZERO.gcd(POLY), POLY);
        assert_eq!(POLY.gcd(Pol::ZERO), POLY);
    }

    #[test]
    fn mul_mod_known_values() {
        assert_eq!(
            Pol::new(0x1230).mul_mod(Pol::new(0x230), Pol::new(0x55)).unwrap(),
            Pol::new(0x22)
        );
        let a = Pol::new(0x9999999999999999 & ((1 << 63) - 1));
        let b = Pol::new(0x7777777777777777 & ((1 << 63) - 1));
        assert_eq!(a.mul_mod(b, POLY).unwrap(), Pol::new(0x186af0ee72fe76));
    }

    #[test]
    fn irreducibility() {
        assert!(POLY.irreducible());
        assert!(Pol::new(0x3).irreducible());
        assert!(Pol::new(0x7).irreducible());
        assert!(Pol::new(0xb).irreducible());
        assert!(!Pol::new(0x3da3358b4dc171).irreducible());
        assert!(!Pol::new(0x38f1e565e6e64e1).irreducible());
        assert!(!Pol::new(0x20000000000009).irreducible());
        assert!(!Pol::new(0x53).irreducible());
        assert!(!Pol::ZERO.irreducible());
        assert!(!Pol::new(1).irreducible());
    }

    #[test]
    fn random_irreducible_has_fixed_shape() {
        let pol = Pol::random_irreducible().unwrap();
        assert_eq!(pol.deg(), 53);
        assert_eq!(pol.bits() & 1, 1);
        assert!(pol.irreducible());
    }

    #[test]
    fn hex_json_roundtrip() {
        let json = serde_json::to_string(&POLY).unwrap();
        assert_eq!(json, "\"3da3358b4dc173\"");
        let back: Pol = serde_json::from_str(&json).unwrap();
        assert_eq!(back, POLY);
        assert!(serde_json::from_str::<Pol>("\"zz\"").is_err());
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn mul_then_div_roundtrips(a in 1u64..=u32::MAX as u64, b in 1u64..=u32::MAX as u64) {
                let (a, b) = (Pol::new(a), Pol::new(b));
                let product = a.checked_mul(b).unwrap();
                let (q, r) = product.divmod(b).unwrap();
                prop_assert_eq!(q, a);
                prop_assert_eq!(r, Pol::ZERO);
            }

            #[test]
            fn divmod_reconstructs(x in any::<u64>(), d in 1u64..=u32::MAX as u64) {
                let (x, d) = (Pol::new(x), Pol::new(d));
                let (q, r) = x.divmod(d).unwrap();
                prop_assert!(r.deg() < d.deg());
                let back = q.checked_mul(d).unwrap().add(r);
                prop_assert_eq!(back, x);
            }

            #[test]
            fn gcd_divides_both(a in 1u64..=u32::MAX as u64, b in 1u64..=u32::MAX as u64) {
                let (a, b) = (Pol::new(a), Pol::new(b));
                let g = a.gcd(b);
                prop_assert_eq!(a.rem(g).unwrap(), Pol::ZERO);
                prop_assert_eq!(b.rem(g).unwrap(), Pol::ZERO);
                prop_assert_eq!(g, b.gcd(a));
            }

            #[test]
            fn mul_mod_matches_wide_mul(a in 1u64..=u32::MAX as u64, b in 1u64..=u32::MAX as u64) {
                let (a, b) = (Pol::new(a), Pol::new(b));
                let expect = a.checked_mul(b).unwrap().rem(POLY).unwrap();
                prop_assert_eq!(a.mul_mod(b, POLY).unwrap(), expect);
            }
        }
    }
}
