//! Fixed-capacity processing-unit bit set
//!
//! Bit `i` stands for the operating system's processor number `i`, so a
//! mask can be handed to the affinity syscalls as is. Capacity is
//! [`MAX_PUS`]; setting a bit beyond that is a programming error.

use core::fmt;
use core::ops::{BitAnd, BitAndAssign, BitOr, BitOrAssign, Not};

/// Maximum number of processing units a mask can describe
pub const MAX_PUS: usize = 256;

const WORDS: usize = MAX_PUS / 64;

/// Immutable-by-convention set of PU indices
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Mask {
    words: [u64; WORDS],
}

impl Mask {
    pub const EMPTY: Mask = Mask { words: [0; WORDS] };

    #[inline]
    pub const fn new() -> Self {
        Self::EMPTY
    }

    /// Mask with exactly one PU set
    pub fn single(pu: usize) -> Self {
        let mut m = Self::EMPTY;
        m.set(pu);
        m
    }

    /// PUs `0..n`
    pub fn first_n(n: usize) -> Self {
        Self::from_pus(0..n.min(MAX_PUS))
    }

    pub fn from_pus<I: IntoIterator<Item = usize>>(pus: I) -> Self {
        let mut m = Self::EMPTY;
        for pu in pus {
            m.set(pu);
        }
        m
    }

    #[inline]
    pub fn set(&mut self, pu: usize) {
        assert!(pu < MAX_PUS, "PU index {} exceeds mask capacity {}", pu, MAX_PUS);
        self.words[pu / 64] |= 1u64 << (pu % 64);
    }

    #[inline]
    pub fn clear(&mut self, pu: usize) {
        if pu < MAX_PUS {
            self.words[pu / 64] &= !(1u64 << (pu % 64));
        }
    }

    /// Copy of `self` with `pu` added
    #[must_use]
    pub fn with(mut self, pu: usize) -> Self {
        self.set(pu);
        self
    }

    #[inline]
    pub fn test(&self, pu: usize) -> bool {
        pu < MAX_PUS && self.words[pu / 64] & (1u64 << (pu % 64)) != 0
    }

    /// Number of PUs set
    #[inline]
    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    pub fn is_subset_of(&self, other: &Mask) -> bool {
        self.words
            .iter()
            .zip(other.words.iter())
            .all(|(a, b)| a & !b == 0)
    }

    pub fn intersects(&self, other: &Mask) -> bool {
        self.words
            .iter()
            .zip(other.words.iter())
            .any(|(a, b)| a & b != 0)
    }

    /// Lowest PU set
    pub fn first(&self) -> Option<usize> {
        self.iter().next()
    }

    /// Set PUs in ascending order
    pub fn iter(&self) -> MaskIter<'_> {
        MaskIter { mask: self, word: 0, bits: self.words[0] }
    }

    /// Render as a compact list such as `0-3,8,10-11`
    pub fn to_list_string(&self) -> String {
        let mut out = String::new();
        let mut iter = self.iter().peekable();
        while let Some(start) = iter.next() {
            let mut end = start;
            while iter.peek() == Some(&(end + 1)) {
                end += 1;
                iter.next();
            }
            if !out.is_empty() {
                out.push(',');
            }
            if start == end {
                out.push_str(&start.to_string());
            } else {
                out.push_str(&format!("{}-{}", start, end));
            }
        }
        out
    }
}

/// Iterator over the PUs of a [`Mask`]
pub struct MaskIter<'a> {
    mask: &'a Mask,
    word: usize,
    bits: u64,
}

impl Iterator for MaskIter<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        loop {
            if self.bits != 0 {
                let bit = self.bits.trailing_zeros() as usize;
                self.bits &= self.bits - 1;
                return Some(self.word * 64 + bit);
            }
            self.word += 1;
            if self.word >= WORDS {
                return None;
            }
            self.bits = self.mask.words[self.word];
        }
    }
}

impl<'a> IntoIterator for &'a Mask {
    type Item = usize;
    type IntoIter = MaskIter<'a>;

    fn into_iter(self) -> MaskIter<'a> {
        self.iter()
    }
}

impl FromIterator<usize> for Mask {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        Mask::from_pus(iter)
    }
}

impl BitAnd for Mask {
    type Output = Mask;
    fn bitand(mut self, rhs: Mask) -> Mask {
        self &= rhs;
        self
    }
}

impl BitAndAssign for Mask {
    fn bitand_assign(&mut self, rhs: Mask) {
        for (a, b) in self.words.iter_mut().zip(rhs.words.iter()) {
            *a &= b;
        }
    }
}

impl BitOr for Mask {
    type Output = Mask;
    fn bitor(mut self, rhs: Mask) -> Mask {
        self |= rhs;
        self
    }
}

impl BitOrAssign for Mask {
    fn bitor_assign(&mut self, rhs: Mask) {
        for (a, b) in self.words.iter_mut().zip(rhs.words.iter()) {
            *a |= b;
        }
    }
}

/// Complement over the full mask capacity
impl Not for Mask {
    type Output = Mask;
    fn not(mut self) -> Mask {
        for w in self.words.iter_mut() {
            *w = !*w;
        }
        self
    }
}

impl fmt::Debug for Mask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Mask{{{}}}", self.to_list_string())
    }
}

impl fmt::Display for Mask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_list_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_test_count() {
        let mut m = Mask::new();
        assert!(m.is_empty());
        m.set(0);
        m.set(63);
        m.set(64);
        m.set(255);
        assert_eq!(m.count(), 4);
        assert!(m.test(64));
        assert!(!m.test(65));
        assert!(!m.test(MAX_PUS + 5));
        m.clear(63);
        assert_eq!(m.iter().collect::<Vec<_>>(), vec![0, 64, 255]);
        assert_eq!(m.first(), Some(0));
    }

    #[test]
    #[should_panic(expected = "exceeds mask capacity")]
    fn test_set_out_of_range_panics() {
        Mask::new().set(MAX_PUS);
    }

    #[test]
    fn test_set_algebra() {
        let a = Mask::from_pus([0, 1, 2, 3]);
        let b = Mask::from_pus([2, 3, 4]);
        assert_eq!(a & b, Mask::from_pus([2, 3]));
        assert_eq!(a | b, Mask::first_n(5));
        assert_eq!((!a).count(), MAX_PUS - 4);
        assert!((!a & a).is_empty());
        assert!(Mask::single(2).is_subset_of(&a));
        assert!(!b.is_subset_of(&a));
        assert!(a.intersects(&b));
        assert!(!a.intersects(&Mask::single(100)));
    }

    #[test]
    fn test_list_string() {
        let m = Mask::from_pus([0, 1, 2, 3, 8, 10, 11]);
        assert_eq!(m.to_list_string(), "0-3,8,10-11");
        assert_eq!(format!("{:?}", Mask::single(5)), "Mask{5}");
        assert_eq!(Mask::EMPTY.to_string(), "");
    }
}
