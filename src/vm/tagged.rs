use std::fmt;

// ── Tagged 32-bit value ──────────────────────────────────────────────
//
// Low bit 1  : small non-negative integer, n << 1 | 1
// Low bits 00: heap reference, index << 2
// Low bits 10: dictionary index, index << 2 | 2
//
// Every non-negative i32 fits in 31 bits. Heap and dictionary indices
// must be below 2^30.

const TAG_SMALL: u32 = 0b01;
const TAG_DICT: u32 = 0b10;
const TAG_MASK: u32 = 0b11;

/// Exclusive upper bound for heap references and dictionary indices.
pub const INDEX_LIMIT: u32 = 1 << 30;

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tagged(u32);

/// Total decode of the tag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unpacked {
    SmallInt(i32),
    Reference(u32),
    Dict(u32),
}

impl Tagged {
    pub const FALSE: Tagged = Tagged::small(0);
    pub const UNDEFINED: Tagged = Tagged(TAG_DICT);
    /// GC mark word written into every heap object header.
    pub const UNMARKED: Tagged = Tagged::small(0);

    /// Internal counters (saved bp/pc). Values above `i32::MAX` are not
    /// representable and must not be passed.
    #[inline]
    pub const fn small(n: u32) -> Tagged {
        Tagged(n << 1 | TAG_SMALL)
    }

    #[inline]
    pub fn small_int(n: i32) -> Option<Tagged> {
        if n < 0 { None } else { Some(Tagged::small(n as u32)) }
    }

    #[inline]
    pub fn reference(index: u32) -> Option<Tagged> {
        (index < INDEX_LIMIT).then(|| Tagged(index << 2))
    }

    #[inline]
    pub fn dict(index: u32) -> Option<Tagged> {
        (index < INDEX_LIMIT).then(|| Tagged(index << 2 | TAG_DICT))
    }

    #[inline]
    pub fn unpack(self) -> Unpacked {
        if self.0 & TAG_SMALL != 0 {
            Unpacked::SmallInt((self.0 >> 1) as i32)
        } else if self.0 & TAG_MASK == TAG_DICT {
            Unpacked::Dict(self.0 >> 2)
        } else {
            Unpacked::Reference(self.0 >> 2)
        }
    }

    #[inline]
    pub fn as_small_int(self) -> Option<i32> {
        match self.unpack() {
            Unpacked::SmallInt(n) => Some(n),
            _ => None,
        }
    }

    #[inline]
    pub fn as_dict(self) -> Option<u32> {
        match self.unpack() {
            Unpacked::Dict(i) => Some(i),
            _ => None,
        }
    }

    /// Raw word, for placing constants inline in the instruction stream.
    #[inline]
    pub fn to_bits(self) -> u32 {
        self.0
    }

    #[inline]
    pub fn from_bits(bits: u32) -> Tagged {
        Tagged(bits)
    }
}

impl fmt::Debug for Tagged {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.unpack() {
            Unpacked::SmallInt(n) => write!(f, "#{n}"),
            Unpacked::Reference(i) => write!(f, "@{i}"),
            Unpacked::Dict(i) => write!(f, "d{i}"),
        }
    }
}
