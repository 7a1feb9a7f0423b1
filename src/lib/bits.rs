use log::trace;

/// A bit vector with a parallel override mask.
///
/// `data` holds the bit values; `mask` records which bits have been
/// explicitly written. Defaults are applied through `set_default_bits`,
/// which never touches the mask, so an explicit write always wins over a
/// default regardless of ordering.
///
/// Bit `i` lives in word `i / 32` at position `i % 32`, so `words()` yields
/// the 32-bit groups in ascending bit order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bits {
    data: Vec<u32>,
    mask: Vec<u32>,
    len: usize,
}

impl Bits {
    /// A zeroed, unmasked vector of `len` bits.
    pub fn new(len: usize) -> Self {
        let words = (len + 31) / 32;
        Self {
            data: vec![0; words],
            mask: vec![0; words],
            len,
        }
    }

    /// An empty vector to be grown with `append_bits`.
    pub fn empty() -> Self {
        Self::new(0)
    }

    /// Length in bits.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Write `value` into the inclusive bit span `[hi..lo]` and mark those
    /// bits as explicitly set. The value is truncated to the span width,
    /// which is also how negative two's-complement values land correctly.
    pub fn set_bits(&mut self, hi: usize, lo: usize, value: u64) {
        self.check_span(hi, lo);
        trace!("set bits [{hi}:{lo}] = {value:#x}");
        for (i, bit) in (lo..=hi).enumerate() {
            self.write_bit(bit, (value >> i) & 1 == 1);
            self.mask[bit / 32] |= 1 << (bit % 32);
        }
    }

    /// Write `value` into `[hi..lo]`, skipping any bit that has been
    /// explicitly set. The mask is left untouched, so defaults never block
    /// a later explicit write.
    pub fn set_default_bits(&mut self, hi: usize, lo: usize, value: u64) {
        self.check_span(hi, lo);
        for (i, bit) in (lo..=hi).enumerate() {
            if !self.bit_masked(bit) {
                self.write_bit(bit, (value >> i) & 1 == 1);
            }
        }
    }

    /// Read the inclusive bit span `[hi..lo]`.
    pub fn get_bits(&self, hi: usize, lo: usize) -> u64 {
        self.check_span(hi, lo);
        let mut value = 0;
        for (i, bit) in (lo..=hi).enumerate() {
            value |= (self.read_bit(bit) as u64) << i;
        }
        value
    }

    /// True if any bit in the span has been explicitly set.
    pub fn any_masked(&self, hi: usize, lo: usize) -> bool {
        self.check_span(hi, lo);
        (lo..=hi).any(|bit| self.bit_masked(bit))
    }

    /// True if every bit in the span has been explicitly set.
    pub fn all_masked(&self, hi: usize, lo: usize) -> bool {
        self.check_span(hi, lo);
        (lo..=hi).all(|bit| self.bit_masked(bit))
    }

    /// Grow the vector by `width` bits holding `value` (explicitly set).
    pub fn append_bits(&mut self, width: usize, value: u64) {
        assert!(width <= 64, "append span too wide: {width}");
        let lo = self.len;
        self.len += width;
        let words = (self.len + 31) / 32;
        self.data.resize(words, 0);
        self.mask.resize(words, 0);
        if width > 0 {
            self.set_bits(self.len - 1, lo, value);
        }
    }

    /// A copy of `self` with `other`'s explicitly-set bits written over it.
    /// Both vectors must be the same length.
    pub fn overlaid(&self, other: &Bits) -> Bits {
        assert_eq!(self.len, other.len, "overlay length mismatch");
        let mut out = self.clone();
        for bit in 0..self.len {
            if other.bit_masked(bit) {
                out.write_bit(bit, other.read_bit(bit));
                out.mask[bit / 32] |= 1 << (bit % 32);
            }
        }
        out
    }

    /// The packed 32-bit groups, group 0 first.
    pub fn words(&self) -> &[u32] {
        &self.data
    }

    fn check_span(&self, hi: usize, lo: usize) {
        assert!(lo <= hi, "inverted bit span [{hi}:{lo}]");
        assert!(hi < self.len, "bit span [{hi}:{lo}] out of range {}", self.len);
        assert!(hi - lo < 64, "bit span [{hi}:{lo}] too wide");
    }

    fn write_bit(&mut self, bit: usize, value: bool) {
        let word = bit / 32;
        let pos = bit % 32;
        if value {
            self.data[word] |= 1 << pos;
        } else {
            self.data[word] &= !(1 << pos);
        }
    }

    fn read_bit(&self, bit: usize) -> bool {
        self.data[bit / 32] >> (bit % 32) & 1 == 1
    }

    fn bit_masked(&self, bit: usize) -> bool {
        self.mask[bit / 32] >> (bit % 32) & 1 == 1
    }
}
