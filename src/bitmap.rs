use num::Integer;

/// A packed bit vector with a fixed logical length, bit `i` lives in byte `i / 8` at position `i % 8` (the layout of
/// ext2's block and inode bitmaps).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Bitmap {
    data: Vec<u8>,
    len: usize,
}

impl Bitmap {
    /// Creates a bitmap of `len` bits, all unset.
    pub fn new(len: usize) -> Self {
        Self { data: vec![0; Integer::div_ceil(&len, &8)], len }
    }

    /// Wraps the first `len` bits of `bytes`; any bits beyond `len` are dropped.
    /// PANICS: Panics if `bytes` holds fewer than `len` bits.
    pub fn from_bytes(bytes: &[u8], len: usize) -> Self {
        let byte_len = Integer::div_ceil(&len, &8);
        assert!(
            bytes.len() >= byte_len,
            "Attempted to create a bitmap of {} bits from {} bytes",
            len,
            bytes.len()
        );
        let mut instance = Self { data: bytes[..byte_len].to_vec(), len };
        instance.clear_tail();
        instance
    }

    /// PANICS: Panics if `idx` out of bounds
    pub fn get(&self, idx: usize) -> bool {
        self.check_bounds(idx);
        let (data_idx, bit_idx) = idx.div_rem(&8);
        self.data[data_idx] & (1 << bit_idx) != 0
    }

    /// PANICS: Panics if `idx` out of bounds
    pub fn set(&mut self, idx: usize) {
        self.check_bounds(idx);
        let (data_idx, bit_idx) = idx.div_rem(&8);
        self.data[data_idx] |= 1 << bit_idx;
    }

    /// PANICS: Panics if `idx` out of bounds
    pub fn clear(&mut self, idx: usize) {
        self.check_bounds(idx);
        let (data_idx, bit_idx) = idx.div_rem(&8);
        self.data[data_idx] &= !(1 << bit_idx);
    }

    pub fn clear_all(&mut self) {
        self.data.fill(0);
    }

    /// Returns the index of the first unset bit at or after `from`, or None if every remaining bit is set.
    pub fn next_unset(&self, from: usize) -> Option<usize> {
        let mut idx = from;
        while idx < self.len {
            let (data_idx, bit_idx) = idx.div_rem(&8);
            let byte = self.data[data_idx];
            if bit_idx == 0 && byte == u8::MAX {
                idx += 8;
                continue;
            }
            if byte & (1 << bit_idx) == 0 {
                return Some(idx);
            }
            idx += 1;
        }
        None
    }

    pub fn count_set(&self) -> usize {
        self.data.iter().map(|byte| byte.count_ones() as usize).sum()
    }

    /// The packed bytes, `ceil(len / 8)` of them.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.len
    }

    fn check_bounds(&self, idx: usize) {
        assert!(idx < self.len, "Bit {} out of bounds for bitmap of length {}", idx, self.len);
    }

    // bits past `len` in the last byte must never count as set
    fn clear_tail(&mut self) {
        let used_bits = self.len % 8;
        if used_bits != 0 {
            if let Some(last) = self.data.last_mut() {
                *last &= (1u8 << used_bits) - 1;
            }
        }
    }
}
