//! The per-block validity bitmap and its prefix-sum index.

/// Default bitmap stride factor: one prefix-sum checkpoint per 1024 blocks.
pub const DEFAULT_FACTOR: u32 = 10;

/// An expanded (one byte per block) validity bitmap plus a prefix-sum table
/// for O(2^factor) logical-block -> preceding-captured-count translation.
#[derive(Debug)]
pub struct Bitmap {
    /// One entry per logical block: `1` if captured, `0` otherwise. Any
    /// value other than `1` is treated as not captured.
    bits: Vec<u8>,
    /// `prefix[k]` = count of captured blocks strictly preceding logical
    /// block `k << factor`.
    prefix: Vec<u64>,
    factor: u32,
}

impl Bitmap {
    /// Build the prefix-sum index over an already-expanded byte-per-block
    /// bitmap. `bits[i]` must already have been normalized so that `1` means
    /// captured and anything else means not (both the v1 byte-per-block
    /// loader and the v2 bit-expansion loader do this at read time).
    pub fn from_expanded(bits: Vec<u8>, factor: u32) -> Self {
        let stride = 1u64 << factor;
        let total_blocks = bits.len() as u64;
        let num_entries = (total_blocks >> factor) + 1;
        let mut prefix = vec![0u64; num_entries as usize];

        let mut nset = 0u64;
        for (i, &b) in bits.iter().enumerate() {
            let i = i as u64;
            if i & (stride - 1) == 0 {
                prefix[(i >> factor) as usize] = nset;
            }
            if b == 1 {
                nset += 1;
            }
        }
        // When total_blocks is an exact multiple of the stride, the loop
        // above never visits the final checkpoint (it only ever runs for
        // i < total_blocks). Fill it in explicitly so that
        // `captured_in_prefix(total_blocks)` — a legal query, since seeking
        // to `total_blocks` itself is the defined EOF cursor — returns the
        // true total rather than a leftover zero.
        if total_blocks & (stride - 1) == 0 {
            let last = (total_blocks >> factor) as usize;
            prefix[last] = nset;
        }

        Bitmap {
            bits,
            prefix,
            factor,
        }
    }

    pub fn factor(&self) -> u32 {
        self.factor
    }

    pub fn len(&self) -> u64 {
        self.bits.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    pub fn is_captured(&self, block: u64) -> bool {
        self.bits[block as usize] == 1
    }

    /// Count of captured blocks in `[0, block)`.
    pub fn captured_in_prefix(&self, block: u64) -> u64 {
        let stride = 1u64 << self.factor;
        let checkpoint = self.prefix[(block >> self.factor) as usize];
        let stride_start = block & !(stride - 1);
        let tail = (stride_start..block).filter(|&i| self.bits[i as usize] == 1).count() as u64;
        checkpoint + tail
    }

    pub fn into_raw_bytes(self) -> Vec<u8> {
        self.bits
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(bits: &[u8]) -> Bitmap {
        Bitmap::from_expanded(bits.to_vec(), DEFAULT_FACTOR)
    }

    #[test]
    fn prefix_matches_direct_popcount_small() {
        let bits = [1, 0, 1, 0, 1, 1, 0, 0];
        let bmp = build(&bits);
        for b in 0..=bits.len() as u64 {
            let direct = bits[..b as usize].iter().filter(|&&v| v == 1).count() as u64;
            assert_eq!(bmp.captured_in_prefix(b), direct, "mismatch at b={b}");
        }
    }

    #[test]
    fn prefix_sums_are_monotonic() {
        let bits: Vec<u8> = (0..4096u32).map(|i| (i % 7 == 0) as u8).collect();
        let bmp = build(&bits);
        for k in 0..bmp.prefix.len() - 1 {
            assert!(bmp.prefix[k] <= bmp.prefix[k + 1]);
        }
    }

    #[test]
    fn every_seventh_entry_over_4096_blocks() {
        let bits: Vec<u8> = (0..4096u32).map(|i| (i % 7 == 0) as u8).collect();
        let expected_total = bits.iter().filter(|&&v| v == 1).count() as u64;
        let bmp = build(&bits);
        assert_eq!(bmp.captured_in_prefix(4096), expected_total);

        for b in 0..=4096u64 {
            let stride = 1u64 << DEFAULT_FACTOR;
            let checkpoint_block = b & !(stride - 1);
            let direct = bits[..checkpoint_block as usize]
                .iter()
                .filter(|&&v| v == 1)
                .count() as u64
                + bits[checkpoint_block as usize..b as usize]
                    .iter()
                    .filter(|&&v| v == 1)
                    .count() as u64;
            assert_eq!(bmp.captured_in_prefix(b), direct);
        }
    }

    #[test]
    fn non_one_byte_values_are_treated_as_not_captured() {
        let bits = [1, 2, 0, 255, 1];
        let bmp = build(&bits);
        assert!(bmp.is_captured(0));
        assert!(!bmp.is_captured(1));
        assert!(!bmp.is_captured(3));
        assert!(bmp.is_captured(4));
        assert_eq!(bmp.captured_in_prefix(5), 2);
    }
}
