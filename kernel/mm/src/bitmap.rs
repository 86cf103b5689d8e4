//! Hierarchical order bitmaps over a raw storage window.
//!
//! One bit per order-`k` block for every order in `0..=MAX_ORDER`, packed
//! MSB-first into 64-bit words: bit `i` of an order lives in word `i >> 6`
//! under the mask `1 << (63 - (i & 63))`. Bit value 1 means the block is
//! reserved (allocated, covering non-RAM, or covering this window itself);
//! 0 means free.
//!
//! The window is a single contiguous run of words carved out of an
//! available region at boot; each order's bitmap is addressed through a
//! computed word offset rather than a separate slice.

use crate::{MAX_ORDER, ORDER_COUNT};

/// Bits per bitmap word.
pub(crate) const BITS_PER_WORD: usize = 64;

/// Number of blocks at `order` for a machine with `pages` pages.
///
/// The trailing block is counted even when it only partially covers memory;
/// its bit is seeded reserved and never cleared.
pub(crate) const fn blocks_for_order(pages: usize, order: usize) -> usize {
    (pages + (1 << order) - 1) >> order
}

/// Number of 64-bit words in the order-`order` bitmap for `pages` pages.
pub(crate) const fn words_for_order(pages: usize, order: usize) -> usize {
    blocks_for_order(pages, order).div_ceil(BITS_PER_WORD)
}

/// Total bitmap footprint in bytes for a machine with `pages` pages, over
/// all `MAX_ORDER + 1` orders.
pub(crate) const fn footprint(pages: usize) -> usize {
    let mut words = 0;
    let mut order = 0;
    while order <= MAX_ORDER {
        words += words_for_order(pages, order);
        order += 1;
    }
    words * core::mem::size_of::<u64>()
}

/// MSB-first single-bit mask for block index `index` within its word.
const fn bit_mask(index: usize) -> u64 {
    1 << (63 - (index & (BITS_PER_WORD - 1)))
}

/// MSB-first mask covering `len` bits starting `offset` bits into a word.
///
/// `len` must be in `1..=64` and `offset + len` must not exceed 64.
const fn run_mask(offset: usize, len: usize) -> u64 {
    let bits = u64::MAX >> (BITS_PER_WORD - len);
    bits << (BITS_PER_WORD - offset - len)
}

/// Location of one order's bitmap inside the shared window.
#[derive(Debug, Clone, Copy, Default)]
struct OrderSpan {
    /// Word offset of this order's first word within the window.
    offset: usize,
    /// Word count (block count rounded up to a whole word).
    words: usize,
    /// Number of real blocks at this order. Trailing pad bits up to the
    /// word boundary stay permanently set.
    blocks: usize,
}

/// Typed view over the bitmap storage window.
///
/// Owns the window exclusively for the life of the kernel. All indexing is
/// explicit through the per-order spans; nothing outside this module knows
/// the layout.
pub(crate) struct OrderBitmaps {
    words: &'static mut [u64],
    spans: [OrderSpan; ORDER_COUNT],
}

impl OrderBitmaps {
    /// Carves `window` into per-order slabs for `pages` pages and seeds
    /// every bit, including trailing padding, as reserved.
    ///
    /// `window` must span exactly `footprint(pages)` bytes.
    pub(crate) fn install(window: &'static mut [u64], pages: usize) -> Self {
        let mut spans = [OrderSpan::default(); ORDER_COUNT];
        let mut offset = 0;
        for (order, span) in spans.iter_mut().enumerate() {
            let words = words_for_order(pages, order);
            *span = OrderSpan {
                offset,
                words,
                blocks: blocks_for_order(pages, order),
            };
            offset += words;
        }
        debug_assert_eq!(offset, window.len(), "window does not match footprint");

        window.fill(u64::MAX);
        Self {
            words: window,
            spans,
        }
    }

    /// Number of real blocks at `order`.
    #[inline]
    pub(crate) fn blocks(&self, order: usize) -> usize {
        self.spans[order].blocks
    }

    /// Returns whether the bit for block `index` at `order` is set.
    #[inline]
    pub(crate) fn is_set(&self, order: usize, index: usize) -> bool {
        let span = self.spans[order];
        debug_assert!(index < span.blocks, "block index out of range");
        self.words[span.offset + (index >> 6)] & bit_mask(index) != 0
    }

    /// Sets the bit for block `index` at `order`. Returns `true` if the bit
    /// actually changed.
    pub(crate) fn set(&mut self, order: usize, index: usize) -> bool {
        let span = self.spans[order];
        debug_assert!(index < span.blocks, "block index out of range");
        let word = &mut self.words[span.offset + (index >> 6)];
        let changed = *word & bit_mask(index) == 0;
        *word |= bit_mask(index);
        changed
    }

    /// Clears the bit for block `index` at `order`. Returns `true` if the
    /// bit actually changed.
    pub(crate) fn clear(&mut self, order: usize, index: usize) -> bool {
        let span = self.spans[order];
        debug_assert!(index < span.blocks, "block index out of range");
        let word = &mut self.words[span.offset + (index >> 6)];
        let changed = *word & bit_mask(index) != 0;
        *word &= !bit_mask(index);
        changed
    }

    /// Sets a run of `count` bits starting at block `index`, returning how
    /// many flipped 0 to 1.
    pub(crate) fn set_run(&mut self, order: usize, index: usize, count: usize) -> usize {
        self.apply_run(order, index, count, true)
    }

    /// Clears a run of `count` bits starting at block `index`, returning
    /// how many flipped 1 to 0.
    pub(crate) fn clear_run(&mut self, order: usize, index: usize, count: usize) -> usize {
        self.apply_run(order, index, count, false)
    }

    fn apply_run(&mut self, order: usize, index: usize, count: usize, set: bool) -> usize {
        let span = self.spans[order];
        debug_assert!(index + count <= span.blocks, "bit run out of range");

        let mut changed = 0;
        let mut index = index;
        let mut remaining = count;
        while remaining > 0 {
            let offset = index & (BITS_PER_WORD - 1);
            let len = remaining.min(BITS_PER_WORD - offset);
            let mask = run_mask(offset, len);
            let word = &mut self.words[span.offset + (index >> 6)];
            if set {
                changed += (!*word & mask).count_ones() as usize;
                *word |= mask;
            } else {
                changed += (*word & mask).count_ones() as usize;
                *word &= !mask;
            }
            index += len;
            remaining -= len;
        }
        changed
    }

    /// Finds the first free bit at `order` (lowest block index), sets it,
    /// and returns its index. Fully-reserved words are skipped whole.
    ///
    /// Returns `None` when every block at `order` is reserved.
    pub(crate) fn reserve_first_free(&mut self, order: usize) -> Option<usize> {
        let span = self.spans[order];
        for w in 0..span.words {
            let word = self.words[span.offset + w];
            if word == u64::MAX {
                continue;
            }
            // MSB-first: the leading zero of the inverted word is the free
            // bit with the lowest block index.
            let bit = (!word).leading_zeros() as usize;
            let index = (w << 6) + bit;
            // Pad bits are permanently set, so a found bit is a real block.
            debug_assert!(index < span.blocks);
            self.words[span.offset + w] |= bit_mask(index);
            return Some(index);
        }
        None
    }

    /// Number of free (zero) bits at `order`. Pad bits are always set and
    /// never counted.
    pub(crate) fn count_free(&self, order: usize) -> usize {
        let span = self.spans[order];
        self.words[span.offset..span.offset + span.words]
            .iter()
            .map(|w| w.count_zeros() as usize)
            .sum()
    }

    /// The raw window contents, for state snapshots in tests.
    #[cfg(test)]
    pub(crate) fn raw_words(&self) -> &[u64] {
        self.words
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window_for(pages: usize) -> &'static mut [u64] {
        let words = footprint(pages) / core::mem::size_of::<u64>();
        Box::leak(vec![0u64; words].into_boxed_slice())
    }

    #[test]
    fn words_per_order_round_up() {
        // 4096 pages: 64 words at order 0, halving until a single word
        // suffices from order 6 on.
        assert_eq!(words_for_order(4096, 0), 64);
        assert_eq!(words_for_order(4096, 1), 32);
        assert_eq!(words_for_order(4096, 5), 2);
        assert_eq!(words_for_order(4096, 6), 1);
        assert_eq!(words_for_order(4096, 10), 1);

        // A non-multiple block count still occupies a whole word.
        assert_eq!(blocks_for_order(70, 0), 70);
        assert_eq!(words_for_order(70, 0), 2);
        assert_eq!(blocks_for_order(70, 1), 35);
        assert_eq!(words_for_order(70, 1), 1);
    }

    #[test]
    fn footprint_sums_all_orders() {
        // 4096 pages: 64+32+16+8+4+2+1+1+1+1+1 = 131 words.
        assert_eq!(footprint(4096), 131 * 8);
    }

    #[test]
    fn masks_follow_msb_first_convention() {
        assert_eq!(bit_mask(0), 1 << 63);
        assert_eq!(bit_mask(63), 1);
        assert_eq!(bit_mask(64), 1 << 63);
        assert_eq!(run_mask(0, 64), u64::MAX);
        assert_eq!(run_mask(0, 1), 1 << 63);
        assert_eq!(run_mask(62, 2), 0b11);
        assert_eq!(run_mask(1, 2), 0b11 << 61);
    }

    #[test]
    fn install_seeds_everything_reserved() {
        let bitmaps = OrderBitmaps::install(window_for(4096), 4096);
        for order in 0..=MAX_ORDER {
            assert_eq!(bitmaps.count_free(order), 0);
        }
        assert_eq!(bitmaps.blocks(0), 4096);
        assert_eq!(bitmaps.blocks(MAX_ORDER), 4);
    }

    #[test]
    fn set_clear_report_changes() {
        let mut bitmaps = OrderBitmaps::install(window_for(4096), 4096);
        assert!(bitmaps.clear(0, 130));
        assert!(!bitmaps.clear(0, 130));
        assert!(!bitmaps.is_set(0, 130));
        assert_eq!(bitmaps.count_free(0), 1);

        assert!(bitmaps.set(0, 130));
        assert!(!bitmaps.set(0, 130));
        assert!(bitmaps.is_set(0, 130));
        assert_eq!(bitmaps.count_free(0), 0);
    }

    #[test]
    fn clear_uses_msb_first_layout() {
        let mut bitmaps = OrderBitmaps::install(window_for(4096), 4096);
        bitmaps.clear(0, 0);
        assert_eq!(bitmaps.raw_words()[0], !(1 << 63));
        bitmaps.clear(0, 65);
        assert_eq!(bitmaps.raw_words()[1], !(1 << 62));
    }

    #[test]
    fn runs_cross_word_boundaries() {
        let mut bitmaps = OrderBitmaps::install(window_for(4096), 4096);
        assert_eq!(bitmaps.clear_run(0, 60, 10), 10);
        assert_eq!(bitmaps.count_free(0), 10);
        // Re-clearing flips nothing.
        assert_eq!(bitmaps.clear_run(0, 60, 10), 0);

        // Overlapping set counts only the bits that actually flip.
        assert_eq!(bitmaps.set_run(0, 64, 8), 6);
        assert_eq!(bitmaps.count_free(0), 4);
        assert_eq!(bitmaps.set_run(0, 60, 4), 4);
        assert_eq!(bitmaps.count_free(0), 0);
    }

    #[test]
    fn whole_word_runs() {
        let mut bitmaps = OrderBitmaps::install(window_for(16384), 16384);
        assert_eq!(bitmaps.clear_run(0, 0, 1024), 1024);
        assert_eq!(bitmaps.count_free(0), 1024);
        assert_eq!(bitmaps.set_run(0, 0, 1024), 1024);
        assert_eq!(bitmaps.count_free(0), 0);
    }

    #[test]
    fn reserve_scans_lowest_index_first() {
        let mut bitmaps = OrderBitmaps::install(window_for(4096), 4096);
        assert_eq!(bitmaps.reserve_first_free(0), None);

        bitmaps.clear(0, 130);
        bitmaps.clear(0, 700);
        // Word 0 and word 1 are fully reserved and must be skipped.
        assert_eq!(bitmaps.reserve_first_free(0), Some(130));
        assert_eq!(bitmaps.reserve_first_free(0), Some(700));
        assert_eq!(bitmaps.reserve_first_free(0), None);
    }

    #[test]
    fn pad_bits_stay_reserved() {
        // 70 pages: order 0 occupies two words with 58 pad bits.
        let mut bitmaps = OrderBitmaps::install(window_for(70), 70);
        assert_eq!(bitmaps.clear_run(0, 0, 70), 70);
        assert_eq!(bitmaps.count_free(0), 70);
        // Bits 64..69 cleared, 70..127 still set.
        assert_eq!(bitmaps.raw_words()[1], !run_mask(0, 6));

        for _ in 0..70 {
            assert!(bitmaps.reserve_first_free(0).is_some());
        }
        // Only the 70 real blocks were reservable.
        assert_eq!(bitmaps.reserve_first_free(0), None);
    }
}
