//! Near-even work partitioning
//!
//! `n` items are split into `parts` contiguous chunks. Every chunk gets
//! `n / parts`; the remainder is handed out two at a time to the leading
//! chunks, and an odd leftover goes to the chunk after them. Chunks always
//! sum to `n` and none exceeds `ceil(n / parts) + 1`.
//!
//! A `parts` of zero is treated as one.

use std::ops::Range;

/// Size of chunk `index`
pub fn chunk_size(n: usize, parts: usize, index: usize) -> usize {
    let parts = parts.max(1);
    if index >= parts {
        return 0;
    }
    let base = n / parts;
    let rem = n % parts;
    let doubled = rem / 2;
    if index < doubled {
        base + 2
    } else if index == doubled && rem % 2 == 1 {
        base + 1
    } else {
        base
    }
}

/// Offset of chunk `index`: the sum of all preceding chunk sizes
pub fn chunk_offset(n: usize, parts: usize, index: usize) -> usize {
    (0..index.min(parts.max(1)))
        .map(|i| chunk_size(n, parts, i))
        .sum()
}

/// Item range of chunk `index`
pub fn chunk_range(n: usize, parts: usize, index: usize) -> Range<usize> {
    let start = chunk_offset(n, parts, index);
    start..start + chunk_size(n, parts, index)
}

/// Split `rows` into chunks of whole row pairs
///
/// Keeps adjacent rows `2k, 2k+1` in the same chunk. An odd trailing row
/// joins the last non-empty chunk.
pub fn pair_range(rows: usize, parts: usize, index: usize) -> Range<usize> {
    if rows == 1 {
        return if index == 0 { 0..1 } else { 0..0 };
    }
    let pairs = rows / 2;
    let range = chunk_range(pairs, parts, index);
    let start = range.start * 2;
    let mut end = range.end * 2;
    if rows % 2 == 1 && end == pairs * 2 && !range.is_empty() {
        end += 1;
    }
    start..end
}

/// Largest chunk any index can receive
pub fn max_chunk(n: usize, parts: usize) -> usize {
    chunk_size(n, parts, 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remainder_distribution() {
        // rem 2: the first chunk takes both
        let sizes: Vec<_> = (0..4).map(|i| chunk_size(10, 4, i)).collect();
        assert_eq!(sizes, vec![4, 2, 2, 2]);

        // rem 3: one chunk +2, the next +1
        let sizes: Vec<_> = (0..4).map(|i| chunk_size(11, 4, i)).collect();
        assert_eq!(sizes, vec![4, 3, 2, 2]);
    }

    #[test]
    fn test_ranges_are_contiguous() {
        let ranges: Vec<_> = (0..3).map(|i| chunk_range(8, 3, i)).collect();
        assert_eq!(ranges, vec![0..4, 4..6, 6..8]);
    }

    #[test]
    fn test_fewer_items_than_parts() {
        let sizes: Vec<_> = (0..4).map(|i| chunk_size(3, 4, i)).collect();
        assert_eq!(sizes, vec![2, 1, 0, 0]);
        assert_eq!(chunk_range(3, 4, 3), 3..3);
    }

    #[test]
    fn test_pair_ranges() {
        let ranges: Vec<_> = (0..2).map(|i| pair_range(10, 2, i)).collect();
        assert_eq!(ranges, vec![0..6, 6..10]);

        let ranges: Vec<_> = (0..2).map(|i| pair_range(7, 2, i)).collect();
        assert_eq!(ranges, vec![0..4, 4..7]);

        assert_eq!(pair_range(1, 3, 0), 0..1);
        assert!(pair_range(1, 3, 1).is_empty());
    }

    #[test]
    fn test_zero_parts() {
        assert_eq!(chunk_range(5, 0, 0), 0..5);
    }
}
