//! Cache bucket sizing.
//!
//! Bucket sizes are 1, 2 and 3 pages, then four steps per power of two
//! `P, P + P/4, P + P/2, P + 3P/4` for `P` from 4 pages up to the cache
//! ceiling. Laid out four to a row, the row of a page count is
//! `30 - clz((pages - 1) | 3)`, which gives an O(1) lookup:
//!
//! ```text
//! row  sizes (pages)       row stride   column size
//!  0:    1   2   3   4         4            1
//!  1:    5   6   7   8         4            1
//!  2:   10  12  14  16         8            2
//!  3:   20  24  28  32        16            4
//!  4:   40  48  56  64        32            8
//! ```

use std::collections::VecDeque;
use std::sync::Arc;

use super::BoRecord;

/// Largest power-of-two step that still gets cache buckets.
pub const CACHE_MAX_SIZE: u64 = 64 * 1024 * 1024;

pub(crate) struct Bucket {
    pub(crate) size: u64,
    /// Oldest free at the front.
    pub(crate) bos: VecDeque<Arc<BoRecord>>,
}

/// Sizes of every bucket, ascending.
pub fn bucket_sizes(page_size: u64) -> Vec<u64> {
    let mut sizes = vec![page_size, 2 * page_size, 3 * page_size];
    let mut size = 4 * page_size;
    while size <= CACHE_MAX_SIZE {
        sizes.push(size);
        sizes.push(size + size / 4);
        sizes.push(size + size * 2 / 4);
        sizes.push(size + size * 3 / 4);
        size *= 2;
    }
    sizes
}

/// Index of the smallest bucket that fits `size` bytes, if any.
pub fn bucket_index(size: u64, page_size: u64, num_buckets: usize) -> Option<usize> {
    let pages = size.div_ceil(page_size);
    if pages == 0 || pages > u32::MAX as u64 {
        return None;
    }
    let pages = pages as u32;
    let row = 30 - ((pages - 1) | 3).leading_zeros() as i32;
    let row_max_pages = 4u32 << row;
    let prev_row_max_pages = (row_max_pages / 2) & !2;
    let mut col_size_log2 = row - 1;
    col_size_log2 += (col_size_log2 < 0) as i32;
    let col = (pages - prev_row_max_pages + ((1 << col_size_log2) - 1)) >> col_size_log2;
    let index = (row as usize) * 4 + (col as usize - 1);
    (index < num_buckets).then_some(index)
}

pub(crate) fn make_buckets(page_size: u64) -> Vec<Bucket> {
    bucket_sizes(page_size)
        .into_iter()
        .map(|size| Bucket {
            size,
            bos: VecDeque::new(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const PAGE: u64 = 4096;

    #[test]
    fn series_layout() {
        let sizes = bucket_sizes(PAGE);
        assert_eq!(sizes.len(), 55);
        let pages: Vec<u64> = sizes.iter().take(12).map(|s| s / PAGE).collect();
        assert_eq!(pages, vec![1, 2, 3, 4, 5, 6, 7, 8, 10, 12, 14, 16]);
        assert_eq!(*sizes.last().unwrap(), CACHE_MAX_SIZE + CACHE_MAX_SIZE * 3 / 4);
    }

    #[test]
    fn lookup_examples() {
        let n = bucket_sizes(PAGE).len();
        assert_eq!(bucket_index(1, PAGE, n), Some(0));
        assert_eq!(bucket_index(PAGE, PAGE, n), Some(0));
        assert_eq!(bucket_index(PAGE + 1, PAGE, n), Some(1));
        assert_eq!(bucket_index(17 * PAGE, PAGE, n), Some(12));
        assert_eq!(bucket_index(64 * PAGE, PAGE, n), Some(19));
        assert_eq!(bucket_index(0, PAGE, n), None);
        assert_eq!(bucket_index(CACHE_MAX_SIZE * 4, PAGE, n), None);
    }

    #[test]
    fn lookup_is_tightest_fit() {
        let sizes = bucket_sizes(PAGE);
        for pages in 1..=(CACHE_MAX_SIZE * 2 / PAGE) {
            let size = pages * PAGE;
            let expect = sizes.iter().position(|&s| s >= size);
            assert_eq!(bucket_index(size, PAGE, sizes.len()), expect, "pages={pages}");
        }
    }
}
