// vim: tw=80
//! Common utility functions used throughout the EC engine

use crate::types::SGList;
use divbuf::DivBufShared;
use lazy_static::lazy_static;

/// Length of the global read-only `ZERO_REGION`
pub const ZERO_REGION_LEN: usize = 32768;

lazy_static! {
    /// A read-only buffer of zeros, useful for padding.
    ///
    /// The length is pretty arbitrary.  Code should be able to cope with a
    /// smaller-than-desired `ZERO_REGION`.  A smaller size will have less
    /// impact on the CPU cache.  A larger size will consume fewer CPU
    /// cycles manipulating sglists.
    pub static ref ZERO_REGION: DivBufShared =
        DivBufShared::from(vec![0u8; ZERO_REGION_LEN]);
}

/// Divide two unsigned numbers, rounding up.
pub fn div_roundup(dividend: u64, divisor: u64) -> u64 {
    (dividend + divisor - 1) / divisor
}

/// Round `x` up to the next multiple of `align`
pub fn roundup(x: u64, align: u64) -> u64 {
    div_roundup(x, align) * align
}

/// Round `x` down to a multiple of `align`
pub fn rounddown(x: u64, align: u64) -> u64 {
    x / align * align
}

/// Return the length of data in an sglist, not the number of iovecs
pub fn sglist_len<T>(sglist: &[T]) -> usize
    where T: std::ops::Deref<Target=[u8]>
{
    sglist.iter().fold(0usize, |accumulator, buf| {
        accumulator + buf.len()
    })
}

/// Create an SGList full of zeros, with the requested total length
pub fn zero_sglist(len: usize) -> SGList {
    let zero_region_len = ZERO_REGION.len();
    let zero_bufs = div_roundup(len as u64, zero_region_len as u64) as usize;
    let mut sglist = SGList::new();
    for _ in 0..(zero_bufs - 1) {
        sglist.push(ZERO_REGION.try_const().unwrap())
    }
    sglist.push(ZERO_REGION.try_const().unwrap().slice_to(
            len - (zero_bufs - 1) * zero_region_len));
    sglist
}

// LCOV_EXCL_START
#[cfg(test)]
mod t {
    use pretty_assertions::assert_eq;
    use super::*;

    #[test]
    fn test_div_roundup() {
        assert_eq!(div_roundup(5, 2), 3);
        assert_eq!(div_roundup(4, 2), 2);
        assert_eq!(div_roundup(4000, 1500), 3);
    }

    #[test]
    fn test_roundup_rounddown() {
        assert_eq!(roundup(0, 8), 0);
        assert_eq!(roundup(1, 8), 8);
        assert_eq!(roundup(8, 8), 8);
        assert_eq!(rounddown(7, 8), 0);
        assert_eq!(rounddown(8, 8), 8);
        assert_eq!(rounddown(15, 8), 8);
    }

    #[test]
    fn test_sglist_len() {
        assert_eq!(0, sglist_len::<&[u8]>(&[]));
        assert_eq!(1, sglist_len(&[&[42u8][..]]));
        assert_eq!(6, sglist_len(&[&[42u8, 43, 44, 45][..], &[46, 47][..]]));
    }

    #[test]
    fn test_zero_sglist() {
        let sg0 = zero_sglist(100);
        assert_eq!(&sg0[0][..], &[0u8; 100][..]);
        assert_eq!(sg0.len(), 1);

        let sg1 = zero_sglist(ZERO_REGION_LEN + 100);
        assert_eq!(&sg1[0][..], &[0u8; ZERO_REGION_LEN][..]);
        assert_eq!(&sg1[1][..], &[0u8; 100][..]);
        assert_eq!(sg1.len(), 2);
    }
}
// LCOV_EXCL_STOP
