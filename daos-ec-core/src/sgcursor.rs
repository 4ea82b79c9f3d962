// vim: tw=80

use crate::types::{Error, IoVec, Result, SGList};

/// A span within a single iovec of an `SGList`.
///
/// Spans survive the cursor that produced them and can be re-sliced from
/// the originating list at any time, which also makes byte-adjacent spans
/// of the same iovec mergeable after the fact.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SegSpan {
    /// Index of the iovec within the originating `SGList`
    pub iov: usize,
    /// Byte offset within that iovec
    pub off: usize,
    /// Length in bytes
    pub len: usize,
}

impl SegSpan {
    /// Does `other` begin exactly where `self` ends, within the same iovec?
    pub fn adjoins(&self, other: &SegSpan) -> bool {
        self.iov == other.iov && self.off + self.len == other.off
    }

    /// Materialize the span as an `IoVec` borrowed from `sglist`
    pub fn slice(&self, sglist: &SGList) -> IoVec {
        sglist[self.iov].slice(self.off, self.off + self.len)
    }
}

/// A Cursor type that can iterate over `SGList`s.
///
/// This structure can be used to iterate through an `SGList` as a series of
/// `IoVec`s, but not necessarily with the same boundaries as the `SGList`
/// is composed of.  It has two main purposes:
///
/// - Immutably iterate through several `SGList`s simultaneously.  This is
///   necessary for calculating parity when the data columns are `SGList`s
///   instead of `IoVec`s.
/// - Transform an `SGList` into another `SGList` with `IoVec` boundaries at
///   chosen locations (plus the original boundaries, too).  This is
///   necessary for splitting an `SGList` up into multiple columns.
///
/// Cursors are cheap to copy; a copy re-reads from the position it was
/// taken at without disturbing the original.
#[derive(Clone, Copy)]
pub struct SGCursor<'a> {
    sglist: &'a SGList,
    sglist_idx: usize,
    iovec_idx: usize
}

impl<'a> SGCursor<'a> {
    /// Return a contiguous segment from the beginning of the Cursor.
    ///
    /// It will be at most `max` bytes long, but it may be less.  If the
    /// `SGCursor` is empty, `None` will be returned
    pub fn next(&mut self, max: usize) -> Option<IoVec> {
        let ncl = self.peek_len();
        if ncl == 0 {
            None
        } else if max < ncl {
            let b = self.iovec_idx;
            let e = b + max;
            let iovec = Some(self.sglist[self.sglist_idx].slice(b, e));
            self.iovec_idx += max;
            iovec
        } else if self.iovec_idx > 0 {
            let b = self.iovec_idx;
            let iovec = Some(self.sglist[self.sglist_idx].slice_from(b));
            self.iovec_idx = 0;
            self.sglist_idx += 1;
            iovec
        } else {
            let r = Some(self.sglist[self.sglist_idx].clone());
            self.sglist_idx += 1;
            r
        }
    }

    /// Like [`next`](Self::next), but return the segment's coordinates
    /// instead of a buffer view.
    pub fn span(&mut self, max: usize) -> Option<SegSpan> {
        let ncl = self.peek_len();
        if ncl == 0 {
            return None;
        }
        let span = SegSpan {
            iov: self.sglist_idx,
            off: self.iovec_idx,
            len: ncl.min(max),
        };
        if max < ncl {
            self.iovec_idx += max;
        } else {
            self.iovec_idx = 0;
            self.sglist_idx += 1;
        }
        Some(span)
    }

    /// Consume exactly `len` bytes, returning one span per contiguous
    /// segment crossed.  Fails with [`Error::Rec2Big`] if the list is
    /// exhausted first.
    pub fn consume(&mut self, len: usize) -> Result<Vec<SegSpan>> {
        let mut spans = Vec::new();
        let mut remaining = len;
        while remaining > 0 {
            let span = self.span(remaining).ok_or(Error::Rec2Big)?;
            remaining -= span.len;
            spans.push(span);
        }
        Ok(spans)
    }

    /// Consume exactly `len` bytes, returning them as a new `SGList` that
    /// borrows the underlying buffers.
    pub fn take_sglist(&mut self, len: usize) -> Result<SGList> {
        let mut sglist = SGList::new();
        let mut remaining = len;
        while remaining > 0 {
            let iovec = self.next(remaining).ok_or(Error::Rec2Big)?;
            remaining -= iovec.len();
            sglist.push(iovec);
        }
        Ok(sglist)
    }

    /// Skip forward `len` bytes without producing segments
    pub fn advance(&mut self, len: usize) -> Result<()> {
        let mut remaining = len;
        while remaining > 0 {
            let span = self.span(remaining).ok_or(Error::Rec2Big)?;
            remaining -= span.len;
        }
        Ok(())
    }

    /// Return the length of the next contiguous segment.
    ///
    /// This will be the length of the next segment returned by
    /// `next(usize::MAX)`
    pub fn peek_len(&self) -> usize {
        if self.sglist_idx < self.sglist.len() {
            self.sglist[self.sglist_idx].len() - self.iovec_idx
        } else {
            0
        }
    }
}

impl<'a> From<&'a SGList> for SGCursor<'a> {
    fn from(src: &'a SGList) -> SGCursor<'a> {
        SGCursor { sglist: src, sglist_idx: 0, iovec_idx: 0}
    }
}

// LCOV_EXCL_STOP
