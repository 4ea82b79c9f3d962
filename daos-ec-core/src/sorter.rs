// vim: tw=80
//! Per-target collection and compaction of memory segments
//!
//! While an I/O descriptor is being reassembled, every piece of the
//! caller's buffers (and every parity buffer) must end up grouped by the
//! target that will receive it, in target order, with byte-adjacent pieces
//! coalesced.  The sorter collects segments as the reassembly walks the
//! extents, then packs them into the reassembled scatter-gather list in one
//! pass.

use crate::{
    sgcursor::SegSpan,
    types::{IoVec, SGList},
};

/// One segment owed to a target: either a span of the caller's sgl, or an
/// owned view of a parity buffer.
#[derive(Clone, Debug)]
pub enum EcSeg {
    User(SegSpan),
    Parity(IoVec),
}

impl EcSeg {
    /// Are these two segments literally the same memory region?
    fn same_region(&self, other: &EcSeg) -> bool {
        match (self, other) {
            (EcSeg::User(a), EcSeg::User(b)) => a == b,
            (EcSeg::Parity(a), EcSeg::Parity(b)) =>
                a.as_ptr() == b.as_ptr() && a.len() == b.len(),
            _ => false
        }
    }
}

/// Collects memory segments per target and compacts them into a per-target
/// scatter-gather list.
///
/// Segments for one target must be inserted in increasing offset order;
/// every call site walks extents in increasing index order, so this holds
/// naturally.
pub struct SegSorter {
    /// All inserted segments, in arrival order, tagged with their target
    segs: Vec<(u32, EcSeg)>,

    /// Index into `segs` of each target's most recent segment
    last: Vec<Option<usize>>,
}

impl SegSorter {
    /// `seg_capacity` should be the worst-case total segment count, so that
    /// insertion never reallocates.
    pub fn new(tgt_nr: u32, seg_capacity: usize) -> Self {
        SegSorter {
            segs: Vec::with_capacity(seg_capacity),
            last: vec![None; tgt_nr as usize],
        }
    }

    /// Append one segment to a target's chain, coalescing it with the
    /// target's previous segment when the two are byte-adjacent.
    pub fn insert(&mut self, tgt: u32, seg: EcSeg) {
        if let Some(last_idx) = self.last[tgt as usize] {
            if let (EcSeg::User(prev), EcSeg::User(span)) =
                (&mut self.segs[last_idx].1, &seg)
            {
                if prev.adjoins(span) {
                    prev.len += span.len;
                    return;
                }
            }
        }
        self.last[tgt as usize] = Some(self.segs.len());
        self.segs.push((tgt, seg));
    }

    /// Insert a run of spans of the caller's sgl
    pub fn insert_spans(&mut self, tgt: u32, spans: &[SegSpan]) {
        for span in spans {
            self.insert(tgt, EcSeg::User(*span));
        }
    }

    /// Number of segments currently held
    pub fn seg_nr(&self) -> usize {
        self.segs.len()
    }

    /// Walk targets in index order and emit a compacted scatter-gather
    /// list.  `usgl` is the caller's sgl that `User` segments refer into.
    ///
    /// Consecutive segments describing literally the same memory region are
    /// merged into one, even across target boundaries.  That happens when
    /// several targets receive replicas of the same bytes; it is an
    /// opportunistic compaction, not required for correctness.
    pub fn pack(mut self, usgl: &SGList) -> SGList {
        self.segs.sort_by_key(|(tgt, _)| *tgt);
        let mut sglist = SGList::with_capacity(self.segs.len());
        let mut prev: Option<&EcSeg> = None;
        for (_, seg) in self.segs.iter() {
            if prev.map(|p| p.same_region(seg)).unwrap_or(false) {
                continue;
            }
            sglist.push(match seg {
                EcSeg::User(span) => span.slice(usgl),
                EcSeg::Parity(iovec) => iovec.clone(),
            });
            prev = Some(seg);
        }
        sglist
    }
}

// LCOV_EXCL_STOP
