// vim: tw=80
//! Classification of requested extents against the stripe layout
//!
//! The scanner walks one I/O descriptor's extents, in increasing index
//! order, and decides which parts cover whole stripes (and therefore get
//! parity encoded) and which parts are partial (and instead get replicated
//! onto the parity targets on update).  Its output sizes everything the
//! reassembly step builds: the reassembled recx array, the segment sorter,
//! and the parity buffers.

use crate::{
    layout::EcLayout,
    oiod::SIOD_EVEN_DIST,
    types::{Iod, Recx, Result, SGList},
    util::{rounddown, roundup},
};
use divbuf::DivBufShared;
use fixedbitset::FixedBitSet;
use tracing::trace;

/// One full-stripe run found within an input extent
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct EcRecx {
    /// Index of the input extent this run was carved from
    pub idx: u32,
    /// Number of whole stripes in the run
    pub stripe_nr: u32,
    /// Byte offset of the run within the descriptor's linear data stream
    pub byte_off: u64,
    /// The stripe-aligned extent itself
    pub recx: Recx,
}

/// Everything the scanner learned about one I/O descriptor
#[derive(Debug)]
pub struct RecxArray {
    layout: EcLayout,

    /// Full-stripe runs, in increasing extent order
    pub recxs: Vec<EcRecx>,

    /// Per-target count of reassembled extents
    pub tgt_recx_nrs: Vec<u32>,

    /// Per-target first slot within the reassembled extent array
    pub tgt_recx_idxs: Vec<u32>,

    /// Total number of full stripes; sizes the parity buffers
    pub stripe_total: u32,

    /// One parity buffer per parity target, each `stripe_total` cells
    /// long.  Allocated lazily once the stripe count is known.
    pub pbufs: Vec<DivBufShared>,

    /// Resume point for [`full_stripe_of`](Self::full_stripe_of).  Extents
    /// must be looked up in increasing index order.
    cursor: usize,
}

impl RecxArray {
    pub(crate) fn new(layout: EcLayout) -> Self {
        let tgt_nr = layout.tgt_nr() as usize;
        RecxArray {
            layout,
            recxs: Vec::new(),
            tgt_recx_nrs: vec![0; tgt_nr],
            tgt_recx_idxs: vec![0; tgt_nr],
            stripe_total: 0,
            pbufs: Vec::new(),
            cursor: 0,
        }
    }

    /// If input extent `recx_idx` contains a full-stripe run, return it.
    ///
    /// Lookups resume from a cached cursor, so a whole descriptor's worth
    /// of lookups in increasing order costs one pass.
    pub fn full_stripe_of(&mut self, recx_idx: u32) -> Option<EcRecx> {
        let mut i = self.cursor;
        while i < self.recxs.len() {
            let ec_recx = self.recxs[i];
            if ec_recx.idx == recx_idx {
                self.cursor = i;
                return Some(ec_recx);
            }
            if ec_recx.idx > recx_idx {
                break;
            }
            i += 1;
        }
        None
    }

    /// Allocate the parity buffers, `stripe_total` cells each
    pub fn alloc_pbufs(&mut self, cell_bytes: u64) {
        debug_assert!(self.pbufs.is_empty());
        if self.stripe_total == 0 {
            return;
        }
        let len = self.stripe_total as u64 * cell_bytes;
        for _ in 0..self.layout.p() {
            self.pbufs.push(DivBufShared::from(vec![0u8; len as usize]));
        }
    }
}

/// Sizing information for the reassembly that follows a scan
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ScanSizes {
    /// Total slot count of the reassembled extent array
    pub recx_nr: u32,
    /// Number of participating targets
    pub tgt_nr: u32,
    /// Worst-case memory segment count, excluding the caller's own iovec
    /// count
    pub seg_nr: u32,
    /// `SIOD_EVEN_DIST` when every target sees the same extents
    pub oiod_flags: u32,
}

/// Scan one descriptor's extents and classify them against the layout.
///
/// `skip_tgts` names failed targets a degraded fetch must not address.
/// Participating targets are recorded in the request-wide `bitmap`.
pub fn recx_scan(iod: &Iod, sgl: &SGList, layout: &EcLayout, update: bool,
                 skip_tgts: Option<&FixedBitSet>, bitmap: &mut FixedBitSet)
    -> Result<(RecxArray, ScanSizes)>
{
    let mut array = RecxArray::new(*layout);
    let k = layout.k();
    let p = layout.p();
    let stripe_rec_nr = layout.stripe_rec_nr();
    let cell_rec_nr = layout.cell_rec_nr();
    let mut seg_nr: u32 = 0;
    let mut rec_off: u64 = 0;
    let mut full_stripe_only = true;
    let mut parity_seg_counted = false;
    let mut frag_seg_counted = false;

    let skipped = |tgt: u32| -> bool {
        !update && skip_tgts.map(|s| s.contains(tgt as usize))
            .unwrap_or(false)
    };
    // one reassembled extent on each data target that isn't being skipped
    let data_tgt_recx_nrs = |nrs: &mut Vec<u32>| {
        for tgt in 0..k {
            if !skipped(tgt) {
                nrs[tgt as usize] += 1;
            }
        }
    };

    for (i, recx) in iod.recxs.iter().enumerate() {
        // add segment count on data cells
        seg_nr += layout.recx_cell_nr(recx.rx_idx, recx.rx_nr) as u32;
        let start = roundup(recx.rx_idx, stripe_rec_nr);
        let end = rounddown(recx.end(), stripe_rec_nr);
        if start >= end {
            // No full stripe fits: the whole extent is partial
            if update {
                // each parity target holds one extent as a replica
                for tgt in k..k + p {
                    array.tgt_recx_nrs[tgt as usize] += 1;
                }
            }
            if recx.rx_nr > stripe_rec_nr - cell_rec_nr {
                // at most one reassembled extent per data target
                data_tgt_recx_nrs(&mut array.tgt_recx_nrs);
            } else {
                // one reassembled extent per covered cell
                let mut idx = rounddown(recx.rx_idx, cell_rec_nr);
                while idx < recx.end() {
                    let tgt = layout.tgt_of_idx(idx);
                    if !skipped(tgt) {
                        array.tgt_recx_nrs[tgt as usize] += 1;
                    }
                    idx += cell_rec_nr;
                }
            }
            if update {
                // replica with one segment run on each parity cell
                if !frag_seg_counted {
                    seg_nr += p * sgl.len() as u32;
                    frag_seg_counted = true;
                } else {
                    seg_nr += p;
                }
                rec_off += recx.rx_nr;
            }
            full_stripe_only = false;
            continue;
        }

        // at least one reassembled extent on each target for a full stripe
        if update {
            for tgt in 0..k + p {
                array.tgt_recx_nrs[tgt as usize] += 1;
            }
        } else {
            data_tgt_recx_nrs(&mut array.tgt_recx_nrs);
            continue;
        }

        // Encoded parity with one segment on each parity cell
        if !parity_seg_counted {
            seg_nr += p;
            parity_seg_counted = true;
        }
        let rec_nr = end - start;
        let stripe_nr = (rec_nr / stripe_rec_nr) as u32;
        array.recxs.push(EcRecx {
            idx: i as u32,
            stripe_nr,
            byte_off: (rec_off + start - recx.rx_idx) * iod.size,
            recx: Recx::new(start, rec_nr),
        });
        array.stripe_total += stripe_nr;
        rec_off += recx.rx_nr;
        // A partial remainder before or after the full stripes is
        // replicated to the parity targets.
        let mut partial_nr = 0;
        if recx.rx_idx < start {
            partial_nr += 1;
        }
        if recx.end() > end {
            partial_nr += 1;
        }
        if partial_nr > 0 {
            full_stripe_only = false;
            for tgt in k..k + p {
                array.tgt_recx_nrs[tgt as usize] += partial_nr;
            }
            // replica to each parity cell
            if !frag_seg_counted {
                seg_nr += p * sgl.len() as u32 * partial_nr;
                frag_seg_counted = true;
            } else {
                seg_nr += p * partial_nr;
            }
        }
    }

    let mut recx_nr = 0;
    let mut tgt_nr = 0;
    for tgt in 0..layout.tgt_nr() as usize {
        array.tgt_recx_idxs[tgt] = recx_nr;
        recx_nr += array.tgt_recx_nrs[tgt];
        if array.tgt_recx_nrs[tgt] != 0 {
            bitmap.insert(tgt);
            tgt_nr += 1;
        }
    }
    let mut oiod_flags = 0;
    if update && full_stripe_only {
        debug_assert_eq!(tgt_nr, layout.tgt_nr());
        oiod_flags = SIOD_EVEN_DIST;
    }
    if update && !iod.is_punch(update) {
        array.alloc_pbufs(layout.cell_bytes(iod.size));
    }
    trace!(akey = %iod.name, recx_nr, tgt_nr, seg_nr,
           stripe_total = array.stripe_total, "scanned");
    Ok((array, ScanSizes { recx_nr, tgt_nr, seg_nr, oiod_flags }))
}

// LCOV_EXCL_STOP
