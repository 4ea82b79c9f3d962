// vim: tw=80
//! Reassembly of application I/O requests onto an erasure-coded layout
//!
//! For every I/O descriptor in a request this module produces a derived
//! descriptor whose extents are regrouped by target (data targets first,
//! then parity), a matching scatter-gather list, the per-target slice
//! descriptors, and the request-wide participation bitmap.  On update it
//! also drives parity encoding for every full stripe.

use crate::{
    codec::Codec,
    layout::EcLayout,
    oiod::{ObjIoDesc, ShardIod, TgtOiod},
    recov::FailInfo,
    scan::{recx_scan, RecxArray, ScanSizes},
    sgcursor::SGCursor,
    sorter::{EcSeg, SegSorter},
    types::{Iod, IodType, Recx, RecxId, Result, SGList},
    util::{rounddown, roundup},
};
use fixedbitset::FixedBitSet;
use std::sync::Arc;
use tracing::trace;

/// Add one reassembled extent to a target's slot range, merging it into
/// the target's previous extent when the two are contiguous in the same
/// index space.
fn recx_add(recxs: &mut [Recx], ridx: &mut [u32], start_idx: &[u32],
            tgt: u32, idx: u64, nr: u64)
{
    let t = tgt as usize;
    let cur = (start_idx[t] + ridx[t]) as usize;
    if ridx[t] != 0 && recxs[cur - 1].rx_idx + recxs[cur - 1].rx_nr == idx {
        recxs[cur - 1].rx_nr += nr;
        return;
    }
    recxs[cur] = Recx::new(idx, nr);
    ridx[t] += 1;
}

/// Add a data extent to the reassembled extent array.
///
/// The extent lands on the data targets that cover it, at target-local
/// indices.  With `add_parity`, the whole extent is also replicated to
/// every parity target at its original linear index (replicas need no
/// index mapping).  Failed targets in `skip` are left out.
#[allow(clippy::too_many_arguments)]
fn data_recx_add(layout: &EcLayout, recx: &Recx, recxs: &mut [Recx],
                 ridx: &mut [u32], start_idx: &[u32], add_parity: bool,
                 skip: Option<&FixedBitSet>)
{
    let k = layout.k();
    let stripe_rec_nr = layout.stripe_rec_nr();
    let cell_rec_nr = layout.cell_rec_nr();
    if recx.rx_nr == 0 {
        return;
    }

    if add_parity {
        for i in 0..layout.p() {
            recx_add(recxs, ridx, start_idx, k + i, recx.rx_idx,
                     recx.rx_nr);
        }
    }

    let skipped = |tgt: u32| {
        skip.map(|s| s.contains(tgt as usize)).unwrap_or(false)
    };
    let start = recx.rx_idx;
    let end = recx.end();
    // For a small extent, add one reassembled extent per covered cell
    if recx.rx_nr <= stripe_rec_nr - cell_rec_nr {
        let mut idx = start;
        let mut nr = recx.rx_nr.min(cell_rec_nr - idx % cell_rec_nr);
        loop {
            let tgt = layout.tgt_of_idx(idx);
            if !skipped(tgt) {
                recx_add(recxs, ridx, start_idx, tgt,
                         layout.daos_to_vos(idx), nr);
            }
            idx = roundup(idx + 1, cell_rec_nr);
            if idx >= end {
                break;
            }
            nr = cell_rec_nr.min(end - idx);
        }
        return;
    }
    // For a large extent it is more efficient to calculate each target's
    // merged range directly.
    let first_tgt = layout.tgt_of_idx(start);
    let last_tgt = layout.tgt_of_idx(end - 1);
    for i in 0..k {
        if skipped(i) {
            continue;
        }
        let r_start = if i < first_tgt {
            roundup(start, stripe_rec_nr) + i as u64 * cell_rec_nr
        } else if i == first_tgt {
            start
        } else {
            rounddown(start, cell_rec_nr)
                + (i - first_tgt) as u64 * cell_rec_nr
        };
        let r_end = if i < last_tgt {
            rounddown(end - 1, stripe_rec_nr)
                + (i + 1) as u64 * cell_rec_nr
        } else if i == last_tgt {
            end
        } else {
            rounddown(end, stripe_rec_nr) - stripe_rec_nr
                + (i + 1) as u64 * cell_rec_nr
        };
        debug_assert!(r_end > r_start);
        debug_assert_eq!(i, layout.tgt_of_idx(r_start));
        let vos_start = layout.daos_to_vos(r_start);
        let mut vos_end = layout.daos_to_vos(r_end);
        if r_end % cell_rec_nr == 0 && r_end % stripe_rec_nr != 0 {
            // r_end sits on a cell boundary inside a stripe; its vos image
            // belongs to the next target, so complete this target's cell
            vos_end += cell_rec_nr;
        }
        recx_add(recxs, ridx, start_idx, i, vos_start, vos_end - vos_start);
    }
}

/// Add the full-stripe parity extents to the parity targets, tagged with
/// the parity indicator.
fn parity_recx_add(layout: &EcLayout, recx: &Recx, recxs: &mut [Recx],
                   ridx: &mut [u32], start_idx: &[u32])
{
    let stripe_rec_nr = layout.stripe_rec_nr();
    debug_assert_eq!(recx.rx_idx % stripe_rec_nr, 0);
    debug_assert_eq!(recx.rx_nr % stripe_rec_nr, 0);
    debug_assert!(recx.rx_nr > 0);
    let idx = RecxId::Parity(layout.parity_of_daos(recx.rx_idx)).raw();
    let nr = (recx.rx_nr / stripe_rec_nr) * layout.cell_rec_nr();
    for i in 0..layout.p() {
        recx_add(recxs, ridx, start_idx, layout.k() + i, idx, nr);
    }
}

/// Register a data extent's memory segments with the segment sorter.
///
/// The persistent `cursor` tracks the extent-to-buffer correspondence
/// across calls; extents must arrive in increasing index order.  With
/// `add_parity`, the extent's bytes are also registered against every
/// parity target (replication).  Failed targets in `skip` get no
/// segments, but the cursor still advances past their bytes.
#[allow(clippy::too_many_arguments)]
fn data_seg_add(layout: &EcLayout, recx: &Recx, iod_size: u64,
                cursor: &mut SGCursor, sorter: &mut SegSorter,
                add_parity: bool, skip: Option<&FixedBitSet>) -> Result<()>
{
    let cell_rec_nr = layout.cell_rec_nr();
    if recx.rx_nr == 0 {
        return Ok(());
    }

    if add_parity {
        // The replicas re-read the same bytes, so consume from a copy
        let mut replica_cursor = *cursor;
        let spans = replica_cursor.consume(
            (recx.rx_nr * iod_size) as usize)?;
        for i in 0..layout.p() {
            sorter.insert_spans(layout.k() + i, &spans);
        }
    }

    let skipped = |tgt: u32| {
        skip.map(|s| s.contains(tgt as usize)).unwrap_or(false)
    };
    let end = recx.end();
    // add segments one cell at a time, starting from the first cell
    let mut idx = recx.rx_idx;
    let mut nr = recx.rx_nr.min(cell_rec_nr - idx % cell_rec_nr);
    loop {
        let tgt = layout.tgt_of_idx(idx);
        let spans = cursor.consume((nr * iod_size) as usize)?;
        if !skipped(tgt) {
            sorter.insert_spans(tgt, &spans);
        }
        idx = roundup(idx + 1, cell_rec_nr);
        if idx >= end {
            break;
        }
        nr = cell_rec_nr.min(end - idx);
    }
    Ok(())
}

/// Register the encoded parity buffers as segments on the parity targets
fn parity_seg_add(layout: &EcLayout, array: &RecxArray, iod: &Iod,
                  sorter: &mut SegSorter)
{
    if array.stripe_total == 0 {
        return;
    }
    for (i, pbuf) in array.pbufs.iter().enumerate() {
        let iovec = pbuf.try_const()
            .expect("parity buffers are no longer mutably borrowed");
        debug_assert_eq!(iovec.len() as u64,
                         array.stripe_total as u64
                             * layout.cell_bytes(iod.size));
        sorter.insert(layout.k() + i as u32, EcSeg::Parity(iovec));
    }
}

/// A fully reassembled request: one reassembled iod/sgl/oiod triple per
/// input descriptor, plus the request-wide target state.
///
/// The context owns all derived storage; the caller's descriptors and
/// buffers are only borrowed during [`req_reasb`](Self::req_reasb) and the
/// reassembled sgls reference (not copy) the caller's buffers.
pub struct ReasbReq {
    layout: EcLayout,
    codec: Arc<Codec>,

    /// Reassembled descriptors, extents regrouped by target
    pub iods: Vec<Iod>,

    /// Reassembled scatter-gather lists, grouped identically
    pub sgls: Vec<SGList>,

    /// Per-descriptor target slicing
    pub oiods: Vec<ObjIoDesc>,

    /// Per-descriptor scan state, parity buffers included
    pub recxs: Vec<RecxArray>,

    /// Participating targets for the whole request
    pub bitmap: FixedBitSet,

    /// Number of bits set in `bitmap`
    pub tgt_nr: u32,

    /// Exactly one data target covers every extent and nothing was
    /// encoded; all per-target byte offsets collapse to zero because
    /// every target shares the caller's un-reassembled buffer.
    pub single_tgt: bool,

    /// Per-target fan-out index, built on fetch
    pub tgt_oiods: Vec<TgtOiod>,

    /// Failed-target tracking, lazily attached on the first observed
    /// failure and shared by every sub-task of this request
    pub fail: Option<FailInfo>,
}

impl ReasbReq {
    pub fn new(layout: EcLayout, codec: Arc<Codec>, iod_nr: usize) -> Self {
        let tgt_nr = layout.tgt_nr() as usize;
        ReasbReq {
            layout,
            codec,
            iods: Vec::with_capacity(iod_nr),
            sgls: Vec::with_capacity(iod_nr),
            oiods: Vec::with_capacity(iod_nr),
            recxs: Vec::with_capacity(iod_nr),
            bitmap: FixedBitSet::with_capacity(tgt_nr),
            tgt_nr: 0,
            single_tgt: false,
            tgt_oiods: Vec::new(),
            fail: None,
        }
    }

    pub fn layout(&self) -> &EcLayout {
        &self.layout
    }

    pub fn codec(&self) -> &Arc<Codec> {
        &self.codec
    }

    /// The failure-tracking state, created on first use.
    ///
    /// It persists across retries of this request and is never reset
    /// automatically.
    pub fn fail_info(&mut self) -> &FailInfo {
        if self.fail.is_none() {
            self.fail = Some(FailInfo::new(self.layout));
        }
        self.fail.as_ref().unwrap()
    }

    /// Failed targets to leave out of a degraded fetch, if any
    fn skip_tgts(&self) -> Option<FixedBitSet> {
        self.fail.as_ref().map(FailInfo::tgt_bitset)
            .filter(|s| s.count_ones(..) > 0)
    }

    /// Reassemble a whole request.
    ///
    /// For each descriptor this scans its extents, encodes parity (on
    /// update), and builds the reassembled iod/sgl/oiod.  On fetch it
    /// finally builds the per-target fan-out index.
    #[tracing::instrument(level = "trace", skip(self, iods, sgls))]
    pub fn req_reasb(&mut self, iods: &[Iod], sgls: &[SGList],
                     dkey_hash: u64, update: bool) -> Result<()>
    {
        debug_assert_eq!(iods.len(), sgls.len());
        // Updates never route around failed targets; only a degraded
        // fetch does.
        let skip = if update { None } else { self.skip_tgts() };
        for (iod, sgl) in iods.iter().zip(sgls.iter()) {
            if iod.kind == IodType::Single {
                crate::singv::singv_req_reasb(self, iod, sgl, dkey_hash,
                                              update)?;
                continue;
            }
            // For an array, scan/encode/reassemble each descriptor
            let (mut array, sizes) = recx_scan(iod, sgl, &self.layout,
                                               update, skip.as_ref(),
                                               &mut self.bitmap)?;
            if update && !iod.is_punch(update) {
                recx_encode(&self.codec, &self.layout, iod, sgl,
                            &mut array)?;
            }
            self.recx_reasb(iod, sgl, array, sizes, update,
                            skip.as_ref())?;
        }

        self.tgt_nr = self.bitmap.count_ones(..) as u32;
        let data_tgts = self.bitmap.ones()
            .filter(|&tgt| tgt < self.layout.k() as usize)
            .count();
        let encoded = self.recxs.iter().any(|a| a.stripe_total > 0)
            || self.oiods.iter().any(ObjIoDesc::is_singv);
        if data_tgts == 1 && !encoded {
            self.single_tgt = true;
            for oiod in self.oiods.iter_mut() {
                for siod in oiod.siods.iter_mut() {
                    siod.off = 0;
                }
            }
        }

        if !update {
            self.tgt_oiods = TgtOiod::build(&self.oiods, &self.bitmap,
                                            self.single_tgt);
        }
        trace!(tgt_nr = self.tgt_nr, single_tgt = self.single_tgt,
               "request reassembled");
        Ok(())
    }

    /// Reassemble one array descriptor from its scan state
    fn recx_reasb(&mut self, iod: &Iod, sgl: &SGList, mut array: RecxArray,
                  sizes: ScanSizes, update: bool,
                  skip: Option<&FixedBitSet>) -> Result<()>
    {
        let layout = self.layout;
        let punch = iod.is_punch(update);
        let mut riod_recxs = vec![Recx::default(); sizes.recx_nr as usize];
        let mut ridx = vec![0u32; layout.tgt_nr() as usize];
        let mut sorter = SegSorter::new(
            layout.tgt_nr(),
            (sizes.seg_nr as usize) + sgl.len());
        let mut cursor = SGCursor::from(sgl);

        for (i, recx) in iod.recxs.iter().enumerate() {
            let full = array.full_stripe_of(i as u32);
            if full.is_none() || !update {
                data_recx_add(&layout, recx, &mut riod_recxs, &mut ridx,
                              &array.tgt_recx_idxs, update, skip);
                if !punch {
                    data_seg_add(&layout, recx, iod.size, &mut cursor,
                                 &mut sorter, update, skip)?;
                }
                continue;
            }
            // Split a straddling extent at the stripe boundaries; the
            // remainders are replicated to parity, the aligned middle is
            // not.
            let full_recx = full.unwrap().recx;
            debug_assert!(recx.rx_idx <= full_recx.rx_idx);
            if recx.rx_idx < full_recx.rx_idx {
                let head = Recx::new(recx.rx_idx,
                                     full_recx.rx_idx - recx.rx_idx);
                data_recx_add(&layout, &head, &mut riod_recxs, &mut ridx,
                              &array.tgt_recx_idxs, true, skip);
                if !punch {
                    data_seg_add(&layout, &head, iod.size, &mut cursor,
                                 &mut sorter, true, skip)?;
                }
            }
            data_recx_add(&layout, &full_recx, &mut riod_recxs, &mut ridx,
                          &array.tgt_recx_idxs, false, skip);
            if !punch {
                data_seg_add(&layout, &full_recx, iod.size, &mut cursor,
                             &mut sorter, false, skip)?;
            }
            debug_assert!(recx.end() >= full_recx.end());
            if recx.end() > full_recx.end() {
                let tail = Recx::new(full_recx.end(),
                                     recx.end() - full_recx.end());
                data_recx_add(&layout, &tail, &mut riod_recxs, &mut ridx,
                              &array.tgt_recx_idxs, true, skip);
                if !punch {
                    data_seg_add(&layout, &tail, iod.size, &mut cursor,
                                 &mut sorter, true, skip)?;
                }
            }
        }

        if update {
            for i in 0..array.recxs.len() {
                let full_recx = array.recxs[i].recx;
                parity_recx_add(&layout, &full_recx, &mut riod_recxs,
                                &mut ridx, &array.tgt_recx_idxs);
            }
            if !punch {
                parity_seg_add(&layout, &array, iod, &mut sorter);
            }
        }

        let rsgl = if punch { SGList::new() } else { sorter.pack(sgl) };

        // Generate the oiod/siod.  Adjacent target ranges may have merged
        // during reassembly, leaving empty slots to squeeze out.
        let mut riod_nr = riod_recxs.len();
        let tgt_nr = if update { layout.tgt_nr() } else { layout.k() };
        let mut oiod = ObjIoDesc::new(tgt_nr, sizes.oiod_flags);
        let mut tidx = vec![None; tgt_nr as usize];
        let mut idx = 0u32;
        let mut last = 0usize;
        for i in 0..tgt_nr as usize {
            if array.tgt_recx_nrs[i] != 0 {
                tidx[i] = Some(idx);
                idx += 1;
            }
            let tgt_end = (array.tgt_recx_idxs[i]
                + array.tgt_recx_nrs[i]) as usize;
            for j in last..tgt_end {
                if riod_recxs[j].rx_nr != 0 {
                    continue;
                }
                // merged away, leaving empty space
                debug_assert_ne!(j, array.tgt_recx_idxs[i] as usize);
                debug_assert!(j < riod_nr);
                debug_assert!(riod_recxs[j..tgt_end].iter()
                              .all(|r| r.rx_nr == 0));
                let empty_nr = tgt_end - j;
                for m in j..riod_nr - empty_nr {
                    riod_recxs[m] = riod_recxs[m + empty_nr];
                }
                for m in riod_nr - empty_nr..riod_nr {
                    riod_recxs[m] = Recx::default();
                }
                array.tgt_recx_nrs[i] -= empty_nr as u32;
                for idxs in array.tgt_recx_idxs[i + 1..tgt_nr as usize]
                    .iter_mut()
                {
                    *idxs -= empty_nr as u32;
                }
                riod_nr -= empty_nr;
                break;
            }
            last = (array.tgt_recx_idxs[i] + array.tgt_recx_nrs[i])
                as usize;
        }
        riod_recxs.truncate(riod_nr);

        let mut rec_nr = 0u64;
        let mut last = 0usize;
        for i in 0..tgt_nr as usize {
            if array.tgt_recx_nrs[i] == 0 {
                continue;
            }
            let siod = ShardIod {
                tgt_idx: i as u32,
                idx: array.tgt_recx_idxs[i],
                nr: array.tgt_recx_nrs[i],
                off: rec_nr * iod.size,
            };
            let tgt_end = (array.tgt_recx_idxs[i]
                + array.tgt_recx_nrs[i]) as usize;
            for recx in riod_recxs[last..tgt_end].iter() {
                rec_nr += recx.rx_nr;
            }
            last = tgt_end;
            debug_assert_eq!(tidx[i], Some(oiod.siods.len() as u32));
            oiod.siods.push(siod);
        }

        self.iods.push(Iod {
            name: iod.name.clone(),
            size: iod.size,
            kind: IodType::Array,
            recxs: riod_recxs,
        });
        self.sgls.push(rsgl);
        self.oiods.push(oiod);
        self.recxs.push(array);
        Ok(())
    }
}

/// Encode the parity for every full stripe of one descriptor into its
/// parity buffers.
///
/// A stripe's cells may be discontiguous in the caller's sgl; the codec's
/// vectored encode handles that without copying.
pub(crate) fn recx_encode(codec: &Codec, layout: &EcLayout, iod: &Iod,
                          sgl: &SGList, array: &mut RecxArray) -> Result<()>
{
    if array.stripe_total == 0 {
        return Ok(());
    }
    let cell_bytes = layout.cell_bytes(iod.size) as usize;
    let stripe_bytes = cell_bytes * layout.k() as usize;
    let mut pmuts: Vec<_> = array.pbufs.iter()
        .map(|dbs| dbs.try_mut().expect("parity buffers are unshared"))
        .collect();
    let mut cursor = SGCursor::from(sgl);
    let mut last_off = 0u64;
    let mut encoded_nr = 0usize;
    for i in 0..array.recxs.len() {
        let ec_recx = array.recxs[i];
        cursor.advance((ec_recx.byte_off - last_off) as usize)?;
        last_off = ec_recx.byte_off;
        for _ in 0..ec_recx.stripe_nr {
            let mut cell_cursor = cursor;
            let cells = (0..layout.k())
                .map(|_| cell_cursor.take_sglist(cell_bytes))
                .collect::<Result<Vec<SGList>>>()?;
            let mut prefs: Vec<&mut [u8]> = pmuts.iter_mut()
                .map(|pbuf| {
                    &mut pbuf[encoded_nr * cell_bytes
                        ..(encoded_nr + 1) * cell_bytes]
                })
                .collect();
            codec.encodev(cell_bytes, &cells, &mut prefs);
            encoded_nr += 1;
            cursor.advance(stripe_bytes)?;
            last_off += stripe_bytes as u64;
        }
    }
    Ok(())
}

// LCOV_EXCL_STOP
