// vim: tw=80
//! Failed-target tracking and stripe-level data recovery
//!
//! A request's `FailInfo` moves through four phases: no failures, tracking
//! failures (targets observed failing as sub-request replies come in),
//! decode-ready (the matrix for the current failure set has been built),
//! and recovering (stripe tasks exist and are being refetched and
//! decoded).  The failure set is shared by every concurrent sub-task of
//! one request, so it lives behind a mutex; everything else is driven by
//! the single thread that owns the request.
//!
//! State is never reset automatically; a caller retiring or restarting a
//! request must [`clear`](FailInfo::clear) it explicitly.

use crate::{
    codec::Codec,
    layout::EcLayout,
    types::{Epoch, Error, Iod, IodType, IoVecMut, Recx, RecxId, Result,
            SGListMut},
    util::{rounddown, roundup},
};
use divbuf::DivBufShared;
use fixedbitset::FixedBitSet;
use std::sync::Mutex;
use tracing::{debug, trace, warn};

/// One extent the client is missing, tagged with the epoch it must be
/// read at
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RecxEp {
    pub recx: Recx,
    pub epoch: Epoch,
}

/// A server-reported list of missing extents for one descriptor
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RecxEpList {
    pub recxs: Vec<RecxEp>,
}

/// One stripe-granularity recovery task.
///
/// The buffer is a view into the per-descriptor scratch arena, holding one
/// cell-sized slot per target (`k` data slots followed by `p` parity
/// slots).  Surviving slots are filled by refetching at `epoch`; failed
/// slots are reconstructed in place.
#[derive(Debug)]
pub struct RecovTask {
    pub epoch: Epoch,
    /// A single-extent descriptor covering exactly one stripe (no extents
    /// for a single value)
    pub iod: Iod,
    pub buf: IoVecMut,
}

/// Recovery state for one descriptor: the scratch arena and its tasks
#[derive(Debug)]
pub struct IodRecovery {
    /// Backs every task buffer; outlives all of them
    _scratch: DivBufShared,
    pub tasks: Vec<RecovTask>,
}

#[derive(Debug, Default)]
struct FailInner {
    /// Failed target offsets, unordered, at most `p` of them
    tgts: Vec<u32>,

    /// Decode matrix for the current failure set.  Invalidated whenever
    /// the set changes, rebuilt on demand.
    rows: Option<Box<[u8]>>,

    /// Parity targets already chosen to serve a replica read
    used_parities: Vec<u32>,

    /// First parity shard's view of what exists, per descriptor; later
    /// shards must agree with it
    parity_lists: Vec<Option<RecxEpList>>,

    /// Stripe recovery tasks, per descriptor
    recovs: Vec<IodRecovery>,
}

/// Failure tracking and recovery for one logical object request
#[derive(Debug)]
pub struct FailInfo {
    layout: EcLayout,
    inner: Mutex<FailInner>,
}

impl FailInfo {
    pub fn new(layout: EcLayout) -> Self {
        FailInfo {
            layout,
            inner: Mutex::new(FailInner::default()),
        }
    }

    /// Record a newly-observed failed target.
    ///
    /// Idempotent: re-inserting a known-failed target changes nothing and
    /// keeps the decode matrix.  Fails with [`Error::DataLoss`], leaving
    /// the set untouched, once more than `p` targets would be failed.
    pub fn insert(&self, tgt: u32) -> Result<()> {
        if tgt >= self.layout.tgt_nr() {
            return Err(Error::Inval);
        }
        let mut inner = self.inner.lock().unwrap();
        if inner.tgts.contains(&tgt) {
            return Ok(());
        }
        if inner.tgts.len() >= self.layout.p() as usize {
            warn!(tgt, nr_failed = inner.tgts.len(),
                  "failure budget exhausted");
            return Err(Error::DataLoss);
        }
        debug!(tgt, "target failed");
        inner.tgts.push(tgt);
        // the failure set changed, so any decode matrix is stale
        inner.rows = None;
        Ok(())
    }

    pub fn nr_failed(&self) -> u32 {
        self.inner.lock().unwrap().tgts.len() as u32
    }

    /// Failed target offsets, in ascending order
    pub fn fail_tgts(&self) -> Vec<u32> {
        let mut tgts = self.inner.lock().unwrap().tgts.clone();
        tgts.sort_unstable();
        tgts
    }

    /// The failed targets as a bitset over the whole group
    pub fn tgt_bitset(&self) -> FixedBitSet {
        let mut set = FixedBitSet::with_capacity(
            self.layout.tgt_nr() as usize);
        for tgt in self.inner.lock().unwrap().tgts.iter() {
            set.insert(*tgt as usize);
        }
        set
    }

    /// Is the decode matrix for the current failure set built?
    pub fn decode_ready(&self) -> bool {
        self.inner.lock().unwrap().rows.is_some()
    }

    /// Pick the first surviving parity target that hasn't already been
    /// used to serve a replica read
    pub fn parity_get(&self) -> Result<u32> {
        let mut inner = self.inner.lock().unwrap();
        for tgt in self.layout.k()..self.layout.tgt_nr() {
            if inner.tgts.contains(&tgt) ||
                inner.used_parities.contains(&tgt)
            {
                continue;
            }
            inner.used_parities.push(tgt);
            return Ok(tgt);
        }
        Err(Error::DataLoss)
    }

    /// Build the decode matrix for the current failure set.
    ///
    /// A no-op while the set is unchanged since the last build; the
    /// rebuilt matrix covers exactly the failed offsets, data- or
    /// parity-side.
    pub fn build_decode(&self, codec: &Codec) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.rows.is_some() {
            return Ok(());
        }
        if inner.tgts.is_empty() {
            return Err(Error::Inval);
        }
        let mut erasures = FixedBitSet::with_capacity(
            self.layout.tgt_nr() as usize);
        for tgt in inner.tgts.iter() {
            erasures.insert(*tgt as usize);
        }
        inner.rows = Some(codec.decode_rows(&erasures));
        trace!(nr_failed = inner.tgts.len(), "decode matrix built");
        Ok(())
    }

    /// Merge one parity shard's report of what extents exist at what
    /// epochs.
    ///
    /// The first report per descriptor is kept; every later one must match
    /// it exactly.  A mismatch means background aggregation raced the
    /// degraded read, and the whole fetch must be restarted.
    pub fn merge_parity_list(&self, iod_idx: usize, list: &RecxEpList)
        -> Result<()>
    {
        let mut inner = self.inner.lock().unwrap();
        if inner.parity_lists.len() <= iod_idx {
            inner.parity_lists.resize(iod_idx + 1, None);
        }
        match &inner.parity_lists[iod_idx] {
            None => {
                inner.parity_lists[iod_idx] = Some(list.clone());
                Ok(())
            }
            Some(prev) if prev == list => Ok(()),
            Some(prev) => {
                warn!(iod_idx, ?prev, current = ?list,
                      "parity shards disagree; restarting the fetch");
                Err(Error::FetchAgain)
            }
        }
    }

    /// Turn a reported missing extent into the linear data range it
    /// shadows.  Parity-space reports cover whole stripes.
    fn shadow_range(&self, recx: &Recx) -> (u64, u64) {
        match recx.id() {
            RecxId::Data(idx) => (idx, idx + recx.rx_nr),
            RecxId::Parity(idx) => {
                let start = self.layout.daos_of_parity(idx);
                (start, start + recx.rx_nr * self.layout.k() as u64)
            }
        }
    }

    /// Build the recovery tasks: per descriptor, the minimal set of
    /// stripe-aligned ranges covering every reported gap, one task per
    /// stripe, all sharing one scratch allocation.
    ///
    /// Only the first call builds; retries reuse the existing tasks.
    pub fn recov_prep(&self, iods: &[Iod], lists: &[RecxEpList])
        -> Result<()>
    {
        let mut inner = self.inner.lock().unwrap();
        if !inner.recovs.is_empty() {
            return Ok(());
        }
        let layout = &self.layout;
        let slot_nr = layout.tgt_nr() as usize;
        for (iod, list) in iods.iter().zip(lists.iter()) {
            if iod.kind == IodType::Single {
                let cell = layout.singv_cell_bytes(iod.size) as usize;
                let epoch = list.recxs.iter().map(|re| re.epoch).max()
                    .unwrap_or(0);
                let scratch =
                    DivBufShared::from(vec![0u8; slot_nr * cell]);
                let buf = scratch.try_mut()
                    .expect("scratch buffer is uniquely owned");
                inner.recovs.push(IodRecovery {
                    tasks: vec![RecovTask {
                        epoch,
                        iod: Iod::single(&iod.name, iod.size),
                        buf,
                    }],
                    _scratch: scratch,
                });
                continue;
            }

            let stripe_rec_nr = layout.stripe_rec_nr();
            // every stripe any reported gap touches, with the newest
            // epoch reported for it
            let mut stripes: Vec<(u64, Epoch)> = Vec::new();
            for re in list.recxs.iter() {
                let (lo, hi) = self.shadow_range(&re.recx);
                let mut start = rounddown(lo, stripe_rec_nr);
                while start < roundup(hi, stripe_rec_nr) {
                    match stripes.iter_mut().find(|(s, _)| *s == start) {
                        Some(entry) => entry.1 = entry.1.max(re.epoch),
                        None => stripes.push((start, re.epoch)),
                    }
                    start += stripe_rec_nr;
                }
            }
            stripes.sort_unstable_by_key(|(s, _)| *s);
            let cell_bytes = layout.cell_bytes(iod.size) as usize;
            let stripe_buf = slot_nr * cell_bytes;
            let scratch = DivBufShared::from(
                vec![0u8; stripes.len() * stripe_buf]);
            let mut whole = scratch.try_mut()
                .expect("scratch buffer is uniquely owned");
            let mut tasks = Vec::with_capacity(stripes.len());
            for (start, epoch) in stripes.into_iter() {
                let buf = whole.split_to(stripe_buf);
                tasks.push(RecovTask {
                    epoch,
                    iod: Iod::array(&iod.name, iod.size,
                                    vec![Recx::new(start, stripe_rec_nr)]),
                    buf,
                });
            }
            trace!(akey = %iod.name, nr_tasks = tasks.len(),
                   "recovery tasks prepared");
            inner.recovs.push(IodRecovery { tasks, _scratch: scratch });
        }
        Ok(())
    }

    /// Visit every recovery task, e.g. to fill the surviving cell slots
    /// from refetched data.  `f` receives the descriptor index and the
    /// task.
    pub fn for_each_task<F>(&self, mut f: F)
        where F: FnMut(usize, &mut RecovTask)
    {
        let mut inner = self.inner.lock().unwrap();
        for (iod_idx, recov) in inner.recovs.iter_mut().enumerate() {
            for task in recov.tasks.iter_mut() {
                f(iod_idx, task);
            }
        }
    }

    /// Reconstruct every failed cell and stitch the recovered bytes back
    /// into the caller's original scatter-gather lists.
    ///
    /// Each task's buffer must already hold the surviving cells, fetched
    /// at the task's epoch.  Only the overlap between a recovered stripe
    /// and the originally-requested extents is copied back.
    pub fn recov_data(&self, codec: &Codec, iods: &[Iod],
                      sgls: &mut [SGListMut]) -> Result<()>
    {
        self.build_decode(codec)?;
        let mut inner = self.inner.lock().unwrap();
        let inner = &mut *inner;
        let k = self.layout.k() as usize;
        let rows = inner.rows.as_ref().unwrap();
        let mut failed = FixedBitSet::with_capacity(
            self.layout.tgt_nr() as usize);
        for tgt in inner.tgts.iter() {
            failed.insert(*tgt as usize);
        }

        for (recov, (iod, sgl)) in inner.recovs.iter_mut()
            .zip(iods.iter().zip(sgls.iter_mut()))
        {
            let singv = iod.kind == IodType::Single;
            let cell_bytes = if singv {
                self.layout.singv_cell_bytes(iod.size) as usize
            } else {
                self.layout.cell_bytes(iod.size) as usize
            };
            for task in recov.tasks.iter_mut() {
                // Partition the buffer's cell slots into the k lowest
                // survivors and the failed slots, then decode in place.
                {
                    let mut surviving = Vec::with_capacity(k);
                    let mut missing = Vec::new();
                    for (i, chunk) in
                        task.buf.chunks_mut(cell_bytes).enumerate()
                    {
                        if failed.contains(i) {
                            missing.push(chunk);
                        } else if surviving.len() < k {
                            surviving.push(chunk);
                        }
                    }
                    let surv_refs: Vec<&[u8]> = surviving.iter()
                        .map(|chunk| &chunk[..])
                        .collect();
                    codec.decode_with_rows(cell_bytes, &surv_refs,
                                           &mut missing, rows);
                }
                // The first k slots now hold the stripe's linear bytes;
                // copy the overlap with each requested extent back.
                if singv {
                    sgl_write_at(sgl, 0, &task.buf[..iod.size as usize])?;
                    continue;
                }
                let stripe = task.iod.recxs[0];
                let mut off_bytes = 0u64;
                for recx in iod.recxs.iter() {
                    let lo = stripe.rx_idx.max(recx.rx_idx);
                    let hi = stripe.end().min(recx.end());
                    if lo < hi {
                        let src = &task.buf[
                            ((lo - stripe.rx_idx) * iod.size) as usize
                            ..((hi - stripe.rx_idx) * iod.size) as usize];
                        let dst = off_bytes
                            + (lo - recx.rx_idx) * iod.size;
                        sgl_write_at(sgl, dst as usize, src)?;
                    }
                    off_bytes += recx.rx_nr * iod.size;
                }
            }
        }
        Ok(())
    }

    /// Reset to the no-failures state.  Called between independent
    /// requests; recovery state never resets itself.
    pub fn clear(&self) {
        *self.inner.lock().unwrap() = FailInner::default();
    }
}

/// Copy `src` into a scatter-gather list at the given byte offset,
/// crossing iovec boundaries as needed.
fn sgl_write_at(sgl: &mut SGListMut, mut off: usize, mut src: &[u8])
    -> Result<()>
{
    for iovec in sgl.iter_mut() {
        if off >= iovec.len() {
            off -= iovec.len();
            continue;
        }
        let n = (iovec.len() - off).min(src.len());
        iovec[off..off + n].copy_from_slice(&src[..n]);
        src = &src[n..];
        off = 0;
        if src.is_empty() {
            return Ok(());
        }
    }
    if src.is_empty() {
        Ok(())
    } else {
        Err(Error::Rec2Big)
    }
}

// LCOV_EXCL_START
#[cfg(test)]
mod tests {
    use crate::codec::CodecRegistry;
    use divbuf::DivBufShared;
    use pretty_assertions::assert_eq;
    use rand::{Rng, SeedableRng};
    use rand_xorshift::XorShiftRng;
    use std::sync::Arc;
    use super::*;

    fn layout() -> EcLayout {
        EcLayout::new(2, 1, 4096).unwrap()
    }

    fn codec_for(layout: &EcLayout) -> Arc<Codec> {
        CodecRegistry::new().get(layout)
    }

    // Inserting the same failed target twice changes nothing and keeps
    // the decode matrix.
    #[test]
    fn idempotent_insert() {
        let l = layout();
        let fi = FailInfo::new(l);
        let codec = codec_for(&l);
        fi.insert(0).unwrap();
        fi.build_decode(&codec).unwrap();
        assert!(fi.decode_ready());
        fi.insert(0).unwrap();
        assert_eq!(fi.fail_tgts(), vec![0]);
        assert!(fi.decode_ready(), "matrix rebuilt for an unchanged set");
        // A genuinely new failure invalidates it
        let l2 = EcLayout::new(2, 2, 4096).unwrap();
        let fi2 = FailInfo::new(l2);
        fi2.insert(0).unwrap();
        fi2.build_decode(&codec_for(&l2)).unwrap();
        fi2.insert(1).unwrap();
        assert!(!fi2.decode_ready());
    }

    // One failure beyond the parity budget is unrecoverable, and the
    // previously-valid set stays intact.
    #[test]
    fn data_loss_past_budget() {
        let fi = FailInfo::new(layout());
        fi.insert(1).unwrap();
        assert_eq!(fi.insert(2), Err(Error::DataLoss));
        assert_eq!(fi.fail_tgts(), vec![1]);
        assert_eq!(fi.insert(9), Err(Error::Inval));
    }

    #[test]
    fn parity_get_exhaustion() {
        let l = EcLayout::new(2, 2, 4096).unwrap();
        let fi = FailInfo::new(l);
        fi.insert(2).unwrap();
        // target 2 failed, so the first usable parity is 3; after that
        // nothing is left
        assert_eq!(fi.parity_get(), Ok(3));
        assert_eq!(fi.parity_get(), Err(Error::DataLoss));
    }

    #[test]
    fn parity_list_mismatch() {
        let fi = FailInfo::new(layout());
        let a = RecxEpList {
            recxs: vec![RecxEp { recx: Recx::new(0, 8192), epoch: 5 }],
        };
        let mut b = a.clone();
        fi.merge_parity_list(0, &a).unwrap();
        fi.merge_parity_list(0, &a).unwrap();
        b.recxs[0].epoch = 6;
        assert_eq!(fi.merge_parity_list(0, &b), Err(Error::FetchAgain));
        // the first view is retained
        fi.merge_parity_list(0, &a).unwrap();
    }

    // Stripe tasks: one per touched stripe, deduplicated, newest epoch
    // wins, parity-space reports convert to whole stripes.
    #[test]
    fn prep_builds_stripe_tasks() {
        let l = layout();
        let fi = FailInfo::new(l);
        fi.insert(0).unwrap();
        let iod = Iod::array("a", 1, vec![Recx::new(0, 16384)]);
        let list = RecxEpList { recxs: vec![
            RecxEp { recx: Recx::new(100, 200), epoch: 5 },
            RecxEp { recx: Recx::new(300, 100), epoch: 7 },
            // parity-space report for the second stripe
            RecxEp { recx: Recx::parity(4096, 4096), epoch: 3 },
        ]};
        fi.recov_prep(&[iod], &[list]).unwrap();
        let mut seen = Vec::new();
        fi.for_each_task(|iod_idx, task| {
            assert_eq!(iod_idx, 0);
            // one cell-sized slot per target
            assert_eq!(task.buf.len(), 3 * 4096);
            seen.push((task.iod.recxs[0], task.epoch));
        });
        assert_eq!(seen, vec![
            (Recx::new(0, 8192), 7),
            (Recx::new(8192, 8192), 3),
        ]);
    }

    // End-to-end: encode a stripe, lose a data target, refetch the
    // survivors, reconstruct, and stitch into a fragmented caller sgl.
    #[test_log::test]
    fn recover_stripe() {
        let l = layout();
        let codec = codec_for(&l);
        let cell = 4096usize;
        let mut rng = XorShiftRng::seed_from_u64(0x5ca1ab1e);
        let d0: Vec<u8> = (0..cell).map(|_| rng.gen()).collect();
        let d1: Vec<u8> = (0..cell).map(|_| rng.gen()).collect();
        let mut parity = vec![0u8; cell];
        codec.encode(cell, &[&d0, &d1], &mut [&mut parity]);

        let fi = FailInfo::new(l);
        fi.insert(0).unwrap();
        // The caller asked for records [0, 5000); target 0's cell is gone
        let iod = Iod::array("a", 1, vec![Recx::new(0, 5000)]);
        let list = RecxEpList { recxs: vec![
            RecxEp { recx: Recx::new(0, 4096), epoch: 9 },
        ]};
        fi.recov_prep(std::slice::from_ref(&iod), &[list]).unwrap();
        // Refetch fills the surviving slots: cell 1 and the parity cell
        fi.for_each_task(|_, task| {
            assert_eq!(task.epoch, 9);
            task.buf[cell..2 * cell].copy_from_slice(&d1);
            task.buf[2 * cell..3 * cell].copy_from_slice(&parity);
        });

        let user0 = DivBufShared::from(vec![0u8; 3000]);
        let user1 = DivBufShared::from(vec![0u8; 2000]);
        let mut sgls = vec![vec![user0.try_mut().unwrap(),
                                 user1.try_mut().unwrap()]];
        fi.recov_data(&codec, std::slice::from_ref(&iod), &mut sgls)
            .unwrap();
        drop(sgls);
        let r0 = user0.try_const().unwrap();
        let r1 = user1.try_const().unwrap();
        assert_eq!(&r0[..], &d0[..3000]);
        assert_eq!(&r1[..cell - 3000], &d0[3000..]);
        assert_eq!(&r1[cell - 3000..], &d1[..5000 - cell]);
    }

    // Recovery copies only the overlap when the stripe extends past the
    // caller's extent
    #[test]
    fn recover_partial_overlap() {
        let l = layout();
        let codec = codec_for(&l);
        let cell = 4096usize;
        let d0: Vec<u8> = vec![0xaa; cell];
        let d1: Vec<u8> = vec![0xbb; cell];
        let mut parity = vec![0u8; cell];
        codec.encode(cell, &[&d0, &d1], &mut [&mut parity]);

        let fi = FailInfo::new(l);
        fi.insert(1).unwrap();
        // Caller wants [6000, 2000 records); only target 1's part of the
        // stripe overlaps it
        let iod = Iod::array("a", 1, vec![Recx::new(6000, 2000)]);
        let list = RecxEpList { recxs: vec![
            RecxEp { recx: Recx::new(6000, 2000), epoch: 1 },
        ]};
        fi.recov_prep(std::slice::from_ref(&iod), &[list]).unwrap();
        fi.for_each_task(|_, task| {
            task.buf[..cell].copy_from_slice(&d0);
            task.buf[2 * cell..3 * cell].copy_from_slice(&parity);
        });
        let user = DivBufShared::from(vec![0u8; 2000]);
        let mut sgls = vec![vec![user.try_mut().unwrap()]];
        fi.recov_data(&codec, std::slice::from_ref(&iod), &mut sgls)
            .unwrap();
        drop(sgls);
        let result = user.try_const().unwrap();
        assert_eq!(&result[..], &vec![0xbb; 2000][..]);
    }

    #[test]
    fn clear_resets_everything() {
        let fi = FailInfo::new(layout());
        fi.insert(2).unwrap();
        fi.parity_get().unwrap_err();
        fi.clear();
        assert_eq!(fi.nr_failed(), 0);
        assert!(!fi.decode_ready());
        assert_eq!(fi.parity_get(), Ok(2));
    }

    #[test]
    fn sgl_write_crosses_iovecs() {
        let dbs0 = DivBufShared::from(vec![0u8; 4]);
        let dbs1 = DivBufShared::from(vec![0u8; 4]);
        let mut sgl = vec![dbs0.try_mut().unwrap(),
                           dbs1.try_mut().unwrap()];
        sgl_write_at(&mut sgl, 2, &[1, 2, 3, 4]).unwrap();
        assert_eq!(&sgl[0][..], &[0, 0, 1, 2][..]);
        assert_eq!(&sgl[1][..], &[3, 4, 0, 0][..]);
        assert_eq!(sgl_write_at(&mut sgl, 7, &[1, 2]),
                   Err(Error::Rec2Big));
    }
}
// LCOV_EXCL_STOP
