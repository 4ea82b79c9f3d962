// vim: tw=80
//! Reassembly of single-value (non-array) descriptors
//!
//! Single values never go through the extent scanner.  A small value lands
//! whole on one hash-chosen data target and is replicated, not encoded,
//! onto every parity target.  A large value is split into `k` equal cells
//! (the last one zero-padded) and parity is encoded over those cells like
//! an ordinary stripe.

use crate::{
    codec::Codec,
    layout::EcLayout,
    oiod::{ObjIoDesc, SIOD_SINGV},
    reasb::ReasbReq,
    recov::FailInfo,
    scan::RecxArray,
    sgcursor::SGCursor,
    types::{Iod, IodType, Result, SGList},
    util::zero_sglist,
};
use tracing::trace;

/// Encode the parity cells of an evenly-distributed single value.
///
/// The value splits into `k` cells by byte length; the last cell is
/// zero-padded up to the common cell size before encoding.
fn singv_encode(codec: &Codec, layout: &EcLayout, iod: &Iod, sgl: &SGList,
                array: &mut RecxArray) -> Result<()>
{
    let k = layout.k();
    let cell_bytes = layout.singv_cell_bytes(iod.size) as usize;
    let mut cursor = SGCursor::from(sgl);
    let mut cells = Vec::with_capacity(k as usize);
    for tgt in 0..k {
        let loc = layout.singv_local(iod.size, tgt);
        let mut cell = cursor.take_sglist(loc.size as usize)?;
        if loc.pad > 0 {
            cell.append(&mut zero_sglist(loc.pad as usize));
        }
        cells.push(cell);
    }
    let mut pmuts: Vec<_> = array.pbufs.iter()
        .map(|dbs| dbs.try_mut().expect("parity buffers are unshared"))
        .collect();
    let mut prefs: Vec<&mut [u8]> = pmuts.iter_mut()
        .map(|pbuf| &mut pbuf[..])
        .collect();
    codec.encodev(cell_bytes, &cells, &mut prefs);
    Ok(())
}

/// Reassemble one single-value descriptor.
///
/// Populates the request's reassembled iod/sgl/oiod slots and the target
/// bitmap; encodes parity when a large value is being updated.
pub fn singv_req_reasb(req: &mut ReasbReq, iod: &Iod, sgl: &SGList,
                       dkey_hash: u64, update: bool) -> Result<()>
{
    let layout = *req.layout();
    let codec = req.codec().clone();
    let punch = iod.is_punch(update);
    let mut array = RecxArray::new(layout);
    let mut singv_parity = false;

    if layout.singv_one_tgt(iod, Some(sgl)) {
        // A small value is stored whole on one target and replicated to
        // every parity target.  During a degraded fetch, read the replica
        // from a surviving parity target instead.
        let degraded = !update &&
            req.fail.as_ref().map(|f| f.nr_failed() > 0).unwrap_or(false);
        let idx = if degraded {
            req.fail.as_ref().unwrap().parity_get()?
        } else {
            layout.singv_small_idx(dkey_hash)
        };
        req.bitmap.insert(idx as usize);
        if update {
            for tgt in layout.k()..layout.tgt_nr() {
                req.bitmap.insert(tgt as usize);
            }
        }
    } else if update {
        // A large value is split across every target
        for tgt in 0..layout.tgt_nr() {
            req.bitmap.insert(tgt as usize);
        }
        singv_parity = !punch;
    } else {
        let skip = req.fail.as_ref().map(FailInfo::tgt_bitset);
        for tgt in 0..layout.k() {
            if skip.as_ref().map(|s| s.contains(tgt as usize))
                .unwrap_or(false)
            {
                continue;
            }
            req.bitmap.insert(tgt as usize);
        }
    }

    let oiod = ObjIoDesc::new(layout.tgt_nr(), SIOD_SINGV);
    let rsgl = if singv_parity {
        // Encode parity for the evenly-distributed update, then append
        // the parity cells to the caller's buffers.
        debug_assert_ne!(iod.size, crate::types::REC_ANY);
        array.stripe_total = 1;
        let cell_bytes = layout.singv_cell_bytes(iod.size);
        array.alloc_pbufs(cell_bytes);
        singv_encode(&codec, &layout, iod, sgl, &mut array)?;
        let mut rsgl = sgl.clone();
        for pbuf in array.pbufs.iter() {
            rsgl.push(pbuf.try_const()
                .expect("parity buffers are no longer mutably borrowed"));
        }
        rsgl
    } else if punch {
        SGList::new()
    } else {
        sgl.clone()
    };

    trace!(akey = %iod.name, size = iod.size, singv_parity,
           "single value reassembled");
    req.iods.push(Iod {
        name: iod.name.clone(),
        size: iod.size,
        kind: IodType::Single,
        recxs: Vec::new(),
    });
    req.sgls.push(rsgl);
    req.oiods.push(oiod);
    req.recxs.push(array);
    Ok(())
}

// LCOV_EXCL_START
#[cfg(test)]
mod tests {
    use crate::{codec::CodecRegistry, types::Recx};
    use divbuf::DivBufShared;
    use pretty_assertions::assert_eq;
    use super::*;

    fn req(k: u32, p: u32) -> ReasbReq {
        let layout = EcLayout::new(k, p, 1024).unwrap();
        let registry = CodecRegistry::new();
        let codec = registry.get(&layout);
        ReasbReq::new(layout, codec, 1)
    }

    fn value_sgl(len: usize) -> (DivBufShared, SGList) {
        let dbs = DivBufShared::from(
            (0..len).map(|i| i as u8).collect::<Vec<_>>());
        let sgl = vec![dbs.try_const().unwrap()];
        (dbs, sgl)
    }

    // A small single value updates one hash-chosen data target plus every
    // parity target, all holding plain replicas.
    #[test]
    fn small_update() {
        let mut req = req(2, 1);
        let (_dbs, sgl) = value_sgl(100);
        let iod = Iod::single("a", 100);
        req.req_reasb(&[iod], std::slice::from_ref(&sgl), 7, true).unwrap();
        // dkey_hash 7 % k targets, plus parity target 2
        assert!(req.bitmap.contains(1));
        assert!(req.bitmap.contains(2));
        assert!(!req.bitmap.contains(0));
        assert_eq!(req.tgt_nr, 2);
        assert!(req.oiods[0].is_singv());
        // replicated, not encoded: the sgl is the caller's, unchanged
        assert_eq!(req.sgls[0].len(), 1);
        assert_eq!(&req.sgls[0][0][..], &sgl[0][..]);
        assert!(req.recxs[0].pbufs.is_empty());
    }

    #[test]
    fn small_fetch_single_target() {
        let mut req = req(2, 1);
        let (_dbs, sgl) = value_sgl(100);
        let iod = Iod::single("a", 100);
        req.req_reasb(&[iod], std::slice::from_ref(&sgl), 6, false)
            .unwrap();
        assert!(req.bitmap.contains(0));
        assert_eq!(req.tgt_nr, 1);
        // fetch builds the per-target index
        assert_eq!(req.tgt_oiods.len(), 1);
        assert!(req.tgt_oiods[0].oiods[0].is_singv());
    }

    // A degraded small-value fetch reads the replica from the first
    // surviving parity target instead.
    #[test]
    fn small_fetch_degraded() {
        let mut req = req(2, 2);
        req.fail_info().insert(0).unwrap();
        let (_dbs, sgl) = value_sgl(100);
        let iod = Iod::single("a", 100);
        req.req_reasb(&[iod], std::slice::from_ref(&sgl), 0, false)
            .unwrap();
        // dkey_hash 0 would choose target 0, which has failed
        assert!(!req.bitmap.contains(0));
        assert!(req.bitmap.contains(2));
        assert_eq!(req.tgt_nr, 1);
    }

    // A large single value is split evenly and parity-encoded
    #[test]
    fn large_update_encodes_parity() {
        let mut req = req(2, 1);
        let gsize = 8192usize;     // > (k - 1) * 4096, forces distribution
        let (_dbs, sgl) = value_sgl(gsize);
        let iod = Iod::single("a", gsize as u64);
        req.req_reasb(&[iod], std::slice::from_ref(&sgl), 0, true).unwrap();
        assert_eq!(req.bitmap.count_ones(..), 3);
        let cell = 4096usize;
        // caller's span plus one parity span
        assert_eq!(req.sgls[0].len(), 2);
        assert_eq!(req.sgls[0][1].len(), cell);
        // single parity degrades to XOR of the two data cells
        for i in 0..cell {
            assert_eq!(req.sgls[0][1][i], sgl[0][i] ^ sgl[0][cell + i],
                       "parity mismatch at byte {i}");
        }
    }

    // The last cell of an unevenly-split value is zero-padded before
    // encoding.
    #[test]
    fn large_update_pads_tail() {
        let mut req = req(2, 1);
        let gsize = 8192 + 100;
        let (_dbs, sgl) = value_sgl(gsize);
        let iod = Iod::single("a", gsize as u64);
        req.req_reasb(&[iod], std::slice::from_ref(&sgl), 0, true).unwrap();
        let cell = req.layout().singv_cell_bytes(gsize as u64) as usize;
        let parity = &req.sgls[0][1];
        assert_eq!(parity.len(), cell);
        for i in 0..cell {
            let d0 = sgl[0][i];
            let d1 = if cell + i < gsize { sgl[0][cell + i] } else { 0 };
            assert_eq!(parity[i], d0 ^ d1, "parity mismatch at byte {i}");
        }
    }

    #[test]
    fn large_fetch_data_targets_only() {
        let mut req = req(4, 2);
        let gsize = 4 * 4096;
        let (_dbs, sgl) = value_sgl(gsize);
        let iod = Iod::single("a", gsize as u64);
        req.req_reasb(&[iod], std::slice::from_ref(&sgl), 0, false)
            .unwrap();
        assert_eq!(req.tgt_nr, 4);
        assert!(!req.bitmap.contains(4));
        assert!(!req.bitmap.contains(5));
    }

    // A punch of a single value emits the bitmap but no buffers
    #[test]
    fn punch() {
        let mut req = req(2, 1);
        let iod = Iod::single("a", crate::types::REC_ANY);
        let sgl = SGList::new();
        req.req_reasb(&[iod], std::slice::from_ref(&sgl), 1, true).unwrap();
        assert_eq!(req.tgt_nr, 2);
        assert!(req.sgls[0].is_empty());
        assert!(req.recxs[0].pbufs.is_empty());
    }

    // A mixed request: one array iod and one single-value iod
    #[test]
    fn mixed_with_array() {
        let mut req = req(2, 1);
        let stripe = 2 * 1024usize;
        let adbs = DivBufShared::from(vec![3u8; stripe]);
        let asgl = vec![adbs.try_const().unwrap()];
        let aiod = Iod::array("arr", 1, vec![Recx::new(0, stripe as u64)]);
        let (_sdbs, ssgl) = value_sgl(100);
        let siod = Iod::single("sv", 100);
        req.req_reasb(&[aiod, siod], &[asgl, ssgl], 0, true).unwrap();
        assert_eq!(req.iods.len(), 2);
        assert_eq!(req.iods[0].kind, IodType::Array);
        assert_eq!(req.iods[1].kind, IodType::Single);
        assert!(req.oiods[1].is_singv());
        assert_eq!(req.bitmap.count_ones(..), 3);
    }
}
// LCOV_EXCL_STOP
