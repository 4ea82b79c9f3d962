// vim: tw=80
//! Per-target slices of a reassembled I/O descriptor
//!
//! After reassembly, one `ObjIoDesc` per IOD records how the reassembled
//! extent array splits across targets.  The `TgtOiod` index inverts that
//! mapping: one entry per participating target, used to emit one
//! sub-request per target (fan-out) and to interpret its reply (fan-in).

use crate::types::Recx;
use fixedbitset::FixedBitSet;

/// All participating targets hold the same set of extents (a fully-striped
/// update); sub-requests may be dispatched without per-target slicing.
pub const SIOD_EVEN_DIST: u32 = 0x1;
/// The descriptor addresses a single value; there are no extent slices.
pub const SIOD_SINGV: u32 = 0x2;
/// The descriptor carries exactly one target's slice.
pub const SIOD_PROC_ONE: u32 = 0x4;

/// One target's slice of a reassembled extent array
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ShardIod {
    /// Target this slice belongs to
    pub tgt_idx: u32,
    /// First index of the slice within the reassembled recx array
    pub idx: u32,
    /// Number of recxs in the slice
    pub nr: u32,
    /// Byte offset of this target's data within the reassembled data
    /// stream
    pub off: u64,
}

/// Per-target slicing of one reassembled I/O descriptor
#[derive(Clone, Debug, Default)]
pub struct ObjIoDesc {
    /// One entry per participating target, in target order.  Empty for
    /// single values.
    pub siods: Vec<ShardIod>,
    pub flags: u32,
}

impl ObjIoDesc {
    pub fn new(tgt_nr: u32, flags: u32) -> Self {
        ObjIoDesc {
            siods: Vec::with_capacity(tgt_nr as usize),
            flags,
        }
    }

    pub fn is_singv(&self) -> bool {
        self.flags & SIOD_SINGV != 0
    }

    /// The slice belonging to `tgt`, if it participates
    pub fn siod(&self, tgt: u32) -> Option<&ShardIod> {
        self.siods.iter().find(|siod| siod.tgt_idx == tgt)
    }

    /// Slice a reassembled recx array down to one target's extents
    pub fn tgt_recxs<'a>(&self, tgt: u32, recxs: &'a [Recx])
        -> Option<&'a [Recx]>
    {
        self.siod(tgt).map(|siod| {
            &recxs[siod.idx as usize..(siod.idx + siod.nr) as usize]
        })
    }
}

/// One target's view of every IOD in a request
#[derive(Clone, Debug)]
pub struct TgtOiod {
    pub tgt_idx: u32,
    /// Per-IOD byte offset of this target's data
    pub offs: Vec<u64>,
    /// Per-IOD descriptor holding only this target's slice
    pub oiods: Vec<ObjIoDesc>,
}

impl TgtOiod {
    /// Build the per-target index from the reassembled descriptors.
    ///
    /// Built once per request, after every IOD has been reassembled.  When
    /// only one data target participates in the whole request every target
    /// reads from the same un-reassembled buffer, so `single_tgt` forces
    /// all byte offsets to zero.
    pub fn build(r_oiods: &[ObjIoDesc], bitmap: &FixedBitSet,
                 single_tgt: bool) -> Vec<TgtOiod>
    {
        let iod_nr = r_oiods.len();
        let mut tgt_oiods: Vec<TgtOiod> = bitmap.ones().map(|tgt| {
            let oiods = (0..iod_nr).map(|_| {
                let mut oiod = ObjIoDesc::new(1, SIOD_PROC_ONE);
                oiod.siods.push(ShardIod {
                    tgt_idx: tgt as u32,
                    ..Default::default()
                });
                oiod
            }).collect();
            TgtOiod {
                tgt_idx: tgt as u32,
                offs: vec![0; iod_nr],
                oiods,
            }
        }).collect();

        // Traverse the reassembled descriptors and fill each target's view
        for (i, r_oiod) in r_oiods.iter().enumerate() {
            if r_oiod.is_singv() {
                for tgt_oiod in tgt_oiods.iter_mut() {
                    let oiod = &mut tgt_oiod.oiods[i];
                    oiod.flags |= SIOD_SINGV;
                    oiod.siods.clear();
                }
                continue;
            }
            for r_siod in r_oiod.siods.iter() {
                let tgt_oiod = tgt_oiods.iter_mut()
                    .find(|t| t.tgt_idx == r_siod.tgt_idx)
                    .expect("siod target missing from the bitmap");
                tgt_oiod.offs[i] = if single_tgt { 0 } else { r_siod.off };
                let siod = &mut tgt_oiod.oiods[i].siods[0];
                debug_assert_eq!(siod.tgt_idx, r_siod.tgt_idx);
                siod.idx = r_siod.idx;
                siod.nr = r_siod.nr;
                siod.off = tgt_oiod.offs[i];
            }
        }
        tgt_oiods
    }

    /// Look up one target's view
    pub fn get<'a>(tgt_oiods: &'a [TgtOiod], tgt_idx: u32)
        -> Option<&'a TgtOiod>
    {
        tgt_oiods.iter().find(|t| t.tgt_idx == tgt_idx)
    }
}

// LCOV_EXCL_START
#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use super::*;

    fn bitmap(bits: &[usize], nbits: usize) -> FixedBitSet {
        let mut bitmap = FixedBitSet::with_capacity(nbits);
        for b in bits {
            bitmap.insert(*b);
        }
        bitmap
    }

    #[test]
    fn build_and_get() {
        let mut oiod = ObjIoDesc::new(2, 0);
        oiod.siods.push(ShardIod { tgt_idx: 0, idx: 0, nr: 2, off: 0 });
        oiod.siods.push(ShardIod { tgt_idx: 2, idx: 2, nr: 1, off: 8192 });
        let bm = bitmap(&[0, 2], 3);
        let tgt_oiods = TgtOiod::build(&[oiod], &bm, false);
        assert_eq!(tgt_oiods.len(), 2);

        let t0 = TgtOiod::get(&tgt_oiods, 0).unwrap();
        assert_eq!(t0.offs[0], 0);
        assert_eq!(t0.oiods[0].siods[0],
                   ShardIod { tgt_idx: 0, idx: 0, nr: 2, off: 0 });
        assert_eq!(t0.oiods[0].flags, SIOD_PROC_ONE);

        let t2 = TgtOiod::get(&tgt_oiods, 2).unwrap();
        assert_eq!(t2.offs[0], 8192);
        assert_eq!(t2.oiods[0].siods[0],
                   ShardIod { tgt_idx: 2, idx: 2, nr: 1, off: 8192 });

        assert!(TgtOiod::get(&tgt_oiods, 1).is_none());
    }

    // With a single participating data target, every byte offset collapses
    // to zero.
    #[test]
    fn single_tgt_zeroes_offsets() {
        let mut oiod = ObjIoDesc::new(1, 0);
        oiod.siods.push(ShardIod { tgt_idx: 1, idx: 0, nr: 3, off: 4096 });
        let bm = bitmap(&[1], 3);
        let tgt_oiods = TgtOiod::build(&[oiod], &bm, true);
        let t1 = TgtOiod::get(&tgt_oiods, 1).unwrap();
        assert_eq!(t1.offs[0], 0);
        assert_eq!(t1.oiods[0].siods[0].off, 0);
    }

    #[test]
    fn singv_entries() {
        let oiod = ObjIoDesc::new(3, SIOD_SINGV);
        let bm = bitmap(&[0, 1, 2], 3);
        let tgt_oiods = TgtOiod::build(&[oiod], &bm, false);
        for t in tgt_oiods.iter() {
            assert!(t.oiods[0].is_singv());
            assert!(t.oiods[0].siods.is_empty());
        }
    }

    #[test]
    fn tgt_recxs() {
        let mut oiod = ObjIoDesc::new(2, 0);
        oiod.siods.push(ShardIod { tgt_idx: 0, idx: 0, nr: 2, off: 0 });
        oiod.siods.push(ShardIod { tgt_idx: 1, idx: 2, nr: 1, off: 128 });
        let recxs = [Recx::new(0, 4), Recx::new(16, 4), Recx::new(4, 4)];
        assert_eq!(oiod.tgt_recxs(0, &recxs).unwrap(), &recxs[0..2]);
        assert_eq!(oiod.tgt_recxs(1, &recxs).unwrap(), &recxs[2..3]);
        assert!(oiod.tgt_recxs(2, &recxs).is_none());
    }
}
// LCOV_EXCL_STOP
