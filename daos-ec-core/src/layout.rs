// vim: tw=80
//! Stripe and cell geometry for an erasure-coded object class
//!
//! All of the index math here is pure arithmetic over two address spaces:
//! the linear "daos" space the application addresses records in, and the
//! target-local "vos" space each storage target keeps its cells in.  A
//! stripe is `k` cells; cell `i` of every stripe lives on data target `i`,
//! and each of the `p` parity targets holds one parity cell per stripe.

use crate::{
    types::{Error, Iod, Result, SGList, REC_ANY},
    util::*,
};

/// Alignment of a single value's per-target cells, in bytes
const SINGV_CELL_ALIGN: u64 = 8;

/// Per-data-target threshold below which a single value is stored whole on
/// one target instead of being split across all of them.
const SINGV_EVEN_DIST_FLOOR: u64 = 4096;

/// Where one target's slice of an evenly-distributed single value lives
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SingvLocal {
    /// Byte offset of the slice within the value's linear byte stream.
    /// Parity cells are addressed past the end of the value.
    pub off: u64,
    /// Bytes of real data in the slice
    pub size: u64,
    /// Zero padding needed to fill the slice out to a full cell
    pub pad: u64,
}

/// Erasure-coding geometry of one object class
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct EcLayout {
    /// Number of data targets in the group
    k: u32,
    /// Number of parity targets.  This many targets may fail before data
    /// becomes irrecoverable.
    p: u32,
    /// Cell size in records
    cell: u64,
}

impl EcLayout {
    pub fn new(k: u32, p: u32, cell: u64) -> Result<Self> {
        if k == 0 || p == 0 || cell == 0 {
            return Err(Error::Inval);
        }
        Ok(EcLayout { k, p, cell })
    }

    pub fn k(&self) -> u32 {
        self.k
    }

    pub fn p(&self) -> u32 {
        self.p
    }

    /// Total number of targets in the group
    pub fn tgt_nr(&self) -> u32 {
        self.k + self.p
    }

    /// Cell size in records
    pub fn cell_rec_nr(&self) -> u64 {
        self.cell
    }

    /// Stripe size in records
    pub fn stripe_rec_nr(&self) -> u64 {
        self.k as u64 * self.cell
    }

    pub fn cell_bytes(&self, rec_size: u64) -> u64 {
        self.cell * rec_size
    }

    pub fn stripe_bytes(&self, rec_size: u64) -> u64 {
        self.stripe_rec_nr() * rec_size
    }

    /// Which data target owns a given linear record index
    pub fn tgt_of_idx(&self, idx: u64) -> u32 {
        ((idx % self.stripe_rec_nr()) / self.cell) as u32
    }

    /// Convert a linear record index to the owning target's local index
    pub fn daos_to_vos(&self, idx: u64) -> u64 {
        (idx / self.stripe_rec_nr()) * self.cell + idx % self.cell
    }

    /// Inverse of [`daos_to_vos`](Self::daos_to_vos), given the target the
    /// local index belongs to
    pub fn vos_to_daos(&self, vos_idx: u64, tgt: u32) -> u64 {
        debug_assert!(tgt < self.k);
        (vos_idx / self.cell) * self.stripe_rec_nr()
            + tgt as u64 * self.cell
            + vos_idx % self.cell
    }

    /// Target-local index of the parity cell covering a (stripe-aligned)
    /// linear record index
    pub fn parity_of_daos(&self, idx: u64) -> u64 {
        (idx / self.stripe_rec_nr()) * self.cell
    }

    /// First linear record index of the stripe covered by a (cell-aligned)
    /// parity-space index
    pub fn daos_of_parity(&self, parity_idx: u64) -> u64 {
        (parity_idx / self.cell) * self.stripe_rec_nr()
    }

    /// Number of cells an extent touches.  This bounds the number of
    /// per-target memory segments its data splits into.
    pub fn recx_cell_nr(&self, idx: u64, nr: u64) -> u64 {
        (roundup(idx + nr, self.cell) - rounddown(idx, self.cell)) / self.cell
    }

    /// Size below which a single value goes whole onto one target
    pub fn singv_even_dist_size(&self) -> u64 {
        (self.k as u64 - 1) * SINGV_EVEN_DIST_FLOOR
    }

    /// Should this single value be stored on one target (and replicated to
    /// parity), rather than split across all data targets?
    ///
    /// When the size is not yet known (a size-discovery fetch), fall back
    /// to the supplied buffer capacity.
    pub fn singv_one_tgt(&self, iod: &Iod, sgl: Option<&SGList>) -> bool {
        let small = self.singv_even_dist_size();
        (iod.size != REC_ANY && iod.size <= small) ||
            sgl.map(|sg| sglist_len(sg) as u64 <= small).unwrap_or(false)
    }

    /// Deterministic placement of a small single value on a data target
    pub fn singv_small_idx(&self, dkey_hash: u64) -> u32 {
        (dkey_hash % self.k as u64) as u32
    }

    /// Per-target cell size of an evenly-distributed single value
    pub fn singv_cell_bytes(&self, gsize: u64) -> u64 {
        roundup(div_roundup(gsize, self.k as u64), SINGV_CELL_ALIGN)
    }

    /// Locate one target's slice of an evenly-distributed single value
    pub fn singv_local(&self, gsize: u64, tgt: u32) -> SingvLocal {
        debug_assert!(tgt < self.tgt_nr());
        let k = self.k as u64;
        let cell = self.singv_cell_bytes(gsize);
        let off = if (tgt as u64) < k {
            tgt as u64 * cell
        } else {
            // Parity cells are addressed past the end of the value
            gsize + (tgt as u64 - k) * cell
        };
        let size = if tgt == self.k - 1 {
            // The last data target's cell may be short
            gsize - (k - 1) * cell
        } else {
            cell
        };
        SingvLocal { off, size, pad: cell - size }
    }
}

// LCOV_EXCL_START
#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use super::*;

    #[test]
    fn validation() {
        assert_eq!(EcLayout::new(0, 1, 16), Err(Error::Inval));
        assert_eq!(EcLayout::new(2, 0, 16), Err(Error::Inval));
        assert_eq!(EcLayout::new(2, 1, 0), Err(Error::Inval));
        assert!(EcLayout::new(2, 1, 16).is_ok());
    }

    #[rstest]
    #[case(2, 1, 16)]
    #[case(4, 2, 1024)]
    #[case(8, 3, 4096)]
    fn index_roundtrip(#[case] k: u32, #[case] p: u32, #[case] cell: u64) {
        let layout = EcLayout::new(k, p, cell).unwrap();
        let stripe = layout.stripe_rec_nr();
        // Sample indices around every cell boundary of the first few
        // stripes, plus some deep ones.
        let mut idxs = Vec::new();
        for s in 0..3u64 {
            for c in 0..k as u64 {
                let base = s * stripe + c * cell;
                idxs.extend([base, base + 1, base + cell - 1]);
            }
        }
        idxs.extend([17 * stripe + 5, 1000 * stripe + stripe - 1]);
        for idx in idxs {
            let tgt = layout.tgt_of_idx(idx);
            let vos = layout.daos_to_vos(idx);
            assert_eq!(layout.vos_to_daos(vos, tgt), idx,
                       "roundtrip failed for idx {idx}");
        }
    }

    #[test]
    fn tgt_of_idx() {
        let layout = EcLayout::new(2, 1, 4).unwrap();
        assert_eq!(layout.tgt_of_idx(0), 0);
        assert_eq!(layout.tgt_of_idx(3), 0);
        assert_eq!(layout.tgt_of_idx(4), 1);
        assert_eq!(layout.tgt_of_idx(7), 1);
        assert_eq!(layout.tgt_of_idx(8), 0);
    }

    #[test]
    fn parity_mapping() {
        let layout = EcLayout::new(2, 1, 4).unwrap();
        // Stripe n starts at daos index 8n and owns parity records [4n, 4n+4)
        assert_eq!(layout.parity_of_daos(0), 0);
        assert_eq!(layout.parity_of_daos(8), 4);
        assert_eq!(layout.parity_of_daos(24), 12);
        assert_eq!(layout.daos_of_parity(4), 8);
        assert_eq!(layout.daos_of_parity(12), 24);
        for stripe_start in [0u64, 8, 16, 1024] {
            assert_eq!(
                layout.daos_of_parity(layout.parity_of_daos(stripe_start)),
                stripe_start);
        }
    }

    #[test]
    fn recx_cell_nr() {
        let layout = EcLayout::new(2, 1, 4).unwrap();
        assert_eq!(layout.recx_cell_nr(0, 4), 1);
        assert_eq!(layout.recx_cell_nr(1, 4), 2);
        assert_eq!(layout.recx_cell_nr(0, 9), 3);
        assert_eq!(layout.recx_cell_nr(6, 1), 1);
    }

    #[test]
    fn singv_local() {
        let layout = EcLayout::new(4, 2, 1024).unwrap();
        let gsize = 4 * SINGV_EVEN_DIST_FLOOR;   // forces even distribution
        assert!(!layout.singv_one_tgt(&Iod::single("a", gsize), None));
        let cell = layout.singv_cell_bytes(gsize);
        assert_eq!(cell, 4096);
        assert_eq!(layout.singv_local(gsize, 0),
                   SingvLocal { off: 0, size: 4096, pad: 0 });
        assert_eq!(layout.singv_local(gsize, 3),
                   SingvLocal { off: 3 * 4096, size: 4096, pad: 0 });
        // Parity cells are addressed past the end of the value
        assert_eq!(layout.singv_local(gsize, 4),
                   SingvLocal { off: gsize, size: 4096, pad: 0 });
        assert_eq!(layout.singv_local(gsize, 5),
                   SingvLocal { off: gsize + 4096, size: 4096, pad: 0 });

        // An unevenly-split value pads its last data cell
        let gsize = gsize + 100;
        let cell = layout.singv_cell_bytes(gsize);
        assert_eq!(cell, 4128);
        let last = layout.singv_local(gsize, 3);
        assert_eq!(last.size, gsize - 3 * cell);
        assert_eq!(last.pad, 4 * cell - gsize);
    }

    #[test]
    fn singv_placement() {
        let layout = EcLayout::new(2, 1, 16).unwrap();
        assert!(layout.singv_one_tgt(&Iod::single("a", 4096), None));
        assert!(!layout.singv_one_tgt(&Iod::single("a", 4097), None));
        assert_eq!(layout.singv_small_idx(0), 0);
        assert_eq!(layout.singv_small_idx(3), 1);
        assert_eq!(layout.singv_small_idx(0xdead_beef_0000_0001), 1);
    }
}
// LCOV_EXCL_STOP
