// vim: tw=80
//! Common type definitions used throughout the EC engine

use divbuf::{DivBuf, DivBufMut};
use thiserror::Error;

/// Our `IoVec`.  Unlike the standard library's, ours is reference-counted so
/// it can have more than one owner.
pub type IoVec = DivBuf;

/// Mutable version of `IoVec`.  Uniquely owned.
pub type IoVecMut = DivBufMut;

/// Our scatter-gather list.  A slice of reference-counted `IoVec`s.
pub type SGList = Vec<IoVec>;

/// Mutable version of `SGList`.  Uniquely owned.
pub type SGListMut = Vec<IoVecMut>;

/// Epoch at which an extent version exists.  Assigned by the server; opaque
/// to this crate except for equality and ordering.
pub type Epoch = u64;

/// Record size of an I/O descriptor whose size is not yet known.
///
/// An update with this record size is a punch; a fetch with it is a
/// size-discovery round.
pub const REC_ANY: u64 = 0;

/// The high bit of a record index marks the index as living in parity space
/// rather than data space.
///
/// This tagged encoding is round-tripped through transmitted recx lists, so
/// it must never change.  Use [`RecxId`] to manipulate tagged indices
/// instead of twiddling the bit directly.
pub const PARITY_INDICATOR: u64 = 1 << 63;

/// The EC engine's error type
#[derive(Clone, Copy, Debug, Error, Eq, PartialEq)]
pub enum Error {
    /// Inconsistent or out-of-contract input.  Always a programming error,
    /// never expected in steady-state operation.
    #[error("Invalid argument")]
    Inval,

    /// The supplied scatter-gather list is too short for the records it
    /// must cover.
    #[error("Record too large for the supplied buffers")]
    Rec2Big,

    /// More targets have failed than the parity count can tolerate.  Fatal
    /// to the request; never retried internally.
    #[error("Too many failed targets; data is unrecoverable")]
    DataLoss,

    /// Parity shards disagreed about extent epochs during a degraded read.
    /// The caller should discard all recovery state and restart the fetch.
    #[error("Inconsistent parity epochs; fetch must be restarted")]
    FetchAgain,
}

pub type Result<T> = std::result::Result<T, Error>;

/// A record index, tagged with the index space it lives in.
///
/// The wire encoding overloads the high bit of `rx_idx` as the space tag;
/// this enum is the internal face of that encoding.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RecxId {
    /// An index in the ordinary, linear data space
    Data(u64),
    /// A target-local index in parity space
    Parity(u64),
}

impl RecxId {
    /// Decode a raw `rx_idx` value
    pub fn from_raw(raw: u64) -> Self {
        if raw & PARITY_INDICATOR == 0 {
            RecxId::Data(raw)
        } else {
            RecxId::Parity(raw & !PARITY_INDICATOR)
        }
    }

    /// The wire-compatible encoding of this index
    pub fn raw(self) -> u64 {
        match self {
            RecxId::Data(idx) => {
                debug_assert_eq!(idx & PARITY_INDICATOR, 0);
                idx
            }
            RecxId::Parity(idx) => {
                debug_assert_eq!(idx & PARITY_INDICATOR, 0);
                idx | PARITY_INDICATOR
            }
        }
    }

    /// The index, without its space tag
    pub fn offset(self) -> u64 {
        match self {
            RecxId::Data(idx) | RecxId::Parity(idx) => idx
        }
    }
}

/// A record extent: a contiguous range of record indices.
///
/// Both fields are in record units, not bytes.  `rx_idx` may carry the
/// [`PARITY_INDICATOR`] tag.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Recx {
    pub rx_idx: u64,
    pub rx_nr: u64,
}

impl Recx {
    pub fn new(rx_idx: u64, rx_nr: u64) -> Self {
        Recx { rx_idx, rx_nr }
    }

    /// An extent in parity space, starting at the given target-local index
    pub fn parity(idx: u64, rx_nr: u64) -> Self {
        Recx { rx_idx: RecxId::Parity(idx).raw(), rx_nr }
    }

    pub fn id(&self) -> RecxId {
        RecxId::from_raw(self.rx_idx)
    }

    pub fn is_parity(&self) -> bool {
        self.rx_idx & PARITY_INDICATOR != 0
    }

    /// One past the last record index covered by this extent
    pub fn end(&self) -> u64 {
        self.rx_idx + self.rx_nr
    }
}

/// The kind of value a single I/O descriptor addresses
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IodType {
    /// One atomic value per key
    Single,
    /// An array of records, addressed by extents
    Array,
}

/// An I/O descriptor: one attribute's access pattern within a request.
///
/// The caller owns its `Iod`s; reassembly produces new, derived ones whose
/// extents are re-expressed per target.
#[derive(Clone, Debug)]
pub struct Iod {
    /// Attribute name
    pub name: String,

    /// Record size in bytes, or [`REC_ANY`] when not yet known
    pub size: u64,

    pub kind: IodType,

    /// Record extents addressed, in increasing index order.  Unused for
    /// single values.
    pub recxs: Vec<Recx>,
}

impl Iod {
    /// A new array-type descriptor
    pub fn array(name: &str, size: u64, recxs: Vec<Recx>) -> Self {
        Iod { name: name.to_owned(), size, kind: IodType::Array, recxs }
    }

    /// A new single-value descriptor.  `size` is the total value size.
    pub fn single(name: &str, size: u64) -> Self {
        Iod { name: name.to_owned(), size, kind: IodType::Single,
              recxs: Vec::new() }
    }

    /// Is this descriptor a punch (an update that removes the value)?
    pub fn is_punch(&self, update: bool) -> bool {
        update && self.size == REC_ANY
    }
}

// LCOV_EXCL_START
#[cfg(test)]
mod t {
    use pretty_assertions::assert_eq;
    use super::*;

    #[test]
    fn recx_id_roundtrip() {
        for raw in [0u64, 1, 42, PARITY_INDICATOR, PARITY_INDICATOR | 4096] {
            assert_eq!(RecxId::from_raw(raw).raw(), raw);
        }
        assert_eq!(RecxId::from_raw(7), RecxId::Data(7));
        assert_eq!(RecxId::from_raw(PARITY_INDICATOR | 7), RecxId::Parity(7));
    }

    #[test]
    fn recx_parity_tagging() {
        let recx = Recx::parity(4096, 128);
        assert!(recx.is_parity());
        assert_eq!(recx.id().offset(), 4096);
        assert_eq!(recx.rx_idx, PARITY_INDICATOR | 4096);
        assert!(!Recx::new(4096, 128).is_parity());
    }

    #[test]
    fn iod_punch() {
        let iod = Iod::array("a", REC_ANY, vec![Recx::new(0, 1)]);
        assert!(iod.is_punch(true));
        assert!(!iod.is_punch(false));
        assert!(!Iod::array("a", 1, vec![Recx::new(0, 1)]).is_punch(true));
    }
}
// LCOV_EXCL_STOP
