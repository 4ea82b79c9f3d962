// vim: tw=80

//! Client-side erasure coding for a DAOS-style object store
//!
//! This crate turns an application's I/O request (attribute descriptors,
//! record extents, and scatter-gather buffers) into the per-target
//! sub-requests an erasure-coded layout demands: it classifies extents
//! against the stripe geometry, regroups extents and buffers by target,
//! encodes parity for full stripes, and, when targets fail, rebuilds lost
//! cells from the survivors and stitches them back into the caller's
//! buffers.
//!
//! It performs no I/O of its own: everything here is synchronous transform
//! logic driven by whatever task layer owns the request.

pub mod codec;
pub mod layout;
pub mod oiod;
pub mod reasb;
pub mod recov;
pub mod scan;
pub mod sgcursor;
pub mod singv;
pub mod sorter;
pub mod types;
pub mod util;

pub use crate::types::*;
pub use crate::util::*;
