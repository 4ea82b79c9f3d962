// vim: tw=80

//! Reed-Solomon erasure codec in GF(2^8)
//!
//! Field arithmetic comes from `reed_solomon_erasure`'s `galois_8`
//! primitives (prime polynomial 0x11d, the same field every peer encodes
//! in).  Matrix construction and inversion live here because the decode
//! matrix must be built for an arbitrary subset of failed targets, data- or
//! parity-side, which no stock codec API exposes.

use crate::{
    layout::EcLayout,
    sgcursor::SGCursor,
    types::SGList,
};
use fixedbitset::FixedBitSet;
use reed_solomon_erasure::galois_8;
use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

/// Generate an `m` x `k` single-generator Vandermonde-style matrix.
///
/// Its first parity row is all ones, making single-parity arrays
/// XOR-compatible.
fn gf_gen_rs_matrix(a: &mut [u8], m: usize, k: usize) {
    a.fill(0);
    for i in 0..k {
        a[k * i + i] = 1;
    }
    let mut gen: u8 = 1;
    for i in k..m {
        let mut coef: u8 = 1;
        for j in 0..k {
            a[k * i + j] = coef;
            coef = galois_8::mul(coef, gen);
        }
        gen = galois_8::mul(gen, 2);
    }
}

/// Generate an `m` x `k` Cauchy matrix: an identity block followed by
/// parity rows `a[i][j] = 1 / (i ^ j)`.
///
/// Every square submatrix of a Cauchy matrix is invertible, so any `k` of
/// the `m` coded columns suffice to reconstruct the data.
fn gf_gen_cauchy1_matrix(a: &mut [u8], m: usize, k: usize) {
    a.fill(0);
    for i in 0..k {
        a[k * i + i] = 1;
    }
    for i in k..m {
        for j in 0..k {
            a[k * i + j] = galois_8::div(1, (i ^ j) as u8);
        }
    }
}

/// Invert an `n` x `n` matrix over GF(2^8) by Gauss-Jordan elimination.
///
/// Returns `Err(())` if the matrix is singular.
fn gf_invert_matrix(src: &[u8], out: &mut [u8], n: usize)
    -> std::result::Result<(), ()>
{
    let mut mat = src.to_vec();
    out.fill(0);
    for i in 0..n {
        out[n * i + i] = 1;
    }
    for i in 0..n {
        if mat[n * i + i] == 0 {
            let pivot = (i + 1..n).find(|&r| mat[n * r + i] != 0)
                .ok_or(())?;
            for j in 0..n {
                mat.swap(n * i + j, n * pivot + j);
                out.swap(n * i + j, n * pivot + j);
            }
        }
        let inv = galois_8::div(1, mat[n * i + i]);
        for j in 0..n {
            mat[n * i + j] = galois_8::mul(inv, mat[n * i + j]);
            out[n * i + j] = galois_8::mul(inv, out[n * i + j]);
        }
        for r in 0..n {
            let coef = mat[n * r + i];
            if r == i || coef == 0 {
                continue;
            }
            for j in 0..n {
                mat[n * r + j] ^= galois_8::mul(coef, mat[n * i + j]);
                out[n * r + j] ^= galois_8::mul(coef, out[n * i + j]);
            }
        }
    }
    Ok(())
}

/// An encoder/decoder for Reed-Solomon Erasure coding in GF(2^8), oriented
/// towards striped storage targets
pub struct Codec {
    /// Total number of targets in the EC group.
    ///
    /// GF(2^8) works with up to 255 targets.
    m: u32,

    /// Redundancy level of the group.
    ///
    /// This many targets may fail before the data becomes irrecoverable.
    f: u32,

    /// Encoding coefficients, aka the distribution matrix
    enc_matrix: Box<[u8]>,
}

impl Codec {
    /// Initialize a new erasure codec
    ///
    /// # Parameters
    ///
    /// - `num_tgts`:   Total number of targets in the EC group.  May be up
    ///                 to 255.
    /// - `redundancy`: Redundancy level of the group.  This many targets
    ///                 may fail before the data becomes irrecoverable.
    pub fn new(num_tgts: u32, redundancy: u32) -> Self {
        let m = num_tgts;
        let f = redundancy;
        let k = m - f;
        let mut enc_matrix = vec![0u8; (m * k) as usize].into_boxed_slice();
        // Use Cauchy matrices instead of RS matrices because they guarantee
        // that all square submatrices are invertible.  That means that they
        // can provide any degree of redundancy, unlike RS matrices.
        // However, for single-parity groups an RS matrix produces parity
        // that is compatible with a simple XOR codec, so use RS matrices
        // there for compatibility with a faster future codec.
        if f == 1 {
            gf_gen_rs_matrix(&mut enc_matrix, m as usize, k as usize);
        } else {
            gf_gen_cauchy1_matrix(&mut enc_matrix, m as usize, k as usize);
        }
        Codec { m, f, enc_matrix }
    }

    /// Return the degree of redundancy
    pub fn protection(&self) -> u32 {
        self.f
    }

    /// Return the total number of targets in the EC group
    pub fn stripesize(&self) -> u32 {
        self.m
    }

    /// Generate parity columns from a complete set of data columns
    ///
    /// # Parameters
    /// - `len`:    Size of each column, in bytes
    /// - `data`:   Input array: `k` columns of at least `len` bytes each
    /// - `parity`: Storage for parity columns.  `f` columns of at least
    ///             `len` bytes each; the first `len` bytes of each will be
    ///             overwritten.
    pub fn encode(&self, len: usize, data: &[&[u8]],
                  parity: &mut [&mut [u8]])
    {
        let k = (self.m - self.f) as usize;
        assert_eq!(data.len(), k);
        assert_eq!(parity.len(), self.f as usize);
        for (r, pcol) in parity.iter_mut().enumerate() {
            let coefs = &self.enc_matrix[(k + r) * k..(k + r + 1) * k];
            let out = &mut pcol[..len];
            galois_8::mul_slice(coefs[0], &data[0][..len], out);
            for (col, &coef) in data.iter().zip(coefs.iter()).skip(1) {
                galois_8::mul_slice_xor(coef, &col[..len], out);
            }
        }
    }

    /// Encode parity, using vectored input
    ///
    /// Like `encode`, but with discontiguous data columns.
    ///
    /// # Parameters
    /// - `len`:    Size of each column, in bytes
    /// - `data`:   Input array: `k` columns of `len` bytes each.  They may
    ///             be discontiguous, and each may have a different
    ///             structure.
    /// - `parity`: Storage for parity columns.  `f` columns of `len` bytes
    ///             each: will be populated upon return.
    pub fn encodev(&self, len: usize, data: &[SGList],
                   parity: &mut [&mut [u8]])
    {
        let mut cursors: Vec<SGCursor> =
            data.iter()
                .map(SGCursor::from)
                .collect();
        let mut l = 0;
        while l < len {
            let ncl =
                cursors.iter()
                       .map(SGCursor::peek_len)
                       .min().unwrap()
                       .min(len - l);
            assert!(ncl > 0, "data columns shorter than {len} bytes");
            let iovecs: Vec<_> =
                cursors.iter_mut()
                       .map(|sg| sg.next(ncl).unwrap())
                       .collect();
            let refs: Vec<&[u8]> = iovecs.iter().map(|iov| &iov[..]).collect();
            let mut prefs: Vec<&mut [u8]> = parity.iter_mut()
                .map(|pcol| &mut pcol[l..l + ncl])
                .collect();
            self.encode(ncl, &refs, &mut prefs);
            l += ncl;
        }
    }

    /// Reconstruct missing columns from `k` surviving columns
    ///
    /// Given a `Codec` with `m` total columns composed of `k` data columns
    /// and `f` parity columns, where one or more columns is missing,
    /// reconstruct the missing columns.  Takes as a parameter exactly `k`
    /// surviving columns, even if more than `k` columns survive.  These
    /// *must* be the lowest `k` surviving columns, sorted in order of the
    /// original column index, with data columns preceding parity columns.
    ///
    /// # Parameters
    ///
    /// - `len`:        Size of each column, in bytes
    /// - `surviving`:  Exactly `k` surviving columns.
    /// - `missing`:    Reconstructed columns, one per erased column in
    ///                 ascending column order.  Upon return they will be
    ///                 populated with the original contents of the missing
    ///                 columns.
    /// - `erasures`:   Bitmap of the column indices of the missing columns.
    pub fn decode(&self, len: usize, surviving: &[&[u8]],
                  missing: &mut [&mut [u8]], erasures: &FixedBitSet)
    {
        let rows = self.decode_rows(erasures);
        self.decode_with_rows(len, surviving, missing, &rows);
    }

    /// Like [`decode`](Self::decode), but with a decode matrix previously
    /// built by [`decode_rows`](Self::decode_rows).  Lets a caller that
    /// retries recovery reuse the matrix as long as its failure set is
    /// unchanged.
    pub fn decode_with_rows(&self, len: usize, surviving: &[&[u8]],
                            missing: &mut [&mut [u8]], rows: &[u8])
    {
        let k = (self.m - self.f) as usize;
        assert!(!missing.is_empty(), "nothing to reconstruct");
        assert_eq!(rows.len(), k * missing.len());
        assert_eq!(surviving.len(), k);
        for (e, out) in missing.iter_mut().enumerate() {
            let coefs = &rows[e * k..(e + 1) * k];
            let out = &mut out[..len];
            galois_8::mul_slice(coefs[0], &surviving[0][..len], out);
            for (col, &coef) in surviving.iter().zip(coefs.iter()).skip(1) {
                galois_8::mul_slice_xor(coef, &col[..len], out);
            }
        }
    }

    /// Build the decode matrix for a given set of erased columns: one row
    /// of `k` coefficients per erased column, to be applied to the lowest
    /// `k` surviving columns.
    ///
    /// Cauchy submatrices are always invertible, so inversion failure here
    /// means the codec was misconfigured; it aborts rather than returning
    /// an error.
    pub fn decode_rows(&self, erasures: &FixedBitSet) -> Box<[u8]> {
        let m = self.m as usize;
        let k = m - self.f as usize;
        let err_list: Vec<usize> = erasures.ones().filter(|&i| i < m)
            .collect();
        let nerrs = err_list.len();
        assert!(nerrs > 0);
        assert!(nerrs <= self.f as usize,
                "{nerrs} failures exceed redundancy {}", self.f);
        let mut rows = vec![0u8; k * nerrs].into_boxed_slice();

        // If every failure is parity-side then all data columns survive and
        // reconstruction is just re-encoding: reuse the encoding rows.
        if err_list.iter().all(|&e| e >= k) {
            for (i, &e) in err_list.iter().enumerate() {
                rows[k * i..k * (i + 1)]
                    .copy_from_slice(&self.enc_matrix[k * e..k * (e + 1)]);
            }
            return rows;
        }

        // To generate the decoding matrix, first select the k healthy rows
        // from the encoding matrix.
        let mut dec_matrix_inv = vec![0u8; k * k].into_boxed_slice();
        let mut skips = 0;
        for i in 0..k {
            while erasures.contains(i + skips) {
                skips += 1;
            }
            let row = i + skips;
            dec_matrix_inv[k * i..k * (i + 1)]
                .copy_from_slice(&self.enc_matrix[k * row..k * (row + 1)]);
        }
        // Then invert the result
        let mut dec_matrix = vec![0u8; k * k].into_boxed_slice();
        gf_invert_matrix(&dec_matrix_inv, &mut dec_matrix, k)
            .expect("Cauchy submatrices are always invertible");
        // Finally select the rows corresponding to the missing columns.  A
        // missing data column's row comes straight from the inverted
        // matrix; a missing parity column's row is its encoding row
        // composed with the inverse.
        for (i, &e) in err_list.iter().enumerate() {
            if e < k {
                rows[k * i..k * (i + 1)]
                    .copy_from_slice(&dec_matrix[k * e..k * (e + 1)]);
            } else {
                for j in 0..k {
                    let mut s = 0u8;
                    for q in 0..k {
                        s ^= galois_8::mul(dec_matrix[k * q + j],
                                           self.enc_matrix[k * e + q]);
                    }
                    rows[k * i + j] = s;
                }
            }
        }
        rows
    }
}

/// A shared, immutable registry of codecs, one per EC geometry.
///
/// Build one at process start and hand it to every request context;
/// codecs are created on first use and never dropped.
#[derive(Default)]
pub struct CodecRegistry {
    codecs: RwLock<HashMap<(u32, u32), Arc<Codec>>>,
}

impl CodecRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the codec for an object class, creating it on first use
    pub fn get(&self, layout: &EcLayout) -> Arc<Codec> {
        let key = (layout.k(), layout.p());
        if let Some(codec) = self.codecs.read().unwrap().get(&key) {
            return codec.clone();
        }
        let mut wguard = self.codecs.write().unwrap();
        wguard.entry(key)
            .or_insert_with(|| Arc::new(Codec::new(key.0 + key.1, key.1)))
            .clone()
    }
}

// LCOV_EXCL_STOP
