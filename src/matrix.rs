// Copyright 2025 Mikael Lund
//
// Licensed under the Apache license, version 2.0 (the "license");
// you may not use this file except in compliance with the license.
// You may obtain a copy of the license at
//
//     http://www.apache.org/licenses/license-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the license is distributed on an "as is" basis,
// without warranties or conditions of any kind, either express or implied.
// See the license for the specific language governing permissions and
// limitations under the license.

//! Packed symmetric matrices.
//!
//! Multivariate hills carry the upper triangle of a symmetric `n × n` matrix,
//! stored row by row (`(0,0), (0,1), …, (0,n-1), (1,1), …`). Hills files instead
//! store the lower Cholesky factor of the covariance in band order, i.e. the
//! main diagonal first, then the first sub-diagonal and so on.

use anyhow::{anyhow, Result};
use nalgebra::{DMatrix, DVector};

/// Relative floor applied to eigenvalues before inverting a covariance.
const RELATIVE_EIGENVALUE_FLOOR: f64 = 1e-12;
/// Absolute floor used when the covariance is entirely zero.
const ABSOLUTE_EIGENVALUE_FLOOR: f64 = 1e-12;

/// Number of packed entries of a symmetric `n × n` matrix.
pub const fn packed_len(n: usize) -> usize {
    n * (n + 1) / 2
}

/// Rebuild a full symmetric matrix from its packed upper triangle.
pub fn unpack_symmetric(packed: &[f64], n: usize) -> DMatrix<f64> {
    debug_assert_eq!(packed.len(), packed_len(n));
    let mut matrix = DMatrix::zeros(n, n);
    let mut k = 0;
    for i in 0..n {
        for j in i..n {
            matrix[(i, j)] = packed[k];
            matrix[(j, i)] = packed[k];
            k += 1;
        }
    }
    matrix
}

/// Packed upper triangle of a (symmetric) matrix.
pub fn pack_upper(matrix: &DMatrix<f64>) -> Vec<f64> {
    let n = matrix.nrows();
    let mut packed = Vec::with_capacity(packed_len(n));
    for i in 0..n {
        for j in i..n {
            packed.push(matrix[(i, j)]);
        }
    }
    packed
}

/// Inverse of a symmetric matrix, symmetrized to remove round-off asymmetry.
pub fn invert_symmetric(matrix: &DMatrix<f64>) -> Result<DMatrix<f64>> {
    let inverse = matrix
        .clone()
        .try_inverse()
        .ok_or_else(|| anyhow!("matrix is singular and cannot be inverted"))?;
    Ok((&inverse + inverse.transpose()) * 0.5)
}

/// Inverse of a symmetric positive semi-definite matrix via its eigen-decomposition.
///
/// Eigenvalues are floored so that degenerate directions get a large but finite
/// inverse instead of an infinite one.
pub fn invert_floored(matrix: &DMatrix<f64>) -> DMatrix<f64> {
    let eigen = matrix.clone().symmetric_eigen();
    let largest = eigen.eigenvalues.iter().copied().fold(0.0, f64::max);
    let floor = (largest * RELATIVE_EIGENVALUE_FLOOR).max(ABSOLUTE_EIGENVALUE_FLOOR);
    let inverted = DVector::from_iterator(
        eigen.eigenvalues.len(),
        eigen.eigenvalues.iter().map(|&value| 1.0 / value.max(floor)),
    );
    let vectors = &eigen.eigenvectors;
    vectors * DMatrix::from_diagonal(&inverted) * vectors.transpose()
}

/// Largest eigenvalue of a symmetric matrix and its eigenvector.
pub fn leading_eigenpair(matrix: &DMatrix<f64>) -> (f64, DVector<f64>) {
    let eigen = matrix.clone().symmetric_eigen();
    let (index, &value) = eigen
        .eigenvalues
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .unwrap_or((0, &0.0));
    (value, eigen.eigenvectors.column(index).into_owned())
}

/// Band-ordered lower Cholesky factor of the covariance belonging to a packed precision matrix.
///
/// Entry order: `for i in 0..n { for j in 0..n-i { L(j+i, j) } }`.
pub fn precision_to_cholesky_band(precision: &[f64], n: usize) -> Result<Vec<f64>> {
    let covariance = invert_symmetric(&unpack_symmetric(precision, n))?;
    let lower = covariance
        .cholesky()
        .ok_or_else(|| anyhow!("covariance of multivariate hill is not positive definite"))?
        .l();
    let mut band = Vec::with_capacity(packed_len(n));
    for i in 0..n {
        for j in 0..n - i {
            band.push(lower[(j + i, j)]);
        }
    }
    Ok(band)
}

/// Inverse of [`precision_to_cholesky_band`]: packed precision from a band-ordered Cholesky factor.
pub fn cholesky_band_to_precision(band: &[f64], n: usize) -> Result<Vec<f64>> {
    let mut lower = DMatrix::zeros(n, n);
    let mut k = 0;
    for i in 0..n {
        for j in 0..n - i {
            lower[(j + i, j)] = band[k];
            k += 1;
        }
    }
    let covariance = &lower * lower.transpose();
    Ok(pack_upper(&invert_symmetric(&covariance)?))
}

/// Field-name suffixes `"<a>_<b>"` of the band-ordered Cholesky entries.
pub fn band_labels(names: &[&str]) -> Vec<String> {
    let n = names.len();
    let mut labels = Vec::with_capacity(packed_len(n));
    for i in 0..n {
        for j in 0..n - i {
            labels.push(format!("{}_{}", names[j + i], names[j]));
        }
    }
    labels
}
