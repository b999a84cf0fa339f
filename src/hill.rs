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

//! Gaussian hills and their evaluation.

use crate::collective_variable::CollectiveVariable;
use crate::matrix::{packed_len, unpack_symmetric};
use anyhow::{bail, Result};
use derive_getters::Getters;
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

/// Half squared normalized distance beyond which a hill contributes exactly zero.
///
/// `exp(-6.25) ≈ 1.9e-3`, i.e. the truncated tail is below 0.2% of the height.
pub const DP2_CUTOFF: f64 = 6.25;

/// Widths below this are treated as zero when inverted.
const MIN_WIDTH: f64 = 1e-20;

/// Shape of a deposited Gaussian.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HillShape {
    /// Axis-aligned Gaussian with one sigma per CV.
    Isotropic,
    /// Arbitrarily oriented Gaussian given by a packed precision matrix.
    Multivariate,
}

impl HillShape {
    /// Number of width parameters for `ncv` collective variables.
    pub const fn num_widths(&self, ncv: usize) -> usize {
        match self {
            Self::Isotropic => ncv,
            Self::Multivariate => packed_len(ncv),
        }
    }
}

/// One deposited Gaussian.
///
/// For isotropic hills `width` holds one sigma per CV. For multivariate hills it
/// holds the packed upper triangle of the precision (inverse covariance) matrix.
#[derive(Debug, Clone, PartialEq, Getters)]
pub struct Hill {
    center: Vec<f64>,
    width: Vec<f64>,
    height: f64,
    shape: HillShape,
    #[getter(skip)]
    inverse_width: Vec<f64>,
    #[getter(skip)]
    precision: Option<DMatrix<f64>>,
}

impl Hill {
    pub fn new(center: Vec<f64>, width: Vec<f64>, height: f64, shape: HillShape) -> Result<Self> {
        let expected = shape.num_widths(center.len());
        if width.len() != expected {
            bail!(
                "{:?} hill in {} dimensions needs {} width parameters, got {}",
                shape,
                center.len(),
                expected,
                width.len()
            );
        }
        if !height.is_finite() || height < 0.0 {
            bail!("hill height must be finite and non-negative, got {}", height);
        }
        if center.iter().chain(&width).any(|x| !x.is_finite()) {
            bail!("hill center and widths must be finite");
        }
        let (inverse_width, precision) = match shape {
            HillShape::Isotropic => (
                width
                    .iter()
                    .map(|&sigma| if sigma.abs() > MIN_WIDTH { 1.0 / sigma } else { 0.0 })
                    .collect(),
                None,
            ),
            HillShape::Multivariate => (Vec::new(), Some(unpack_symmetric(&width, center.len()))),
        };
        Ok(Self {
            center,
            width,
            height,
            shape,
            inverse_width,
            precision,
        })
    }

    /// Axis-aligned hill with one sigma per CV.
    pub fn isotropic(center: Vec<f64>, sigma: Vec<f64>, height: f64) -> Result<Self> {
        Self::new(center, sigma, height, HillShape::Isotropic)
    }

    /// Multivariate hill from a packed precision matrix.
    pub fn multivariate(center: Vec<f64>, precision: Vec<f64>, height: f64) -> Result<Self> {
        Self::new(center, precision, height, HillShape::Multivariate)
    }

    /// Number of collective variables.
    pub fn ncv(&self) -> usize {
        self.center.len()
    }

    /// Full precision matrix; `diag(1/σ²)` for isotropic hills.
    pub fn precision_matrix(&self) -> DMatrix<f64> {
        match &self.precision {
            Some(precision) => precision.clone(),
            None => DMatrix::from_diagonal(&nalgebra::DVector::from_iterator(
                self.ncv(),
                self.inverse_width.iter().map(|w| w * w),
            )),
        }
    }

    /// Half the squared Mahalanobis distance from the center, and the per-axis
    /// (periodic) differences `cv - center`.
    fn reduced_distance(&self, cv: &[f64], cvs: &[CollectiveVariable]) -> (f64, Vec<f64>) {
        let delta: Vec<f64> = cvs
            .iter()
            .zip(self.center.iter().zip(cv))
            .map(|(axis, (&center, &x))| axis.difference(center, x))
            .collect();
        let dp2 = match &self.precision {
            None => {
                0.5 * delta
                    .iter()
                    .zip(&self.inverse_width)
                    .map(|(d, w)| (d * w).powi(2))
                    .sum::<f64>()
            }
            Some(m) => {
                let mut sum = 0.0;
                for i in 0..delta.len() {
                    for j in 0..delta.len() {
                        sum += delta[i] * m[(i, j)] * delta[j];
                    }
                }
                0.5 * sum
            }
        };
        (dp2, delta)
    }

    /// Value of the hill at `cv`.
    ///
    /// If `gradient` is given, the derivative with respect to each CV is *added*
    /// to it. Beyond [`DP2_CUTOFF`] the hill is exactly zero.
    pub fn evaluate(
        &self,
        cv: &[f64],
        cvs: &[CollectiveVariable],
        gradient: Option<&mut [f64]>,
    ) -> f64 {
        debug_assert_eq!(cv.len(), self.ncv());
        let (dp2, delta) = self.reduced_distance(cv, cvs);
        if dp2 >= DP2_CUTOFF {
            return 0.0;
        }
        let value = self.height * (-dp2).exp();
        if let Some(gradient) = gradient {
            match &self.precision {
                None => {
                    for ((g, d), w) in gradient.iter_mut().zip(&delta).zip(&self.inverse_width) {
                        *g -= value * d * w * w;
                    }
                }
                Some(m) => {
                    for (i, g) in gradient.iter_mut().enumerate() {
                        let m_delta: f64 = (0..delta.len()).map(|j| m[(i, j)] * delta[j]).sum();
                        *g -= value * m_delta;
                    }
                }
            }
        }
        value
    }
}
