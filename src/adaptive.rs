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

//! Adaptive hill shapes.
//!
//! Instead of fixed widths, the covariance of the next hill is estimated on the
//! fly, either from the recent fluctuations of the CVs (`diffusion`) or from the
//! local metric of the CV mapping (`geometry`). Hills are then multivariate with
//! the inverse of that covariance as precision.

use crate::{
    collective_variable::CollectiveVariable,
    matrix::{invert_floored, pack_upper, packed_len, unpack_symmetric},
};
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// Width adaptation policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Adaptive {
    /// Fixed widths.
    #[default]
    #[serde(alias = "NONE")]
    None,
    /// Width is a time window in steps over which CV fluctuations are averaged.
    #[serde(alias = "DIFF", alias = "diff")]
    Diffusion,
    /// Width is a distance in the space of the underlying coordinates.
    #[serde(alias = "GEOM", alias = "geom")]
    Geometry,
}

impl Adaptive {
    pub const fn is_adaptive(&self) -> bool {
        !matches!(self, Self::None)
    }
}

/// Running estimate of the hill covariance.
#[derive(Debug, Clone)]
pub struct WidthAdapter {
    policy: Adaptive,
    /// Time window (diffusion) or distance (geometry).
    sigma: f64,
    cvs: Vec<CollectiveVariable>,
    /// Moving average of the CVs; set by the first update.
    average: Option<Vec<f64>>,
    /// Packed upper triangle of the covariance.
    covariance: Vec<f64>,
}

impl WidthAdapter {
    pub fn new(policy: Adaptive, sigma: f64, cvs: Vec<CollectiveVariable>) -> Result<Self> {
        if !policy.is_adaptive() {
            bail!("width adapter needs an adaptive policy");
        }
        if !(sigma > 0.0) {
            bail!("adaptive width must be positive, got {}", sigma);
        }
        if policy == Adaptive::Diffusion && sigma < 1.0 {
            bail!("diffusion time window must be at least one step, got {}", sigma);
        }
        let covariance = vec![0.0; packed_len(cvs.len())];
        Ok(Self {
            policy,
            sigma,
            cvs,
            average: None,
            covariance,
        })
    }

    pub const fn policy(&self) -> Adaptive {
        self.policy
    }

    /// Packed covariance estimate.
    pub fn covariance(&self) -> &[f64] {
        &self.covariance
    }

    /// Advance the estimate with the CV values of the current step.
    ///
    /// The geometry policy needs the Jacobian of the CVs, one row per CV.
    pub fn update(&mut self, cv: &[f64], jacobian: Option<&[Vec<f64>]>) -> Result<()> {
        match self.policy {
            Adaptive::None => Ok(()),
            Adaptive::Diffusion => {
                self.update_diffusion(cv);
                Ok(())
            }
            Adaptive::Geometry => match jacobian {
                Some(jacobian) => self.update_geometry(jacobian),
                None => bail!("geometry adaptive widths need the Jacobian of the collective variables"),
            },
        }
    }

    fn update_diffusion(&mut self, cv: &[f64]) {
        let decay = 1.0 / self.sigma;
        let average = self.average.get_or_insert_with(|| cv.to_vec());
        let delta: Vec<f64> = self
            .cvs
            .iter()
            .zip(average.iter().zip(cv))
            .map(|(axis, (&a, &x))| axis.difference(a, x))
            .collect();
        for ((a, d), axis) in average.iter_mut().zip(&delta).zip(&self.cvs) {
            *a = axis.wrap(*a + decay * d);
        }
        let n = delta.len();
        let mut k = 0;
        for i in 0..n {
            for j in i..n {
                self.covariance[k] = (1.0 - decay) * self.covariance[k] + decay * delta[i] * delta[j];
                k += 1;
            }
        }
    }

    fn update_geometry(&mut self, jacobian: &[Vec<f64>]) -> Result<()> {
        let n = self.cvs.len();
        if jacobian.len() != n {
            bail!("Jacobian has {} rows, expected one per CV ({})", jacobian.len(), n);
        }
        if jacobian.iter().any(|row| row.len() != jacobian[0].len()) {
            bail!("Jacobian rows differ in length");
        }
        let s2 = self.sigma * self.sigma;
        let mut k = 0;
        for i in 0..n {
            for j in i..n {
                let dot: f64 = jacobian[i].iter().zip(&jacobian[j]).map(|(a, b)| a * b).sum();
                self.covariance[k] = s2 * dot;
                k += 1;
            }
        }
        Ok(())
    }

    /// Packed precision (inverse covariance) for the next hill.
    pub fn precision(&self) -> Vec<f64> {
        let covariance = unpack_symmetric(&self.covariance, self.cvs.len());
        pack_upper(&invert_floored(&covariance))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn deserialize_keywords() {
        let policy: Adaptive = serde_yaml::from_str("DIFF").unwrap();
        assert_eq!(policy, Adaptive::Diffusion);
        let policy: Adaptive = serde_yaml::from_str("geometry").unwrap();
        assert_eq!(policy, Adaptive::Geometry);
        assert!(serde_yaml::from_str::<Adaptive>("sideways").is_err());
    }

    #[test]
    fn diffusion_tracks_fluctuations() {
        let cvs = vec![CollectiveVariable::new("x")];
        let mut adapter = WidthAdapter::new(Adaptive::Diffusion, 10.0, cvs).unwrap();
        adapter.update(&[1.0], None).unwrap();
        // first observation defines the average, hence no deviation
        assert_eq!(adapter.covariance(), &[0.0]);
        assert!(adapter.precision()[0].is_finite());

        adapter.update(&[2.0], None).unwrap();
        // delta = 1, C = 0.9 * 0 + 0.1 * 1
        assert_relative_eq!(adapter.covariance()[0], 0.1, epsilon = 1e-12);
        assert_relative_eq!(adapter.precision()[0], 10.0, epsilon = 1e-9);
    }

    #[test]
    fn diffusion_is_periodic_aware() {
        let cvs = vec![CollectiveVariable::periodic("phi", -1.0, 1.0)];
        let mut adapter = WidthAdapter::new(Adaptive::Diffusion, 2.0, cvs).unwrap();
        adapter.update(&[0.95], None).unwrap();
        adapter.update(&[-0.95], None).unwrap();
        // the short way round is 0.1, so C = 0.5 * 0.01
        assert_relative_eq!(adapter.covariance()[0], 0.005, epsilon = 1e-12);
    }

    #[test]
    fn geometry_from_jacobian() {
        let cvs = vec![CollectiveVariable::new("a"), CollectiveVariable::new("b")];
        let mut adapter = WidthAdapter::new(Adaptive::Geometry, 0.5, cvs).unwrap();
        assert!(adapter.update(&[0.0, 0.0], None).is_err());
        let jacobian = vec![vec![1.0, 0.0, 0.0], vec![1.0, 1.0, 0.0]];
        adapter.update(&[0.0, 0.0], Some(jacobian.as_slice())).unwrap();
        // 0.25 * [[1, 1], [1, 2]]
        assert_eq!(adapter.covariance(), &[0.25, 0.25, 0.5]);
        let precision = unpack_symmetric(&adapter.precision(), 2);
        let product = precision * unpack_symmetric(adapter.covariance(), 2);
        assert_relative_eq!(product[(0, 0)], 1.0, epsilon = 1e-9);
        assert_relative_eq!(product[(0, 1)], 0.0, epsilon = 1e-9);
    }

    #[test]
    fn fixed_policy_is_rejected() {
        assert!(WidthAdapter::new(Adaptive::None, 1.0, vec![CollectiveVariable::new("x")]).is_err());
    }
}
