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

use super::Interval;
use crate::{
    collective_variable::CollectiveVariable,
    comm::Communicator,
    grid::Grid,
    hill::{Hill, HillShape, DP2_CUTOFF},
    matrix::{invert_floored, leading_eigenpair},
};
use anyhow::{bail, Result};
use derive_more::Debug;
use std::sync::Arc;

/// Bias tabulated on a grid.
///
/// A new hill is evaluated at every grid point within its support, the
/// participants share that work by stride, and the reduced contributions are
/// added to the grid.
#[derive(Debug, Clone)]
pub struct GridBias {
    grid: Grid,
    cvs: Vec<CollectiveVariable>,
    interval: Option<Interval>,
    num_hills: usize,
    #[debug(skip)]
    comm: Arc<dyn Communicator>,
}

impl GridBias {
    /// With an interval the grid must be built without spline interpolation.
    pub fn new(
        grid: Grid,
        cvs: Vec<CollectiveVariable>,
        interval: Option<Interval>,
        comm: Arc<dyn Communicator>,
    ) -> Result<Self> {
        if grid.dimension() != cvs.len() {
            bail!(
                "grid has {} axes but there are {} collective variables",
                grid.dimension(),
                cvs.len()
            );
        }
        if interval.is_some() && grid.uses_spline() {
            bail!("spline interpolation cannot be combined with an interval");
        }
        Ok(Self {
            grid,
            cvs,
            interval,
            num_hills: 0,
            comm,
        })
    }

    pub const fn grid(&self) -> &Grid {
        &self.grid
    }

    pub const fn num_hills(&self) -> usize {
        self.num_hills
    }

    /// Number of grid points along each axis covered by a hill's significant footprint.
    pub fn support(&self, hill: &Hill) -> Vec<usize> {
        let cutoff = (2.0 * DP2_CUTOFF).sqrt();
        let radius: Vec<f64> = match hill.shape() {
            HillShape::Isotropic => hill.width().iter().map(|s| s.abs()).collect(),
            HillShape::Multivariate => {
                let covariance = invert_floored(&hill.precision_matrix());
                let (value, vector) = leading_eigenpair(&covariance);
                (0..hill.ncv())
                    .map(|i| {
                        let principal = (value.max(0.0).sqrt() * vector[i]).abs();
                        principal.max(covariance[(i, i)].max(0.0).sqrt())
                    })
                    .collect()
            }
        };
        radius
            .iter()
            .zip(self.grid.spacing())
            .map(|(r, dx)| (cutoff * r / dx).ceil() as usize)
            .collect()
    }

    pub fn add_hill(&mut self, hill: &Hill) -> Result<()> {
        let ncv = self.cvs.len();
        let neighbors = self.grid.neighbors(hill.center(), &self.support(hill));
        let stride = ncv + 1;
        let mut buffer = vec![0.0; neighbors.len() * stride];
        let (rank, size) = (self.comm.rank(), self.comm.size());

        for (k, &index) in neighbors.iter().enumerate().skip(rank).step_by(size) {
            let point = self.grid.point(index);
            if let Some(interval) = &self.interval {
                if !interval.contains(point[0]) {
                    continue;
                }
            }
            let chunk = &mut buffer[k * stride..(k + 1) * stride];
            let (value, derivatives) = chunk.split_at_mut(1);
            value[0] = hill.evaluate(&point, &self.cvs, Some(derivatives));
        }
        self.comm.sum(&mut buffer)?;

        for (&index, chunk) in neighbors.iter().zip(buffer.chunks_exact(stride)) {
            if chunk.iter().any(|&x| x != 0.0) {
                self.grid
                    .add_value_and_derivatives(index, chunk[0], &chunk[1..]);
            }
        }
        self.num_hills += 1;
        log::trace!("hill splatted onto {} grid points", neighbors.len());
        Ok(())
    }

    /// Interpolated bias at `cv`; `gradient` is overwritten with its derivatives.
    pub fn evaluate(&self, cv: &[f64], gradient: &mut [f64]) -> Result<f64> {
        let value = self.grid.value_and_derivatives(cv, gradient)?;
        if let Some(interval) = &self.interval {
            if !interval.contains(cv[0]) {
                gradient.iter_mut().for_each(|g| *g = 0.0);
            }
        }
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{comm::SingleProcess, grid::GridAxis};
    use approx::assert_relative_eq;

    fn grid_bias(periodic: bool, interval: Option<Interval>) -> GridBias {
        let axis = GridAxis {
            name: "x".to_string(),
            min: -1.0,
            max: 1.0,
            bins: 200,
            periodic,
        };
        let cv = match periodic {
            true => CollectiveVariable::periodic("x", -1.0, 1.0),
            false => CollectiveVariable::new("x"),
        };
        let grid = Grid::new("metad.bias", vec![axis], false, interval.is_none()).unwrap();
        GridBias::new(grid, vec![cv], interval, Arc::new(SingleProcess)).unwrap()
    }

    #[test]
    fn isotropic_support() {
        let bias = grid_bias(false, None);
        let hill = Hill::isotropic(vec![0.0], vec![0.1], 1.0).unwrap();
        // sqrt(12.5) * 0.1 / 0.01 = 35.36
        assert_eq!(bias.support(&hill), vec![36]);
    }

    #[test]
    fn multivariate_support_covers_axis_extent() {
        let axes = ["a", "b"]
            .iter()
            .map(|name| GridAxis {
                name: name.to_string(),
                min: 0.0,
                max: 1.0,
                bins: 100,
                periodic: false,
            })
            .collect();
        let grid = Grid::new("bias", axes, false, true).unwrap();
        let cvs = vec![CollectiveVariable::new("a"), CollectiveVariable::new("b")];
        let bias = GridBias::new(grid, cvs, None, Arc::new(SingleProcess)).unwrap();
        // covariance diag(0.01, 0.0025): sigma 0.1 and 0.05
        let hill = Hill::multivariate(vec![0.5, 0.5], vec![100.0, 0.0, 400.0], 1.0).unwrap();
        assert_eq!(bias.support(&hill), vec![36, 18]);
    }

    #[test]
    fn matches_hill_on_grid() {
        let mut bias = grid_bias(false, None);
        let hill = Hill::isotropic(vec![0.1], vec![0.1], 0.5).unwrap();
        bias.add_hill(&hill).unwrap();
        assert_eq!(bias.num_hills(), 1);
        let cvs = [CollectiveVariable::new("x")];
        let mut gradient = [0.0];
        let mut expected = [0.0];
        for x in [0.1, 0.123, 0.2, -0.05] {
            let value = bias.evaluate(&[x], &mut gradient).unwrap();
            expected[0] = 0.0;
            let reference = hill.evaluate(&[x], &cvs, Some(&mut expected));
            assert_relative_eq!(value, reference, epsilon = 1e-5);
            assert_relative_eq!(gradient[0], expected[0], epsilon = 1e-3);
        }
    }

    #[test]
    fn periodic_splat_wraps() {
        let mut bias = grid_bias(true, None);
        bias.add_hill(&Hill::isotropic(vec![0.98], vec![0.05], 1.0).unwrap())
            .unwrap();
        let expected = (-0.5 * (0.04f64 / 0.05).powi(2)).exp();
        assert_relative_eq!(
            bias.evaluate(&[-0.98], &mut [0.0]).unwrap(),
            expected,
            epsilon = 1e-5
        );
    }

    #[test]
    fn periodic_edges_match_list() {
        use crate::storage::list::HillList;
        use std::f64::consts::PI;
        let axis = GridAxis {
            name: "phi".to_string(),
            min: -PI,
            max: PI,
            bins: 200,
            periodic: true,
        };
        let cvs = vec![CollectiveVariable::periodic("phi", -PI, PI)];
        let grid = Grid::new("metad.bias", vec![axis], false, true).unwrap();
        let mut bias = GridBias::new(grid, cvs.clone(), None, Arc::new(SingleProcess)).unwrap();
        let mut list = HillList::new(cvs, None, Arc::new(SingleProcess));
        for center in [-3.1, 3.05, PI] {
            let hill = Hill::isotropic(vec![center], vec![0.3], 1.0).unwrap();
            bias.add_hill(&hill).unwrap();
            list.add_hill(hill);
        }

        let dx = 2.0 * PI / 200.0;
        let below_min = f64::from_bits((-PI).to_bits() + 1);
        let (mut gradient, mut expected) = ([0.0], [0.0]);
        for x in [below_min, -PI, PI, PI - 0.3 * dx, PI - 0.7 * dx, -3.0, 3.0] {
            let value = bias.evaluate(&[x], &mut gradient).unwrap();
            let reference = list.evaluate(&[x], &mut expected).unwrap();
            assert_relative_eq!(value, reference, epsilon = 1e-4);
            assert_relative_eq!(gradient[0], expected[0], epsilon = 1e-3);
        }
    }

    #[test]
    fn interval_suppresses_splat_and_force() {
        let interval = Interval {
            lower: -0.5,
            upper: 0.5,
        };
        let mut bias = grid_bias(false, Some(interval));
        bias.add_hill(&Hill::isotropic(vec![0.45], vec![0.1], 1.0).unwrap())
            .unwrap();
        let mut gradient = [0.0];
        assert!(bias.evaluate(&[0.4], &mut gradient).unwrap() > 0.0);
        assert!(gradient[0] != 0.0);
        assert_eq!(bias.evaluate(&[0.55], &mut gradient).unwrap(), 0.0);
        assert_eq!(gradient[0], 0.0);
    }

    #[test]
    fn spline_with_interval_is_rejected() {
        let axis = GridAxis {
            name: "x".to_string(),
            min: 0.0,
            max: 1.0,
            bins: 10,
            periodic: false,
        };
        let grid = Grid::new("bias", vec![axis], false, true).unwrap();
        let interval = Interval {
            lower: 0.2,
            upper: 0.8,
        };
        assert!(GridBias::new(
            grid,
            vec![CollectiveVariable::new("x")],
            Some(interval),
            Arc::new(SingleProcess)
        )
        .is_err());
    }
}
