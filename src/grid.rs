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

//! Regular grid of function values and derivatives in CV space.
//!
//! Each axis spans `[min, max]` with `bins` intervals of width `dx = (max - min) / bins`.
//! A non-periodic axis has `bins + 1` points (both ends included), a periodic
//! axis has `bins` points since `max` coincides with `min`.
//! Points are numbered with the first axis running fastest.
//!
//! Between points, values are interpolated with cubic Hermite splines built from
//! the stored values and first derivatives, see e.g.
//! <https://en.wikipedia.org/wiki/Cubic_Hermite_spline>.

use anyhow::{bail, Result};
use itertools::Itertools;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;

/// One grid axis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridAxis {
    pub name: String,
    pub min: f64,
    pub max: f64,
    pub bins: usize,
    pub periodic: bool,
}

impl GridAxis {
    /// Distance between neighboring points.
    pub fn spacing(&self) -> f64 {
        (self.max - self.min) / self.bins as f64
    }

    /// Number of points along this axis.
    pub const fn num_points(&self) -> usize {
        if self.periodic {
            self.bins
        } else {
            self.bins + 1
        }
    }

    /// Fractional point coordinate of `x`, wrapped for periodic axes.
    fn reduced(&self, x: f64) -> Result<f64> {
        let reduced = (x - self.min) / self.spacing();
        if self.periodic {
            let bins = self.bins as f64;
            let wrapped = reduced.rem_euclid(bins);
            // rem_euclid rounds up to `bins` just below the lower edge
            return Ok(if wrapped >= bins { 0.0 } else { wrapped });
        }
        // allow round-off at the very edges
        let slack = 1e-9;
        if reduced < -slack || reduced > self.bins as f64 + slack {
            bail!(
                "{} = {} is outside the grid [{}, {}]",
                self.name,
                x,
                self.min,
                self.max
            );
        }
        Ok(reduced.clamp(0.0, self.bins as f64))
    }

    /// Lower and upper point of the interval containing `x`, and the position within it.
    fn bracket(&self, x: f64) -> Result<(usize, usize, f64)> {
        let reduced = self.reduced(x)?;
        let mut lower = reduced.floor() as usize;
        if self.periodic {
            lower %= self.bins;
            let t = reduced - lower as f64;
            Ok((lower, (lower + 1) % self.bins, t))
        } else {
            lower = lower.min(self.bins - 1);
            Ok((lower, lower + 1, reduced - lower as f64))
        }
    }
}

/// Cubic Hermite basis `h00` and `h10` with their derivatives in `t`.
fn hermite(t: f64) -> [f64; 4] {
    let t2 = t * t;
    let t3 = t2 * t;
    [
        2.0 * t3 - 3.0 * t2 + 1.0,
        t3 - 2.0 * t2 + t,
        6.0 * t2 - 6.0 * t,
        3.0 * t2 - 4.0 * t + 1.0,
    ]
}

#[derive(Debug, Clone)]
enum Storage {
    /// Every point is allocated up front.
    Dense {
        values: Vec<f64>,
        /// One row of derivatives per point.
        derivatives: Array2<f64>,
    },
    /// Only points that received a contribution are stored.
    Sparse(HashMap<usize, (f64, Vec<f64>)>),
}

/// Grid of values and derivatives with optional spline interpolation.
#[derive(Debug, Clone)]
pub struct Grid {
    /// Name of the tabulated function, used in file headers.
    label: String,
    axes: Vec<GridAxis>,
    spline: bool,
    storage: Storage,
}

impl Grid {
    pub fn new(label: impl Into<String>, axes: Vec<GridAxis>, sparse: bool, spline: bool) -> Result<Self> {
        if axes.is_empty() {
            bail!("grid needs at least one axis");
        }
        for axis in &axes {
            if axis.bins == 0 {
                bail!("grid axis '{}' needs at least one bin", axis.name);
            }
            if !(axis.max > axis.min) {
                bail!(
                    "grid axis '{}' must have max > min, got [{}, {}]",
                    axis.name,
                    axis.min,
                    axis.max
                );
            }
        }
        let size = axes.iter().map(GridAxis::num_points).product();
        let storage = if sparse {
            Storage::Sparse(HashMap::new())
        } else {
            Storage::Dense {
                values: vec![0.0; size],
                derivatives: Array2::zeros((size, axes.len())),
            }
        };
        Ok(Self {
            label: label.into(),
            axes,
            spline,
            storage,
        })
    }

    pub fn axes(&self) -> &[GridAxis] {
        &self.axes
    }

    pub fn dimension(&self) -> usize {
        self.axes.len()
    }

    /// Total number of points.
    pub fn size(&self) -> usize {
        self.axes.iter().map(GridAxis::num_points).product()
    }

    pub fn spacing(&self) -> Vec<f64> {
        self.axes.iter().map(GridAxis::spacing).collect()
    }

    pub const fn uses_spline(&self) -> bool {
        self.spline
    }

    fn flat_index(&self, indices: &[usize]) -> usize {
        indices
            .iter()
            .zip(&self.axes)
            .rev()
            .fold(0, |acc, (&i, axis)| acc * axis.num_points() + i)
    }

    fn indices(&self, mut index: usize) -> Vec<usize> {
        self.axes
            .iter()
            .map(|axis| {
                let i = index % axis.num_points();
                index /= axis.num_points();
                i
            })
            .collect()
    }

    /// Coordinates of a point.
    pub fn point(&self, index: usize) -> Vec<f64> {
        self.indices(index)
            .iter()
            .zip(&self.axes)
            .map(|(&i, axis)| (i as f64).mul_add(axis.spacing(), axis.min))
            .collect()
    }

    /// Index of the lower corner point of the cell containing `cv`.
    pub fn index_of(&self, cv: &[f64]) -> Result<usize> {
        let lower = self
            .axes
            .iter()
            .zip(cv)
            .map(|(axis, &x)| axis.bracket(x).map(|b| b.0))
            .collect::<Result<Vec<_>>>()?;
        Ok(self.flat_index(&lower))
    }

    /// Points within `support[i]` points of `center` along each axis.
    ///
    /// The neighborhood is clipped at non-periodic edges and wrapped, without
    /// duplicates, along periodic axes. `center` itself may lie outside a
    /// non-periodic grid.
    pub fn neighbors(&self, center: &[f64], support: &[usize]) -> Vec<usize> {
        let ranges: Vec<Vec<usize>> = self
            .axes
            .iter()
            .zip(center.iter().zip(support))
            .map(|(axis, (&x, &n))| {
                let origin = ((x - axis.min) / axis.spacing()).floor() as i64;
                let n = n as i64;
                let points = axis.num_points() as i64;
                if axis.periodic {
                    if 2 * n + 1 >= points {
                        (0..axis.num_points()).collect()
                    } else {
                        (origin - n..=origin + n)
                            .map(|i| i.rem_euclid(points) as usize)
                            .collect()
                    }
                } else {
                    (origin - n..=origin + n)
                        .filter(|i| (0..points).contains(i))
                        .map(|i| i as usize)
                        .collect()
                }
            })
            .collect();
        if ranges.iter().any(Vec::is_empty) {
            return Vec::new();
        }
        ranges
            .into_iter()
            .multi_cartesian_product()
            .map(|indices| self.flat_index(&indices))
            .collect()
    }

    /// Stored value and derivatives of a point.
    pub fn value_and_derivatives_at(&self, index: usize) -> (f64, Vec<f64>) {
        match &self.storage {
            Storage::Dense {
                values,
                derivatives,
            } => (values[index], derivatives.row(index).to_vec()),
            Storage::Sparse(map) => map
                .get(&index)
                .cloned()
                .unwrap_or_else(|| (0.0, vec![0.0; self.dimension()])),
        }
    }

    /// Add to the value and derivatives of a point.
    pub fn add_value_and_derivatives(&mut self, index: usize, value: f64, derivatives: &[f64]) {
        let dimension = self.axes.len();
        match &mut self.storage {
            Storage::Dense {
                values,
                derivatives: stored,
            } => {
                values[index] += value;
                stored
                    .row_mut(index)
                    .iter_mut()
                    .zip(derivatives)
                    .for_each(|(s, d)| *s += d);
            }
            Storage::Sparse(map) => {
                let entry = map
                    .entry(index)
                    .or_insert_with(|| (0.0, vec![0.0; dimension]));
                entry.0 += value;
                entry
                    .1
                    .iter_mut()
                    .zip(derivatives)
                    .for_each(|(s, d)| *s += d);
            }
        }
    }

    /// Interpolated value at `cv`.
    pub fn value(&self, cv: &[f64]) -> Result<f64> {
        let mut derivatives = vec![0.0; self.dimension()];
        self.value_and_derivatives(cv, &mut derivatives)
    }

    /// Interpolated value at `cv`; `derivatives` is overwritten with the gradient.
    ///
    /// Without splines the value and derivatives of the lower corner point are returned.
    pub fn value_and_derivatives(&self, cv: &[f64], derivatives: &mut [f64]) -> Result<f64> {
        if !self.spline {
            let (value, stored) = self.value_and_derivatives_at(self.index_of(cv)?);
            derivatives.copy_from_slice(&stored);
            return Ok(value);
        }

        let brackets = self
            .axes
            .iter()
            .zip(cv)
            .map(|(axis, &x)| axis.bracket(x))
            .collect::<Result<Vec<_>>>()?;

        let dimension = self.dimension();
        let spacing = self.spacing();
        derivatives.iter_mut().for_each(|d| *d = 0.0);
        let mut value = 0.0;
        let mut indices = vec![0; dimension];
        // per axis: [weight of value, weight of slope, and their x-derivatives]
        let mut basis = vec![[0.0; 4]; dimension];

        for corner in 0..(1_usize << dimension) {
            for (j, &(lower, upper, t)) in brackets.iter().enumerate() {
                let dx = spacing[j];
                let [h, hd, dh, dhd] = if corner >> j & 1 == 0 {
                    indices[j] = lower;
                    let [h00, h10, d00, d10] = hermite(t);
                    [h00, h10 * dx, d00 / dx, d10]
                } else {
                    indices[j] = upper;
                    let [h00, h10, d00, d10] = hermite(1.0 - t);
                    [h00, -h10 * dx, -d00 / dx, d10]
                };
                basis[j] = [h, hd, dh, dhd];
            }
            let (corner_value, slopes) = self.value_and_derivatives_at(self.flat_index(&indices));

            // product of value weights, optionally skipping up to two axes
            let product = |skip: &[usize]| -> f64 {
                (0..dimension)
                    .filter(|k| !skip.contains(k))
                    .map(|k| basis[k][0])
                    .product()
            };

            value += corner_value * product(&[]);
            for j in 0..dimension {
                value += slopes[j] * basis[j][1] * product(&[j]);
            }
            for (m, derivative) in derivatives.iter_mut().enumerate() {
                *derivative += corner_value * basis[m][2] * product(&[m]);
                for j in 0..dimension {
                    *derivative += if j == m {
                        slopes[j] * basis[j][3] * product(&[j])
                    } else {
                        slopes[j] * basis[j][1] * basis[m][2] * product(&[j, m])
                    };
                }
            }
        }
        Ok(value)
    }

    /// Write the grid as text: a header followed by one line per point with
    /// coordinates, value and derivatives.
    pub fn write(&self, stream: &mut dyn Write) -> Result<()> {
        write!(stream, "#! FIELDS")?;
        for axis in &self.axes {
            write!(stream, " {}", axis.name)?;
        }
        write!(stream, " {}", self.label)?;
        for axis in &self.axes {
            write!(stream, " der_{}", axis.name)?;
        }
        writeln!(stream)?;
        for axis in &self.axes {
            writeln!(stream, "#! SET min_{} {}", axis.name, axis.min)?;
            writeln!(stream, "#! SET max_{} {}", axis.name, axis.max)?;
            writeln!(stream, "#! SET nbins_{} {}", axis.name, axis.bins)?;
            writeln!(stream, "#! SET periodic_{} {}", axis.name, axis.periodic)?;
        }

        let write_point = |stream: &mut dyn Write, index: usize| -> Result<()> {
            let (value, derivatives) = self.value_and_derivatives_at(index);
            for x in self.point(index) {
                write!(stream, " {:.9}", x)?;
            }
            write!(stream, " {:.9}", value)?;
            for d in derivatives {
                write!(stream, " {:.9}", d)?;
            }
            writeln!(stream)?;
            Ok(())
        };

        match &self.storage {
            Storage::Dense { .. } => {
                let row_length = self.axes[0].num_points();
                for index in 0..self.size() {
                    if self.dimension() > 1 && index > 0 && index % row_length == 0 {
                        writeln!(stream)?;
                    }
                    write_point(stream, index)?;
                }
            }
            Storage::Sparse(map) => {
                for &index in map.keys().sorted() {
                    write_point(stream, index)?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn axis(name: &str, min: f64, max: f64, bins: usize, periodic: bool) -> GridAxis {
        GridAxis {
            name: name.to_string(),
            min,
            max,
            bins,
            periodic,
        }
    }

    #[test]
    fn layout() {
        let grid = Grid::new(
            "bias",
            vec![axis("a", 0.0, 1.0, 10, false), axis("b", -1.0, 1.0, 4, true)],
            false,
            true,
        )
        .unwrap();
        assert_eq!(grid.size(), 11 * 4);
        assert_relative_eq!(grid.spacing()[0], 0.1);
        let p = grid.point(12);
        assert_relative_eq!(p[0], 0.1, epsilon = 1e-12);
        assert_relative_eq!(p[1], -0.5, epsilon = 1e-12);
    }

    #[test]
    fn neighbors_are_clipped_and_wrapped() {
        let grid = Grid::new("bias", vec![axis("a", 0.0, 1.0, 10, false)], false, true).unwrap();
        assert_eq!(grid.neighbors(&[0.05], &[2]), vec![0, 1, 2]);
        assert!(grid.neighbors(&[5.0], &[2]).is_empty());

        let periodic = Grid::new("bias", vec![axis("p", 0.0, 1.0, 10, true)], false, true).unwrap();
        let mut n = periodic.neighbors(&[0.05], &[2]);
        n.sort_unstable();
        assert_eq!(n, vec![0, 1, 2, 8, 9]);
        assert_eq!(periodic.neighbors(&[0.5], &[20]).len(), 10);
    }

    #[test]
    fn spline_reproduces_cubic() {
        // f = x³ is reproduced exactly by cubic Hermite interpolation
        let mut grid = Grid::new("f", vec![axis("x", 0.0, 2.0, 8, false)], false, true).unwrap();
        for index in 0..grid.size() {
            let x = grid.point(index)[0];
            grid.add_value_and_derivatives(index, x.powi(3), &[3.0 * x * x]);
        }
        let mut der = [0.0];
        for x in [0.0, 0.13, 0.77, 1.5, 2.0] {
            let value = grid.value_and_derivatives(&[x], &mut der).unwrap();
            assert_relative_eq!(value, x.powi(3), epsilon = 1e-12);
            assert_relative_eq!(der[0], 3.0 * x * x, epsilon = 1e-10);
        }
        assert!(grid.value(&[2.5]).is_err());
    }

    #[test]
    fn spline_reproduces_separable_bilinear() {
        let mut grid = Grid::new(
            "f",
            vec![axis("x", 0.0, 1.0, 5, false), axis("y", 0.0, 1.0, 5, false)],
            false,
            true,
        )
        .unwrap();
        for index in 0..grid.size() {
            let p = grid.point(index);
            grid.add_value_and_derivatives(index, 2.0 * p[0] + 3.0 * p[1] + 1.0, &[2.0, 3.0]);
        }
        let mut der = [0.0; 2];
        let value = grid.value_and_derivatives(&[0.33, 0.71], &mut der).unwrap();
        assert_relative_eq!(value, 2.0 * 0.33 + 3.0 * 0.71 + 1.0, epsilon = 1e-12);
        assert_relative_eq!(der[0], 2.0, epsilon = 1e-10);
        assert_relative_eq!(der[1], 3.0, epsilon = 1e-10);
    }

    #[test]
    fn periodic_lookup_at_domain_edges() {
        use std::f64::consts::PI;
        let mut grid = Grid::new("f", vec![axis("phi", -PI, PI, 100, true)], false, true).unwrap();
        for index in 0..grid.size() {
            let x = grid.point(index)[0];
            grid.add_value_and_derivatives(index, x.cos(), &[-x.sin()]);
        }
        let dx = grid.spacing()[0];
        let below_min = f64::from_bits((-PI).to_bits() + 1);
        assert!(below_min < -PI);
        let mut der = [0.0];
        for x in [below_min, -PI, PI, PI - 0.3 * dx, PI - 0.7 * dx] {
            let value = grid.value_and_derivatives(&[x], &mut der).unwrap();
            assert_relative_eq!(value, x.cos(), epsilon = 1e-6);
            assert_relative_eq!(der[0], -x.sin(), epsilon = 1e-4);
        }
        assert_eq!(grid.index_of(&[below_min]).unwrap(), 0);
        assert_eq!(grid.index_of(&[PI - 0.3 * dx]).unwrap(), 99);
    }

    #[test]
    fn sparse_matches_dense() {
        let axes = vec![axis("x", -1.0, 1.0, 20, false)];
        let mut dense = Grid::new("f", axes.clone(), false, true).unwrap();
        let mut sparse = Grid::new("f", axes, true, true).unwrap();
        for grid in [&mut dense, &mut sparse] {
            for index in grid.neighbors(&[0.1], &[3]) {
                let x = grid.point(index)[0];
                grid.add_value_and_derivatives(index, (-x * x).exp(), &[-2.0 * x * (-x * x).exp()]);
            }
        }
        for x in [0.0, 0.07, 0.15] {
            assert_relative_eq!(dense.value(&[x]).unwrap(), sparse.value(&[x]).unwrap());
        }
    }

    #[test]
    fn no_spline_uses_lower_point() {
        let mut grid = Grid::new("f", vec![axis("x", 0.0, 1.0, 4, false)], false, false).unwrap();
        grid.add_value_and_derivatives(1, 5.0, &[1.0]);
        let mut der = [0.0];
        assert_relative_eq!(grid.value_and_derivatives(&[0.3], &mut der).unwrap(), 5.0);
        assert_relative_eq!(der[0], 1.0);
        assert_relative_eq!(grid.value(&[0.55]).unwrap(), 0.0);
    }

    #[test]
    fn write_header_and_points() {
        let grid = Grid::new(
            "metad.bias",
            vec![axis("x", 0.0, 1.0, 2, false), axis("y", 0.0, 1.0, 2, true)],
            false,
            true,
        )
        .unwrap();
        let mut buffer = Vec::new();
        grid.write(&mut buffer).unwrap();
        let text = String::from_utf8(buffer).unwrap();
        assert!(text.starts_with("#! FIELDS x y metad.bias der_x der_y\n"));
        assert!(text.contains("#! SET periodic_y true"));
        let data_lines = text
            .lines()
            .filter(|l| !l.starts_with('#') && !l.trim().is_empty())
            .count();
        assert_eq!(data_lines, grid.size());
        // one blank line between the two rows
        assert_eq!(text.lines().filter(|l| l.trim().is_empty()).count(), 1);
    }
}
