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

//! Accumulated bias potential.
//!
//! The bias is either kept as the raw list of hills ([`HillList`]) or
//! tabulated on a grid ([`GridBias`]). The choice is made once, when the
//! engine is configured.

mod grid;
mod list;

pub use grid::GridBias;
pub use list::HillList;

use crate::{hill::Hill, Info};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::io::Write;

/// Open one-dimensional interval `(lower, upper)` outside of which the bias is not applied.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Interval {
    pub lower: f64,
    pub upper: f64,
}

impl Interval {
    pub fn contains(&self, x: f64) -> bool {
        x > self.lower && x < self.upper
    }
}

/// Storage strategy for the deposited hills.
#[derive(Debug, Clone)]
pub enum BiasStorage {
    /// Sum over every hill at each evaluation.
    List(HillList),
    /// Hills are splatted onto a grid and the bias is interpolated.
    Grid(GridBias),
}

impl BiasStorage {
    /// Add a hill to the bias.
    pub fn add_hill(&mut self, hill: &Hill) -> Result<()> {
        match self {
            Self::List(list) => {
                list.add_hill(hill.clone());
                Ok(())
            }
            Self::Grid(grid) => grid.add_hill(hill),
        }
    }

    /// Bias at `cv`. If given, `gradient` is overwritten with the derivative
    /// with respect to each CV.
    pub fn evaluate(&self, cv: &[f64], gradient: Option<&mut [f64]>) -> Result<f64> {
        let mut scratch;
        let gradient = match gradient {
            Some(gradient) => gradient,
            None => {
                scratch = vec![0.0; cv.len()];
                scratch.as_mut_slice()
            }
        };
        match self {
            Self::List(list) => list.evaluate(cv, gradient),
            Self::Grid(grid) => grid.evaluate(cv, gradient),
        }
    }

    /// Number of hills added so far.
    pub fn num_hills(&self) -> usize {
        match self {
            Self::List(list) => list.len(),
            Self::Grid(grid) => grid.num_hills(),
        }
    }

    /// Write the tabulated bias. Only grids can be written.
    pub fn snapshot(&self, stream: &mut dyn Write) -> Result<()> {
        match self {
            Self::List(_) => anyhow::bail!("only a grid bias can be written to file"),
            Self::Grid(grid) => grid.grid().write(stream),
        }
    }
}

impl Info for BiasStorage {
    fn short_name(&self) -> Option<&'static str> {
        match self {
            Self::List(_) => Some("list"),
            Self::Grid(_) => Some("grid"),
        }
    }
    fn long_name(&self) -> Option<&'static str> {
        match self {
            Self::List(_) => Some("Sum over deposited Gaussians"),
            Self::Grid(_) => Some("Gaussians tabulated on a grid"),
        }
    }
}
