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

//! Well-tempered height rescaling.
//!
//! With bias factor `γ > 1` the height of a new hill decays with the bias already
//! present at its center, `h = h₀ exp(-V / (kT (γ - 1)))`, so that the bias
//! converges to `(1 - 1/γ)` times the negative free energy.

use anyhow::{bail, Result};
use derive_getters::Getters;

/// Bias factor and thermal energy of a well-tempered run.
#[derive(Debug, Clone, Copy, PartialEq, Getters)]
pub struct WellTempered {
    bias_factor: f64,
    /// `kB T` in the energy unit of the bias.
    thermal_energy: f64,
}

impl WellTempered {
    pub fn new(bias_factor: f64, thermal_energy: f64) -> Result<Self> {
        if !(bias_factor > 1.0) {
            bail!("well-tempered bias factor must exceed one, got {}", bias_factor);
        }
        if !(thermal_energy > 0.0) {
            bail!("well-tempered metadynamics needs a positive temperature");
        }
        Ok(Self {
            bias_factor,
            thermal_energy,
        })
    }

    /// Height of a hill deposited where the current bias is `bias`.
    pub fn height(&self, initial_height: f64, bias: f64) -> f64 {
        initial_height * (-bias / (self.thermal_energy * (self.bias_factor - 1.0))).exp()
    }

    /// Height as written to the hills file.
    pub fn to_stored(&self, height: f64) -> f64 {
        height * self.bias_factor / (self.bias_factor - 1.0)
    }
}

/// Height of a replayed hill, undoing the scaling applied when it was written
/// with bias factor `bias_factor`.
pub fn from_stored(stored_height: f64, bias_factor: f64) -> f64 {
    if bias_factor > 1.0 {
        stored_height * (bias_factor - 1.0) / bias_factor
    } else {
        stored_height
    }
}
