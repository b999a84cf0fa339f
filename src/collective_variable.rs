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

//! Collective variables as seen by the bias.
//!
//! The bias never computes a CV itself. It receives one scalar per CV and step,
//! and only needs to know each CV's name (used in file headers) and, for
//! periodic CVs, the domain so that distances wrap to the minimum image.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// Metadata for one collective-variable axis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CollectiveVariable {
    pub name: String,
    /// Periodic domain `(min, max)`, or `None` for a non-periodic CV.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub periodic: Option<(f64, f64)>,
}

impl CollectiveVariable {
    /// Non-periodic CV.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            periodic: None,
        }
    }

    /// Periodic CV with domain `[min, max)`.
    pub fn periodic(name: impl Into<String>, min: f64, max: f64) -> Self {
        Self {
            name: name.into(),
            periodic: Some((min, max)),
        }
    }

    pub const fn is_periodic(&self) -> bool {
        self.periodic.is_some()
    }

    /// Signed difference `b - a`, wrapped to the minimum image for periodic CVs.
    pub fn difference(&self, a: f64, b: f64) -> f64 {
        let delta = b - a;
        match self.periodic {
            Some((min, max)) => {
                let period = max - min;
                delta - period * (delta / period).round()
            }
            None => delta,
        }
    }

    /// Map a value back into the periodic domain. Non-periodic values are returned as is.
    pub fn wrap(&self, value: f64) -> f64 {
        match self.periodic {
            Some((min, max)) => min + (value - min).rem_euclid(max - min),
            None => value,
        }
    }

    /// Check that the name can be used as a whitespace separated file field
    /// and that a periodic domain is non-empty.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() || self.name.chars().any(char::is_whitespace) {
            bail!("invalid collective variable name '{}'", self.name);
        }
        if let Some((min, max)) = self.periodic {
            if !(max > min) {
                bail!(
                    "periodic domain of '{}' must have max > min, got [{}, {}]",
                    self.name,
                    min,
                    max
                );
            }
        }
        Ok(())
    }
}
