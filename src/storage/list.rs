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
use crate::{collective_variable::CollectiveVariable, comm::Communicator, hill::Hill};
use anyhow::Result;
use derive_more::Debug;
use std::sync::Arc;

/// Bias as an explicit sum over all deposited hills.
///
/// Each participant of the communicator evaluates every `size`-th hill and the
/// partial sums are combined with a single reduction.
#[derive(Debug, Clone)]
pub struct HillList {
    hills: Vec<Hill>,
    cvs: Vec<CollectiveVariable>,
    interval: Option<Interval>,
    #[debug(skip)]
    comm: Arc<dyn Communicator>,
}

impl HillList {
    pub fn new(
        cvs: Vec<CollectiveVariable>,
        interval: Option<Interval>,
        comm: Arc<dyn Communicator>,
    ) -> Self {
        Self {
            hills: Vec::new(),
            cvs,
            interval,
            comm,
        }
    }

    pub fn add_hill(&mut self, hill: Hill) {
        self.hills.push(hill);
    }

    pub fn hills(&self) -> &[Hill] {
        &self.hills
    }

    pub fn len(&self) -> usize {
        self.hills.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hills.is_empty()
    }

    /// Bias at `cv`; `gradient` is overwritten with its derivatives.
    pub fn evaluate(&self, cv: &[f64], gradient: &mut [f64]) -> Result<f64> {
        gradient.iter_mut().for_each(|g| *g = 0.0);
        if let Some(interval) = &self.interval {
            if !interval.contains(cv[0]) {
                return Ok(0.0);
            }
        }
        // [value, gradient...] so that one reduction suffices
        let mut buffer = vec![0.0; cv.len() + 1];
        let (value, partial_gradient) = buffer.split_at_mut(1);
        let (rank, size) = (self.comm.rank(), self.comm.size());
        for hill in self.hills.iter().skip(rank).step_by(size) {
            value[0] += hill.evaluate(cv, &self.cvs, Some(partial_gradient));
        }
        self.comm.sum(&mut buffer)?;
        gradient.copy_from_slice(&buffer[1..]);
        Ok(buffer[0])
    }
}
