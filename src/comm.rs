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

//! Sum-reduction across cooperating participants.
//!
//! Both bias storages split their work by stride (`rank, rank + size, …`) and
//! combine partial results with [`Communicator::sum`]. Every participant must
//! call `sum` the same number of times with buffers of equal length.
//!
//! Results do not depend on the number of participants, except for the order of
//! floating point additions; compare across participant counts with a tolerance.

use anyhow::{anyhow, bail, Result};
use std::sync::{Arc, Barrier, Mutex};

/// A group of participants that can sum a buffer element-wise.
pub trait Communicator: std::fmt::Debug + Send + Sync {
    /// Index of this participant, `0..size()`.
    fn rank(&self) -> usize;
    /// Number of participants.
    fn size(&self) -> usize;
    /// Replace `buffer` on every participant with the element-wise sum over all participants.
    fn sum(&self, buffer: &mut [f64]) -> Result<()>;
}

/// The trivial group with a single participant.
#[derive(Debug, Default, Clone, Copy)]
pub struct SingleProcess;

impl Communicator for SingleProcess {
    fn rank(&self) -> usize {
        0
    }
    fn size(&self) -> usize {
        1
    }
    fn sum(&self, _buffer: &mut [f64]) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug)]
struct Shared {
    barrier: Barrier,
    /// Contribution of each rank for the reduction in progress.
    slots: Mutex<Vec<Option<Vec<f64>>>>,
}

/// In-process group whose participants run on separate threads.
#[derive(Debug)]
pub struct ThreadGroup;

impl ThreadGroup {
    /// One communicator per participant; hand each to its own thread.
    #[allow(clippy::new_ret_no_self)]
    pub fn new(size: usize) -> Vec<ThreadCommunicator> {
        let shared = Arc::new(Shared {
            barrier: Barrier::new(size),
            slots: Mutex::new(vec![None; size]),
        });
        (0..size)
            .map(|rank| ThreadCommunicator {
                rank,
                size,
                shared: Arc::clone(&shared),
            })
            .collect()
    }
}

/// Member of a [`ThreadGroup`].
///
/// Contributions are added in rank order, so a reduction is reproducible for a
/// fixed group size regardless of thread scheduling.
#[derive(Debug, Clone)]
pub struct ThreadCommunicator {
    rank: usize,
    size: usize,
    shared: Arc<Shared>,
}

impl ThreadCommunicator {
    fn total(&self, len: usize) -> Result<Vec<f64>> {
        let slots = self
            .shared
            .slots
            .lock()
            .map_err(|_| anyhow!("reduction buffer poisoned"))?;
        let mut total = vec![0.0; len];
        for (rank, slot) in slots.iter().enumerate() {
            let contribution = slot
                .as_ref()
                .ok_or_else(|| anyhow!("rank {} did not contribute to reduction", rank))?;
            if contribution.len() != len {
                bail!(
                    "reduction length mismatch: rank {} has {}, rank {} has {}",
                    rank,
                    contribution.len(),
                    self.rank,
                    len
                );
            }
            total
                .iter_mut()
                .zip(contribution)
                .for_each(|(t, c)| *t += c);
        }
        Ok(total)
    }
}

impl Communicator for ThreadCommunicator {
    fn rank(&self) -> usize {
        self.rank
    }
    fn size(&self) -> usize {
        self.size
    }
    fn sum(&self, buffer: &mut [f64]) -> Result<()> {
        if self.size == 1 {
            return Ok(());
        }
        self.shared
            .slots
            .lock()
            .map_err(|_| anyhow!("reduction buffer poisoned"))?[self.rank] = Some(buffer.to_vec());
        self.shared.barrier.wait();
        // all participants must pass every barrier, even on error
        let total = self.total(buffer.len());
        self.shared.barrier.wait();
        if self.rank == 0 {
            if let Ok(mut slots) = self.shared.slots.lock() {
                slots.iter_mut().for_each(|slot| *slot = None);
            }
        }
        self.shared.barrier.wait();
        buffer.copy_from_slice(&total?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_process_is_identity() {
        let mut buffer = [1.0, 2.0];
        SingleProcess.sum(&mut buffer).unwrap();
        assert_eq!(buffer, [1.0, 2.0]);
        assert_eq!(SingleProcess.size(), 1);
    }

    #[test]
    fn thread_group_sums_in_every_participant() {
        let group = ThreadGroup::new(3);
        let results: Vec<Vec<f64>> = std::thread::scope(|scope| {
            let handles: Vec<_> = group
                .into_iter()
                .map(|comm| {
                    scope.spawn(move || {
                        let mut out = Vec::new();
                        // repeated reductions must not mix rounds
                        for round in 0..4 {
                            let r = comm.rank() as f64;
                            let mut buffer = vec![r, 10.0 * r + round as f64];
                            comm.sum(&mut buffer).unwrap();
                            out.extend(buffer);
                        }
                        out
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        for result in &results {
            assert_eq!(result, &results[0]);
        }
        // ranks 0+1+2 = 3; 10*(0+1+2) + 3*round
        assert_eq!(results[0][0], 3.0);
        assert_eq!(results[0][1], 30.0);
        assert_eq!(results[0][7], 39.0);
    }
}
