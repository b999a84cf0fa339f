// Copyright 2023 Mikael Lund
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

//! # History-dependent bias potentials (metadynamics)
//!
//! Gaussian hills are deposited in collective-variable space at a fixed pace and
//! summed into a bias potential whose gradient becomes a force on each CV.
//! Hills are kept either as a plain list or splatted onto a grid, may be
//! well-tempered or adaptively shaped, and are shared between replicas through
//! append-only hills files.

pub mod adaptive;
pub mod auxiliary;
pub mod cli;
pub mod collective_variable;
pub mod comm;
pub mod grid;
pub mod hill;
pub mod hills_log;
pub mod matrix;
pub mod metadynamics;
pub mod storage;
pub mod welltempered;

pub use collective_variable::CollectiveVariable;
pub use comm::{Communicator, SingleProcess, ThreadGroup};
pub use hill::{Hill, HillShape, DP2_CUTOFF};
pub use metadynamics::{BiasOutput, MetaDynamics, MetaDynamicsBuilder};
pub use storage::BiasStorage;

pub use physical_constants::MOLAR_GAS_CONSTANT;

/// Boltzmann constant in kJ/(mol K), the default energy unit of the bias.
pub const BOLTZMANN_KJ_PER_MOL: f64 = MOLAR_GAS_CONSTANT * 1e-3;

/// Descriptive names for objects that show up in logs and reports.
pub trait Info {
    /// Get a short name
    fn short_name(&self) -> Option<&'static str> {
        None
    }
    /// Get a long name
    fn long_name(&self) -> Option<&'static str> {
        None
    }
}
