//! Shared utilities for integration tests.
//!
//! Provides seeded CV trajectories, a step loop mimicking a host engine, and
//! helpers for running the `metad` CLI binary.

use std::path::{Path, PathBuf};
use std::process::Command;

use metad::{CollectiveVariable, MetaDynamics, MetaDynamicsBuilder};
use rand::{rngs::StdRng, Rng, SeedableRng};

/// Path to the compiled `metad` binary.
pub fn metad_binary() -> PathBuf {
    let mut path = PathBuf::from(env!("CARGO_BIN_EXE_metad"));
    if !path.exists() {
        path = PathBuf::from("target/debug/metad");
    }
    path
}

/// Run metad with the given arguments and assert success.
pub fn run_metad(input: &Path, output: &Path) {
    let status = Command::new(metad_binary())
        .arg("-o")
        .arg(output)
        .arg("run")
        .arg("-i")
        .arg(input)
        .status()
        .expect("failed to execute metad binary");
    assert!(status.success(), "metad exited with status: {status}");
}

/// Reflected random walk inside `[lower, upper]` for every CV.
pub fn random_walk(
    seed: u64,
    steps: usize,
    start: &[f64],
    lower: f64,
    upper: f64,
    step_size: f64,
) -> Vec<Vec<f64>> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut x = start.to_vec();
    (0..steps)
        .map(|_| {
            for xi in x.iter_mut() {
                *xi += rng.gen_range(-step_size..step_size);
                if *xi < lower {
                    *xi = 2.0 * lower - *xi;
                }
                if *xi > upper {
                    *xi = 2.0 * upper - *xi;
                }
            }
            x.clone()
        })
        .collect()
}

/// One non-periodic CV with hills of width 0.2 and height 0.3.
pub fn one_cv_builder(dir: &Path, pace: usize) -> MetaDynamicsBuilder {
    let mut builder =
        MetaDynamicsBuilder::new(vec![CollectiveVariable::new("d1")], vec![0.2], 0.3, pace);
    builder.file = dir.join("HILLS");
    builder
}

/// Step `metad` through `steps` of `trajectory` and return the bias seen at each step.
pub fn run_steps(
    metad: &mut MetaDynamics,
    trajectory: &[Vec<f64>],
    steps: std::ops::RangeInclusive<usize>,
) -> Vec<(usize, f64)> {
    steps
        .map(|step| {
            let cv = &trajectory[step];
            let bias = metad.calculate(cv).unwrap().bias;
            metad.update(step, cv, None).unwrap();
            (step, bias)
        })
        .collect()
}
