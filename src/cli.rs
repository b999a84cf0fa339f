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

//! Command line driver that replays a CV trajectory through the bias.
//!
//! ~~~yaml
//! metadynamics:
//!   cvs: [{name: d1}]
//!   sigma: [0.2]
//!   height: 0.3
//!   pace: 500
//! trajectory: colvar.dat    # rows of `step cv_1 .. cv_n`
//! bias_file: bias.dat.gz    # rows of `step bias force_1 .. force_n`
//! ~~~

use crate::{
    adaptive::Adaptive,
    auxiliary::{open_compressed, open_decompressed},
    comm::SingleProcess,
    metadynamics::{MetaDynamics, MetaDynamicsBuilder},
};
use anyhow::{anyhow, bail, Context, Result};
use average::{Estimate, Mean};
use clap::{Parser, Subcommand};
use indicatif::ProgressBar;
use pretty_env_logger::env_logger::DEFAULT_FILTER_ENV;
use serde::{Deserialize, Serialize};
use std::{
    io::{BufRead, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run metadynamics along a CV trajectory
    #[clap(arg_required_else_help = true)]
    Run {
        /// Input file in YAML format
        #[clap(long, short = 'i')]
        input: PathBuf,
    },
}

#[derive(Parser)]
#[clap(version, about, long_about = None)]
struct Args {
    #[clap(subcommand)]
    pub command: Commands,

    /// Verbose output. See more with e.g. RUST_LOG=Trace
    #[clap(long, short = 'v', action)]
    pub verbose: bool,
    /// Output file in YAML format
    #[clap(long, short = 'o', default_value = "output.yaml")]
    pub output: PathBuf,
}

/// Input file layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Input {
    pub metadynamics: MetaDynamicsBuilder,
    /// CV values per step.
    pub trajectory: PathBuf,
    /// Bias and forces per step; gzip compressed if the name ends with `.gz`.
    #[serde(default)]
    pub bias_file: Option<PathBuf>,
}

impl Input {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path)
            .with_context(|| format!("cannot open input file {}", path.display()))?;
        serde_yaml::from_reader(file)
            .with_context(|| format!("cannot parse input file {}", path.display()))
    }
}

/// Results written to the output YAML file.
#[derive(Debug, Clone, Serialize)]
pub struct Summary {
    pub steps: usize,
    pub num_hills: usize,
    pub mean_bias: f64,
    pub final_bias: f64,
}

pub fn do_main() -> Result<()> {
    let args = Args::parse();
    if std::env::var(DEFAULT_FILTER_ENV).is_err() {
        std::env::set_var(
            DEFAULT_FILTER_ENV,
            if args.verbose { "Debug" } else { "Info" },
        );
    }
    pretty_env_logger::init();

    let mut yaml_output = std::fs::File::create(&args.output)
        .with_context(|| format!("cannot create {}", args.output.display()))?;

    match args.command {
        Commands::Run { input } => {
            run(&input, &mut yaml_output)?;
        }
    }
    Ok(())
}

/// Helper function to serialize data to an existing YAML file
fn write_yaml<T: serde::Serialize>(
    data: &T,
    output: &mut dyn Write,
    key: Option<&str>,
) -> Result<()> {
    match key {
        Some(key) => {
            let mut wrapper = std::collections::BTreeMap::new();
            wrapper.insert(key.to_string(), data);
            let yaml = serde_yaml::to_string(&wrapper)?;
            output.write_all(yaml.as_bytes())?;
        }
        None => {
            let yaml = serde_yaml::to_string(data)?;
            output.write_all(yaml.as_bytes())?;
        }
    }
    Ok(())
}

/// Trajectory rows `(step, cv values)`; `#` comments and blank lines are skipped.
pub fn read_trajectory(path: impl AsRef<Path>, ncv: usize) -> Result<Vec<(usize, Vec<f64>)>> {
    let path = path.as_ref();
    let mut rows = Vec::new();
    for (number, line) in open_decompressed(path)?.lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let location = || format!("{} line {}", path.display(), number + 1);
        let mut words = line.split_whitespace();
        let step = words
            .next()
            .ok_or_else(|| anyhow!("missing step"))?
            .parse::<usize>()
            .with_context(location)?;
        let cv = words
            .map(|w| w.parse::<f64>())
            .collect::<std::result::Result<Vec<_>, _>>()
            .with_context(location)?;
        if cv.len() != ncv {
            bail!("{}: expected {} CV values, got {}", location(), ncv, cv.len());
        }
        rows.push((step, cv));
    }
    Ok(rows)
}

/// Step the bias along `trajectory`, optionally writing bias and forces of every step.
pub fn replay_trajectory(
    metad: &mut MetaDynamics,
    trajectory: &[(usize, Vec<f64>)],
    mut stream: Option<&mut dyn Write>,
    progress: Option<&ProgressBar>,
) -> Result<Summary> {
    let mut mean = Mean::new();
    let mut final_bias = 0.0;
    for (i, (step, cv)) in trajectory.iter().enumerate() {
        let output = metad.calculate(cv)?;
        if let Some(stream) = stream.as_mut() {
            write!(stream, "{} {:.6}", step, output.bias)?;
            for force in &output.forces {
                write!(stream, " {:.6}", force)?;
            }
            writeln!(stream)?;
        }
        mean.add(output.bias);
        final_bias = output.bias;
        metad.update(*step, cv, None)?;
        if let Some(progress) = progress {
            progress.set_position(i as u64 + 1);
        }
    }
    Ok(Summary {
        steps: trajectory.len(),
        num_hills: metad.num_hills(),
        mean_bias: mean.mean(),
        final_bias,
    })
}

fn run(input: &Path, yaml_output: &mut std::fs::File) -> Result<()> {
    let input = Input::from_file(input)?;
    if input.metadynamics.adaptive == Adaptive::Geometry {
        bail!("geometry adaptive widths need CV Jacobians, which a trajectory file does not provide");
    }
    let mut metad = input.metadynamics.build(Arc::new(SingleProcess))?;
    let trajectory = read_trajectory(&input.trajectory, metad.cvs().len())?;
    log::info!(
        "read {} steps from {}",
        trajectory.len(),
        input.trajectory.display()
    );

    write_yaml(&input.metadynamics, yaml_output, Some("metadynamics"))?;

    let mut stream = input.bias_file.as_ref().map(open_compressed).transpose()?;
    let progress = ProgressBar::new(trajectory.len() as u64);
    let summary = replay_trajectory(
        &mut metad,
        &trajectory,
        stream.as_deref_mut().map(|s| s as &mut dyn Write),
        Some(&progress),
    )?;
    progress.finish();
    if let Some(stream) = stream.as_mut() {
        stream.flush()?;
    }

    log::info!(
        "deposited or replayed {} hills, mean bias {:.3}",
        summary.num_hills,
        summary.mean_bias
    );
    write_yaml(&summary, yaml_output, Some("summary"))?;
    Ok(())
}
