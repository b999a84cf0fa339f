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

//! # Metadynamics
//!
//! History-dependent bias built from Gaussian hills deposited every `pace` steps
//! at the current position in CV space.
//!
//! ~~~yaml
//! metadynamics:
//!   cvs:
//!     - name: d1
//!     - {name: phi, periodic: [-3.141592653589793, 3.141592653589793]}
//!   sigma: [0.2, 0.35]
//!   height: 1.2          # kJ/mol
//!   pace: 500
//!   file: HILLS
//!   bias_factor: 10.0    # well-tempered if > 1
//!   temperature: 300.0
//!   grid: {min: [0.0, -3.141592653589793], max: [3.0, 3.141592653589793], bins: [300, 100]}
//!   walkers: {n: 4, id: 0, dir: shared, read_stride: 100}
//! ~~~
//!
//! Per step the host calls [`MetaDynamics::calculate`] for the bias and forces,
//! followed by [`MetaDynamics::update`] which deposits, logs and synchronizes.

use crate::{
    adaptive::{Adaptive, WidthAdapter},
    auxiliary::{backup_existing, open_compressed},
    collective_variable::CollectiveVariable,
    comm::Communicator,
    grid::{Grid, GridAxis},
    hill::{Hill, HillShape},
    hills_log::{log_path, HillRecord, LogReader, LogWriter, PeerLog},
    matrix::packed_len,
    storage::{BiasStorage, GridBias, HillList, Interval},
    welltempered::WellTempered,
    Info, BOLTZMANN_KJ_PER_MOL,
};
use anyhow::{bail, Context, Result};
use derive_more::Debug;
use float_cmp::approx_eq;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashSet,
    io::Write,
    path::{Path, PathBuf},
    sync::Arc,
};
use validator::Validate;

fn default_label() -> String {
    "metad".to_string()
}
fn default_file() -> PathBuf {
    PathBuf::from("HILLS")
}
const fn default_bias_factor() -> f64 {
    1.0
}
const fn default_timestep() -> f64 {
    1.0
}
const fn default_true() -> bool {
    true
}
const fn default_read_stride() -> usize {
    1
}
fn default_dir() -> PathBuf {
    PathBuf::from(".")
}

/// Grid section of the configuration. One entry per CV in `min`, `max` and `bins`.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct GridBuilder {
    pub min: Vec<f64>,
    pub max: Vec<f64>,
    pub bins: Vec<usize>,
    /// Only store grid points that received a contribution.
    #[serde(default)]
    pub sparse: bool,
    /// Cubic spline interpolation between grid points.
    #[serde(default = "default_true")]
    pub spline: bool,
    /// Write the grid every this many steps (0 = never).
    #[serde(default)]
    pub write_stride: usize,
    #[serde(default)]
    pub file: Option<PathBuf>,
    /// Keep earlier snapshots as backups instead of overwriting them.
    #[serde(default)]
    pub store_old: bool,
}

/// Multiple replicas sharing their hills through files in `dir`.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct WalkersBuilder {
    #[validate(range(min = 1))]
    pub n: usize,
    pub id: usize,
    #[serde(default = "default_dir")]
    pub dir: PathBuf,
    /// Read the other replicas' hills every this many steps.
    #[serde(default = "default_read_stride")]
    #[validate(range(min = 1))]
    pub read_stride: usize,
}

/// User input for [`MetaDynamics`].
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct MetaDynamicsBuilder {
    /// Prefix of the tabulated bias in grid files.
    #[serde(default = "default_label")]
    pub label: String,
    pub cvs: Vec<CollectiveVariable>,
    /// One width per CV, or a single time window/distance for adaptive widths.
    pub sigma: Vec<f64>,
    /// Initial hill height.
    #[validate(range(exclusive_min = 0.0))]
    pub height: f64,
    /// Deposition interval in steps.
    #[validate(range(min = 1))]
    pub pace: usize,
    #[serde(default = "default_file")]
    pub file: PathBuf,
    #[serde(default)]
    pub adaptive: Adaptive,
    #[serde(default = "default_bias_factor")]
    #[validate(range(min = 1.0))]
    pub bias_factor: f64,
    /// Temperature in kelvin; required for well-tempered runs.
    #[serde(default)]
    pub temperature: Option<f64>,
    /// Defaults to the molar gas constant in kJ/(mol K).
    #[serde(default)]
    pub boltzmann_constant: Option<f64>,
    /// Simulation time per step, used for the time column of hills files.
    #[serde(default = "default_timestep")]
    pub timestep: f64,
    #[serde(default)]
    #[validate(nested)]
    pub grid: Option<GridBuilder>,
    #[serde(default)]
    #[validate(nested)]
    pub walkers: Option<WalkersBuilder>,
    /// Restrict the bias to `(lower, upper)` of a single CV.
    #[serde(default)]
    pub interval: Option<Interval>,
    /// Continue from existing hills files.
    #[serde(default)]
    pub restart: bool,
    /// Decimals of numbers in the hills file; exact shortest form if unset.
    #[serde(default)]
    pub decimals: Option<usize>,
}

impl MetaDynamicsBuilder {
    /// Minimal isotropic setup, mostly for programmatic use.
    pub fn new(cvs: Vec<CollectiveVariable>, sigma: Vec<f64>, height: f64, pace: usize) -> Self {
        Self {
            label: default_label(),
            cvs,
            sigma,
            height,
            pace,
            file: default_file(),
            adaptive: Adaptive::None,
            bias_factor: default_bias_factor(),
            temperature: None,
            boltzmann_constant: None,
            timestep: default_timestep(),
            grid: None,
            walkers: None,
            interval: None,
            restart: false,
            decimals: None,
        }
    }

    fn check_cvs(&self) -> Result<()> {
        if self.cvs.is_empty() {
            bail!("metadynamics needs at least one collective variable");
        }
        let mut names = HashSet::new();
        for cv in &self.cvs {
            cv.validate()?;
            if !names.insert(cv.name.as_str()) {
                bail!("duplicate collective variable '{}'", cv.name);
            }
        }
        Ok(())
    }

    fn check_widths(&self) -> Result<()> {
        if self.adaptive.is_adaptive() {
            if self.sigma.len() != 1 {
                bail!(
                    "adaptive widths need exactly one sigma, got {}",
                    self.sigma.len()
                );
            }
        } else if self.sigma.len() != self.cvs.len() {
            bail!(
                "{} sigma values given for {} collective variables",
                self.sigma.len(),
                self.cvs.len()
            );
        }
        if self.sigma.iter().any(|s| !s.is_finite() || *s < 0.0) {
            bail!("sigma values must be finite and non-negative");
        }
        Ok(())
    }

    fn well_tempered(&self) -> Result<Option<WellTempered>> {
        if self.bias_factor <= 1.0 {
            return Ok(None);
        }
        let temperature = match self.temperature {
            Some(t) if t > 0.0 => t,
            _ => bail!("well-tempered metadynamics (bias_factor > 1) needs a positive temperature"),
        };
        let kb = self.boltzmann_constant.unwrap_or(BOLTZMANN_KJ_PER_MOL);
        WellTempered::new(self.bias_factor, kb * temperature).map(Some)
    }

    fn interval(&self) -> Result<Option<Interval>> {
        match self.interval {
            None => Ok(None),
            Some(_) if self.cvs.len() != 1 => {
                bail!("an interval can only be used with a single collective variable")
            }
            Some(interval) if interval.upper < interval.lower => bail!(
                "interval upper bound {} is below the lower bound {}",
                interval.upper,
                interval.lower
            ),
            Some(interval) => Ok(Some(interval)),
        }
    }

    fn grid_axes(&self, grid: &GridBuilder) -> Result<Vec<GridAxis>> {
        let ncv = self.cvs.len();
        if grid.min.len() != ncv || grid.max.len() != ncv || grid.bins.len() != ncv {
            bail!("grid needs one min, max and bins entry per collective variable");
        }
        if grid.file.is_some() != (grid.write_stride > 0) {
            bail!("grid output needs both a file and a positive write_stride");
        }
        self.cvs
            .iter()
            .enumerate()
            .map(|(i, cv)| {
                if let Some((min, max)) = cv.periodic {
                    if !approx_eq!(f64, grid.min[i], min, epsilon = 1e-12)
                        || !approx_eq!(f64, grid.max[i], max, epsilon = 1e-12)
                    {
                        bail!(
                            "grid bounds of periodic '{}' must equal its domain [{}, {}]",
                            cv.name,
                            min,
                            max
                        );
                    }
                }
                Ok(GridAxis {
                    name: cv.name.clone(),
                    min: grid.min[i],
                    max: grid.max[i],
                    bins: grid.bins[i],
                    periodic: cv.is_periodic(),
                })
            })
            .collect()
    }

    fn storage(&self, comm: &Arc<dyn Communicator>) -> Result<BiasStorage> {
        let interval = self.interval()?;
        match &self.grid {
            None => Ok(BiasStorage::List(HillList::new(
                self.cvs.clone(),
                interval,
                Arc::clone(comm),
            ))),
            Some(grid) => {
                let spline = grid.spline && interval.is_none();
                if grid.spline && !spline {
                    log::info!("spline interpolation is switched off inside an interval");
                }
                let grid = Grid::new(
                    format!("{}.bias", self.label),
                    self.grid_axes(grid)?,
                    grid.sparse,
                    spline,
                )?;
                Ok(BiasStorage::Grid(GridBias::new(
                    grid,
                    self.cvs.clone(),
                    interval,
                    Arc::clone(comm),
                )?))
            }
        }
    }

    /// Check the input, set up the bias and, for restarts, replay existing hills files.
    ///
    /// Every participant of `comm` must call this. Only rank 0 writes files.
    pub fn build(&self, comm: Arc<dyn Communicator>) -> Result<MetaDynamics> {
        self.validate()?;
        self.check_cvs()?;
        self.check_widths()?;
        let well_tempered = self.well_tempered()?;
        let storage = self.storage(&comm)?;

        let walkers = self.walkers.clone().unwrap_or(WalkersBuilder {
            n: 1,
            id: 0,
            dir: default_dir(),
            read_stride: 1,
        });
        if walkers.id >= walkers.n {
            bail!(
                "walker id {} must be smaller than the number of walkers {}",
                walkers.id,
                walkers.n
            );
        }

        let (adapter, shape) = match self.adaptive {
            Adaptive::None => (None, HillShape::Isotropic),
            policy => (
                Some(WidthAdapter::new(policy, self.sigma[0], self.cvs.clone())?),
                HillShape::Multivariate,
            ),
        };

        let grid_output = self.grid.as_ref().and_then(|grid| {
            grid.file.as_ref().map(|file| GridOutput {
                file: file.clone(),
                stride: grid.write_stride,
                store_old: grid.store_old,
            })
        });

        let own_path = log_path(&self.file, &walkers.dir, walkers.n, walkers.id);
        let peers: Vec<PeerLog> = (0..walkers.n)
            .filter(|&i| i != walkers.id)
            .map(|i| PeerLog::new(log_path(&self.file, &walkers.dir, walkers.n, i), &self.cvs))
            .collect();

        let mut metad = MetaDynamics {
            label: self.label.clone(),
            cvs: self.cvs.clone(),
            sigma: self.sigma.clone(),
            height: self.height,
            pace: self.pace,
            timestep: self.timestep,
            bias_factor: self.bias_factor,
            shape,
            storage,
            well_tempered,
            adapter,
            writer: None,
            own_path,
            peers,
            read_stride: walkers.read_stride,
            grid_output,
            first_step: true,
            comm,
        };

        let is_root = metad.comm.rank() == 0;
        if self.restart {
            let mut records = Vec::new();
            if is_root && metad.own_path.exists() {
                records = LogReader::open(&metad.own_path, &metad.cvs)?.read_new()?;
                log::info!(
                    "restart: read {} hills from {}",
                    records.len(),
                    metad.own_path.display()
                );
            }
            let own = metad.replay(records)?;
            let peers = metad.sync_walkers()?;
            log::info!("restart: replayed {} own and {} peer hills", own, peers);
        }
        if is_root {
            if !self.restart {
                backup_existing(&metad.own_path)?;
            }
            metad.writer = Some(LogWriter::open(
                &metad.own_path,
                &metad.cvs,
                shape,
                walkers.n > 1,
                self.restart,
            )?
            .with_decimals(self.decimals));
        }

        log::info!(
            "{} metadynamics on {} CV(s): {} storage, {:?} hills, height {}, pace {}{}",
            metad.label,
            metad.cvs.len(),
            metad.storage.short_name().unwrap_or_default(),
            shape,
            metad.height,
            metad.pace,
            metad
                .well_tempered
                .map(|wt| format!(", bias factor {}", wt.bias_factor()))
                .unwrap_or_default()
        );
        if walkers.n > 1 {
            log::info!(
                "replica {} of {}, hills file {}",
                walkers.id,
                walkers.n,
                metad.own_path.display()
            );
        }
        Ok(metad)
    }
}

#[derive(Debug, Clone)]
struct GridOutput {
    file: PathBuf,
    stride: usize,
    store_old: bool,
}

/// Bias energy and the generalized force on each CV.
#[derive(Debug, Clone, PartialEq)]
pub struct BiasOutput {
    pub bias: f64,
    /// `-dV/ds` for each CV.
    pub forces: Vec<f64>,
}

/// History-dependent bias potential.
#[derive(Debug)]
pub struct MetaDynamics {
    label: String,
    cvs: Vec<CollectiveVariable>,
    sigma: Vec<f64>,
    /// Initial hill height.
    height: f64,
    pace: usize,
    timestep: f64,
    bias_factor: f64,
    shape: HillShape,
    storage: BiasStorage,
    well_tempered: Option<WellTempered>,
    adapter: Option<WidthAdapter>,
    /// Only present on rank 0.
    writer: Option<LogWriter>,
    own_path: PathBuf,
    peers: Vec<PeerLog>,
    read_stride: usize,
    grid_output: Option<GridOutput>,
    /// Nothing is deposited on the first update after construction.
    first_step: bool,
    #[debug(skip)]
    comm: Arc<dyn Communicator>,
}

impl MetaDynamics {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn cvs(&self) -> &[CollectiveVariable] {
        &self.cvs
    }

    pub const fn storage(&self) -> &BiasStorage {
        &self.storage
    }

    pub fn num_hills(&self) -> usize {
        self.storage.num_hills()
    }

    pub const fn well_tempered(&self) -> Option<&WellTempered> {
        self.well_tempered.as_ref()
    }

    /// Hills file written by this replica.
    pub fn log_path(&self) -> &Path {
        &self.own_path
    }

    fn check_dimension(&self, cv: &[f64]) -> Result<()> {
        if cv.len() != self.cvs.len() {
            bail!(
                "expected {} collective variable values, got {}",
                self.cvs.len(),
                cv.len()
            );
        }
        Ok(())
    }

    /// Bias at `cv` and the force `-dV/ds` on each CV.
    pub fn calculate(&self, cv: &[f64]) -> Result<BiasOutput> {
        self.check_dimension(cv)?;
        let mut gradient = vec![0.0; cv.len()];
        let bias = self.storage.evaluate(cv, Some(&mut gradient))?;
        Ok(BiasOutput {
            bias,
            forces: gradient.into_iter().map(|g| -g).collect(),
        })
    }

    /// Height of a hill deposited at `cv` now.
    pub fn height(&self, cv: &[f64]) -> Result<f64> {
        match &self.well_tempered {
            Some(wt) => Ok(wt.height(self.height, self.storage.evaluate(cv, None)?)),
            None => Ok(self.height),
        }
    }

    /// Width parameters of a hill deposited now.
    fn width(&self) -> Vec<f64> {
        match &self.adapter {
            Some(adapter) => adapter.precision(),
            None => self.sigma.clone(),
        }
    }

    /// Add a hill to the bias without logging it.
    pub fn add_hill(&mut self, hill: &Hill) -> Result<()> {
        if hill.ncv() != self.cvs.len() {
            bail!(
                "hill has {} dimensions, bias has {}",
                hill.ncv(),
                self.cvs.len()
            );
        }
        self.storage.add_hill(hill)
    }

    /// Advance one step: adapt widths, deposit every `pace` steps, write the grid
    /// and read the other replicas' hills when due.
    ///
    /// `jacobian` (one row per CV) is needed only for geometry adaptive widths.
    pub fn update(&mut self, step: usize, cv: &[f64], jacobian: Option<&[Vec<f64>]>) -> Result<()> {
        self.check_dimension(cv)?;
        if let Some(adapter) = &mut self.adapter {
            adapter.update(cv, jacobian)?;
        }
        let deposit = step % self.pace == 0 && !self.first_step;
        self.first_step = false;

        if deposit {
            // bias is read before the new hill is added
            let height = self.height(cv)?;
            let hill = Hill::new(cv.to_vec(), self.width(), height, self.shape)?;
            self.add_hill(&hill)?;
            if let Some(writer) = &mut self.writer {
                let stored = self
                    .well_tempered
                    .map_or(height, |wt| wt.to_stored(height));
                writer.write(self.timestep * step as f64, &hill, stored, self.bias_factor)?;
            }
            log::debug!("step {}: deposited hill of height {} at {:?}", step, height, cv);
        }

        let grid_due = self
            .grid_output
            .as_ref()
            .is_some_and(|output| step % output.stride == 0);
        if grid_due {
            self.write_grid()?;
        }

        if !self.peers.is_empty() && step % self.read_stride == 0 {
            let replayed = self.sync_walkers()?;
            if replayed > 0 {
                log::debug!("step {}: replayed {} hills from other replicas", step, replayed);
            }
        }
        Ok(())
    }

    /// Read new hills of the other replicas and add them to the bias.
    ///
    /// Files are read on rank 0 and the hills are shared with all participants.
    /// Returns the number of hills added.
    pub fn sync_walkers(&mut self) -> Result<usize> {
        let mut records = Vec::new();
        if self.comm.rank() == 0 {
            for peer in &mut self.peers {
                let new = peer.poll()?;
                log::trace!("{} new hills in {}", new.len(), peer.path().display());
                records.extend(new);
            }
        }
        self.replay(records)
    }

    /// Add logged hills to the bias, undoing the well-tempered height scaling.
    fn replay(&mut self, records: Vec<HillRecord>) -> Result<usize> {
        for record in &records {
            if record.bias_factor != self.bias_factor {
                log::warn!(
                    "hill at time {} was deposited with bias factor {}, this run uses {}",
                    record.time,
                    record.bias_factor,
                    self.bias_factor
                );
            }
        }
        let hills = records
            .into_iter()
            .map(HillRecord::into_hill)
            .collect::<Result<Vec<_>>>()?;
        let hills = broadcast_hills(self.comm.as_ref(), self.cvs.len(), hills)?;
        for hill in &hills {
            self.add_hill(hill)?;
        }
        Ok(hills.len())
    }

    /// Write the tabulated bias to the configured grid file.
    pub fn write_grid(&self) -> Result<()> {
        let Some(output) = &self.grid_output else {
            bail!("no grid file configured");
        };
        if self.comm.rank() != 0 {
            return Ok(());
        }
        if output.store_old {
            backup_existing(&output.file)?;
        }
        let mut stream = open_compressed(&output.file)?;
        self.storage
            .snapshot(&mut *stream)
            .and_then(|_| stream.flush().map_err(Into::into))
            .with_context(|| format!("cannot write grid to {}", output.file.display()))
    }
}

/// Hills known to rank 0, sent to every participant.
fn broadcast_hills(comm: &dyn Communicator, ncv: usize, hills: Vec<Hill>) -> Result<Vec<Hill>> {
    if comm.size() == 1 {
        return Ok(hills);
    }
    // center, shape flag, widths padded to the multivariate length, height
    let stride = ncv + 1 + packed_len(ncv) + 1;
    let is_root = comm.rank() == 0;
    let mut count = [if is_root { hills.len() as f64 } else { 0.0 }];
    comm.sum(&mut count)?;
    let count = count[0] as usize;

    let mut buffer = vec![0.0; count * stride];
    if is_root {
        for (hill, chunk) in hills.iter().zip(buffer.chunks_exact_mut(stride)) {
            let (center, rest) = chunk.split_at_mut(ncv);
            center.copy_from_slice(hill.center());
            rest[0] = match hill.shape() {
                HillShape::Isotropic => 0.0,
                HillShape::Multivariate => 1.0,
            };
            rest[1..=hill.width().len()].copy_from_slice(hill.width());
            rest[stride - ncv - 1] = *hill.height();
        }
    }
    comm.sum(&mut buffer)?;

    buffer
        .chunks_exact(stride)
        .map(|chunk| {
            let shape = if chunk[ncv] > 0.5 {
                HillShape::Multivariate
            } else {
                HillShape::Isotropic
            };
            let widths = &chunk[ncv + 1..ncv + 1 + shape.num_widths(ncv)];
            Hill::new(chunk[..ncv].to_vec(), widths.to_vec(), chunk[stride - 1], shape)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::{SingleProcess, ThreadGroup};
    use approx::assert_relative_eq;

    fn builder(dir: &Path) -> MetaDynamicsBuilder {
        let mut builder =
            MetaDynamicsBuilder::new(vec![CollectiveVariable::new("d1")], vec![0.2], 0.3, 500);
        builder.file = dir.join("HILLS");
        builder
    }

    #[test]
    fn deserialize_builder() {
        let yaml = r#"
cvs:
  - name: d1
  - name: phi
    periodic: [-3.0, 3.0]
sigma: [0.2, 0.3]
height: 1.0
pace: 100
adaptive: none
grid:
  min: [0.0, -3.0]
  max: [2.0, 3.0]
  bins: [100, 60]
walkers: {n: 2, id: 1}
"#;
        let builder: MetaDynamicsBuilder = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(builder.label, "metad");
        assert_eq!(builder.file, PathBuf::from("HILLS"));
        assert_eq!(builder.bias_factor, 1.0);
        let grid = builder.grid.as_ref().unwrap();
        assert!(grid.spline);
        assert!(!grid.sparse);
        assert_eq!(builder.walkers.as_ref().unwrap().read_stride, 1);
        assert_eq!(builder.decimals, None);
        assert!(serde_yaml::from_str::<MetaDynamicsBuilder>("cvs: []\nsigma: []\nheight: 1\npace: 1\nfoo: 1").is_err());
    }

    #[test]
    fn configuration_errors() {
        let dir = tempfile::tempdir().unwrap();
        let comm: Arc<dyn Communicator> = Arc::new(SingleProcess);
        let check = |modify: &dyn Fn(&mut MetaDynamicsBuilder)| {
            let mut b = builder(dir.path());
            modify(&mut b);
            b.build(Arc::clone(&comm)).is_err()
        };
        assert!(!check(&|_| {}));
        assert!(check(&|b| b.sigma = vec![0.1, 0.2]));
        assert!(check(&|b| b.height = 0.0));
        assert!(check(&|b| b.pace = 0));
        assert!(check(&|b| b.bias_factor = 0.5));
        assert!(check(&|b| b.bias_factor = 10.0));
        assert!(check(&|b| {
            b.adaptive = Adaptive::Diffusion;
            b.sigma = vec![10.0, 10.0];
        }));
        assert!(check(&|b| {
            b.interval = Some(Interval {
                lower: 1.0,
                upper: 0.0,
            })
        }));
        assert!(check(&|b| {
            b.walkers = Some(WalkersBuilder {
                n: 2,
                id: 2,
                dir: dir.path().to_path_buf(),
                read_stride: 1,
            })
        }));
        assert!(check(&|b| {
            b.grid = Some(GridBuilder {
                min: vec![0.0],
                max: vec![2.0],
                bins: vec![],
                sparse: false,
                spline: true,
                write_stride: 0,
                file: None,
                store_old: false,
            })
        }));
        assert!(check(&|b| {
            b.grid = Some(GridBuilder {
                min: vec![0.0],
                max: vec![2.0],
                bins: vec![100],
                sparse: false,
                spline: true,
                write_stride: 10,
                file: None,
                store_old: false,
            })
        }));
        assert!(check(&|b| {
            b.cvs = vec![CollectiveVariable::periodic("d1", -3.0, 3.0)];
            b.grid = Some(GridBuilder {
                min: vec![-2.0],
                max: vec![3.0],
                bins: vec![100],
                sparse: false,
                spline: true,
                write_stride: 0,
                file: None,
                store_old: false,
            })
        }));
        assert!(check(&|b| {
            b.cvs.push(CollectiveVariable::new("d2"));
            b.sigma.push(0.1);
            b.interval = Some(Interval {
                lower: 0.0,
                upper: 1.0,
            })
        }));
    }

    #[test]
    fn first_update_never_deposits() {
        let dir = tempfile::tempdir().unwrap();
        let mut metad = builder(dir.path()).build(Arc::new(SingleProcess)).unwrap();
        metad.update(0, &[1.0], None).unwrap();
        assert_eq!(metad.num_hills(), 0);
        metad.update(1, &[1.0], None).unwrap();
        assert_eq!(metad.num_hills(), 0);
        metad.update(500, &[1.0], None).unwrap();
        assert_eq!(metad.num_hills(), 1);

        let output = metad.calculate(&[1.0]).unwrap();
        assert_relative_eq!(output.bias, 0.3, epsilon = 1e-12);
        assert_relative_eq!(output.forces[0], 0.0);
        let output = metad.calculate(&[1.2]).unwrap();
        assert_relative_eq!(output.bias, 0.3 * (-0.5f64).exp(), epsilon = 1e-12);
        // pushed back towards larger d1
        assert!(output.forces[0] > 0.0);
        assert!(metad.calculate(&[1.0, 2.0]).is_err());
    }

    #[test]
    fn existing_log_is_backed_up() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("HILLS"), "old").unwrap();
        let metad = builder(dir.path()).build(Arc::new(SingleProcess)).unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("bck.0.HILLS")).unwrap(),
            "old"
        );
        assert!(std::fs::read_to_string(metad.log_path())
            .unwrap()
            .starts_with("#! FIELDS time d1 multivariate sigma_d1 height biasf\n"));
    }

    #[test]
    fn adaptive_hills_are_multivariate() {
        let dir = tempfile::tempdir().unwrap();
        let mut b = builder(dir.path());
        b.adaptive = Adaptive::Diffusion;
        b.sigma = vec![5.0];
        b.pace = 2;
        let mut metad = b.build(Arc::new(SingleProcess)).unwrap();
        for (step, x) in [1.0, 1.1, 0.9, 1.05, 0.95].iter().enumerate() {
            metad.update(step, &[*x], None).unwrap();
        }
        assert_eq!(metad.num_hills(), 2);
        let BiasStorage::List(list) = metad.storage() else {
            panic!("expected list storage");
        };
        assert_eq!(*list.hills()[0].shape(), HillShape::Multivariate);
        let text = std::fs::read_to_string(metad.log_path()).unwrap();
        assert!(text.contains("sigma_d1_d1"));
        assert_eq!(text.lines().filter(|l| l.contains(" true ")).count(), 2);
    }

    #[test]
    fn geometry_needs_jacobian() {
        let dir = tempfile::tempdir().unwrap();
        let mut b = builder(dir.path());
        b.adaptive = Adaptive::Geometry;
        b.sigma = vec![0.1];
        let mut metad = b.build(Arc::new(SingleProcess)).unwrap();
        assert!(metad.update(0, &[1.0], None).is_err());
        let jacobian = vec![vec![1.0, 0.0]];
        metad.update(1, &[1.0], Some(jacobian.as_slice())).unwrap();
    }

    #[test]
    fn broadcast_from_root() {
        let group = ThreadGroup::new(2);
        let results: Vec<Vec<Hill>> = std::thread::scope(|scope| {
            let handles: Vec<_> = group
                .into_iter()
                .map(|comm| {
                    scope.spawn(move || {
                        let hills = if comm.rank() == 0 {
                            vec![
                                Hill::isotropic(vec![0.5, 1.5], vec![0.1, 0.2], 0.7).unwrap(),
                                Hill::multivariate(vec![0.0, 1.0], vec![4.0, 1.0, 9.0], 0.2)
                                    .unwrap(),
                            ]
                        } else {
                            Vec::new()
                        };
                        broadcast_hills(&comm, 2, hills).unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert_eq!(results[0], results[1]);
        assert_eq!(results[1].len(), 2);
        assert_eq!(results[1][1].width(), &vec![4.0, 1.0, 9.0]);
    }
}
