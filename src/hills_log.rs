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

//! Append-only hills files.
//!
//! Every replica appends its deposited hills to its own file and replays the
//! files of all other replicas. A file starts with a header,
//!
//! ~~~text
//! #! FIELDS time d1 phi multivariate sigma_d1 sigma_phi height biasf
//! #! SET min_phi -pi
//! #! SET max_phi pi
//! ~~~
//!
//! followed by one line per hill. Headers may re-occur, e.g. after a restart,
//! and readers pick up the new field layout. `#! SET` entries act as constant
//! fields for the lines that follow.

use crate::{
    collective_variable::CollectiveVariable,
    hill::{Hill, HillShape},
    matrix::{band_labels, cholesky_band_to_precision, packed_len, precision_to_cholesky_band},
    welltempered,
};
use anyhow::{anyhow, bail, Context, Result};
use float_cmp::approx_eq;
use regex::Regex;
use std::{
    collections::HashMap,
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

/// Hills file of replica `id`.
///
/// A single replica uses `file` as is; with several replicas every replica
/// appends its index, `<dir>/<file>.<id>`.
pub fn log_path(file: impl AsRef<Path>, dir: impl AsRef<Path>, replicas: usize, id: usize) -> PathBuf {
    let file = file.as_ref();
    if replicas > 1 {
        let name = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        dir.as_ref().join(format!("{}.{}", name, id))
    } else {
        file.to_path_buf()
    }
}

/// Names of the width fields, without the `sigma_` prefix.
fn width_labels(cvs: &[CollectiveVariable], shape: HillShape) -> Vec<String> {
    match shape {
        HillShape::Isotropic => cvs.iter().map(|cv| cv.name.clone()).collect(),
        HillShape::Multivariate => {
            let names: Vec<&str> = cvs.iter().map(|cv| cv.name.as_str()).collect();
            band_labels(&names)
        }
    }
}

/// Header block of a hills file.
fn header(cvs: &[CollectiveVariable], shape: HillShape, clock: bool) -> String {
    let mut text = String::from("#! FIELDS time");
    for cv in cvs {
        text.push(' ');
        text.push_str(&cv.name);
    }
    text.push_str(" multivariate");
    for label in width_labels(cvs, shape) {
        text.push_str(" sigma_");
        text.push_str(&label);
    }
    text.push_str(" height biasf");
    if clock {
        text.push_str(" clock");
    }
    text.push('\n');
    for cv in cvs {
        if let Some((min, max)) = cv.periodic {
            text.push_str(&format!("#! SET min_{} {}\n", cv.name, min));
            text.push_str(&format!("#! SET max_{} {}\n", cv.name, max));
        }
    }
    text
}

/// Appends hills to the hills file of this replica.
#[derive(Debug)]
pub struct LogWriter {
    path: PathBuf,
    file: File,
    cvs: Vec<CollectiveVariable>,
    shape: HillShape,
    /// Append wall clock time to each record.
    clock: bool,
    /// Fixed number of decimals; shortest exact representation if unset.
    decimals: Option<usize>,
}

fn format_number(x: f64, decimals: Option<usize>) -> String {
    match decimals {
        Some(decimals) => format!("{:.*}", decimals, x),
        None => format!("{}", x),
    }
}

impl LogWriter {
    /// Create the file, or append to it when `append` is set. The header is written in both cases.
    pub fn open(
        path: impl AsRef<Path>,
        cvs: &[CollectiveVariable],
        shape: HillShape,
        clock: bool,
        append: bool,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("cannot create directory {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(append)
            .write(true)
            .truncate(!append)
            .open(&path)
            .with_context(|| format!("cannot open hills file {}", path.display()))?;
        file.write_all(header(cvs, shape, clock).as_bytes())?;
        file.flush()?;
        Ok(Self {
            path,
            file,
            cvs: cvs.to_vec(),
            shape,
            clock,
            decimals: None,
        })
    }

    /// Print numbers with a fixed number of decimals.
    pub fn with_decimals(mut self, decimals: Option<usize>) -> Self {
        self.decimals = decimals;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one hill. `height` is the value to store, i.e. already scaled for
    /// well-tempered runs.
    pub fn write(&mut self, time: f64, hill: &Hill, height: f64, bias_factor: f64) -> Result<()> {
        if *hill.shape() != self.shape {
            bail!("{:?} hill cannot be written to a {:?} hills file", hill.shape(), self.shape);
        }
        let number = |x: f64| format!(" {}", format_number(x, self.decimals));
        let mut record = format_number(time, self.decimals);
        for &x in hill.center() {
            record.push_str(&number(x));
        }
        let widths = match self.shape {
            HillShape::Isotropic => {
                record.push_str(" false");
                hill.width().clone()
            }
            HillShape::Multivariate => {
                record.push_str(" true");
                precision_to_cholesky_band(hill.width(), self.cvs.len())?
            }
        };
        for w in widths {
            record.push_str(&number(w));
        }
        record.push_str(&number(height));
        record.push_str(&number(bias_factor));
        if self.clock {
            let seconds = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default();
            record.push_str(&format!(" {}", seconds));
        }
        record.push('\n');
        // one write per record so that readers never see half a line from us
        self.file
            .write_all(record.as_bytes())
            .and_then(|_| self.file.flush())
            .with_context(|| format!("cannot write to {}", self.path.display()))
    }
}

/// One line of a hills file as written, before undoing well-tempered scaling.
#[derive(Debug, Clone, PartialEq)]
pub struct HillRecord {
    pub time: f64,
    pub center: Vec<f64>,
    pub shape: HillShape,
    /// Sigmas, or the packed precision matrix for multivariate hills.
    pub width: Vec<f64>,
    pub stored_height: f64,
    pub bias_factor: f64,
}

impl HillRecord {
    /// The hill with its deposited height restored.
    pub fn into_hill(self) -> Result<Hill> {
        let height = welltempered::from_stored(self.stored_height, self.bias_factor);
        Hill::new(self.center, self.width, height, self.shape)
    }
}

fn parse_number(text: &str) -> Result<f64> {
    match text {
        "pi" => Ok(std::f64::consts::PI),
        "-pi" => Ok(-std::f64::consts::PI),
        _ => text
            .parse::<f64>()
            .map_err(|_| anyhow!("cannot parse '{}' as a number", text)),
    }
}

/// Incremental reader of a hills file.
///
/// Only complete, newline terminated lines are consumed; a partially written
/// last line is picked up by a later call to [`LogReader::read_new`].
#[derive(Debug)]
pub struct LogReader {
    path: PathBuf,
    file: File,
    /// Byte offset of the first unread line.
    cursor: u64,
    cvs: Vec<CollectiveVariable>,
    /// Column of each field in a record.
    fields: HashMap<String, usize>,
    /// `#! SET` entries.
    constants: HashMap<String, String>,
    /// Matches `#! FIELDS ...` and `#! SET ...` lines.
    header: Regex,
}

impl LogReader {
    pub fn open(path: impl AsRef<Path>, cvs: &[CollectiveVariable]) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)
            .with_context(|| format!("cannot open hills file {}", path.display()))?;
        Ok(Self {
            path,
            file,
            cursor: 0,
            cvs: cvs.to_vec(),
            fields: HashMap::new(),
            constants: HashMap::new(),
            header: Regex::new(r"^#!\s+(FIELDS|SET)\s+(.*?)\s*$")?,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub const fn cursor(&self) -> u64 {
        self.cursor
    }

    /// All complete records appended since the previous call.
    pub fn read_new(&mut self) -> Result<Vec<HillRecord>> {
        self.file.seek(SeekFrom::Start(self.cursor))?;
        let mut bytes = Vec::new();
        self.file
            .read_to_end(&mut bytes)
            .with_context(|| format!("cannot read {}", self.path.display()))?;
        let complete = match bytes.iter().rposition(|&b| b == b'\n') {
            Some(last) => last + 1,
            None => return Ok(Vec::new()),
        };
        let text = std::str::from_utf8(&bytes[..complete])
            .with_context(|| format!("{} is not a text file", self.path.display()))?;
        let mut records = Vec::new();
        for line in text.lines() {
            if let Some(record) = self
                .parse_line(line)
                .with_context(|| format!("in {}: '{}'", self.path.display(), line))?
            {
                records.push(record);
            }
        }
        self.cursor += complete as u64;
        log::trace!("read {} hills from {}", records.len(), self.path.display());
        Ok(records)
    }

    fn parse_line(&mut self, line: &str) -> Result<Option<HillRecord>> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }
        if line.starts_with('#') {
            if let Some(captures) = self.header.captures(line) {
                let content = &captures[2];
                if &captures[1] == "FIELDS" {
                    self.fields = content
                        .split_whitespace()
                        .enumerate()
                        .map(|(i, name)| (name.to_string(), i))
                        .collect();
                    self.constants.clear();
                } else {
                    let mut words = content.split_whitespace();
                    if let (Some(key), Some(value)) = (words.next(), words.next()) {
                        self.constants.insert(key.to_string(), value.to_string());
                    }
                }
            }
            return Ok(None);
        }
        let columns: Vec<&str> = line.split_whitespace().collect();
        self.parse_record(&columns).map(Some)
    }

    fn field<'a>(&'a self, columns: &[&'a str], name: &str) -> Result<&'a str> {
        if let Some(&column) = self.fields.get(name) {
            return columns
                .get(column)
                .copied()
                .ok_or_else(|| anyhow!("record is missing field '{}'", name));
        }
        self.constants
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| anyhow!("field '{}' not found", name))
    }

    fn number(&self, columns: &[&str], name: &str) -> Result<f64> {
        parse_number(self.field(columns, name)?)
    }

    fn check_periodicity(&self, cv: &CollectiveVariable) -> Result<()> {
        let min = self.constants.get(&format!("min_{}", cv.name));
        let max = self.constants.get(&format!("max_{}", cv.name));
        match (cv.periodic, min, max) {
            (None, None, None) => Ok(()),
            (Some((lower, upper)), Some(min), Some(max)) => {
                let (min, max) = (parse_number(min)?, parse_number(max)?);
                if approx_eq!(f64, min, lower, epsilon = 1e-12)
                    && approx_eq!(f64, max, upper, epsilon = 1e-12)
                {
                    Ok(())
                } else {
                    bail!(
                        "periodic domain of '{}' is [{}, {}] but hills were written with [{}, {}]",
                        cv.name,
                        lower,
                        upper,
                        min,
                        max
                    )
                }
            }
            (Some(_), _, _) => bail!("'{}' is periodic but the hills file says it is not", cv.name),
            (None, _, _) => bail!("'{}' is not periodic but the hills file says it is", cv.name),
        }
    }

    fn parse_record(&self, columns: &[&str]) -> Result<HillRecord> {
        for cv in &self.cvs {
            self.check_periodicity(cv)?;
        }
        let time = self.number(columns, "time")?;
        let center = self
            .cvs
            .iter()
            .map(|cv| self.number(columns, &cv.name))
            .collect::<Result<Vec<_>>>()?;
        let shape = match self.field(columns, "multivariate")? {
            "true" => HillShape::Multivariate,
            "false" => HillShape::Isotropic,
            other => bail!("'multivariate' must be true or false, got '{}'", other),
        };
        let widths = width_labels(&self.cvs, shape)
            .iter()
            .map(|label| self.number(columns, &format!("sigma_{}", label)))
            .collect::<Result<Vec<_>>>()?;
        let width = match shape {
            HillShape::Isotropic => widths,
            HillShape::Multivariate => {
                debug_assert_eq!(widths.len(), packed_len(self.cvs.len()));
                cholesky_band_to_precision(&widths, self.cvs.len())?
            }
        };
        Ok(HillRecord {
            time,
            center,
            shape,
            width,
            stored_height: self.number(columns, "height")?,
            bias_factor: self.number(columns, "biasf")?,
        })
    }
}

/// Progress of reading another replica's hills file.
#[derive(Debug, Default)]
pub enum PeerState {
    /// The file does not exist (yet).
    #[default]
    Missing,
    /// The file is open but has not been read.
    Open(LogReader),
    /// Everything written so far has been read.
    CaughtUp(LogReader),
}

/// Hills file of another replica.
#[derive(Debug)]
pub struct PeerLog {
    path: PathBuf,
    cvs: Vec<CollectiveVariable>,
    state: PeerState,
}

impl PeerLog {
    pub fn new(path: impl AsRef<Path>, cvs: &[CollectiveVariable]) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            cvs: cvs.to_vec(),
            state: PeerState::Missing,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub const fn state(&self) -> &PeerState {
        &self.state
    }

    /// Records written since the previous poll.
    ///
    /// A missing file is not an error; it is looked for again at the next poll.
    pub fn poll(&mut self) -> Result<Vec<HillRecord>> {
        if matches!(self.state, PeerState::Missing) {
            if !self.path.exists() {
                return Ok(Vec::new());
            }
            log::info!("found hills file {}", self.path.display());
            self.state = PeerState::Open(LogReader::open(&self.path, &self.cvs)?);
        }
        match std::mem::take(&mut self.state) {
            PeerState::Open(mut reader) | PeerState::CaughtUp(mut reader) => {
                let records = reader.read_new();
                self.state = PeerState::CaughtUp(reader);
                records
            }
            PeerState::Missing => Ok(Vec::new()),
        }
    }
}
