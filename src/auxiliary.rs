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

//! File helpers shared by the hills log, grid snapshots and the command line driver.

use anyhow::{Context, Result};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use std::{
    fs::File,
    io::{BufRead, BufReader, BufWriter, Write},
    path::{Path, PathBuf},
};

fn is_gzip(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some("gz")
}

/// Create a file for writing; gzip compressed if the name ends with `.gz`.
pub fn open_compressed(path: impl AsRef<Path>) -> Result<Box<dyn Write>> {
    let path = path.as_ref();
    let file =
        File::create(path).with_context(|| format!("cannot create {}", path.display()))?;
    Ok(if is_gzip(path) {
        Box::new(GzEncoder::new(file, Compression::default()))
    } else {
        Box::new(BufWriter::new(file))
    })
}

/// Open a possibly gzip compressed file for buffered reading.
pub fn open_decompressed(path: impl AsRef<Path>) -> Result<Box<dyn BufRead>> {
    let path = path.as_ref();
    let file = File::open(path).with_context(|| format!("cannot open {}", path.display()))?;
    Ok(if is_gzip(path) {
        Box::new(BufReader::new(GzDecoder::new(file)))
    } else {
        Box::new(BufReader::new(file))
    })
}

/// First free backup name `bck.<n>.<name>` next to `path`.
pub fn backup_path(path: impl AsRef<Path>) -> PathBuf {
    let path = path.as_ref();
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    (0..)
        .map(|n| path.with_file_name(format!("bck.{}.{}", n, name)))
        .find(|candidate| !candidate.exists())
        .unwrap_or_else(|| path.to_path_buf())
}

/// Move an existing file out of the way. Returns the backup path, if any.
pub fn backup_existing(path: impl AsRef<Path>) -> Result<Option<PathBuf>> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(None);
    }
    let backup = backup_path(path);
    std::fs::rename(path, &backup).with_context(|| {
        format!(
            "cannot back up {} as {}",
            path.display(),
            backup.display()
        )
    })?;
    log::info!("backed up {} as {}", path.display(), backup.display());
    Ok(Some(backup))
}
