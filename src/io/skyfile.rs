//! Read/write sky model JSON files.
//!
//! Sky JSON is the portable representation of a fitted sky:
//! - the sky model arrays (one row per fiber)
//! - the configuration and fit diagnostics that produced it
//!
//! Arrays are stored as nested rows so the files are easy to load from scripts.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use chrono::{DateTime, Utc};
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::domain::{FitSummary, SkyConfig, SkyModel};
use crate::error::SkyError;
use crate::fit::SkyFit;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkyModelFile {
    pub tool: String,
    pub created_at: DateTime<Utc>,
    pub config: SkyConfig,
    pub summary: FitSummary,
    pub wave: Vec<f64>,
    pub flux: Vec<Vec<f64>>,
    pub ivar: Vec<Vec<f64>>,
    pub stat_ivar: Vec<Vec<f64>>,
    pub mask: Vec<Vec<u32>>,
    pub nrej: usize,
}

impl SkyModelFile {
    pub fn from_fit(fit: &SkyFit, config: &SkyConfig) -> Self {
        let model = &fit.model;
        Self {
            tool: "skysub".to_string(),
            created_at: Utc::now(),
            config: config.clone(),
            summary: fit.summary.clone(),
            wave: model.wave().to_vec(),
            flux: to_rows(model.flux()),
            ivar: to_rows(model.ivar()),
            stat_ivar: to_rows(model.stat_ivar()),
            mask: to_rows(model.mask()),
            nrej: model.nrej(),
        }
    }

    /// Rebuild the in-memory model, validating every array shape.
    pub fn to_model(&self) -> Result<SkyModel, SkyError> {
        let nwave = self.wave.len();
        SkyModel::new(
            self.wave.clone(),
            from_rows("flux", &self.flux, nwave)?,
            from_rows("ivar", &self.ivar, nwave)?,
            from_rows("mask", &self.mask, nwave)?,
            self.nrej,
            from_rows("stat_ivar", &self.stat_ivar, nwave)?,
        )
    }
}

/// Write a sky model JSON file.
pub fn write_sky_json(path: &Path, fit: &SkyFit, config: &SkyConfig) -> Result<(), SkyError> {
    let file = File::create(path).map_err(|source| SkyError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::to_writer_pretty(BufWriter::new(file), &SkyModelFile::from_fit(fit, config))?;
    Ok(())
}

/// Read a sky model JSON file.
pub fn read_sky_json(path: &Path) -> Result<SkyModelFile, SkyError> {
    let file = File::open(path).map_err(|source| SkyError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let sky: SkyModelFile = serde_json::from_reader(BufReader::new(file))?;
    Ok(sky)
}

fn to_rows<T: nalgebra::Scalar + Copy>(m: &DMatrix<T>) -> Vec<Vec<T>> {
    m.row_iter().map(|r| r.iter().copied().collect()).collect()
}

fn from_rows<T: nalgebra::Scalar + Copy>(
    what: &'static str,
    rows: &[Vec<T>],
    nwave: usize,
) -> Result<DMatrix<T>, SkyError> {
    if let Some(bad) = rows.iter().find(|r| r.len() != nwave) {
        return Err(SkyError::shape(what, format!("rows of {nwave}"), format!("a row of {}", bad.len())));
    }
    Ok(DMatrix::from_fn(rows.len(), nwave, |i, j| rows[i][j]))
}
