//! Conversion of raw sensor values into pressure.
//!
//! Every cell of the mat gets its own curve mapping raw ADC values to
//! pascals, fitted from reference samples taken under known loads. On top of
//! the curves the model keeps a per-cell DC offset: the raw values the mat
//! reports while unloaded. Calibrated frames have the pressure of that
//! baseline subtracted.

use crate::curve_fit::{
    exponential, fit_exponential, fit_polynomial, polynomial, r_squared, FitError, EXP_START,
};
use crate::grid::{CalibratedGrid, Grid, SensorGrid};
use crate::mat::{
    distributed_lbs_to_sensor_pressure, COLS, DEFAULT_MAX_RATED_PRESSURE_PA, FRAME_SIZE, ROWS,
};

use log::{debug, info, warn};
use ndarray::{Array3, ArrayD};
use ndarray_npy::{write_npy, ReadNpyError, ReadNpyExt, WriteNpyError};
use serde::{Deserialize, Serialize};
use std::{
    borrow::Cow,
    fmt, fs, io,
    path::{Path, PathBuf},
    sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

/// Raw values at or above this are treated as saturated and left out of fits.
pub const DEFAULT_SATURATION_THRESHOLD: u16 = 255;

/// Upper clamp applied after the DC offset is subtracted.
pub const MAX_OFFSET_PRESSURE_PA: f64 = 1e9;

/// A calibration model shared between a running session, which applies it
/// to every frame, and whoever refits or rezeroes it.
pub type SharedCalibration = Arc<RwLock<CalibrationModel>>;

/// The family of curve fitted to every cell.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum CurveModel {
    /// `a * e^(b * x) + c`, with bounded parameters.
    Exponential,
    /// An ordinary polynomial of the given degree.
    Polynomial { degree: usize },
}

impl CurveModel {
    /// Number of parameters stored per cell.
    pub fn param_count(&self) -> usize {
        match self {
            CurveModel::Exponential => 3,
            CurveModel::Polynomial { degree } => degree + 1,
        }
    }

    /// Evaluates the curve at raw value `x`.
    pub fn evaluate(&self, x: f64, params: &[f64]) -> f64 {
        match self {
            CurveModel::Exponential => exponential(x, params),
            CurveModel::Polynomial { .. } => polynomial(x, params),
        }
    }

    /// Parameters used before any fit, and by cells whose fit failed.
    pub fn default_params(&self) -> Vec<f64> {
        match self {
            CurveModel::Exponential => EXP_START.to_vec(),
            CurveModel::Polynomial { degree } => vec![0.0; degree + 1],
        }
    }

    fn fit(&self, xs: &[f64], ys: &[f64]) -> Result<Vec<f64>, FitError> {
        match self {
            CurveModel::Exponential => fit_exponential(xs, ys).map(|p| p.to_vec()),
            CurveModel::Polynomial { degree } => fit_polynomial(xs, ys, *degree),
        }
    }
}

impl Default for CurveModel {
    fn default() -> Self {
        CurveModel::Exponential
    }
}

impl fmt::Display for CurveModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CurveModel::Exponential => write!(f, "exponential"),
            CurveModel::Polynomial { degree } => write!(f, "polynomial (degree {})", degree),
        }
    }
}

/// Tunables of a [`CalibrationModel`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    pub curve: CurveModel,
    /// Raw values at or above this are dropped from fits. 256 keeps everything.
    pub saturation_threshold: u16,
    /// Calibrated values are clamped to `[0, max_rated_pressure]` pascals.
    pub max_rated_pressure: f64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        CalibrationConfig {
            curve: CurveModel::default(),
            saturation_threshold: DEFAULT_SATURATION_THRESHOLD,
            max_rated_pressure: DEFAULT_MAX_RATED_PRESSURE_PA,
        }
    }
}

impl CalibrationConfig {
    /// Rejects settings no model can work with.
    pub fn validate(&self) -> Result<(), String> {
        let max = self.max_rated_pressure;
        if !max.is_finite() || max < 0.0 {
            return Err(format!(
                "max_rated_pressure must be a finite, non-negative number of pascals, got {}",
                max
            ));
        }
        Ok(())
    }
}

/// A raw frame recorded under a known, uniform pressure.
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceSample {
    pub grid: SensorGrid,
    pub pressure_pa: f64,
}

impl ReferenceSample {
    pub fn new(grid: SensorGrid, pressure_pa: f64) -> Self {
        ReferenceSample { grid, pressure_pa }
    }

    /// A sample taken with `weight_lbs` spread evenly over the mat.
    pub fn from_weight_lbs(grid: SensorGrid, weight_lbs: f64) -> Self {
        ReferenceSample {
            grid,
            pressure_pa: distributed_lbs_to_sensor_pressure(weight_lbs),
        }
    }
}

/// Summary of one [`CalibrationModel::fit`].
#[derive(Debug, Clone, PartialEq)]
pub struct FitReport {
    /// Number of cells fitted.
    pub cells: usize,
    pub min_r_squared: f64,
    pub avg_r_squared: f64,
    /// Cells whose fit failed and fell back to the default parameters.
    pub failures: usize,
    /// Saturated `(raw, pressure)` pairs left out, over all cells.
    pub dropped_pairs: usize,
    /// Set when the polynomial degree had to be lowered to this value.
    pub degraded_degree: Option<usize>,
    /// Fewer samples than curve parameters were available.
    pub underdetermined: bool,
}

impl fmt::Display for FitReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "fitted {} cells, min R^2 {:.4}, avg R^2 {:.4}, {} failures, {} saturated pairs dropped",
            self.cells, self.min_r_squared, self.avg_r_squared, self.failures, self.dropped_pairs
        )?;
        if let Some(degree) = self.degraded_degree {
            write!(f, ", degree lowered to {}", degree)?;
        }
        if self.underdetermined {
            write!(f, ", underdetermined")?;
        }
        Ok(())
    }
}

/// An operation was asked for before its inputs were available.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreconditionError {
    /// Fitting needs at least two reference samples.
    TooFewSamples { found: usize },

    /// DC offsets were requested before any zeroing sample was added.
    NoZeroingSamples,
}

impl fmt::Display for PreconditionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            PreconditionError::TooFewSamples { found } => Cow::from(format!(
                "at least 2 reference samples are required, got {}",
                found
            )),
            PreconditionError::NoZeroingSamples => Cow::from("no zeroing samples were collected"),
        };

        write!(f, "{}", msg)
    }
}

impl std::error::Error for PreconditionError {}

/// Reading or writing calibration parameters failed.
#[derive(Debug)]
pub enum PersistenceError {
    /// There is no parameter file at the path.
    NotFound(PathBuf),

    /// The file could not be read or written.
    Io(io::Error),

    /// The file is not a usable `.npy` array.
    Format(String),

    /// The stored parameters do not fit the configured curve model.
    ShapeMismatch {
        expected: Vec<usize>,
        found: Vec<usize>,
    },
}

impl fmt::Display for PersistenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            PersistenceError::NotFound(path) => {
                Cow::from(format!("no calibration file at {}", path.display()))
            }
            PersistenceError::Io(e) => Cow::from(format!("io error: {}", e)),
            PersistenceError::Format(reason) => Cow::from(format!("bad file format: {}", reason)),
            PersistenceError::ShapeMismatch { expected, found } => Cow::from(format!(
                "expected parameters of shape {:?}, found {:?}",
                expected, found
            )),
        };

        write!(f, "{}", msg)
    }
}

impl std::error::Error for PersistenceError {}

impl From<io::Error> for PersistenceError {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<ReadNpyError> for PersistenceError {
    fn from(value: ReadNpyError) -> Self {
        match value {
            ReadNpyError::Io(e) => Self::Io(e),
            other => Self::Format(other.to_string()),
        }
    }
}

impl From<WriteNpyError> for PersistenceError {
    fn from(value: WriteNpyError) -> Self {
        match value {
            WriteNpyError::Io(e) => Self::Io(e),
            other => Self::Format(other.to_string()),
        }
    }
}

/// Per-cell calibration curves plus the DC offsets of the unloaded mat.
#[derive(Debug, Clone)]
pub struct CalibrationModel {
    config: CalibrationConfig,
    /// `FRAME_SIZE` runs of `param_count` parameters, cells in row-major order.
    params: Vec<f64>,
    dc_offsets: CalibratedGrid,
    /// `apply` of the DC offsets, kept in step with `params` and `dc_offsets`.
    baseline: CalibratedGrid,
    calibrated: bool,
    zeroing_samples: Vec<SensorGrid>,
}

impl CalibrationModel {
    /// An uncalibrated model using the default parameters in every cell.
    ///
    /// A config that fails [`CalibrationConfig::validate`] is logged and its
    /// rated pressure replaced by the default.
    pub fn new(mut config: CalibrationConfig) -> Self {
        if let Err(e) = config.validate() {
            warn!("{}, using {} Pa", e, DEFAULT_MAX_RATED_PRESSURE_PA);
            config.max_rated_pressure = DEFAULT_MAX_RATED_PRESSURE_PA;
        }
        let params = config.curve.default_params().repeat(FRAME_SIZE);
        let mut model = CalibrationModel {
            config,
            params,
            dc_offsets: CalibratedGrid::filled(0.0),
            baseline: CalibratedGrid::filled(0.0),
            calibrated: false,
            zeroing_samples: Vec::new(),
        };
        model.refresh_baseline();
        model
    }

    /// A model that tries to load its curves from `path`. A missing or
    /// unreadable file is logged and leaves the model uncalibrated.
    pub fn with_default_curves(config: CalibrationConfig, path: impl AsRef<Path>) -> Self {
        let mut model = CalibrationModel::new(config);
        match model.load_curve_params(path.as_ref()) {
            Ok(()) => info!("Loaded calibration curves from {}", path.as_ref().display()),
            Err(PersistenceError::NotFound(p)) => {
                info!("No calibration curves at {}, mat is uncalibrated", p.display())
            }
            Err(e) => warn!("Could not load calibration curves: {}", e),
        }
        model
    }

    /// Wraps the model for sharing with a session.
    pub fn into_shared(self) -> SharedCalibration {
        Arc::new(RwLock::new(self))
    }

    pub fn config(&self) -> &CalibrationConfig {
        &self.config
    }

    /// The curve model currently in use. A fit may lower a polynomial's
    /// degree, so this can differ from what the model was created with.
    pub fn curve(&self) -> CurveModel {
        self.config.curve
    }

    pub fn is_calibrated(&self) -> bool {
        self.calibrated
    }

    pub fn dc_offsets(&self) -> &CalibratedGrid {
        &self.dc_offsets
    }

    /// The curve parameters of cell `(r, c)`.
    pub fn params_at(&self, r: usize, c: usize) -> &[f64] {
        let k = self.config.curve.param_count();
        let start = (r * COLS + c) * k;
        &self.params[start..start + k]
    }

    /// Fits one curve per cell to the reference samples.
    ///
    /// Saturated pairs are dropped before fitting. A cell whose fit fails
    /// keeps the default parameters and counts as a failure. A polynomial of
    /// degree `n` or more for `n` samples is lowered to degree `n - 1`.
    pub fn fit(&mut self, samples: &[ReferenceSample]) -> Result<FitReport, PreconditionError> {
        if samples.len() < 2 {
            return Err(PreconditionError::TooFewSamples {
                found: samples.len(),
            });
        }

        let degraded_degree = self.degrade_degree(samples.len());
        let curve = self.config.curve;
        let underdetermined = samples.len() < curve.param_count();
        if underdetermined {
            warn!(
                "Fitting {} parameters from only {} samples",
                curve.param_count(),
                samples.len()
            );
        }

        let mut params = Vec::with_capacity(FRAME_SIZE * curve.param_count());
        let mut scores = Vec::with_capacity(FRAME_SIZE);
        let mut failures = 0;
        let mut dropped_pairs = 0;
        let mut xs = Vec::with_capacity(samples.len());
        let mut ys = Vec::with_capacity(samples.len());

        for cell in 0..FRAME_SIZE {
            xs.clear();
            ys.clear();
            for sample in samples {
                let raw = sample.grid.as_slice()[cell];
                if u16::from(raw) >= self.config.saturation_threshold {
                    dropped_pairs += 1;
                } else {
                    xs.push(f64::from(raw));
                    ys.push(sample.pressure_pa);
                }
            }

            let fitted = curve.fit(&xs, &ys).unwrap_or_else(|e| {
                debug!("Cell ({}, {}) fell back to defaults: {}", cell / COLS, cell % COLS, e);
                failures += 1;
                curve.default_params()
            });
            scores.push(r_squared(&xs, &ys, |x| curve.evaluate(x, &fitted)));
            params.extend_from_slice(&fitted);
        }

        if dropped_pairs > 0 {
            info!("Dropped {} saturated calibration pairs", dropped_pairs);
        }

        self.params = params;
        self.calibrated = true;
        self.refresh_baseline();

        let report = FitReport {
            cells: FRAME_SIZE,
            min_r_squared: scores.iter().copied().fold(f64::INFINITY, f64::min),
            avg_r_squared: scores.iter().sum::<f64>() / scores.len() as f64,
            failures,
            dropped_pairs,
            degraded_degree,
            underdetermined,
        };
        info!("Calibration {}", report);
        Ok(report)
    }

    /// Fits a single curve to the mean raw value of every sample, and gives
    /// that curve to every cell.
    pub fn fit_averaged(
        &mut self,
        samples: &[ReferenceSample],
    ) -> Result<FitReport, PreconditionError> {
        let averaged: Vec<ReferenceSample> = samples
            .iter()
            .map(|s| {
                let mean = s.grid.iter().map(|&v| f64::from(v)).sum::<f64>() / FRAME_SIZE as f64;
                ReferenceSample::new(SensorGrid::filled(mean.round() as u8), s.pressure_pa)
            })
            .collect();
        self.fit(&averaged)
    }

    fn degrade_degree(&mut self, samples: usize) -> Option<usize> {
        let CurveModel::Polynomial { degree } = self.config.curve else {
            return None;
        };
        if degree < samples {
            return None;
        }

        let lowered = samples - 1;
        warn!(
            "Polynomial degree {} needs more than {} samples, lowering it to {}",
            degree, samples, lowered
        );
        self.config.curve = CurveModel::Polynomial { degree: lowered };
        Some(lowered)
    }

    /// Calibrated value of raw value `x` in cell `cell`, before rounding.
    fn evaluate_clamped(&self, cell: usize, x: f64) -> f64 {
        let k = self.config.curve.param_count();
        let params = &self.params[cell * k..(cell + 1) * k];
        let value = self.config.curve.evaluate(x, params);
        if value.is_nan() {
            return 0.0;
        }
        value.clamp(0.0, self.config.max_rated_pressure)
    }

    fn apply_values(&self, raw: impl Iterator<Item = f64>) -> CalibratedGrid {
        let cells = raw
            .enumerate()
            .map(|(cell, x)| round_centi(self.evaluate_clamped(cell, x)))
            .collect();
        // the iterators handed in always cover every cell
        Grid::from_vec(cells).unwrap_or_else(|| CalibratedGrid::filled(0.0))
    }

    /// Converts a raw frame to pascals, clamped to the rated range and
    /// rounded to two decimals.
    pub fn apply(&self, grid: &SensorGrid) -> CalibratedGrid {
        self.apply_values(grid.iter().map(|&v| f64::from(v)))
    }

    /// Subtracts the pressure of the DC offsets from a calibrated frame.
    pub fn apply_dc_offset(&self, mut grid: CalibratedGrid) -> CalibratedGrid {
        for (v, base) in grid.as_mut_slice().iter_mut().zip(self.baseline.iter()) {
            *v = (*v - base).clamp(0.0, MAX_OFFSET_PRESSURE_PA);
        }
        grid
    }

    /// [`CalibrationModel::apply`] followed by
    /// [`CalibrationModel::apply_dc_offset`].
    pub fn calibrate_frame(&self, grid: &SensorGrid) -> CalibratedGrid {
        self.apply_dc_offset(self.apply(grid))
    }

    /// Stores a frame of the unloaded mat for the next
    /// [`CalibrationModel::compute_dc_offsets`].
    pub fn add_zeroing_sample(&mut self, grid: SensorGrid) {
        self.zeroing_samples.push(grid);
    }

    pub fn zeroing_sample_count(&self) -> usize {
        self.zeroing_samples.len()
    }

    /// Replaces the DC offsets with the mean of the stored zeroing samples,
    /// then forgets the samples.
    pub fn compute_dc_offsets(&mut self) -> Result<(), PreconditionError> {
        if self.zeroing_samples.is_empty() {
            return Err(PreconditionError::NoZeroingSamples);
        }

        let n = self.zeroing_samples.len() as f64;
        let mut sums = vec![0.0; FRAME_SIZE];
        for sample in &self.zeroing_samples {
            for (sum, &v) in sums.iter_mut().zip(sample.iter()) {
                *sum += f64::from(v);
            }
        }
        let offsets = sums.into_iter().map(|s| s / n).collect();
        self.dc_offsets = Grid::from_vec(offsets).unwrap_or_else(|| CalibratedGrid::filled(0.0));

        info!("Computed DC offsets from {} zeroing samples", self.zeroing_samples.len());
        self.zeroing_samples.clear();
        self.refresh_baseline();
        Ok(())
    }

    fn refresh_baseline(&mut self) {
        self.baseline = self.apply_values(self.dc_offsets.iter().copied());
    }

    fn param_shape(&self) -> Vec<usize> {
        vec![ROWS, COLS, self.config.curve.param_count()]
    }

    /// Loads curve parameters saved by [`CalibrationModel::save_curve_params`].
    /// On any error the model is left unchanged.
    ///
    /// A polynomial model takes its degree from the file, since fitting with
    /// too few samples saves a lower degree than the configured one.
    pub fn load_curve_params(&mut self, path: impl AsRef<Path>) -> Result<(), PersistenceError> {
        let path = path.as_ref();
        let file = match fs::File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(PersistenceError::NotFound(path.to_path_buf()))
            }
            Err(e) => return Err(e.into()),
        };
        let array = ArrayD::<f64>::read_npy(io::BufReader::new(file))?;

        let expected = self.param_shape();
        let curve = match (self.config.curve, array.shape()) {
            (_, found) if found == expected.as_slice() => self.config.curve,
            // a fit may have lowered the degree, which the last axis records
            (CurveModel::Polynomial { degree }, &[ROWS, COLS, k]) if k > 0 => {
                warn!(
                    "{} holds degree {} polynomials, not degree {}",
                    path.display(),
                    k - 1,
                    degree
                );
                CurveModel::Polynomial { degree: k - 1 }
            }
            (_, found) => {
                return Err(PersistenceError::ShapeMismatch {
                    expected,
                    found: found.to_vec(),
                })
            }
        };

        self.config.curve = curve;
        self.params = array.iter().copied().collect();
        self.calibrated = true;
        self.refresh_baseline();
        Ok(())
    }

    /// Saves the curve parameters as a `(ROWS, COLS, K)` array.
    pub fn save_curve_params(&self, path: impl AsRef<Path>) -> Result<(), PersistenceError> {
        let k = self.config.curve.param_count();
        let array = Array3::from_shape_fn((ROWS, COLS, k), |(r, c, i)| {
            self.params[(r * COLS + c) * k + i]
        });
        write_npy(path, &array)?;
        Ok(())
    }

    /// Takes the curves of `fitted`, keeping this model's offsets.
    fn install_curves(&mut self, fitted: CalibrationModel) {
        self.config.curve = fitted.config.curve;
        self.params = fitted.params;
        self.calibrated = fitted.calibrated;
        self.refresh_baseline();
    }
}

/// Read access to a shared model, ignoring poisoning.
pub(crate) fn read_model(shared: &SharedCalibration) -> RwLockReadGuard<'_, CalibrationModel> {
    match shared.read() {
        Ok(model) => model,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub(crate) fn write_model(shared: &SharedCalibration) -> RwLockWriteGuard<'_, CalibrationModel> {
    match shared.write() {
        Ok(model) => model,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Refits a shared model without holding its lock for the duration of the
/// fit. The fit runs on a copy; only installing the result takes the write
/// lock.
pub fn refit_shared(
    shared: &SharedCalibration,
    samples: &[ReferenceSample],
) -> Result<FitReport, PreconditionError> {
    let mut working = read_model(shared).clone();
    let report = working.fit(samples)?;
    write_model(shared).install_curves(working);
    Ok(report)
}

fn round_centi(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}
