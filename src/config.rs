//! Settings shared by the command line tools.
//!
//! Settings come from an optional RON file, and flags on the command line
//! override whatever the file says. A missing key in the file keeps its
//! default, so a file only needs the values it changes:
//!
//! ```text
//! (
//!     port: "/dev/ttyUSB0",
//!     calibration: (curve: Polynomial(degree: 3)),
//! )
//! ```

use crate::args::{MatArgs, MatCommand};
use crate::calibration::{CalibrationConfig, CurveModel};
use crate::frame_reader::DEFAULT_MAX_CONSECUTIVE_RESYNCS;
use crate::session::SessionConfig;

use serde::{Deserialize, Serialize};
use std::{
    borrow::Cow,
    fmt, fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

/// Where calibration curves are looked for when nothing else is configured.
pub const DEFAULT_CURVES_PATH: &str = "calibration_curves.npy";

/// Errors that occur while reading or writing a configuration file.
#[derive(Debug)]
pub enum ConfigError {
    IoError(io::Error),
    RonError(ron::Error),
    RonSpannedError(ron::de::SpannedError),
    /// The file parsed but holds a value that cannot be used.
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            ConfigError::IoError(error) => Cow::from(format!("io error: {}", error)),
            ConfigError::RonError(error) => Cow::from(format!("ron error: {}", error)),
            ConfigError::RonSpannedError(error) => {
                Cow::from(format!("ron spanning error: {}", error))
            }
            ConfigError::Invalid(reason) => Cow::from(format!("invalid config: {}", reason)),
        };

        write!(f, "{}", msg)
    }
}

impl std::error::Error for ConfigError {}

impl From<io::Error> for ConfigError {
    fn from(value: io::Error) -> Self {
        Self::IoError(value)
    }
}

/// Everything the command line tools can be configured with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatConfig {
    pub port: String,
    pub baud: u32,
    pub timeout_ms: u64,
    pub output_root: PathBuf,
    pub curves_path: PathBuf,
    pub max_consecutive_resyncs: u32,
    pub calibration: CalibrationConfig,
}

impl Default for MatConfig {
    fn default() -> Self {
        let session = SessionConfig::default();
        MatConfig {
            port: session.port,
            baud: session.baud,
            timeout_ms: session.timeout.as_millis() as u64,
            output_root: session
                .output_root
                .unwrap_or_else(|| PathBuf::from("recordings")),
            curves_path: PathBuf::from(DEFAULT_CURVES_PATH),
            max_consecutive_resyncs: DEFAULT_MAX_CONSECUTIVE_RESYNCS,
            calibration: CalibrationConfig::default(),
        }
    }
}

impl MatConfig {
    /// Parses a configuration from RON text.
    pub fn from_ron(text: &str) -> Result<Self, ConfigError> {
        let config: Self = ron::de::from_str(text).map_err(ConfigError::RonSpannedError)?;
        config.calibration.validate().map_err(ConfigError::Invalid)?;
        Ok(config)
    }

    /// Reads a configuration file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_ron(&fs::read_to_string(path)?)
    }

    /// The configuration as pretty-printed RON.
    pub fn to_ron(&self) -> Result<String, ConfigError> {
        ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())
            .map_err(ConfigError::RonError)
    }

    /// The file named by `--config`, or the defaults, with every flag given
    /// on the command line applied on top.
    pub fn from_args(args: &MatArgs) -> Result<Self, ConfigError> {
        let base = match &args.config {
            Some(path) => Self::from_path(path)?,
            None => Self::default(),
        };
        Ok(base.with_overrides(args))
    }

    fn with_overrides(mut self, args: &MatArgs) -> Self {
        if let Some(port) = &args.port {
            self.port = port.clone();
        }
        if let Some(baud) = args.baud {
            self.baud = baud;
        }
        if let Some(timeout_ms) = args.timeout_ms {
            self.timeout_ms = timeout_ms;
        }
        if let Some(curves) = &args.curves {
            self.curves_path = curves.clone();
        }

        match &args.command {
            MatCommand::Record(record) => {
                if let Some(root) = &record.output_root {
                    self.output_root = root.clone();
                }
                if let Some(max) = record.max_consecutive_resyncs {
                    self.max_consecutive_resyncs = max;
                }
            }
            MatCommand::Calibrate(cal) => {
                if let Some(degree) = cal.degree {
                    self.calibration.curve = CurveModel::Polynomial { degree };
                }
            }
            MatCommand::Capture(_) | MatCommand::Ports | MatCommand::Config => {}
        }
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Settings for a session recording under `expected_weight_lbs`.
    pub fn session_config(&self, expected_weight_lbs: Option<f64>) -> SessionConfig {
        SessionConfig {
            port: self.port.clone(),
            baud: self.baud,
            timeout: self.timeout(),
            expected_weight_lbs,
            output_root: Some(self.output_root.clone()),
            max_consecutive_resyncs: self.max_consecutive_resyncs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn partial_file_keeps_defaults() {
        let config = MatConfig::from_ron(
            r#"(
                port: "/dev/ttyUSB0",
                calibration: (curve: Polynomial(degree: 3)),
            )"#,
        )
        .unwrap();

        assert_eq!(config.port, "/dev/ttyUSB0");
        assert_eq!(config.calibration.curve, CurveModel::Polynomial { degree: 3 });
        assert_eq!(config.calibration.saturation_threshold, 255);
        assert_eq!(config.baud, MatConfig::default().baud);
    }

    #[test]
    fn printed_config_parses_back() {
        let config = MatConfig {
            timeout_ms: 250,
            ..Default::default()
        };
        let text = config.to_ron().unwrap();
        assert_eq!(MatConfig::from_ron(&text).unwrap(), config);
    }

    #[test]
    fn bad_file_is_a_ron_error() {
        assert!(matches!(
            MatConfig::from_ron("(port: 12"),
            Err(ConfigError::RonSpannedError(_))
        ));
    }

    #[test]
    fn negative_rated_pressure_is_rejected() {
        assert!(matches!(
            MatConfig::from_ron("(calibration: (max_rated_pressure: -5.0))"),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn flags_override_the_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"(port: "/dev/ttyS1", baud: 9600, output_root: "a")"#).unwrap();
        let path = file.path().to_string_lossy().into_owned();

        let args = MatArgs::try_parse_from([
            "matterface",
            "--config",
            path.as_str(),
            "--baud",
            "115200",
            "record",
            "--out",
            "b",
        ])
        .unwrap();
        let config = MatConfig::from_args(&args).unwrap();

        assert_eq!(config.port, "/dev/ttyS1");
        assert_eq!(config.baud, 115200);
        assert_eq!(config.output_root, PathBuf::from("b"));

        let session = config.session_config(Some(5.0));
        assert_eq!(session.port, "/dev/ttyS1");
        assert_eq!(session.expected_weight_lbs, Some(5.0));
        assert_eq!(session.output_root, Some(PathBuf::from("b")));
    }

    #[test]
    fn degree_flag_selects_polynomials() {
        let args =
            MatArgs::try_parse_from(["matterface", "calibrate", "-w", "0", "10", "-d", "2"])
                .unwrap();
        let config = MatConfig::from_args(&args).unwrap();
        assert_eq!(config.calibration.curve, CurveModel::Polynomial { degree: 2 });
    }
}
