// Commandline argument parser using clap for matterface

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser, Clone)]
#[clap(version, about)]
pub struct MatArgs {
    #[command(subcommand, long_about)]
    /// Which task to perform
    pub command: MatCommand,

    /// RON file to read settings from. Flags given here override it
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// Serial port the mat is attached to
    #[arg(short = 'p', long = "port")]
    pub port: Option<String>,

    /// Baud rate of the serial port
    #[arg(short = 'b', long = "baud")]
    pub baud: Option<u32>,

    /// Read timeout of the serial port, in milliseconds
    #[arg(short = 't', long = "timeout")]
    pub timeout_ms: Option<u64>,

    /// File holding the calibration curves
    #[arg(long = "curves")]
    pub curves: Option<PathBuf>,

    /// Pick the serial port from a list instead of using --port
    #[arg(short = 's', long = "select")]
    pub select: bool,
}

#[derive(Debug, Subcommand, Clone)]
pub enum MatCommand {
    /// Record calibrated frames until a key is pressed
    #[command(about)]
    Record(RecordCommand),

    /// Take a single calibrated reading and print its statistics
    #[command(about)]
    Capture(CaptureCommand),

    /// Fit calibration curves from readings under known weights
    #[command(about)]
    Calibrate(CalibrateCommand),

    /// List the serial ports present
    #[command(about)]
    Ports,

    /// Print the effective configuration as RON
    #[command(about)]
    Config,
}

#[derive(Debug, Args, Clone)]
#[command(version, about)]
pub struct RecordCommand {
    /// Directory session folders are created in
    #[arg(short = 'o', long = "out")]
    pub output_root: Option<PathBuf>,

    /// Weight resting on the mat, in pounds
    #[arg(short = 'w', long = "weight")]
    pub weight_lbs: Option<f64>,

    /// Zero the unloaded mat before recording
    #[arg(short = 'z', long = "zero")]
    pub zero: bool,

    /// Resynchronisations tolerated back to back before giving up
    #[arg(long = "max-resyncs")]
    pub max_consecutive_resyncs: Option<u32>,
}

#[derive(Debug, Args, Clone)]
#[command(version, about)]
pub struct CaptureCommand {
    /// Weight resting on the mat, in pounds
    #[arg(short = 'w', long = "weight")]
    pub weight_lbs: Option<f64>,

    /// Zero the unloaded mat before the reading
    #[arg(short = 'z', long = "zero")]
    pub zero: bool,
}

#[derive(Debug, Args, Clone)]
#[command(version, about)]
pub struct CalibrateCommand {
    /// Weights to calibrate with, in pounds, one reading each
    #[arg(short = 'w', long = "weights")]
    #[clap(num_args = 2..)]
    pub weights_lbs: Vec<f64>,

    /// Fit polynomials of this degree instead of exponential curves
    #[arg(short = 'd', long = "degree")]
    pub degree: Option<usize>,

    /// Fit one curve to the mean of every reading and give it to all cells
    #[arg(short = 'a', long = "averaged")]
    pub averaged: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_record_invocation() {
        let args = MatArgs::try_parse_from([
            "matterface",
            "--port",
            "/dev/ttyUSB1",
            "record",
            "--out",
            "runs",
            "-w",
            "12.5",
            "--zero",
        ])
        .unwrap();

        assert_eq!(args.port.as_deref(), Some("/dev/ttyUSB1"));
        match args.command {
            MatCommand::Record(record) => {
                assert_eq!(record.output_root, Some(PathBuf::from("runs")));
                assert_eq!(record.weight_lbs, Some(12.5));
                assert!(record.zero);
                assert_eq!(record.max_consecutive_resyncs, None);
            }
            other => panic!("expected record, got {:?}", other),
        }
    }

    #[test]
    fn calibrate_needs_two_weights() {
        assert!(MatArgs::try_parse_from(["matterface", "calibrate", "-w", "5"]).is_err());

        let args =
            MatArgs::try_parse_from(["matterface", "calibrate", "-w", "0", "5", "10", "-d", "2"])
                .unwrap();
        match args.command {
            MatCommand::Calibrate(cal) => {
                assert_eq!(cal.weights_lbs, vec![0.0, 5.0, 10.0]);
                assert_eq!(cal.degree, Some(2));
                assert!(!cal.averaged);
            }
            other => panic!("expected calibrate, got {:?}", other),
        }
    }
}
