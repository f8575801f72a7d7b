//! Drives a real mat from the command line.
//!
//! ```text
//! cargo run --bin matterface -- --port /dev/ttyACM0 calibrate -w 0 5 10 20
//! cargo run --bin matterface -- --port /dev/ttyACM0 record --zero -w 10
//! ```

use clap::Parser;
use matterface::{
    args::{CalibrateCommand, CaptureCommand, MatArgs, MatCommand, RecordCommand},
    calibration::{CalibrationModel, SharedCalibration},
    config::MatConfig,
    mat_link::{PortOpener, SerialOpener},
    sampler::{collect_zeroing, reference_sample, sample_once, ZEROING_SAMPLES},
    session::AcquisitionSession,
    session_stats::ReadingStats,
    tui::{device_selector, monitor_until_keypress},
};

use log::{error, info, warn};
use serial2::SerialPort;
use std::{error::Error, io, process::ExitCode};

type AnyResult<T> = Result<T, Box<dyn Error>>;

fn main() -> ExitCode {
    env_logger::init();
    let args = MatArgs::parse();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            eprintln!("matterface: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(args: MatArgs) -> AnyResult<()> {
    let mut config = MatConfig::from_args(&args)?;

    match &args.command {
        MatCommand::Ports => return list_ports(),
        MatCommand::Config => {
            println!("{}", config.to_ron()?);
            return Ok(());
        }
        _ => {}
    }

    if args.select {
        match device_selector(SerialOpener.available_ports()?)? {
            Some(port) => config.port = port,
            None => {
                info!("No port selected");
                return Ok(());
            }
        }
    }

    match args.command {
        MatCommand::Record(record) => run_record(&config, record),
        MatCommand::Capture(capture) => run_capture(&config, capture),
        MatCommand::Calibrate(calibrate) => run_calibrate(&config, calibrate),
        MatCommand::Ports | MatCommand::Config => Ok(()),
    }
}

fn list_ports() -> AnyResult<()> {
    let ports = SerialOpener.available_ports()?;
    if ports.is_empty() {
        println!("No serial ports found");
    }
    for port in ports {
        println!("{}", port);
    }
    Ok(())
}

fn open_port(config: &MatConfig) -> AnyResult<SerialPort> {
    let ports = SerialOpener.available_ports()?;
    if !ports.contains(&config.port) {
        return Err(format!("serial port {} not found (present: {:?})", config.port, ports).into());
    }
    Ok(SerialOpener.open(&config.port, config.baud, config.timeout())?)
}

fn load_model(config: &MatConfig) -> SharedCalibration {
    let model = CalibrationModel::with_default_curves(config.calibration, &config.curves_path);
    if !model.is_calibrated() {
        warn!("Readings are uncalibrated until `matterface calibrate` has been run");
    }
    model.into_shared()
}

fn zero(model: &SharedCalibration, port: &mut SerialPort) -> AnyResult<()> {
    println!("Zeroing: keep the mat unloaded...");
    collect_zeroing(model, port, ZEROING_SAMPLES)?;
    println!("Zeroing done");
    Ok(())
}

fn run_capture(config: &MatConfig, capture: CaptureCommand) -> AnyResult<()> {
    let model = load_model(config);
    let mut port = open_port(config)?;
    if capture.zero {
        zero(&model, &mut port)?;
        wait_for_enter("Place the load on the mat and press Enter")?;
    }

    let raw = sample_once(&mut port)?;
    let grid = match model.read() {
        Ok(model) => model.calibrate_frame(&raw),
        Err(poisoned) => poisoned.into_inner().calibrate_frame(&raw),
    };

    print!("{}", grid.render(true)?);
    println!("{}", ReadingStats::of(&grid, capture.weight_lbs));
    Ok(())
}

fn run_calibrate(config: &MatConfig, calibrate: CalibrateCommand) -> AnyResult<()> {
    let mut port = open_port(config)?;

    let mut samples = Vec::with_capacity(calibrate.weights_lbs.len());
    for &weight in &calibrate.weights_lbs {
        wait_for_enter(&format!(
            "Spread {} lbs evenly over the mat and press Enter",
            weight
        ))?;
        samples.push(reference_sample(&mut port, weight)?);
        info!("Took reference sample under {} lbs", weight);
    }

    let mut model = CalibrationModel::new(config.calibration);
    let report = if calibrate.averaged {
        model.fit_averaged(&samples)?
    } else {
        model.fit(&samples)?
    };
    println!("{}", report);
    if let Some(degree) = report.degraded_degree {
        warn!(
            "Saving degree {} curves; later runs pick the degree up from {}",
            degree,
            config.curves_path.display()
        );
    }

    model.save_curve_params(&config.curves_path)?;
    println!("Saved {} curves to {}", model.curve(), config.curves_path.display());
    Ok(())
}

fn run_record(config: &MatConfig, record: RecordCommand) -> AnyResult<()> {
    let model = load_model(config);
    if record.zero {
        // the session opens the port itself, so this one is closed again
        let mut port = open_port(config)?;
        zero(&model, &mut port)?;
        wait_for_enter("Place the load on the mat and press Enter to start")?;
    }

    let session = AcquisitionSession::new(config.session_config(record.weight_lbs), model);
    let events = session.subscribe();
    let handle = session.start();

    let (state, result) = monitor_until_keypress(
        &format!("Recording {}", config.port),
        events,
        handle,
        record.weight_lbs,
    )?;

    if let Some(stats) = &state.final_stats {
        println!("{}", stats.final_message());
    }
    if let Some(dir) = &state.recording {
        println!("Frames saved in {}", dir.display());
    }
    Ok(result?)
}

fn wait_for_enter(prompt: &str) -> io::Result<()> {
    println!("{}", prompt);
    io::stdin().read_line(&mut String::new())?;
    Ok(())
}
